//! The crypto provider as a (semi-)trusted dealer, providing correlated randomness.
//!
//! The provider never sees operand values. It samples random field elements, Beaver triples and
//! the masks used by the comparison and truncation protocols, and deals additive shares of them
//! directly into the stores of the computing parties.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use ndarray::ArrayD;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{Level, debug, instrument};

use crate::{
    error::Result,
    field::{Field, bit_len},
    kernel::zip_broadcast,
    party::{Party, Tensor},
    shared::{SharedTensor, ring_matmul, split},
};

/// The shape of the product a Beaver triple is prepared for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TripleKind {
    /// `c = a * b` elementwise, all three of the given shape.
    Mul(Vec<usize>),
    /// `c = a @ b` for matrices `a` of shape `left` and `b` of shape `right`.
    Matmul {
        /// Shape of `a`.
        left: Vec<usize>,
        /// Shape of `b`.
        right: Vec<usize>,
    },
}

/// A secret-shared multiplication triple with `c = a · b`.
///
/// A triple is consumed by exactly one multiplication and is deliberately not `Clone`.
#[derive(Debug)]
pub struct Triple {
    /// The first random factor.
    pub a: SharedTensor,
    /// The second random factor.
    pub b: SharedTensor,
    /// The product of `a` and `b`.
    pub c: SharedTensor,
}

impl Triple {
    pub(crate) fn parts(&self) -> [&SharedTensor; 3] {
        [&self.a, &self.b, &self.c]
    }
}

/// A shared random mask `r` together with the shared bits needed to compare against it.
#[derive(Debug)]
pub(crate) struct Mask {
    /// `r`, uniform over the whole field for comparisons. Truncation masks by `d` stay below
    /// `size - 2 * floor(size / 4) - (d - 1)`, so that the masked dividend never wraps.
    pub(crate) r: SharedTensor,
    /// `floor(r / d)` for truncation masks.
    pub(crate) quotient: Option<SharedTensor>,
    /// Bits of `r` (or of `r mod d` for truncation masks), least significant first.
    pub(crate) bits: Vec<SharedTensor>,
}

impl Mask {
    pub(crate) fn parts(&self) -> impl Iterator<Item = &SharedTensor> {
        std::iter::once(&self.r)
            .chain(self.quotient.as_ref())
            .chain(&self.bits)
    }
}

#[derive(Debug)]
struct Inner {
    party: Party,
    rng: Mutex<ChaCha20Rng>,
    triples: AtomicU64,
}

/// A party generating randomness and multiplication triples on demand.
///
/// The provider can be colocated with a computing party or be a dedicated helper. Cloning
/// clones the handle, all clones draw from the same random stream.
#[derive(Debug, Clone)]
pub struct CryptoProvider(Arc<Inner>);

impl CryptoProvider {
    /// Creates a provider seeded from OS entropy.
    pub fn new(party: Party) -> Self {
        Self::from_rng(party, ChaCha20Rng::from_os_rng())
    }

    /// Creates a provider with a deterministic random stream.
    pub fn with_seed(party: Party, seed: u64) -> Self {
        Self::from_rng(party, ChaCha20Rng::seed_from_u64(seed))
    }

    fn from_rng(party: Party, rng: ChaCha20Rng) -> Self {
        CryptoProvider(Arc::new(Inner {
            party,
            rng: Mutex::new(rng),
            triples: AtomicU64::new(0),
        }))
    }

    /// The party acting as provider.
    pub fn party(&self) -> &Party {
        &self.0.party
    }

    /// The number of Beaver triples dealt so far.
    pub fn triples_dealt(&self) -> u64 {
        self.0.triples.load(Ordering::Relaxed)
    }

    fn rng(&self) -> MutexGuard<'_, ChaCha20Rng> {
        self.0
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deal(
        &self,
        rng: &mut ChaCha20Rng,
        value: &Tensor,
        parties: &[Party],
        field: Field,
    ) -> SharedTensor {
        let shares = split(value, parties.len(), &field, rng);
        let pointers = parties
            .iter()
            .zip(shares)
            .map(|(p, s)| p.store(s))
            .collect();
        SharedTensor::from_shares(pointers, self.clone(), field)
    }

    /// Samples a tensor of uniformly random field elements.
    pub fn random_field_element(&self, shape: &[usize], field: Field) -> Tensor {
        field.random_tensor(shape, &mut *self.rng())
    }

    /// Deals a fresh triple, shared over `parties`.
    #[instrument(level = Level::DEBUG, skip_all, fields(kind = ?kind, parties = parties.len()), err)]
    pub fn beaver_triple(
        &self,
        kind: &TripleKind,
        parties: &[Party],
        field: Field,
    ) -> Result<Triple> {
        let mut rng = self.rng();
        let (a, b, c) = match kind {
            TripleKind::Mul(shape) => {
                let a = field.random_tensor(shape, &mut *rng);
                let b = field.random_tensor(shape, &mut *rng);
                let c = zip_broadcast("mul", &a, &b, |x, y| field.mul(*x, *y))?;
                (a, b, c)
            }
            TripleKind::Matmul { left, right } => {
                let a = field.random_tensor(left, &mut *rng);
                let b = field.random_tensor(right, &mut *rng);
                let c = ring_matmul(&field, &a, &b)?;
                (a, b, c)
            }
        };
        let triple = Triple {
            a: self.deal(&mut rng, &a, parties, field),
            b: self.deal(&mut rng, &b, parties, field),
            c: self.deal(&mut rng, &c, parties, field),
        };
        self.0.triples.fetch_add(1, Ordering::Relaxed);
        Ok(triple)
    }

    /// Deals a mask `r`, uniform over the field, with the shared bits of `r`.
    pub(crate) fn comparison_mask(&self, shape: &[usize], parties: &[Party], field: Field) -> Mask {
        self.mask(shape, parties, field, None)
    }

    /// Deals a mask `r` with shares of `floor(r / divisor)` and the bits of `r mod divisor`.
    pub(crate) fn truncation_mask(
        &self,
        shape: &[usize],
        parties: &[Party],
        field: Field,
        divisor: u64,
    ) -> Mask {
        self.mask(shape, parties, field, Some(divisor))
    }

    fn mask(&self, shape: &[usize], parties: &[Party], field: Field, divisor: Option<u64>) -> Mask {
        let bound = match divisor {
            Some(d) => field.size() - 2 * field.quarter() - (d - 1),
            None => field.size(),
        };
        let mut rng = self.rng();
        let r: Tensor = ArrayD::from_shape_simple_fn(shape, || rng.random_range(0..bound));
        let (low, quotient, max_low) = match divisor {
            Some(d) => (r.mapv(|v| v % d), Some(r.mapv(|v| v / d)), d - 1),
            None => (r.clone(), None, bound - 1),
        };
        let bits = (0..bit_len(max_low))
            .map(|k| {
                let bit = low.mapv(|v| (v >> k) & 1);
                self.deal(&mut rng, &bit, parties, field)
            })
            .collect::<Vec<_>>();
        debug!(
            "Dealt a mask of shape {shape:?} with {} bits to {} parties",
            bits.len(),
            parties.len()
        );
        Mask {
            r: self.deal(&mut rng, &r, parties, field),
            quotient: quotient.map(|q| self.deal(&mut rng, &q, parties, field)),
            bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parties() -> Vec<Party> {
        vec![Party::new("bob"), Party::new("alice")]
    }

    #[test]
    fn random_field_elements_cover_the_field() {
        let field = Field::new(1 << 8);
        let draw = || {
            CryptoProvider::with_seed(Party::new("james"), 5).random_field_element(&[4, 64], field)
        };
        let t = draw();
        assert_eq!(t.shape(), &[4, 64]);
        assert!(t.iter().all(|v| *v < field.size()));
        assert!(t.iter().any(|v| *v > field.bound()));
        assert!(t.iter().any(|v| *v < field.bound()));
        assert_eq!(t, draw());
    }

    #[test]
    fn triples_multiply_out() -> Result<()> {
        let field = Field::new(1 << 62);
        let provider = CryptoProvider::with_seed(Party::new("james"), 6);
        let triple = provider.beaver_triple(&TripleKind::Mul(vec![5]), &parties(), field)?;
        let [a, b, c] = triple.parts().map(SharedTensor::open);
        let (a, b) = (a?, b?);
        assert_eq!(c?, zip_broadcast("mul", &a, &b, |x, y| field.mul(*x, *y))?);

        let kind = TripleKind::Matmul {
            left: vec![2, 3],
            right: vec![3, 4],
        };
        let triple = provider.beaver_triple(&kind, &parties(), field)?;
        let [a, b, c] = triple.parts().map(SharedTensor::open);
        let c = c?;
        assert_eq!(c.shape(), &[2, 4]);
        assert_eq!(c, ring_matmul(&field, &a?, &b?)?);
        assert_eq!(provider.triples_dealt(), 2);
        Ok(())
    }

    #[test]
    fn truncation_masks_stay_below_their_bound() -> Result<()> {
        let field = Field::new(1 << 10);
        let d = 7;
        let provider = CryptoProvider::with_seed(Party::new("james"), 8);
        let mask = provider.truncation_mask(&[256], &parties(), field, d);
        let r = mask.r.open()?;
        assert!(r.iter().all(|v| *v < field.size() - 2 * field.quarter() - (d - 1)));
        let quotient = mask.quotient.as_ref().map(SharedTensor::open).transpose()?;
        assert_eq!(quotient, Some(r.mapv(|v| v / d)));
        assert_eq!(mask.bits.len(), 3);
        let mut low = Tensor::zeros(r.raw_dim());
        for (k, bit) in mask.bits.iter().enumerate() {
            low = low + bit.open()?.mapv(|b| b << k);
        }
        assert_eq!(low, r.mapv(|v| v % d));
        Ok(())
    }

    #[test]
    fn comparison_masks_span_the_field() -> Result<()> {
        let field = Field::new(1 << 8);
        let provider = CryptoProvider::with_seed(Party::new("james"), 9);
        let mask = provider.comparison_mask(&[512], &parties(), field);
        let r = mask.r.open()?;
        assert_eq!(mask.bits.len(), 8);
        assert!(r.iter().any(|v| *v >= field.size() - field.quarter()));
        Ok(())
    }
}
