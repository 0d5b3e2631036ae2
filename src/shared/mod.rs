//! Additive secret sharing of integer tensors.
//!
//! A [`SharedTensor`] is an ordered list of [`Pointer`]s, one per party, whose values sum to the
//! plaintext modulo the field size. Linear operations are computed locally by every party on its
//! own share. Multiplications consume Beaver triples from the [`CryptoProvider`] and need one
//! reveal round, in which every party publishes a masked value before any party continues.
//!
//! Values above half the field size reconstruct as negative numbers.
use ndarray::{ArrayD, Zip};
use rand::Rng;
use tracing::{Level, debug, instrument};

use crate::{
    error::{Error, Result},
    field::Field,
    kernel::matmul,
    party::{Party, Pointer, Tensor},
    provider::CryptoProvider,
};

mod arith;
mod compare;
mod conv;
mod reduce;
mod structure;

pub use conv::{Operand, conv2d};
pub use structure::{IndexDisclosure, get_all};

/// Splits `value` into `n` additive shares, the last one being `value - Σ others`.
pub(crate) fn split(value: &Tensor, n: usize, field: &Field, rng: &mut impl Rng) -> Vec<Tensor> {
    let mut shares = Vec::with_capacity(n);
    let mut last = value.clone();
    for _ in 1..n {
        let r = field.random_tensor(value.shape(), rng);
        Zip::from(&mut last)
            .and(&r)
            .for_each(|l, r| *l = field.sub(*l, *r));
        shares.push(r);
    }
    shares.push(last);
    shares
}

/// Sums all parties' contributions, the plaintext result of a reveal.
pub(crate) fn reconstruct(field: &Field, parts: Vec<Tensor>) -> Result<Tensor> {
    let mut parts = parts.into_iter();
    let Some(mut sum) = parts.next() else {
        return Err(Error::InvalidArgument("nothing to reconstruct".into()));
    };
    for part in parts {
        if part.shape() != sum.shape() {
            return Err(Error::ShapeMismatch {
                op: "reconstruct",
                left: sum.shape().to_vec(),
                right: part.shape().to_vec(),
            });
        }
        Zip::from(&mut sum)
            .and(&part)
            .for_each(|s, p| *s = field.add(*s, *p));
    }
    Ok(sum)
}

/// The matrix product modulo the field size.
pub(crate) fn ring_matmul(field: &Field, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    matmul(a, b, 0, |x, y| field.add(x, y), |x, y| field.mul(x, y))
}

fn check_parties(parties: &[Party]) -> Result<()> {
    if parties.len() < 2 {
        return Err(Error::InvalidArgument(format!(
            "sharing needs at least 2 parties, got {}",
            parties.len()
        )));
    }
    for (i, p) in parties.iter().enumerate() {
        if parties[..i].iter().any(|q| q.id() == p.id()) {
            return Err(Error::InvalidArgument(format!("party {} is listed twice", p.id())));
        }
    }
    Ok(())
}

/// An integer tensor secret-shared between several parties.
///
/// Cloning copies the pointers, not the shares: both clones refer to the same objects.
#[derive(Debug, Clone)]
pub struct SharedTensor {
    shares: Vec<Pointer>,
    provider: CryptoProvider,
    field: Field,
}

impl SharedTensor {
    pub(crate) fn from_shares(shares: Vec<Pointer>, provider: CryptoProvider, field: Field) -> Self {
        Self {
            shares,
            provider,
            field,
        }
    }

    fn with_shares(&self, shares: Vec<Pointer>) -> Self {
        Self::from_shares(shares, self.provider.clone(), self.field)
    }

    /// Splits `value` into random shares and distributes one share to each party.
    ///
    /// Fails with [`Error::FieldOverflow`] if a value does not fit into half the field.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn share(
        value: &ArrayD<i64>,
        parties: &[Party],
        provider: &CryptoProvider,
        field: Field,
    ) -> Result<Self> {
        check_parties(parties)?;
        let lifted = field.lift(value)?;
        let shares = split(&lifted, parties.len(), &field, &mut rand::rng());
        debug!(
            "Sharing a tensor of shape {:?} between {} parties",
            value.shape(),
            parties.len()
        );
        let shares = parties
            .iter()
            .zip(shares)
            .map(|(p, s)| p.store(s))
            .collect();
        Ok(Self::from_shares(shares, provider.clone(), field))
    }

    /// Retrieves every share, removing it from its party, and reconstructs the plaintext.
    ///
    /// The read is consuming: a second `get` of the same shares fails with
    /// [`Error::ObjectNotFound`].
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn get(self) -> Result<ArrayD<i64>> {
        for p in &self.shares {
            if !p.owner().contains(p.id_at_location()) {
                return Err(Error::ObjectNotFound {
                    party: p.owner().id().clone(),
                    id: p.id_at_location(),
                });
            }
        }
        let parts = self
            .shares
            .iter()
            .map(|p| p.get())
            .collect::<Result<Vec<_>>>()?;
        Ok(self.field.lower(&reconstruct(&self.field, parts)?))
    }

    /// Reconstructs the plaintext without removing the shares.
    ///
    /// Only meaningful when the caller can read every party's store, e.g. in simulation.
    pub fn virtual_get(&self) -> Result<ArrayD<i64>> {
        Ok(self.field.lower(&self.open()?))
    }

    /// Reveals the ring value to every party, leaving the shares in place.
    pub(crate) fn open(&self) -> Result<Tensor> {
        let parts = self
            .shares
            .iter()
            .map(|p| p.peek())
            .collect::<Result<Vec<_>>>()?;
        reconstruct(&self.field, parts)
    }

    /// Moves the share at `index` to `new_owner`, leaving all other shares untouched.
    pub fn send_share(&mut self, index: usize, new_owner: &Party) -> Result<()> {
        let Some(ptr) = self.shares.get_mut(index) else {
            return Err(Error::InvalidArgument(format!("no share at index {index}")));
        };
        *ptr = ptr.send(new_owner)?;
        Ok(())
    }

    /// Removes every share from its party.
    pub fn discard(self) {
        for p in self.shares {
            p.discard();
        }
    }

    /// The pointers to the shares, in party order.
    pub fn pointers(&self) -> &[Pointer] {
        &self.shares
    }

    /// The parties holding the shares, in order.
    pub fn parties(&self) -> Vec<Party> {
        self.shares.iter().map(|p| p.owner().clone()).collect()
    }

    /// The provider used for triples and masks.
    pub fn crypto_provider(&self) -> &CryptoProvider {
        &self.provider
    }

    /// The field the shares live in.
    pub fn field(&self) -> Field {
        self.field
    }

    /// The shape of the shared tensor.
    pub fn shape(&self) -> &[usize] {
        self.shares.first().map(|p| p.shape()).unwrap_or(&[])
    }

    fn check_compatible(&self, other: &SharedTensor) -> Result<()> {
        let same_parties = self.shares.len() == other.shares.len()
            && self
                .shares
                .iter()
                .zip(&other.shares)
                .all(|(a, b)| a.owner() == b.owner());
        if same_parties && self.field == other.field {
            Ok(())
        } else {
            Err(Error::PartyMismatch)
        }
    }

    /// Runs `f` at every party on its shares of `inputs`, storing the outputs at that party.
    ///
    /// All outputs are computed before anything is stored, so a failing `f` leaves no objects
    /// behind.
    pub(crate) fn local(
        inputs: &[&SharedTensor],
        f: impl Fn(usize, Vec<Tensor>) -> Result<Vec<Tensor>>,
    ) -> Result<Vec<SharedTensor>> {
        let Some(first) = inputs.first() else {
            return Err(Error::InvalidArgument("no input tensors".into()));
        };
        for x in &inputs[1..] {
            first.check_compatible(x)?;
        }
        let mut per_party = Vec::with_capacity(first.shares.len());
        for i in 0..first.shares.len() {
            let local = inputs
                .iter()
                .map(|x| x.shares[i].peek())
                .collect::<Result<Vec<_>>>()?;
            per_party.push(f(i, local)?);
        }
        let n_out = per_party.first().map(Vec::len).unwrap_or(0);
        if per_party.iter().any(|out| out.len() != n_out) {
            return Err(Error::InvalidArgument(
                "parties produced different numbers of outputs".into(),
            ));
        }
        let mut outputs = vec![Vec::with_capacity(first.shares.len()); n_out];
        for (i, values) in per_party.into_iter().enumerate() {
            let owner = first.shares[i].owner();
            for (o, v) in values.into_iter().enumerate() {
                outputs[o].push(owner.store(v));
            }
        }
        Ok(outputs
            .into_iter()
            .map(|shares| first.with_shares(shares))
            .collect())
    }

    /// Applies `f` to every share.
    pub(crate) fn map_shares(&self, f: impl Fn(usize, Tensor) -> Result<Tensor>) -> Result<Self> {
        let out = Self::local(&[self], |i, mut v| match v.pop() {
            Some(share) => Ok(vec![f(i, share)?]),
            None => Ok(vec![]),
        })?;
        single(out)
    }

    /// Applies `f` to every pair of shares held by the same party.
    pub(crate) fn zip_shares(
        &self,
        other: &SharedTensor,
        f: impl Fn(usize, Tensor, Tensor) -> Result<Tensor>,
    ) -> Result<Self> {
        let out = Self::local(&[self, other], |i, v| {
            let mut v = v.into_iter();
            match (v.next(), v.next()) {
                (Some(a), Some(b)) => Ok(vec![f(i, a, b)?]),
                _ => Ok(vec![]),
            }
        })?;
        single(out)
    }

    /// Embeds a public ring value as a sharing: the first party holds it, all others hold zero.
    pub(crate) fn public_like(&self, value: &Tensor) -> Self {
        let shares = self
            .shares
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let share = if i == 0 {
                    value.clone()
                } else {
                    Tensor::zeros(value.raw_dim())
                };
                p.owner().store(share)
            })
            .collect();
        self.with_shares(shares)
    }
}

/// Intermediate sharings of one protocol run, removed from the parties' stores on drop.
///
/// Registering a sharing right after it is created keeps every exit path clean, including an
/// early return through `?`.
#[derive(Debug, Default)]
pub(crate) struct Scratch(Vec<SharedTensor>);

impl Scratch {
    /// Registers `t` for removal and hands it back.
    pub(crate) fn keep(&mut self, t: SharedTensor) -> SharedTensor {
        self.0.push(t.clone());
        t
    }

    /// Registers sharings owned elsewhere, such as the parts of a triple or mask.
    pub(crate) fn track<'a>(&mut self, tensors: impl IntoIterator<Item = &'a SharedTensor>) {
        self.0.extend(tensors.into_iter().cloned());
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for t in self.0.drain(..) {
            t.discard();
        }
    }
}

pub(crate) fn single(mut tensors: Vec<SharedTensor>) -> Result<SharedTensor> {
    match (tensors.pop(), tensors.is_empty()) {
        (Some(t), true) => Ok(t),
        _ => Err(Error::InvalidArgument("expected exactly one output tensor".into())),
    }
}
