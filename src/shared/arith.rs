//! Linear operations and Beaver multiplication on shared tensors.

use ndarray::{ArrayD, arr0};
use tracing::{Level, debug, instrument};

use super::{Scratch, SharedTensor, reconstruct, ring_matmul};
use crate::{
    error::{Error, Result},
    field::Field,
    kernel::{broadcast_shape, broadcast_to, floor_mod, zip_broadcast},
    party::Tensor,
    provider::{Triple, TripleKind},
};

pub(crate) fn ring_add(f: &Field, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    zip_broadcast("add", a, b, |x, y| f.add(*x, *y))
}

pub(crate) fn ring_sub(f: &Field, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    zip_broadcast("sub", a, b, |x, y| f.sub(*x, *y))
}

pub(crate) fn ring_mul(f: &Field, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    zip_broadcast("mul", a, b, |x, y| f.mul(*x, *y))
}

impl SharedTensor {
    /// `self + other`, computed locally.
    pub fn add(&self, other: &SharedTensor) -> Result<SharedTensor> {
        let f = self.field;
        self.zip_shares(other, |_, a, b| ring_add(&f, &a, &b))
    }

    /// `self - other`, computed locally.
    pub fn sub(&self, other: &SharedTensor) -> Result<SharedTensor> {
        let f = self.field;
        self.zip_shares(other, |_, a, b| ring_sub(&f, &a, &b))
    }

    /// `-self`, computed locally.
    pub fn neg(&self) -> Result<SharedTensor> {
        let f = self.field;
        self.map_shares(|_, a| Ok(a.mapv(|x| f.neg(x))))
    }

    /// Adds a public ring constant into the first party's share only.
    pub(crate) fn add_ring(&self, c: &Tensor) -> Result<SharedTensor> {
        let f = self.field;
        let shape = broadcast_shape(self.shape(), c.shape()).ok_or_else(|| {
            Error::ShapeMismatch {
                op: "add",
                left: self.shape().to_vec(),
                right: c.shape().to_vec(),
            }
        })?;
        self.map_shares(|i, a| {
            if i == 0 {
                ring_add(&f, &a, c)
            } else {
                broadcast_to("add", &a, &shape)
            }
        })
    }

    /// Multiplies every share by a public ring constant.
    pub(crate) fn mul_ring(&self, c: &Tensor) -> Result<SharedTensor> {
        let f = self.field;
        self.map_shares(|_, a| ring_mul(&f, &a, c))
    }

    /// `self + c` for a public `c`, which is added into the first party's share only.
    pub fn add_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        self.add_ring(&self.field.lift(c)?)
    }

    /// `self - c` for a public `c`.
    pub fn sub_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        let f = self.field;
        self.add_ring(&f.lift(c)?.mapv(|x| f.neg(x)))
    }

    /// `c - self` for a public `c`.
    pub fn rsub_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        let f = self.field;
        self.rsub_ring(&f.lift(c)?)
    }

    pub(crate) fn rsub_ring(&self, c: &Tensor) -> Result<SharedTensor> {
        let f = self.field;
        let neg = |a: Tensor| a.mapv(|x| f.neg(x));
        let shape = broadcast_shape(self.shape(), c.shape()).ok_or_else(|| {
            Error::ShapeMismatch {
                op: "sub",
                left: c.shape().to_vec(),
                right: self.shape().to_vec(),
            }
        })?;
        self.map_shares(|i, a| {
            if i == 0 {
                ring_sub(&f, c, &a)
            } else {
                broadcast_to("sub", &neg(a), &shape)
            }
        })
    }

    /// `self * c` elementwise for a public `c`. Needs no triple.
    pub fn mul_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        self.mul_ring(&self.field.lift(c)?)
    }

    /// Multiplies every share by a public scalar.
    pub fn scale_by(&self, k: i64) -> Result<SharedTensor> {
        self.mul_ring(&arr0(self.field.reduce(k)).into_dyn())
    }

    /// `self @ c` for a public matrix `c`. Needs no triple.
    pub fn matmul_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        let f = self.field;
        let c = f.lift(c)?;
        self.map_shares(|_, a| ring_matmul(&f, &a, &c))
    }

    /// `c @ self` for a public matrix `c`. Needs no triple.
    pub fn rmatmul_public(&self, c: &ArrayD<i64>) -> Result<SharedTensor> {
        let f = self.field;
        let c = f.lift(c)?;
        self.map_shares(|_, a| ring_matmul(&f, &c, &a))
    }

    /// `self * other` elementwise, using one Beaver triple.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn mul(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.check_compatible(other)?;
        let shape = broadcast_shape(self.shape(), other.shape()).ok_or_else(|| {
            Error::ShapeMismatch {
                op: "mul",
                left: self.shape().to_vec(),
                right: other.shape().to_vec(),
            }
        })?;
        let mut scratch = Scratch::default();
        let x = self.expanded(&shape)?.map(|t| scratch.keep(t));
        let y = other.expanded(&shape)?.map(|t| scratch.keep(t));
        let triple = self.provider.beaver_triple(
            &TripleKind::Mul(shape.clone()),
            &self.parties(),
            self.field,
        )?;
        let f = self.field;
        beaver(x.as_ref().unwrap_or(self), y.as_ref().unwrap_or(other), triple, |a, b| {
            ring_mul(&f, a, b)
        })
    }

    /// `self @ other` for 2-D shared matrices, using one matrix Beaver triple.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn matmul(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.check_compatible(other)?;
        let (left, right) = (self.shape(), other.shape());
        if left.len() != 2 || right.len() != 2 || left[1] != right[0] {
            return Err(Error::ShapeMismatch {
                op: "matmul",
                left: left.to_vec(),
                right: right.to_vec(),
            });
        }
        let kind = TripleKind::Matmul {
            left: left.to_vec(),
            right: right.to_vec(),
        };
        let triple = self
            .provider
            .beaver_triple(&kind, &self.parties(), self.field)?;
        let f = self.field;
        beaver(self, other, triple, |a, b| ring_matmul(&f, a, b))
    }

    /// Broadcasts the shares to `shape`, `None` if the shape already matches.
    fn expanded(&self, shape: &[usize]) -> Result<Option<SharedTensor>> {
        if self.shape() == shape {
            return Ok(None);
        }
        self.map_shares(|_, a| broadcast_to("expand", &a, shape))
            .map(Some)
    }

    /// Elementwise remainder of every share by a public divisor, sign following the divisor.
    ///
    /// The divisor must divide the field size. The reconstruction is then congruent to the
    /// plaintext modulo `m`, reducing it once more with floor-mod semantics yields the remainder.
    pub fn modulo(&self, m: i64) -> Result<SharedTensor> {
        let f = self.field;
        if m == 0 || f.size() % m.unsigned_abs() != 0 {
            return Err(Error::InvalidArgument(format!(
                "modulus {m} does not divide the field size {}",
                f.size()
            )));
        }
        self.map_shares(|_, a| Ok(a.mapv(|s| f.reduce(floor_mod(s as i64, m)))))
    }
}

/// Multiplies `x` and `y` with the bilinear `product` using the triple `(a, b, c)`.
///
/// Every party publishes `x_i - a_i` and `y_i - b_i`; once all are available (the reveal
/// barrier), `d` and `e` are public and each party computes
/// `z_i = c_i + d·b_i + a_i·e`, the first party also adding `d·e`.
fn beaver(
    x: &SharedTensor,
    y: &SharedTensor,
    triple: Triple,
    product: impl Fn(&Tensor, &Tensor) -> Result<Tensor>,
) -> Result<SharedTensor> {
    let f = x.field;
    let mut scratch = Scratch::default();
    scratch.track(triple.parts());
    x.check_compatible(y)?;
    x.check_compatible(&triple.a)?;
    let mut masked_x = Vec::with_capacity(x.shares.len());
    let mut masked_y = Vec::with_capacity(x.shares.len());
    for i in 0..x.shares.len() {
        masked_x.push(ring_sub(&f, &x.shares[i].peek()?, &triple.a.shares[i].peek()?)?);
        masked_y.push(ring_sub(&f, &y.shares[i].peek()?, &triple.b.shares[i].peek()?)?);
    }
    let d = reconstruct(&f, masked_x)?;
    let e = reconstruct(&f, masked_y)?;
    debug!("Opened Beaver masks of shapes {:?} and {:?}", d.shape(), e.shape());
    let z = SharedTensor::local(&[&triple.a, &triple.b, &triple.c], |i, v| {
        let [a, b, c] = <[Tensor; 3]>::try_from(v)
            .map_err(|_| Error::InvalidArgument("incomplete triple".into()))?;
        let mut z = ring_add(&f, &c, &product(&d, &b)?)?;
        z = ring_add(&f, &z, &product(&a, &e)?)?;
        if i == 0 {
            z = ring_add(&f, &z, &product(&d, &e)?)?;
        }
        Ok(vec![z])
    })?;
    super::single(z)
}
