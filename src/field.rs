//! Arithmetic modulo the field size of the additive sharing.
//!
//! Shares are `u64` values in `0..size`. Since the size is at most 2^63, the sum of two reduced
//! values never overflows a `u64`, products are computed in `u128`.

use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The ring `Z_size` in which all shares live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    size: u64,
}

impl Field {
    /// Creates the field, `size` must already be validated by [`crate::Config::validate`].
    pub(crate) fn new(size: u64) -> Self {
        Self { size }
    }

    /// The modulus.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Values strictly below this bound (in magnitude) can be represented.
    pub fn bound(&self) -> u64 {
        self.size / 2
    }

    /// The offset used to make bounded differences non-negative before masking.
    pub(crate) fn quarter(&self) -> u64 {
        self.size / 4
    }

    pub(crate) fn reduce(&self, v: i64) -> u64 {
        (v as i128).rem_euclid(self.size as i128) as u64
    }

    pub(crate) fn reduce_u128(&self, v: u128) -> u64 {
        (v % self.size as u128) as u64
    }

    /// Maps `0..size` to the signed range, values above `size / 2` become negative.
    pub(crate) fn signed(&self, v: u64) -> i64 {
        if v > self.size / 2 {
            (v as i128 - self.size as i128) as i64
        } else {
            v as i64
        }
    }

    pub(crate) fn add(&self, a: u64, b: u64) -> u64 {
        let s = a + b;
        if s >= self.size { s - self.size } else { s }
    }

    pub(crate) fn sub(&self, a: u64, b: u64) -> u64 {
        if a >= b { a - b } else { a + (self.size - b) }
    }

    pub(crate) fn neg(&self, a: u64) -> u64 {
        if a == 0 { 0 } else { self.size - a }
    }

    pub(crate) fn mul(&self, a: u64, b: u64) -> u64 {
        self.reduce_u128(a as u128 * b as u128)
    }

    pub(crate) fn random(&self, rng: &mut impl Rng) -> u64 {
        rng.random_range(0..self.size)
    }

    /// Embeds a signed tensor into the field, failing if a value is not representable.
    pub(crate) fn lift(&self, values: &ArrayD<i64>) -> Result<ArrayD<u64>> {
        let bound = self.bound();
        if let Some(v) = values.iter().find(|v| v.unsigned_abs() >= bound) {
            return Err(Error::FieldOverflow {
                value: *v as f64,
                bound,
            });
        }
        Ok(values.mapv(|v| self.reduce(v)))
    }

    /// Maps a reconstructed tensor back to signed integers.
    pub(crate) fn lower(&self, values: &ArrayD<u64>) -> ArrayD<i64> {
        values.mapv(|v| self.signed(v))
    }

    pub(crate) fn random_tensor(&self, shape: &[usize], rng: &mut impl Rng) -> ArrayD<u64> {
        ArrayD::from_shape_simple_fn(shape, || self.random(rng))
    }
}

/// Bit length of `v`, at least 1.
pub(crate) fn bit_len(v: u64) -> usize {
    (u64::BITS - v.leading_zeros()).max(1) as usize
}
