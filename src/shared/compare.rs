//! Comparisons and exact division by public integers.
//!
//! Both protocols mask a shared value with a random `r` from the provider, open the masked value
//! and compare the public result with `r` bit by bit. Comparison masks are uniform over the whole
//! field and the wrap-around of the opened value is accounted for, so the sign of every
//! representable value is exact. Division masks are bounded instead, which keeps the masked
//! dividend from wrapping as long as it stays below a quarter of the field size.

use ndarray::arr0;
use tracing::{Level, debug, instrument};

use super::{Scratch, SharedTensor};
use crate::{
    error::{Error, Result},
    party::Tensor,
    provider::Mask,
};

/// Computes `[r ≤ k]` for a shared `r`, given by its bits (least significant first), and a
/// public `k` of the same shape which must fit into as many bits.
fn less_equal_public(bits: &[SharedTensor], k: &Tensor) -> Result<SharedTensor> {
    let Some((msb, rest)) = bits.split_last() else {
        return Err(Error::InvalidArgument("comparison without mask bits".into()));
    };
    let f = msb.field;
    let bit = |i: usize| k.mapv(|v| (v >> i) & 1);
    let not = |b: &Tensor| b.mapv(|v| 1 - v);
    let sign = |b: &Tensor| b.mapv(|v| f.sub(1, 2 * v));

    // holds every prefix state, the current one is removed only when the scan ends
    let mut states = Scratch::default();
    // the prefix is trivially equal before the first bit, so the first round needs no triple
    let k_i = bit(rest.len());
    let mut gt = states.keep(msb.mul_ring(&not(&k_i))?);
    let mut eq = {
        let mut round = Scratch::default();
        let t_sign = round.keep(msb.mul_ring(&sign(&k_i))?);
        states.keep(t_sign.rsub_ring(&not(&k_i))?)
    };

    for (i, r_i) in rest.iter().enumerate().rev() {
        let k_i = bit(i);
        let mut round = Scratch::default();
        let t = round.keep(eq.mul(r_i)?);
        let t_gt = round.keep(t.mul_ring(&not(&k_i))?);
        let t_sign = round.keep(t.mul_ring(&sign(&k_i))?);
        let eq_kept = round.keep(eq.mul_ring(&not(&k_i))?);
        let next_gt = states.keep(gt.add(&t_gt)?);
        let next_eq = states.keep(eq_kept.sub(&t_sign)?);
        round.track([&gt, &eq]);
        gt = next_gt;
        eq = next_eq;
    }
    gt.rsub_ring(&Tensor::ones(k.raw_dim()))
}

impl SharedTensor {
    /// `[self ≥ 0]` elementwise, as a sharing of 0 or 1.
    ///
    /// With `c = self + r` opened and `h = floor(size / 2) + 1` the first value reconstructing
    /// as negative, the result is `[r ≤ c] - [r ≤ c - h] + [c < h]`, all modulo the field size.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn ge_zero(&self) -> Result<SharedTensor> {
        let f = self.field;
        let h = f.bound() + 1;
        let mut scratch = Scratch::default();
        let mask = self
            .provider
            .comparison_mask(self.shape(), &self.parties(), f);
        scratch.track(mask.parts());
        let masked = scratch.keep(self.add(&mask.r)?);
        let c = masked.open()?;
        debug!(
            "Comparing against a mask of {} bits, shape {:?}",
            mask.bits.len(),
            self.shape()
        );
        let shifted = c.mapv(|v| f.sub(v, h));
        let below = c.mapv(|v| u64::from(v < h));
        let no_wrap = scratch.keep(less_equal_public(&mask.bits, &c)?);
        let negative_no_wrap = scratch.keep(less_equal_public(&mask.bits, &shifted)?);
        let diff = scratch.keep(no_wrap.sub(&negative_no_wrap)?);
        diff.add_ring(&below)
    }

    /// `[self > 0]` elementwise.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn gt_zero(&self) -> Result<SharedTensor> {
        let mut scratch = Scratch::default();
        let neg = scratch.keep(self.neg()?);
        let ge = scratch.keep(neg.ge_zero()?);
        ge.rsub_ring(&arr0(1u64).into_dyn())
    }

    /// `[self == 0]` elementwise.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn eq_zero(&self) -> Result<SharedTensor> {
        let mut scratch = Scratch::default();
        let neg = scratch.keep(self.neg()?);
        let upper = scratch.keep(neg.ge_zero()?);
        let lower = scratch.keep(self.ge_zero()?);
        lower.mul(&upper)
    }

    fn compare_diff(
        &self,
        other: &SharedTensor,
        swap: bool,
        f: impl FnOnce(&SharedTensor) -> Result<SharedTensor>,
    ) -> Result<SharedTensor> {
        let mut scratch = Scratch::default();
        let diff = if swap { other.sub(self)? } else { self.sub(other)? };
        f(&scratch.keep(diff))
    }

    /// `[self > other]` elementwise.
    pub fn gt(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.compare_diff(other, false, SharedTensor::gt_zero)
    }

    /// `[self ≥ other]` elementwise.
    pub fn ge(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.compare_diff(other, false, SharedTensor::ge_zero)
    }

    /// `[self < other]` elementwise.
    pub fn lt(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.compare_diff(other, true, SharedTensor::gt_zero)
    }

    /// `[self ≤ other]` elementwise.
    pub fn le(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.compare_diff(other, true, SharedTensor::ge_zero)
    }

    /// `[self == other]` elementwise.
    pub fn eq(&self, other: &SharedTensor) -> Result<SharedTensor> {
        self.compare_diff(other, false, SharedTensor::eq_zero)
    }

    /// `floor(self / d)` elementwise for a public positive divisor.
    ///
    /// The result is exact (rounded towards negative infinity) while `|self|` stays below a
    /// quarter of the field size.
    #[instrument(level = Level::DEBUG, skip_all, fields(divisor = d), err)]
    pub fn div_public(&self, d: u64) -> Result<SharedTensor> {
        let f = self.field;
        let q = f.quarter();
        if d == 0 || d > q {
            return Err(Error::InvalidArgument(format!(
                "cannot divide by {d} in a field of size {}",
                f.size()
            )));
        }
        if d == 1 {
            return self.map_shares(|_, a| Ok(a));
        }
        // the smallest multiple of d that makes every dividend above -q non-negative
        let offset = q.div_ceil(d) * d;
        let mut scratch = Scratch::default();
        let mask = self
            .provider
            .truncation_mask(self.shape(), &self.parties(), f, d);
        scratch.track(mask.parts());
        let masked = scratch.keep(self.add(&mask.r)?);
        let c = masked.open()?.mapv(|v| f.add(v, offset));
        let high = c.mapv(|v| f.sub(f.sub(v / d, offset / d), 1));
        let low = c.mapv(|v| v % d);
        finish_division(&mask, &high, &low)
    }

    /// The same as [`SharedTensor::div_public`] for a signed public divisor, `floor(self / d)`.
    pub fn floor_div(&self, d: i64) -> Result<SharedTensor> {
        if d >= 0 {
            return self.div_public(d.unsigned_abs());
        }
        // floor(x / -d) = floor(-x / d)
        let mut scratch = Scratch::default();
        scratch.keep(self.neg()?).div_public(d.unsigned_abs())
    }
}

/// `floor(c / d) - offset / d - 1 + [r mod d ≤ c mod d] - floor(r / d)`, with the public parts
/// of the opened `c` already folded into `high` and `low`.
fn finish_division(mask: &Mask, high: &Tensor, low: &Tensor) -> Result<SharedTensor> {
    let quotient = mask
        .quotient
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("truncation mask without quotient".into()))?;
    let mut scratch = Scratch::default();
    let borrow = scratch.keep(less_equal_public(&mask.bits, low)?);
    let shifted = scratch.keep(borrow.add_ring(high)?);
    shifted.sub(quotient)
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, arr1};

    use super::*;
    use crate::{field::Field, party::Party, provider::CryptoProvider};

    fn as_bools(t: ArrayD<i64>) -> Vec<bool> {
        t.iter().map(|v| *v == 1).collect()
    }

    fn setup(values: &[i64], field: Field) -> Result<(SharedTensor, Vec<Party>)> {
        let parties: Vec<_> = (0..3).map(|i| Party::new(format!("p{i}"))).collect();
        let provider = CryptoProvider::with_seed(Party::new("dealer"), 42);
        let x = SharedTensor::share(&arr1(values).into_dyn(), &parties, &provider, field)?;
        Ok((x, parties))
    }

    #[test]
    fn sign_tests() -> Result<()> {
        let (x, _) = setup(&[-5, 0, 3, -1, 1], Field::new(1 << 62))?;
        assert_eq!(
            as_bools(x.ge_zero()?.get()?),
            vec![false, true, true, false, true]
        );
        assert_eq!(
            as_bools(x.gt_zero()?.get()?),
            vec![false, false, true, false, true]
        );
        assert_eq!(
            as_bools(x.eq_zero()?.get()?),
            vec![false, true, false, false, false]
        );
        Ok(())
    }

    #[test]
    fn sign_tests_in_a_small_field() -> Result<()> {
        let field = Field::new(1 << 16);
        let q = field.quarter() as i64;
        let (x, _) = setup(&[q - 1, -(q - 1), 0, 7, -7], field)?;
        assert_eq!(
            as_bools(x.ge_zero()?.get()?),
            vec![true, false, true, true, false]
        );
        Ok(())
    }

    #[test]
    fn signs_over_the_whole_field() -> Result<()> {
        let field = Field::new(1 << 16);
        let (half, q) = (field.bound() as i64, field.quarter() as i64);
        let values = [half - 1, -(half - 1), q, -q, q + 1, -(q + 1), 1, -1, 0];
        let (x, _) = setup(&values, field)?;
        let expected = |f: fn(i64) -> bool| values.iter().map(|v| f(*v)).collect::<Vec<_>>();
        assert_eq!(as_bools(x.ge_zero()?.get()?), expected(|v| v >= 0));
        assert_eq!(as_bools(x.gt_zero()?.get()?), expected(|v| v > 0));
        assert_eq!(as_bools(x.eq_zero()?.get()?), expected(|v| v == 0));
        Ok(())
    }

    #[test]
    fn division_at_the_operand_bound() -> Result<()> {
        let field = Field::new(1 << 16);
        let q = field.quarter() as i64;
        let values = [-(q - 1), q - 1, -(q - 4), q - 4, -1];
        let (x, _) = setup(&values, field)?;
        for d in [7i64, 1000] {
            assert_eq!(
                x.div_public(d as u64)?.get()?,
                arr1(&values).into_dyn().mapv(|v| v.div_euclid(d))
            );
        }
        Ok(())
    }

    #[test]
    fn comparisons_leave_only_their_result() -> Result<()> {
        let (x, parties) = setup(&[1, 2, 3], Field::new(1 << 62))?;
        let y = x.add_public(&arr1(&[0i64, 1, -1]).into_dyn())?;
        let before: Vec<_> = parties.iter().map(Party::len).collect();
        let gt = x.gt(&y)?;
        let after: Vec<_> = parties.iter().map(Party::len).collect();
        assert_eq!(after, before.iter().map(|n| n + 1).collect::<Vec<_>>());
        assert_eq!(as_bools(gt.get()?), vec![false, false, true]);
        assert_eq!(as_bools(x.le(&y)?.get()?), vec![true, true, false]);
        assert_eq!(as_bools(x.eq(&y)?.get()?), vec![true, false, false]);
        Ok(())
    }

    #[test]
    fn division_rounds_towards_negative_infinity() -> Result<()> {
        let (x, _) = setup(&[-7, 7, 0, -1, 1000, -1000], Field::new(1 << 62))?;
        assert_eq!(
            x.div_public(2)?.get()?,
            arr1(&[-4i64, 3, 0, -1, 500, -500]).into_dyn()
        );
        assert_eq!(
            x.div_public(1000)?.get()?,
            arr1(&[-1i64, 0, 0, -1, 1, -1]).into_dyn()
        );
        assert_eq!(
            x.floor_div(-2)?.get()?,
            arr1(&[3i64, -4, 0, 0, -500, 500]).into_dyn()
        );
        assert_eq!(x.div_public(1)?.get()?, x.virtual_get()?);
        assert!(matches!(x.div_public(0), Err(Error::InvalidArgument(_))));
        Ok(())
    }
}
