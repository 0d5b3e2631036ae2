//! Reductions: sums and means are local, maxima need a comparison per tournament round.

use ndarray::{Array2, Axis, IxDyn, Slice, concatenate};
use tracing::{Level, debug, instrument};

use super::{Scratch, SharedTensor};
use crate::{
    error::{Error, Result},
    kernel::{fold_axes, reduction_shape, rows_of},
    party::Tensor,
};

fn columns(t: &Tensor, start: usize, end: usize, step: isize) -> Tensor {
    t.slice_axis(Axis(1), Slice::new(start as isize, Some(end as isize), step))
        .to_owned()
}

impl SharedTensor {
    /// Sums over `dims`, or over all axes if `None`.
    pub fn sum(&self, dims: Option<&[usize]>, keepdim: bool) -> Result<SharedTensor> {
        let f = self.field;
        let all: Vec<usize> = (0..self.shape().len()).collect();
        let dims = dims.unwrap_or(&all);
        self.map_shares(|_, s| fold_axes(&s, dims, keepdim, 0, |a, b| f.add(*a, *b)))
    }

    /// The mean over `dims`, rounded towards negative infinity.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn mean(&self, dims: Option<&[usize]>, keepdim: bool) -> Result<SharedTensor> {
        let count: usize = match dims {
            Some(dims) => dims
                .iter()
                .map(|&d| self.shape().get(d).copied().unwrap_or(1))
                .product(),
            None => self.shape().iter().product(),
        };
        if count == 0 {
            return Err(Error::InvalidArgument("mean of an empty tensor".into()));
        }
        let mut scratch = Scratch::default();
        scratch.keep(self.sum(dims, keepdim)?).div_public(count as u64)
    }

    /// The maximum along `dim`, or over all elements if `None`.
    pub fn max(&self, dim: Option<usize>, keepdim: bool) -> Result<SharedTensor> {
        let (values, indices) = self.max_with_indices(dim, keepdim)?;
        indices.discard();
        Ok(values)
    }

    /// The index of the maximum along `dim`, or into the flattened tensor if `None`.
    ///
    /// Ties resolve to the first index.
    pub fn argmax(&self, dim: Option<usize>, keepdim: bool) -> Result<SharedTensor> {
        let (values, indices) = self.max_with_indices(dim, keepdim)?;
        values.discard();
        Ok(indices)
    }

    /// Pairwise tournament over the reduced axis, `ceil(log2(n))` comparison rounds.
    #[instrument(level = Level::DEBUG, skip_all, fields(dim = ?dim), err)]
    pub fn max_with_indices(
        &self,
        dim: Option<usize>,
        keepdim: bool,
    ) -> Result<(SharedTensor, SharedTensor)> {
        let shape = self.shape().to_vec();
        if let Some(d) = dim.filter(|&d| d >= shape.len()) {
            return Err(Error::InvalidArgument(format!(
                "axis {d} out of range for a tensor of rank {}",
                shape.len()
            )));
        }
        let n = dim.map_or(shape.iter().product(), |d| shape[d]);
        if n == 0 || shape.contains(&0) {
            return Err(Error::InvalidArgument("maximum of an empty tensor".into()));
        }
        let out_shape = reduction_shape(&shape, dim, keepdim);

        // every round's columns, discarded once the tournament ends
        let mut rounds = Scratch::default();
        let mut values = rounds.keep(self.map_shares(|_, s| rows_of(s, dim))?);
        let rows = values.shape()[0];
        let grid = Array2::from_shape_fn((rows, n), |(_, j)| j as u64).into_dyn();
        let mut indices = rounds.keep(values.public_like(&grid));

        let mut n = n;
        while n > 1 {
            let half = n / 2;
            debug!("Tournament round over {n} columns");
            let mut scratch = Scratch::default();
            let bits = scratch.keep(compare_pairs(&values, half)?);
            let next_values = rounds.keep(select(&values, &bits, half, n)?);
            let next_indices = rounds.keep(select(&indices, &bits, half, n)?);
            scratch.track([&values, &indices]);
            values = next_values;
            indices = next_indices;
            n = n.div_ceil(2);
        }
        let to_output = |s: Tensor| -> Result<Tensor> { Ok(s.into_shape(IxDyn(&out_shape))?) };
        let out_values = values.map_shares(|_, s| to_output(s))?;
        match indices.map_shares(|_, s| to_output(s)) {
            Ok(out_indices) => Ok((out_values, out_indices)),
            Err(e) => {
                out_values.discard();
                Err(e)
            }
        }
    }
}

/// `[left ≥ right]` for the neighbouring column pairs `(2j, 2j + 1)`.
fn compare_pairs(t: &SharedTensor, half: usize) -> Result<SharedTensor> {
    let mut scratch = Scratch::default();
    let left = scratch.keep(t.map_shares(|_, s| Ok(columns(&s, 0, 2 * half, 2)))?);
    let right = scratch.keep(t.map_shares(|_, s| Ok(columns(&s, 1, 2 * half, 2)))?);
    left.ge(&right)
}

/// Picks the left column of every pair where `bits` is 1, the right one otherwise, carrying an
/// odd last column over unchanged.
fn select(t: &SharedTensor, bits: &SharedTensor, half: usize, n: usize) -> Result<SharedTensor> {
    let mut scratch = Scratch::default();
    let left = scratch.keep(t.map_shares(|_, s| Ok(columns(&s, 0, 2 * half, 2)))?);
    let right = scratch.keep(t.map_shares(|_, s| Ok(columns(&s, 1, 2 * half, 2)))?);
    let diff = scratch.keep(left.sub(&right)?);
    let chosen = scratch.keep(bits.mul(&diff)?);
    let picked = right.add(&chosen)?;
    if n % 2 == 0 {
        return Ok(picked);
    }
    let picked = scratch.keep(picked);
    let out = SharedTensor::local(&[&picked, t], |_, v| {
        let last = columns(&v[1], n - 1, n, 1);
        Ok(vec![concatenate(Axis(1), &[v[0].view(), last.view()])?])
    })?;
    super::single(out)
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, arr0, arr1, arr2};

    use super::*;
    use crate::{field::Field, party::Party, provider::CryptoProvider};

    fn share(t: &ArrayD<i64>) -> Result<SharedTensor> {
        let parties = vec![Party::new("bob"), Party::new("alice"), Party::new("charlie")];
        let provider = CryptoProvider::with_seed(Party::new("james"), 11);
        SharedTensor::share(t, &parties, &provider, Field::new(1 << 62))
    }

    #[test]
    fn sums_and_means() -> Result<()> {
        let x = share(&arr2(&[[1i64, 2, 4], [8, 5, -6]]).into_dyn())?;
        assert_eq!(x.sum(None, false)?.get()?, arr0(14i64).into_dyn());
        assert_eq!(
            x.sum(Some(&[0][..]), false)?.get()?,
            arr1(&[9i64, 7, -2]).into_dyn()
        );
        assert_eq!(
            x.sum(Some(&[1][..]), true)?.get()?,
            arr2(&[[7i64], [7]]).into_dyn()
        );
        // (1 + 8) / 2 and (2 + 5) / 2 round down
        assert_eq!(
            x.mean(Some(&[0][..]), false)?.get()?,
            arr1(&[4i64, 3, -1]).into_dyn()
        );
        assert_eq!(x.mean(None, false)?.get()?, arr0(2i64).into_dyn());
        Ok(())
    }

    #[test]
    fn max_and_argmax_along_an_axis() -> Result<()> {
        let x = share(&arr2(&[[3i64, 9, 1, 9, 2], [-4, -2, -8, -1, -3]]).into_dyn())?;
        assert_eq!(x.max(Some(1), false)?.get()?, arr1(&[9i64, -1]).into_dyn());
        assert_eq!(x.argmax(Some(1), false)?.get()?, arr1(&[1i64, 3]).into_dyn());
        assert_eq!(
            x.argmax(Some(0), true)?.get()?,
            arr2(&[[0i64, 0, 0, 0, 0]]).into_dyn()
        );
        Ok(())
    }

    #[test]
    fn max_over_everything() -> Result<()> {
        let x = share(&arr2(&[[3i64, 5], [7, 2], [7, 1]]).into_dyn())?;
        assert_eq!(x.max(None, false)?.get()?, arr0(7i64).into_dyn());
        assert_eq!(x.argmax(None, false)?.get()?, arr0(2i64).into_dyn());
        assert_eq!(x.argmax(None, true)?.get()?, arr2(&[[2i64]]).into_dyn());
        assert!(x.max(Some(2), false).is_err());
        Ok(())
    }

    #[test]
    fn tournament_cleans_up() -> Result<()> {
        let x = share(&arr1(&[4i64, 1, 6]).into_dyn())?;
        let parties = x.parties();
        let before: Vec<_> = parties.iter().map(Party::len).collect();
        let (values, indices) = x.max_with_indices(Some(0), false)?;
        let after: Vec<_> = parties.iter().map(Party::len).collect();
        assert_eq!(after, before.iter().map(|n| n + 2).collect::<Vec<_>>());
        assert_eq!(values.get()?, arr0(6i64).into_dyn());
        assert_eq!(indices.get()?, arr0(2i64).into_dyn());
        Ok(())
    }
}
