//! Structural operations, applied by every party to its own share.

use ndarray::{ArrayD, Axis};
use tracing::{Level, instrument, warn};

use super::SharedTensor;
use crate::{
    error::{Error, Result},
    ops::Structural,
};

/// The result of indexing with a secret-shared index.
///
/// The index has to be reconstructed before it can be applied to the shares, so every party
/// learns it. The revealed positions are returned to make the leak explicit to the caller.
#[derive(Debug)]
pub struct IndexDisclosure {
    /// The selected elements, still shared.
    pub tensor: SharedTensor,
    /// The index positions that were revealed to all parties.
    pub revealed: Vec<usize>,
}

impl SharedTensor {
    /// Applies `op` to the shares of `inputs`, party by party.
    pub fn apply_structural(inputs: &[&SharedTensor], op: &Structural) -> Result<Vec<SharedTensor>> {
        SharedTensor::local(inputs, |_, shares| {
            let refs: Vec<_> = shares.iter().collect();
            op.apply(&refs)
        })
    }

    fn structural(&self, op: Structural) -> Result<SharedTensor> {
        super::single(Self::apply_structural(&[self], &op)?)
    }

    /// Stacks tensors of equal shape along a new axis.
    pub fn stack(tensors: &[&SharedTensor], axis: usize) -> Result<SharedTensor> {
        super::single(Self::apply_structural(tensors, &Structural::Stack { axis })?)
    }

    /// Concatenates tensors along an existing axis.
    pub fn cat(tensors: &[&SharedTensor], axis: usize) -> Result<SharedTensor> {
        super::single(Self::apply_structural(tensors, &Structural::Cat { axis })?)
    }

    /// Splits into `chunks` pieces of `ceil(len / chunks)` elements, the last one possibly
    /// smaller.
    pub fn chunk(&self, chunks: usize, axis: usize) -> Result<Vec<SharedTensor>> {
        Self::apply_structural(&[self], &Structural::Chunk { chunks, axis })
    }

    /// Removes `axis`, returning one tensor per index along it.
    pub fn unbind(&self, axis: usize) -> Result<Vec<SharedTensor>> {
        Self::apply_structural(&[self], &Structural::Unbind { axis })
    }

    /// Keeps every `step`-th index of `start..end` along `axis`.
    pub fn slice(
        &self,
        axis: usize,
        start: usize,
        end: Option<usize>,
        step: usize,
    ) -> Result<SharedTensor> {
        self.structural(Structural::Slice {
            axis,
            start,
            end,
            step,
        })
    }

    /// Selects public `indices` along `axis`.
    pub fn index_select(&self, axis: usize, indices: &[usize]) -> Result<SharedTensor> {
        self.structural(Structural::IndexSelect {
            axis,
            indices: indices.to_vec(),
        })
    }

    /// Selects along `axis` with a secret-shared index, which is revealed to every party.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn index_select_shared(
        &self,
        axis: usize,
        index: &SharedTensor,
    ) -> Result<IndexDisclosure> {
        let opened = index.field.lower(&index.open()?);
        let mut revealed = Vec::with_capacity(opened.len());
        for &i in opened.iter() {
            let i = usize::try_from(i)
                .map_err(|_| Error::InvalidArgument(format!("negative index {i}")))?;
            revealed.push(i);
        }
        warn!(
            "Indexing with a secret-shared index reveals {} position(s) to all parties",
            revealed.len()
        );
        let tensor = self.index_select(axis, &revealed)?;
        Ok(IndexDisclosure { tensor, revealed })
    }

    /// Reorders the axes.
    pub fn permute(&self, axes: &[usize]) -> Result<SharedTensor> {
        self.structural(Structural::Permute {
            axes: axes.to_vec(),
        })
    }

    /// Swaps two axes.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<SharedTensor> {
        self.structural(Structural::Transpose { dim0, dim1 })
    }

    /// Transposes a matrix.
    pub fn t(&self) -> Result<SharedTensor> {
        if self.shape().len() != 2 {
            return Err(Error::InvalidArgument(format!(
                "t() expects a matrix, got shape {:?}",
                self.shape()
            )));
        }
        self.transpose(0, 1)
    }

    /// Changes the shape, keeping the row-major element order.
    pub fn reshape(&self, shape: &[usize]) -> Result<SharedTensor> {
        self.structural(Structural::Reshape {
            shape: shape.to_vec(),
        })
    }

    /// Broadcasts to `shape`.
    pub fn expand(&self, shape: &[usize]) -> Result<SharedTensor> {
        self.structural(Structural::Expand {
            shape: shape.to_vec(),
        })
    }

    /// Selects a single index along `axis`, removing that axis.
    pub fn select(&self, axis: usize, index: usize) -> Result<SharedTensor> {
        let picked = self.index_select(axis, &[index])?;
        let out = picked.map_shares(|_, s| Ok(s.index_axis_move(Axis(axis), 0)));
        picked.discard();
        out
    }
}

/// Reconstructs the plaintext of several tensors at once, consuming them.
pub fn get_all(tensors: Vec<SharedTensor>) -> Result<Vec<ArrayD<i64>>> {
    tensors.into_iter().map(SharedTensor::get).collect()
}
