//! Errors raised by the sharing engine and the fixed-point layer.

use thiserror::Error;

use crate::party::{ObjectId, PartyId};

/// A custom error type for all secure tensor operations.
///
/// Every error aborts the requested operation at its boundary. Nothing is retried and no other
/// pending shared tensor is touched.
#[derive(Debug, Error)]
pub enum Error {
    /// The object was already consumed (e.g. by `get`) or was never stored at the party.
    #[error("Object {id} not found at party {party}")]
    ObjectNotFound {
        /// The party that was asked for the object.
        party: PartyId,
        /// The missing object id.
        id: ObjectId,
    },
    /// Two fixed-point tensors with different encodings were combined.
    #[error("Precision mismatch: {left:?} vs {right:?} (base, precision_fractional)")]
    PrecisionMismatch {
        /// `(base, precision_fractional)` of the left operand.
        left: (u32, u32),
        /// `(base, precision_fractional)` of the right operand.
        right: (u32, u32),
    },
    /// The operand shapes are incompatible for the operation.
    #[error("Shape mismatch in {op}: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// The operation that rejected the shapes.
        op: &'static str,
        /// Shape of the left operand.
        left: Vec<usize>,
        /// Shape of the right operand.
        right: Vec<usize>,
    },
    /// The operation has no secure implementation.
    #[error("Operation '{0}' is not supported on secret-shared tensors")]
    UnsupportedOperation(String),
    /// A value does not fit into the signed range of the field.
    #[error("Value {value} exceeds the field bound {bound}")]
    FieldOverflow {
        /// The offending value (already scaled for fixed-point inputs).
        value: f64,
        /// The exclusive magnitude bound.
        bound: u64,
    },
    /// The operands are shared over different parties or different fields.
    #[error("Operands are shared over different parties or fields")]
    PartyMismatch,
    /// An argument is outside of its valid domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A tensor could not be (de-)serialized while moving it to another party.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Shorthand for results of secure tensor operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(format!("{e:?}"))
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::InvalidArgument(format!("{e}"))
    }
}
