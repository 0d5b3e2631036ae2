//! Operation tags and the name-based dispatch façade.
//!
//! Every operation with a secure implementation has an [`OpTag`]. Names are resolved through a
//! static table, unknown names fail with [`Error::UnsupportedOperation`]. Structural operations
//! ([`Structural`]) only rearrange elements and are applied identically to every share (or to the
//! plaintext), they never combine values.

use std::str::FromStr;

use ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::{
    error::{Error, Result},
    kernel::{Conv2d, broadcast_to},
    shared::{Operand, SharedTensor, conv2d},
};

/// The closed set of operations with a secure implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpTag {
    /// Elementwise addition.
    Add,
    /// Elementwise subtraction.
    Sub,
    /// Elementwise multiplication.
    Mul,
    /// Matrix multiplication.
    Matmul,
    /// Negation.
    Neg,
    /// `>` comparison.
    Gt,
    /// `>=` comparison.
    Ge,
    /// `<` comparison.
    Lt,
    /// `<=` comparison.
    Le,
    /// `==` comparison.
    Eq,
    /// Sum over axes.
    Sum,
    /// Mean over axes.
    Mean,
    /// Maximum along an axis.
    Max,
    /// Index of the maximum along an axis.
    Argmax,
    /// Remainder of a public divisor.
    Mod,
    /// 2-D convolution without bias.
    Conv2d,
    /// Stacks tensors along a new axis.
    Stack,
    /// Concatenates tensors along an existing axis.
    Cat,
    /// Splits into a number of chunks.
    Chunk,
    /// Removes an axis, returning one tensor per index.
    Unbind,
    /// A strided range along an axis.
    Slice,
    /// Selects public indices along an axis.
    IndexSelect,
    /// Reorders all axes.
    Permute,
    /// Swaps two axes.
    Transpose,
    /// Transposes a matrix.
    T,
    /// Changes the shape, keeping the element order.
    Reshape,
    /// Broadcasts to a larger shape.
    Expand,
}

const NAMES: &[(&str, OpTag)] = &[
    ("add", OpTag::Add),
    ("__add__", OpTag::Add),
    ("sub", OpTag::Sub),
    ("__sub__", OpTag::Sub),
    ("mul", OpTag::Mul),
    ("__mul__", OpTag::Mul),
    ("matmul", OpTag::Matmul),
    ("mm", OpTag::Matmul),
    ("__matmul__", OpTag::Matmul),
    ("neg", OpTag::Neg),
    ("__neg__", OpTag::Neg),
    ("gt", OpTag::Gt),
    ("__gt__", OpTag::Gt),
    ("ge", OpTag::Ge),
    ("__ge__", OpTag::Ge),
    ("lt", OpTag::Lt),
    ("__lt__", OpTag::Lt),
    ("le", OpTag::Le),
    ("__le__", OpTag::Le),
    ("eq", OpTag::Eq),
    ("__eq__", OpTag::Eq),
    ("sum", OpTag::Sum),
    ("mean", OpTag::Mean),
    ("max", OpTag::Max),
    ("argmax", OpTag::Argmax),
    ("mod", OpTag::Mod),
    ("__mod__", OpTag::Mod),
    ("conv2d", OpTag::Conv2d),
    ("stack", OpTag::Stack),
    ("cat", OpTag::Cat),
    ("chunk", OpTag::Chunk),
    ("unbind", OpTag::Unbind),
    ("slice", OpTag::Slice),
    ("index_select", OpTag::IndexSelect),
    ("permute", OpTag::Permute),
    ("transpose", OpTag::Transpose),
    ("t", OpTag::T),
    ("reshape", OpTag::Reshape),
    ("view", OpTag::Reshape),
    ("expand", OpTag::Expand),
];

impl OpTag {
    /// Resolves an operation name, accepting an optional `torch.` prefix.
    pub fn from_name(name: &str) -> Result<Self> {
        let bare = name.strip_prefix("torch.").unwrap_or(name);
        NAMES
            .iter()
            .find(|(n, _)| *n == bare)
            .map(|(_, tag)| *tag)
            .ok_or_else(|| Error::UnsupportedOperation(name.to_string()))
    }

    /// The canonical name of the operation.
    pub fn name(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, tag)| tag == self)
            .map_or("unknown", |(n, _)| n)
    }

    /// Combines two operands into one result.
    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            OpTag::Add
                | OpTag::Sub
                | OpTag::Mul
                | OpTag::Matmul
                | OpTag::Gt
                | OpTag::Ge
                | OpTag::Lt
                | OpTag::Le
                | OpTag::Eq
                | OpTag::Conv2d
        )
    }

    /// The structural operation described by this tag and `args`, `None` for value operations.
    pub fn structural(&self, args: &OpArgs) -> Option<Structural> {
        let axis = args.axis;
        Some(match self {
            OpTag::Stack => Structural::Stack { axis },
            OpTag::Cat => Structural::Cat { axis },
            OpTag::Chunk => Structural::Chunk {
                chunks: args.chunks,
                axis,
            },
            OpTag::Unbind => Structural::Unbind { axis },
            OpTag::Slice => Structural::Slice {
                axis,
                start: args.start,
                end: args.end,
                step: args.step.max(1),
            },
            OpTag::IndexSelect => Structural::IndexSelect {
                axis,
                indices: args.indices.clone(),
            },
            OpTag::Permute => Structural::Permute {
                axes: args.axes.clone(),
            },
            OpTag::Transpose => Structural::Transpose {
                dim0: args.axes.first().copied().unwrap_or(0),
                dim1: args.axes.get(1).copied().unwrap_or(1),
            },
            OpTag::T => Structural::Transpose { dim0: 0, dim1: 1 },
            OpTag::Reshape => Structural::Reshape {
                shape: args.shape.clone(),
            },
            OpTag::Expand => Structural::Expand {
                shape: args.shape.clone(),
            },
            _ => return None,
        })
    }
}

impl FromStr for OpTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OpTag::from_name(s)
    }
}

/// Arguments of a dispatched operation, each operation reads the fields it needs.
#[derive(Debug, Clone, Default)]
pub struct OpArgs {
    /// Axis of structural operations.
    pub axis: usize,
    /// Number of chunks for `chunk`.
    pub chunks: usize,
    /// Indices for `index_select`.
    pub indices: Vec<usize>,
    /// First index of `slice`.
    pub start: usize,
    /// End of `slice` (exclusive), the axis length if `None`.
    pub end: Option<usize>,
    /// Step of `slice`, 0 is read as 1.
    pub step: usize,
    /// Target shape of `reshape` and `expand`.
    pub shape: Vec<usize>,
    /// Axes of `permute` and `transpose`.
    pub axes: Vec<usize>,
    /// Reduction axes of `sum` and `mean`, all axes if `None`.
    pub dims: Option<Vec<usize>>,
    /// Reduction axis of `max` and `argmax`, the flattened tensor if `None`.
    pub dim: Option<usize>,
    /// Keep reduced axes with size 1.
    pub keepdim: bool,
    /// Divisor of `mod`.
    pub divisor: i64,
    /// Hyperparameters of `conv2d`.
    pub conv: Conv2d,
}

/// A rearrangement of tensor elements, applied identically to every share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Structural {
    /// Stacks all inputs along a new axis.
    Stack {
        /// Position of the new axis.
        axis: usize,
    },
    /// Concatenates all inputs along an existing axis.
    Cat {
        /// The axis to concatenate along.
        axis: usize,
    },
    /// Splits into chunks of `ceil(len / chunks)` elements, the last one possibly smaller.
    Chunk {
        /// The requested number of chunks.
        chunks: usize,
        /// The axis to split.
        axis: usize,
    },
    /// Removes an axis, yielding one output per index.
    Unbind {
        /// The axis to remove.
        axis: usize,
    },
    /// Keeps every `step`-th index in `start..end`.
    Slice {
        /// The sliced axis.
        axis: usize,
        /// First index.
        start: usize,
        /// End (exclusive), the axis length if `None`.
        end: Option<usize>,
        /// Step, at least 1.
        step: usize,
    },
    /// Selects the given indices along an axis.
    IndexSelect {
        /// The indexed axis.
        axis: usize,
        /// Public indices.
        indices: Vec<usize>,
    },
    /// Reorders the axes.
    Permute {
        /// The new order of the axes.
        axes: Vec<usize>,
    },
    /// Swaps two axes.
    Transpose {
        /// First axis.
        dim0: usize,
        /// Second axis.
        dim1: usize,
    },
    /// Changes the shape, keeping the row-major element order.
    Reshape {
        /// The new shape.
        shape: Vec<usize>,
    },
    /// Broadcasts to a larger shape.
    Expand {
        /// The target shape.
        shape: Vec<usize>,
    },
}

fn check_axis(axis: usize, ndim: usize) -> Result<()> {
    if axis < ndim {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "axis {axis} out of range for a tensor of rank {ndim}"
        )))
    }
}

fn same_shapes<T>(op: &'static str, inputs: &[&ArrayD<T>]) -> Result<()> {
    let Some(first) = inputs.first() else {
        return Err(Error::InvalidArgument(format!("{op} of no tensors")));
    };
    match inputs.iter().find(|x| x.shape() != first.shape()) {
        Some(x) => Err(Error::ShapeMismatch {
            op,
            left: first.shape().to_vec(),
            right: x.shape().to_vec(),
        }),
        None => Ok(()),
    }
}

impl Structural {
    /// Whether the operation consumes several inputs.
    pub fn is_many_to_one(&self) -> bool {
        matches!(self, Structural::Stack { .. } | Structural::Cat { .. })
    }

    /// Applies the rearrangement to local tensors.
    pub fn apply<T: Clone>(&self, inputs: &[&ArrayD<T>]) -> Result<Vec<ArrayD<T>>> {
        let owned = |x: ArrayD<T>| x.as_standard_layout().into_owned();
        if self.is_many_to_one() {
            same_shapes_for(self, inputs)?;
        } else if inputs.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "{self:?} expects a single tensor, got {}",
                inputs.len()
            )));
        }
        let x = inputs[0];
        let out = match self {
            Structural::Stack { axis } => {
                check_axis(*axis, x.ndim() + 1)?;
                let views: Vec<_> = inputs.iter().map(|t| t.view()).collect();
                vec![ndarray::stack(Axis(*axis), &views)?]
            }
            Structural::Cat { axis } => {
                check_axis(*axis, x.ndim())?;
                let views: Vec<_> = inputs.iter().map(|t| t.view()).collect();
                vec![ndarray::concatenate(Axis(*axis), &views)?]
            }
            Structural::Chunk { chunks, axis } => {
                check_axis(*axis, x.ndim())?;
                if *chunks == 0 {
                    return Err(Error::InvalidArgument("chunk into 0 pieces".into()));
                }
                let len = x.shape()[*axis];
                let size = len.div_ceil(*chunks).max(1);
                (0..len)
                    .step_by(size)
                    .map(|start| {
                        let end = (start + size).min(len);
                        owned(x.slice_axis(Axis(*axis), Slice::from(start..end)).to_owned())
                    })
                    .collect()
            }
            Structural::Unbind { axis } => {
                check_axis(*axis, x.ndim())?;
                x.axis_iter(Axis(*axis)).map(|v| v.to_owned()).collect()
            }
            Structural::Slice {
                axis,
                start,
                end,
                step,
            } => {
                check_axis(*axis, x.ndim())?;
                let len = x.shape()[*axis];
                let end = end.unwrap_or(len).min(len);
                let start = (*start).min(end);
                let slice = Slice::new(start as isize, Some(end as isize), (*step).max(1) as isize);
                vec![owned(x.slice_axis(Axis(*axis), slice).to_owned())]
            }
            Structural::IndexSelect { axis, indices } => {
                check_axis(*axis, x.ndim())?;
                let len = x.shape()[*axis];
                if let Some(i) = indices.iter().find(|&&i| i >= len) {
                    return Err(Error::InvalidArgument(format!(
                        "index {i} out of range for an axis of length {len}"
                    )));
                }
                vec![x.select(Axis(*axis), indices)]
            }
            Structural::Permute { axes } => {
                let mut sorted = axes.clone();
                sorted.sort_unstable();
                if sorted != (0..x.ndim()).collect::<Vec<_>>() {
                    return Err(Error::InvalidArgument(format!(
                        "{axes:?} is not a permutation of the {} axes",
                        x.ndim()
                    )));
                }
                vec![owned(x.clone().permuted_axes(IxDyn(axes)))]
            }
            Structural::Transpose { dim0, dim1 } => {
                check_axis(*dim0, x.ndim())?;
                check_axis(*dim1, x.ndim())?;
                let mut t = x.clone();
                t.swap_axes(*dim0, *dim1);
                vec![owned(t)]
            }
            Structural::Reshape { shape } => {
                vec![owned(x.clone()).into_shape(IxDyn(shape))?]
            }
            Structural::Expand { shape } => vec![broadcast_to("expand", x, shape)?],
        };
        Ok(out)
    }
}

fn same_shapes_for<T>(op: &Structural, inputs: &[&ArrayD<T>]) -> Result<()> {
    match op {
        Structural::Stack { .. } => same_shapes("stack", inputs),
        Structural::Cat { axis } => {
            let Some(first) = inputs.first() else {
                return Err(Error::InvalidArgument("cat of no tensors".into()));
            };
            // all axes but the concatenated one must agree
            let strip = |s: &[usize]| -> Vec<usize> {
                s.iter()
                    .enumerate()
                    .filter(|(i, _)| i != axis)
                    .map(|(_, d)| *d)
                    .collect()
            };
            match inputs.iter().find(|x| {
                x.ndim() != first.ndim() || strip(x.shape()) != strip(first.shape())
            }) {
                Some(x) => Err(Error::ShapeMismatch {
                    op: "cat",
                    left: first.shape().to_vec(),
                    right: x.shape().to_vec(),
                }),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

/// Operations that can be invoked by name on a tensor type.
pub trait Dispatch: Sized {
    /// Applies a structural operation to the local values of all inputs.
    fn apply_structural(inputs: &[&Self], op: &Structural) -> Result<Vec<Self>>;

    /// Applies a two-operand operation.
    fn binary(&self, tag: OpTag, other: &Self, args: &OpArgs) -> Result<Self>;

    /// Applies a single-operand value operation.
    fn unary(&self, tag: OpTag, args: &OpArgs) -> Result<Self>;

    /// Resolves `name` and applies it to `inputs`.
    ///
    /// Fails with [`Error::UnsupportedOperation`] for names without a secure implementation.
    fn call(name: &str, inputs: &[&Self], args: &OpArgs) -> Result<Vec<Self>> {
        let tag = OpTag::from_name(name)?;
        if let Some(op) = tag.structural(args) {
            return Self::apply_structural(inputs, &op);
        }
        match (tag.is_binary(), inputs) {
            (true, [x, y]) => Ok(vec![x.binary(tag, y, args)?]),
            (false, [x]) => Ok(vec![x.unary(tag, args)?]),
            _ => Err(Error::InvalidArgument(format!(
                "'{}' cannot be applied to {} operands",
                tag.name(),
                inputs.len()
            ))),
        }
    }
}

impl Dispatch for SharedTensor {
    fn apply_structural(inputs: &[&Self], op: &Structural) -> Result<Vec<Self>> {
        SharedTensor::apply_structural(inputs, op)
    }

    fn binary(&self, tag: OpTag, other: &Self, args: &OpArgs) -> Result<Self> {
        match tag {
            OpTag::Add => self.add(other),
            OpTag::Sub => self.sub(other),
            OpTag::Mul => self.mul(other),
            OpTag::Matmul => self.matmul(other),
            OpTag::Gt => self.gt(other),
            OpTag::Ge => self.ge(other),
            OpTag::Lt => self.lt(other),
            OpTag::Le => self.le(other),
            OpTag::Eq => self.eq(other),
            OpTag::Conv2d => conv2d(
                Operand::Shared(self),
                Operand::Shared(other),
                None,
                &args.conv,
            ),
            _ => Err(Error::UnsupportedOperation(tag.name().to_string())),
        }
    }

    fn unary(&self, tag: OpTag, args: &OpArgs) -> Result<Self> {
        match tag {
            OpTag::Neg => self.neg(),
            OpTag::Sum => self.sum(args.dims.as_deref(), args.keepdim),
            OpTag::Mean => self.mean(args.dims.as_deref(), args.keepdim),
            OpTag::Max => self.max(args.dim, args.keepdim),
            OpTag::Argmax => self.argmax(args.dim, args.keepdim),
            OpTag::Mod => self.modulo(args.divisor),
            _ => Err(Error::UnsupportedOperation(tag.name().to_string())),
        }
    }
}
