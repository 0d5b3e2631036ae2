//! Fixed-point encoding of real tensors on top of plain or secret-shared integers.
//!
//! A real value `v` is represented by the integer `round(v * base^precision_fractional)`. The
//! integer lives in a [`Child`], either as a plaintext tensor or as a [`SharedTensor`]; every
//! operation matches on the child and either computes directly on the integers or delegates to
//! the sharing engine. Plain operands of mixed operations are public constants and are never
//! split into shares.
//!
//! Products carry twice the scale and are truncated back by flooring division, in both modes.
//! Plaintext arithmetic runs on 128-bit intermediates and fails with [`Error::FieldOverflow`]
//! when a result leaves the 64-bit encoding.

use ndarray::{ArrayD, IxDyn};
use tracing::{Level, debug, instrument};

use crate::{
    error::{Error, Result},
    field::Field,
    kernel::{
        Conv2d, fold_axes, fold_output, matmul, max_along, unfold, weight_matrix, zip_broadcast,
    },
    ops::{Dispatch, OpArgs, OpTag, Structural},
    party::Party,
    provider::CryptoProvider,
    shared::{Operand, SharedTensor, conv2d},
};

/// `base^precision_fractional`, failing if it does not fit into an `i64`.
pub fn scale(base: u32, precision_fractional: u32) -> Result<i64> {
    if base < 2 {
        return Err(Error::InvalidArgument(format!("base {base} is below 2")));
    }
    i64::from(base)
        .checked_pow(precision_fractional)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "scale {base}^{precision_fractional} does not fit into 64 bits"
            ))
        })
}

/// Encodes real values as `round(v * base^precision_fractional)`.
pub fn encode(values: &ArrayD<f64>, base: u32, precision_fractional: u32) -> Result<ArrayD<i64>> {
    let scale = scale(base, precision_fractional)? as f64;
    let bound = i64::MAX as u64;
    if let Some(v) = values
        .iter()
        .map(|v| (v * scale).round())
        .find(|v| !v.is_finite() || v.abs() >= bound as f64)
    {
        return Err(Error::FieldOverflow { value: v, bound });
    }
    Ok(values.mapv(|v| (v * scale).round() as i64))
}

/// Decodes integers back to real values, `v / base^precision_fractional`.
pub fn decode(values: &ArrayD<i64>, base: u32, precision_fractional: u32) -> Result<ArrayD<f64>> {
    let scale = scale(base, precision_fractional)? as f64;
    Ok(values.mapv(|v| v as f64 / scale))
}

/// A plaintext intermediate, `None` once it has overflowed.
type Wide = Option<i128>;

fn widen(t: &ArrayD<i64>) -> ArrayD<Wide> {
    t.mapv(|v| Some(i128::from(v)))
}

fn wide_add(x: Wide, y: Wide) -> Wide {
    x?.checked_add(y?)
}

fn wide_sub(x: Wide, y: Wide) -> Wide {
    x?.checked_sub(y?)
}

fn wide_mul(x: Wide, y: Wide) -> Wide {
    x?.checked_mul(y?)
}

/// Divides a double-scale product by the scale, rounding towards negative infinity like the
/// shared truncation.
fn truncate(v: Wide, scale: i64) -> Wide {
    v?.checked_div_euclid(i128::from(scale))
}

/// Narrows intermediates back to encoded integers.
fn narrow(t: &ArrayD<Wide>) -> Result<ArrayD<i64>> {
    let bound = i64::MAX as u64;
    let values = t
        .iter()
        .map(|&v| {
            v.and_then(|v| i64::try_from(v).ok())
                .ok_or_else(|| Error::FieldOverflow {
                    value: v.map_or(f64::INFINITY, |v| v as f64),
                    bound,
                })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(ArrayD::from_shape_vec(t.raw_dim(), values)?)
}

/// Divides a shared double-scale product by the scale, discarding the product.
fn rescale(product: SharedTensor, scale: i64) -> Result<SharedTensor> {
    let out = product.div_public(scale.unsigned_abs());
    product.discard();
    out
}

/// The integers behind a fixed-point tensor.
#[derive(Debug, Clone)]
pub enum Child {
    /// A plaintext tensor.
    Plain(ArrayD<i64>),
    /// A secret-shared tensor.
    Shared(SharedTensor),
}

impl Child {
    /// The shape of the underlying tensor.
    pub fn shape(&self) -> &[usize] {
        match self {
            Child::Plain(t) => t.shape(),
            Child::Shared(t) => t.shape(),
        }
    }

    fn operand(&self) -> Operand<'_> {
        match self {
            Child::Plain(t) => Operand::Public(t),
            Child::Shared(t) => Operand::Shared(t),
        }
    }
}

/// A tensor of reals in fixed-point encoding.
#[derive(Debug, Clone)]
pub struct FixedPointTensor {
    child: Child,
    base: u32,
    precision_fractional: u32,
    scale: i64,
}

impl FixedPointTensor {
    /// Wraps already encoded integers.
    pub fn new(child: Child, base: u32, precision_fractional: u32) -> Result<Self> {
        Ok(Self {
            child,
            base,
            precision_fractional,
            scale: scale(base, precision_fractional)?,
        })
    }

    /// Encodes real values with the given base and number of fractional digits.
    pub fn encode(values: &ArrayD<f64>, base: u32, precision_fractional: u32) -> Result<Self> {
        let encoded = encode(values, base, precision_fractional)?;
        Self::new(Child::Plain(encoded), base, precision_fractional)
    }

    /// Encodes real values with base 10 and 3 fractional digits.
    pub fn fix_prec(values: &ArrayD<f64>) -> Result<Self> {
        Self::encode(
            values,
            crate::config::DEFAULT_BASE,
            crate::config::DEFAULT_PRECISION_FRACTIONAL,
        )
    }

    fn with_child(&self, child: Child) -> Self {
        Self {
            child,
            base: self.base,
            precision_fractional: self.precision_fractional,
            scale: self.scale,
        }
    }

    /// The encoded integers.
    pub fn child(&self) -> &Child {
        &self.child
    }

    /// Unwraps the encoded integers.
    pub fn into_child(self) -> Child {
        self.child
    }

    /// The base of the encoding.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The number of fractional digits.
    pub fn precision_fractional(&self) -> u32 {
        self.precision_fractional
    }

    /// `base^precision_fractional`.
    pub fn scale(&self) -> i64 {
        self.scale
    }

    /// The shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.child.shape()
    }

    /// Whether the integers are secret-shared.
    pub fn is_shared(&self) -> bool {
        matches!(self.child, Child::Shared(_))
    }

    /// Decodes a plaintext tensor to reals. Shared tensors have to be reconstructed with
    /// [`FixedPointTensor::get`] first.
    pub fn decode(&self) -> Result<ArrayD<f64>> {
        match &self.child {
            Child::Plain(t) => decode(t, self.base, self.precision_fractional),
            Child::Shared(_) => Err(Error::InvalidArgument(
                "a shared tensor must be reconstructed before decoding".into(),
            )),
        }
    }

    /// Secret-shares the encoded integers between `parties`.
    pub fn share(
        &self,
        parties: &[Party],
        provider: &CryptoProvider,
        field: Field,
    ) -> Result<Self> {
        match &self.child {
            Child::Plain(t) => Ok(self.with_child(Child::Shared(SharedTensor::share(
                t, parties, provider, field,
            )?))),
            Child::Shared(_) => Err(Error::InvalidArgument("the tensor is already shared".into())),
        }
    }

    /// Reconstructs a shared tensor, consuming its shares. Plain tensors are returned as is.
    pub fn get(self) -> Result<Self> {
        let child = match self.child {
            Child::Plain(t) => Child::Plain(t),
            Child::Shared(t) => Child::Plain(t.get()?),
        };
        Ok(Self { child, ..self })
    }

    /// Reconstructs a shared tensor without consuming its shares.
    pub fn virtual_get(&self) -> Result<Self> {
        match &self.child {
            Child::Plain(_) => Ok(self.clone()),
            Child::Shared(t) => Ok(self.with_child(Child::Plain(t.virtual_get()?))),
        }
    }

    /// Removes the shares of a shared tensor from their parties.
    pub fn discard(self) {
        if let Child::Shared(t) = self.child {
            t.discard();
        }
    }

    fn check_precision(&self, other: &Self) -> Result<()> {
        if (self.base, self.precision_fractional) == (other.base, other.precision_fractional) {
            Ok(())
        } else {
            Err(Error::PrecisionMismatch {
                left: (self.base, self.precision_fractional),
                right: (other.base, other.precision_fractional),
            })
        }
    }

    /// `self + other`, both with the same encoding.
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.check_precision(other)?;
        let child = match (&self.child, &other.child) {
            (Child::Plain(a), Child::Plain(b)) => Child::Plain(narrow(&zip_broadcast(
                "add",
                &widen(a),
                &widen(b),
                |x, y| wide_add(*x, *y),
            )?)?),
            (Child::Shared(x), Child::Plain(p)) | (Child::Plain(p), Child::Shared(x)) => {
                Child::Shared(x.add_public(p)?)
            }
            (Child::Shared(x), Child::Shared(y)) => Child::Shared(x.add(y)?),
        };
        Ok(self.with_child(child))
    }

    /// `self - other`, both with the same encoding.
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.check_precision(other)?;
        let child = match (&self.child, &other.child) {
            (Child::Plain(a), Child::Plain(b)) => Child::Plain(narrow(&zip_broadcast(
                "sub",
                &widen(a),
                &widen(b),
                |x, y| wide_sub(*x, *y),
            )?)?),
            (Child::Shared(x), Child::Plain(p)) => Child::Shared(x.sub_public(p)?),
            (Child::Plain(p), Child::Shared(y)) => Child::Shared(y.rsub_public(p)?),
            (Child::Shared(x), Child::Shared(y)) => Child::Shared(x.sub(y)?),
        };
        Ok(self.with_child(child))
    }

    /// `-self`.
    pub fn neg(&self) -> Result<Self> {
        let child = match &self.child {
            Child::Plain(a) => Child::Plain(narrow(&widen(a).mapv(|v| v.map(|v| -v)))?),
            Child::Shared(x) => Child::Shared(x.neg()?),
        };
        Ok(self.with_child(child))
    }

    /// `self * other` elementwise, truncated back to a single scale.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn mul(&self, other: &Self) -> Result<Self> {
        self.check_precision(other)?;
        let scale = self.scale;
        let child = match (&self.child, &other.child) {
            (Child::Plain(a), Child::Plain(b)) => {
                let product =
                    zip_broadcast("mul", &widen(a), &widen(b), |x, y| wide_mul(*x, *y))?;
                Child::Plain(narrow(&product.mapv(|v| truncate(v, scale)))?)
            }
            (Child::Shared(x), Child::Plain(p)) | (Child::Plain(p), Child::Shared(x)) => {
                Child::Shared(rescale(x.mul_public(p)?, scale)?)
            }
            (Child::Shared(x), Child::Shared(y)) => Child::Shared(rescale(x.mul(y)?, scale)?),
        };
        Ok(self.with_child(child))
    }

    /// `self @ other` for matrices, truncated back to a single scale.
    #[instrument(level = Level::DEBUG, skip_all, err)]
    pub fn matmul(&self, other: &Self) -> Result<Self> {
        self.check_precision(other)?;
        let scale = self.scale;
        let child = match (&self.child, &other.child) {
            (Child::Plain(a), Child::Plain(b)) => {
                let product = matmul(&widen(a), &widen(b), Some(0), wide_add, wide_mul)?;
                Child::Plain(narrow(&product.mapv(|v| truncate(v, scale)))?)
            }
            (Child::Shared(x), Child::Plain(p)) => {
                Child::Shared(rescale(x.matmul_public(p)?, scale)?)
            }
            (Child::Plain(p), Child::Shared(y)) => {
                Child::Shared(rescale(y.rmatmul_public(p)?, scale)?)
            }
            (Child::Shared(x), Child::Shared(y)) => Child::Shared(rescale(x.matmul(y)?, scale)?),
        };
        Ok(self.with_child(child))
    }

    /// `bias + mat1 @ mat2`.
    pub fn addmm(bias: &Self, mat1: &Self, mat2: &Self) -> Result<Self> {
        let product = mat1.matmul(mat2)?;
        let out = product.add(bias);
        product.discard();
        out
    }

    /// `input @ weight.t() + bias`, the affine map of a linear layer.
    pub fn linear(input: &Self, weight: &Self, bias: Option<&Self>) -> Result<Self> {
        let transposed = weight.t()?;
        let product = input.matmul(&transposed);
        transposed.discard();
        let product = product?;
        match bias {
            Some(bias) => {
                let out = product.add(bias);
                product.discard();
                out
            }
            None => Ok(product),
        }
    }

    fn compare(
        &self,
        other: &Self,
        swap: bool,
        plain: fn(i64) -> bool,
        shared: fn(&SharedTensor) -> Result<SharedTensor>,
    ) -> Result<Self> {
        let diff = if swap { other.sub(self)? } else { self.sub(other)? };
        let scale = self.scale;
        let child = match diff.child {
            Child::Plain(d) => Child::Plain(d.mapv(|v| i64::from(plain(v)) * scale)),
            Child::Shared(d) => {
                let bit = shared(&d);
                d.discard();
                let bit = bit?;
                let scaled = bit.scale_by(scale);
                bit.discard();
                Child::Shared(scaled?)
            }
        };
        Ok(self.with_child(child))
    }

    /// `self > other`, decoding to 1.0 or 0.0.
    pub fn gt(&self, other: &Self) -> Result<Self> {
        self.compare(other, false, |d| d > 0, SharedTensor::gt_zero)
    }

    /// `self >= other`, decoding to 1.0 or 0.0.
    pub fn ge(&self, other: &Self) -> Result<Self> {
        self.compare(other, false, |d| d >= 0, SharedTensor::ge_zero)
    }

    /// `self < other`, decoding to 1.0 or 0.0.
    pub fn lt(&self, other: &Self) -> Result<Self> {
        self.compare(other, true, |d| d > 0, SharedTensor::gt_zero)
    }

    /// `self <= other`, decoding to 1.0 or 0.0.
    pub fn le(&self, other: &Self) -> Result<Self> {
        self.compare(other, true, |d| d >= 0, SharedTensor::ge_zero)
    }

    /// `self == other`, decoding to 1.0 or 0.0.
    pub fn eq(&self, other: &Self) -> Result<Self> {
        self.compare(other, false, |d| d == 0, SharedTensor::eq_zero)
    }

    /// Sums over `dims`, or over all axes if `None`.
    pub fn sum(&self, dims: Option<&[usize]>, keepdim: bool) -> Result<Self> {
        let child = match &self.child {
            Child::Plain(a) => {
                let all: Vec<usize> = (0..a.ndim()).collect();
                let sum = fold_axes(&widen(a), dims.unwrap_or(&all), keepdim, Some(0), |x, y| {
                    wide_add(*x, *y)
                })?;
                Child::Plain(narrow(&sum)?)
            }
            Child::Shared(x) => Child::Shared(x.sum(dims, keepdim)?),
        };
        Ok(self.with_child(child))
    }

    /// The mean over `dims`, rounded towards negative infinity at the tensor's precision.
    pub fn mean(&self, dims: Option<&[usize]>, keepdim: bool) -> Result<Self> {
        let child = match &self.child {
            Child::Plain(a) => {
                let count: usize = match dims {
                    Some(dims) => dims.iter().map(|&d| a.shape().get(d).copied().unwrap_or(1)).product(),
                    None => a.len(),
                };
                if count == 0 {
                    return Err(Error::InvalidArgument("mean of an empty tensor".into()));
                }
                let all: Vec<usize> = (0..a.ndim()).collect();
                let sum = fold_axes(&widen(a), dims.unwrap_or(&all), keepdim, Some(0), |x, y| {
                    wide_add(*x, *y)
                })?;
                Child::Plain(narrow(&sum.mapv(|v| v?.checked_div_euclid(count as i128)))?)
            }
            Child::Shared(x) => Child::Shared(x.mean(dims, keepdim)?),
        };
        Ok(self.with_child(child))
    }

    /// The maximum along `dim`, or over all elements if `None`.
    pub fn max(&self, dim: Option<usize>, keepdim: bool) -> Result<Self> {
        let child = match &self.child {
            Child::Plain(a) => Child::Plain(max_along(a, dim, keepdim)?.0),
            Child::Shared(x) => Child::Shared(x.max(dim, keepdim)?),
        };
        Ok(self.with_child(child))
    }

    /// The index of the first maximum along `dim`, encoded so that it decodes to the index.
    pub fn argmax(&self, dim: Option<usize>, keepdim: bool) -> Result<Self> {
        let scale = self.scale;
        let child = match &self.child {
            Child::Plain(a) => {
                let (_, index) = max_along(a, dim, keepdim)?;
                Child::Plain(narrow(&widen(&index).mapv(|i| wide_mul(i, Some(scale.into()))))?)
            }
            Child::Shared(x) => {
                let index = x.argmax(dim, keepdim)?;
                let scaled = index.scale_by(scale);
                index.discard();
                Child::Shared(scaled?)
            }
        };
        Ok(self.with_child(child))
    }

    fn structural(&self, op: Structural) -> Result<Self> {
        let mut out = Self::apply_structural(&[self], &op)?;
        match (out.pop(), out.is_empty()) {
            (Some(t), true) => Ok(t),
            _ => Err(Error::InvalidArgument(format!("{op:?} did not yield one tensor"))),
        }
    }

    /// Transposes a matrix.
    pub fn t(&self) -> Result<Self> {
        if self.shape().len() != 2 {
            return Err(Error::InvalidArgument(format!(
                "t() expects a matrix, got shape {:?}",
                self.shape()
            )));
        }
        self.transpose(0, 1)
    }

    /// Swaps two axes.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        self.structural(Structural::Transpose { dim0, dim1 })
    }

    /// Changes the shape, keeping the row-major element order.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        self.structural(Structural::Reshape {
            shape: shape.to_vec(),
        })
    }

    /// 2-D convolution with an optional per-channel bias, added after truncation.
    #[instrument(level = Level::DEBUG, skip_all, fields(conv = ?conv), err)]
    pub fn conv2d(input: &Self, weight: &Self, bias: Option<&Self>, conv: &Conv2d) -> Result<Self> {
        input.check_precision(weight)?;
        if let Some(bias) = bias {
            input.check_precision(bias)?;
        }
        let scale = input.scale;
        let child = match (&input.child, &weight.child) {
            (Child::Plain(x), Child::Plain(w)) => Child::Plain(plain_conv(x, w, conv, scale)?),
            (x, w) => {
                let product = conv2d(x.operand(), w.operand(), None, conv)?;
                Child::Shared(rescale(product, scale)?)
            }
        };
        let Some(bias) = bias else {
            return Ok(input.with_child(child));
        };
        debug!("Adding a bias of shape {:?}", bias.shape());
        let with_bias = add_channel_bias(&child, &bias.child);
        if let Child::Shared(t) = child {
            t.discard();
        }
        Ok(input.with_child(with_bias?))
    }
}

fn plain_conv(x: &ArrayD<i64>, w: &ArrayD<i64>, conv: &Conv2d, scale: i64) -> Result<ArrayD<i64>> {
    let shape = conv.shape(x.shape(), w.shape())?;
    let (x, w) = (widen(x), widen(w));
    let per_group = shape.in_channels / conv.groups;
    let blocks = (0..conv.groups)
        .map(|g| {
            let cols = unfold(&x, Some(0), conv, &shape, g * per_group..(g + 1) * per_group)?;
            let weights = weight_matrix(&w, &shape, conv.groups, g)?;
            matmul(&cols, &weights, Some(0), wide_add, wide_mul)
        })
        .collect::<Result<Vec<_>>>()?;
    narrow(&fold_output(blocks, &shape)?.mapv(|v| truncate(v, scale)))
}

fn add_channel_bias(out: &Child, bias: &Child) -> Result<Child> {
    let channels = match out.shape() {
        [_, o, _, _] if bias.shape() == [*o] => *o,
        _ => {
            return Err(Error::ShapeMismatch {
                op: "conv2d bias",
                left: out.shape().to_vec(),
                right: bias.shape().to_vec(),
            });
        }
    };
    let column = IxDyn(&[1, channels, 1, 1]);
    Ok(match (out, bias) {
        (Child::Plain(y), Child::Plain(b)) => {
            let b = widen(b).into_shape(column)?;
            Child::Plain(narrow(&zip_broadcast("conv2d bias", &widen(y), &b, |v, c| {
                wide_add(*v, *c)
            })?)?)
        }
        (Child::Shared(y), bias) => Child::Shared(y.add_bias(bias.operand())?),
        (Child::Plain(y), Child::Shared(b)) => {
            let b = b.reshape(&[1, channels, 1, 1])?;
            let sum = b.add_public(y);
            b.discard();
            Child::Shared(sum?)
        }
    })
}

impl Dispatch for FixedPointTensor {
    fn apply_structural(inputs: &[&Self], op: &Structural) -> Result<Vec<Self>> {
        let Some(first) = inputs.first() else {
            return Err(Error::InvalidArgument(format!("{op:?} of no tensors")));
        };
        for x in &inputs[1..] {
            first.check_precision(x)?;
        }
        let plain: Option<Vec<&ArrayD<i64>>> = inputs
            .iter()
            .map(|x| match &x.child {
                Child::Plain(t) => Some(t),
                Child::Shared(_) => None,
            })
            .collect();
        let shared: Option<Vec<&SharedTensor>> = inputs
            .iter()
            .map(|x| match &x.child {
                Child::Shared(t) => Some(t),
                Child::Plain(_) => None,
            })
            .collect();
        let children: Vec<Child> = match (plain, shared) {
            (Some(plain), _) => op.apply(&plain)?.into_iter().map(Child::Plain).collect(),
            (_, Some(shared)) => SharedTensor::apply_structural(&shared, op)?
                .into_iter()
                .map(Child::Shared)
                .collect(),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "{op:?} cannot mix plain and shared tensors"
                )));
            }
        };
        Ok(children.into_iter().map(|c| first.with_child(c)).collect())
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
            OpTag::Conv2d => Self::conv2d(self, other, None, &args.conv),
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
            _ => Err(Error::UnsupportedOperation(tag.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};

    use super::*;

    fn fp(values: &[f64], precision_fractional: u32) -> Result<FixedPointTensor> {
        FixedPointTensor::encode(&arr1(values).into_dyn(), 10, precision_fractional)
    }

    fn plain(t: &FixedPointTensor) -> Option<&ArrayD<i64>> {
        match t.child() {
            Child::Plain(t) => Some(t),
            Child::Shared(_) => None,
        }
    }

    #[test]
    fn encode_then_decode() -> Result<()> {
        let x = fp(&[0.1, 0.2, 0.3], 3)?;
        assert_eq!(plain(&x), Some(&arr1(&[100i64, 200, 300]).into_dyn()));
        assert_eq!(x.decode()?, arr1(&[0.1, 0.2, 0.3]).into_dyn());
        let y = x.add(&x)?;
        assert_eq!(plain(&y), Some(&arr1(&[200i64, 400, 600]).into_dyn()));
        Ok(())
    }

    #[test]
    fn encode_rejects_unrepresentable_values() {
        let values = arr1(&[f64::NAN]).into_dyn();
        assert!(matches!(
            encode(&values, 10, 3),
            Err(Error::FieldOverflow { .. })
        ));
        assert!(encode(&arr1(&[1e17]).into_dyn(), 10, 3).is_err());
        assert!(scale(10, 19).is_err());
        assert!(scale(1, 3).is_err());
    }

    #[test]
    fn products_round_down() -> Result<()> {
        let x = fp(&[2.113], 2)?;
        let y = x.mul(&x)?;
        assert_eq!(plain(&y), Some(&arr1(&[445i64]).into_dyn()));
        assert_eq!(y.precision_fractional(), 2);
        assert_eq!(y.decode()?, arr1(&[4.45]).into_dyn());

        let x = fp(&[2.113], 3)?;
        let y = fp(&[-0.113], 3)?;
        assert_eq!(x.mul(&y)?.decode()?, arr1(&[-0.239]).into_dyn());
        assert_eq!(x.mul(&y.add(&y)?)?.decode()?, arr1(&[-0.478]).into_dyn());
        Ok(())
    }

    #[test]
    fn plaintext_overflow_is_reported() -> Result<()> {
        let x = FixedPointTensor::fix_prec(&arr1(&[9.0e15, 9.0e15]).into_dyn())?;
        let overflows = |r: Result<FixedPointTensor>| matches!(r, Err(Error::FieldOverflow { .. }));
        assert!(overflows(x.add(&x)));
        assert!(overflows(x.neg()?.sub(&x)));
        assert!(overflows(x.mul(&x)));
        assert!(overflows(x.sum(None, false)));
        let ones = FixedPointTensor::fix_prec(&arr2(&[[1.0], [1.0]]).into_dyn())?;
        assert!(overflows(x.reshape(&[1, 2])?.matmul(&ones)));
        // the sum only exists as an intermediate
        assert_eq!(x.mean(None, false)?.decode()?.into_raw_vec(), vec![9.0e15]);
        Ok(())
    }

    #[test]
    fn precision_must_match() -> Result<()> {
        let x = fp(&[1.0], 3)?;
        let y = fp(&[1.0], 2)?;
        assert!(matches!(
            x.add(&y),
            Err(Error::PrecisionMismatch {
                left: (10, 3),
                right: (10, 2)
            })
        ));
        assert!(x.sub(&y).is_err());
        assert!(x.mul(&y).is_err());
        Ok(())
    }

    #[test]
    fn linear_layer_methods() -> Result<()> {
        let m = FixedPointTensor::fix_prec(&arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn())?;
        assert_eq!(m.t()?.decode()?, arr2(&[[1.0, 3.0], [2.0, 4.0]]).into_dyn());
        assert_eq!(
            m.matmul(&m)?.decode()?,
            arr2(&[[7.0, 10.0], [15.0, 22.0]]).into_dyn()
        );
        assert_eq!(
            FixedPointTensor::linear(&m, &m, None)?.decode()?,
            arr2(&[[5.0, 11.0], [11.0, 25.0]]).into_dyn()
        );
        let weight = FixedPointTensor::fix_prec(&arr2(&[[1.0, 2.0], [4.0, 2.0]]).into_dyn())?;
        let input = FixedPointTensor::fix_prec(&arr2(&[[1.0, 2.0]]).into_dyn())?;
        let bias = FixedPointTensor::fix_prec(&arr1(&[1.0, 2.0]).into_dyn())?;
        assert_eq!(
            FixedPointTensor::addmm(&bias, &input, &weight)?.decode()?,
            arr2(&[[10.0, 8.0]]).into_dyn()
        );
        Ok(())
    }

    #[test]
    fn plain_comparisons_and_reductions() -> Result<()> {
        let x = fp(&[3.0, 1.0, 2.0], 3)?;
        let y = fp(&[2.0, 1.0, 5.0], 3)?;
        assert_eq!(x.gt(&y)?.decode()?, arr1(&[1.0, 0.0, 0.0]).into_dyn());
        assert_eq!(x.le(&y)?.decode()?, arr1(&[0.0, 1.0, 1.0]).into_dyn());
        assert_eq!(x.eq(&y)?.decode()?, arr1(&[0.0, 1.0, 0.0]).into_dyn());
        assert_eq!(x.max(None, false)?.decode()?.into_raw_vec(), vec![3.0]);
        assert_eq!(x.argmax(None, false)?.decode()?.into_raw_vec(), vec![0.0]);
        assert_eq!(x.sum(None, false)?.decode()?.into_raw_vec(), vec![6.0]);
        // 6 / 3 is exact, -0.001 / 2 rounds down
        assert_eq!(x.mean(None, false)?.decode()?.into_raw_vec(), vec![2.0]);
        let z = fp(&[-0.001, 0.0], 3)?;
        assert_eq!(z.mean(None, false)?.decode()?.into_raw_vec(), vec![-0.001]);
        Ok(())
    }
}
