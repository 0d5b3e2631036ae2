//! Local tensor kernels, executed by each party on its own share (or on plaintexts).
//!
//! The kernels are generic over the element type and take the ring operations as closures, so
//! that the same code serves field elements, signed integers and floats.

use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix2, Ix4, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn mismatch(op: &'static str, left: &[usize], right: &[usize]) -> Error {
    Error::ShapeMismatch {
        op,
        left: left.to_vec(),
        right: right.to_vec(),
    }
}

/// Computes the shape two tensors broadcast to (numpy rules).
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut shape = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        shape[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(shape)
}

/// Broadcasts `a` to `shape` and materializes the result.
pub(crate) fn broadcast_to<T: Clone>(
    op: &'static str,
    a: &ArrayD<T>,
    shape: &[usize],
) -> Result<ArrayD<T>> {
    a.broadcast(IxDyn(shape))
        .map(|v| v.to_owned())
        .ok_or_else(|| mismatch(op, a.shape(), shape))
}

/// Applies `f` elementwise after broadcasting both operands to a common shape.
pub(crate) fn zip_broadcast<A, B, C>(
    op: &'static str,
    a: &ArrayD<A>,
    b: &ArrayD<B>,
    f: impl Fn(&A, &B) -> C,
) -> Result<ArrayD<C>> {
    let shape = broadcast_shape(a.shape(), b.shape())
        .ok_or_else(|| mismatch(op, a.shape(), b.shape()))?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(op, a.shape(), b.shape()))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| mismatch(op, a.shape(), b.shape()))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|x, y| f(x, y)))
}

fn as_matrix<'a, T>(op: &'static str, a: &'a ArrayD<T>, b: &ArrayD<T>) -> Result<ArrayView2<'a, T>> {
    a.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| mismatch(op, a.shape(), b.shape()))
}

/// The 2-D matrix product `a @ b` over the ring given by `add` and `mul`.
pub(crate) fn matmul<T: Copy>(
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    zero: T,
    add: impl Fn(T, T) -> T,
    mul: impl Fn(T, T) -> T,
) -> Result<ArrayD<T>> {
    let lhs = as_matrix("matmul", a, b)?;
    let rhs = as_matrix("matmul", b, a)?;
    let (m, k) = lhs.dim();
    let (k2, n) = rhs.dim();
    if k != k2 {
        return Err(mismatch("matmul", a.shape(), b.shape()));
    }
    let mut out = Array2::from_elem((m, n), zero);
    for i in 0..m {
        for j in 0..n {
            let mut acc = zero;
            for l in 0..k {
                acc = add(acc, mul(lhs[[i, l]], rhs[[l, j]]));
            }
            out[[i, j]] = acc;
        }
    }
    Ok(out.into_dyn())
}

/// Folds the given axes with `f`, keeping them as size 1 if `keepdim` is set.
pub(crate) fn fold_axes<T: Clone>(
    x: &ArrayD<T>,
    axes: &[usize],
    keepdim: bool,
    init: T,
    f: impl Fn(&T, &T) -> T,
) -> Result<ArrayD<T>> {
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != axes.len() || sorted.iter().any(|&ax| ax >= x.ndim()) {
        return Err(Error::InvalidArgument(format!(
            "invalid reduction axes {axes:?} for a tensor of rank {}",
            x.ndim()
        )));
    }
    let mut out = x.clone();
    for &ax in sorted.iter().rev() {
        out = out.fold_axis(Axis(ax), init.clone(), |acc, v| f(acc, v));
    }
    if keepdim {
        for &ax in sorted.iter() {
            out = out.insert_axis(Axis(ax));
        }
    }
    Ok(out)
}

/// Remainder of the floor division, its sign follows the divisor.
pub(crate) fn floor_mod(v: i64, m: i64) -> i64 {
    let r = v % m;
    if r != 0 && ((r < 0) != (m < 0)) { r + m } else { r }
}

/// The shape left after reducing `dim` (all axes if `None`).
pub(crate) fn reduction_shape(shape: &[usize], dim: Option<usize>, keepdim: bool) -> Vec<usize> {
    match (dim, keepdim) {
        (None, false) => vec![],
        (None, true) => vec![1; shape.len()],
        (Some(d), false) => [&shape[..d], &shape[d + 1..]].concat(),
        (Some(d), true) => [&shape[..d], &[1usize][..], &shape[d + 1..]].concat(),
    }
}

/// Moves `dim` last and flattens the remaining axes into rows, `None` flattens everything into
/// a single row.
pub(crate) fn rows_of<T: Clone>(t: ArrayD<T>, dim: Option<usize>) -> Result<ArrayD<T>> {
    let Some(d) = dim else {
        let n = t.len();
        return Ok(t.as_standard_layout().into_owned().into_shape(IxDyn(&[1, n]))?);
    };
    if d >= t.ndim() {
        return Err(Error::InvalidArgument(format!(
            "axis {d} out of range for a tensor of rank {}",
            t.ndim()
        )));
    }
    let mut axes: Vec<usize> = (0..t.ndim()).filter(|&a| a != d).collect();
    axes.push(d);
    let n = t.shape()[d];
    let rows = t.len() / n.max(1);
    let t = t.permuted_axes(IxDyn(&axes)).as_standard_layout().into_owned();
    Ok(t.into_shape(IxDyn(&[rows, n]))?)
}

/// The maximum along `dim` and the index of its first occurrence.
pub(crate) fn max_along<T: Copy + PartialOrd>(
    x: &ArrayD<T>,
    dim: Option<usize>,
    keepdim: bool,
) -> Result<(ArrayD<T>, ArrayD<i64>)> {
    let shape = reduction_shape(x.shape(), dim, keepdim);
    let rows = rows_of(x.clone(), dim)?;
    if rows.shape()[1] == 0 {
        return Err(Error::InvalidArgument("maximum of an empty tensor".into()));
    }
    let mut values = Vec::with_capacity(rows.shape()[0]);
    let mut indices = Vec::with_capacity(rows.shape()[0]);
    for row in rows.axis_iter(Axis(0)) {
        let (mut best, mut at) = (row[0], 0);
        for (j, v) in row.iter().enumerate().skip(1) {
            if *v > best {
                best = *v;
                at = j;
            }
        }
        values.push(best);
        indices.push(at as i64);
    }
    Ok((
        ArrayD::from_shape_vec(IxDyn(&shape), values)?,
        ArrayD::from_shape_vec(IxDyn(&shape), indices)?,
    ))
}

/// Hyperparameters of a 2-D convolution over `(N, C, H, W)` inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2d {
    /// Step between two neighbouring patches, per spatial axis.
    pub stride: (usize, usize),
    /// Zero padding added on both sides, per spatial axis.
    pub padding: (usize, usize),
    /// Spacing between kernel taps, per spatial axis.
    pub dilation: (usize, usize),
    /// Number of blocked connections from input to output channels.
    pub groups: usize,
}

impl Default for Conv2d {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

/// Shapes of a validated convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvShape {
    pub(crate) batch: usize,
    pub(crate) in_channels: usize,
    pub(crate) out_channels: usize,
    pub(crate) kernel: (usize, usize),
    pub(crate) out: (usize, usize),
}

impl Conv2d {
    /// Sets the stride of both spatial axes.
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = (stride, stride);
        self
    }

    /// Sets the padding of both spatial axes.
    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = (padding, padding);
        self
    }

    /// Sets the dilation of both spatial axes.
    pub fn dilation(mut self, dilation: usize) -> Self {
        self.dilation = (dilation, dilation);
        self
    }

    /// Sets the number of groups.
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Validates input/weight shapes and computes the output geometry.
    pub(crate) fn shape(&self, input: &[usize], weight: &[usize]) -> Result<ConvShape> {
        let err = || mismatch("conv2d", input, weight);
        if input.len() != 4 || weight.len() != 4 {
            return Err(err());
        }
        if self.groups == 0
            || self.stride.0 == 0
            || self.stride.1 == 0
            || self.dilation.0 == 0
            || self.dilation.1 == 0
        {
            return Err(Error::InvalidArgument(format!("invalid conv2d parameters {self:?}")));
        }
        let (batch, in_channels, h, w) = (input[0], input[1], input[2], input[3]);
        let (out_channels, group_channels, kh, kw) = (weight[0], weight[1], weight[2], weight[3]);
        if in_channels % self.groups != 0
            || out_channels % self.groups != 0
            || in_channels / self.groups != group_channels
        {
            return Err(err());
        }
        let span_h = self.dilation.0 * (kh.max(1) - 1) + 1;
        let span_w = self.dilation.1 * (kw.max(1) - 1) + 1;
        let (padded_h, padded_w) = (h + 2 * self.padding.0, w + 2 * self.padding.1);
        if kh == 0 || kw == 0 || padded_h < span_h || padded_w < span_w {
            return Err(err());
        }
        Ok(ConvShape {
            batch,
            in_channels,
            out_channels,
            kernel: (kh, kw),
            out: (
                (padded_h - span_h) / self.stride.0 + 1,
                (padded_w - span_w) / self.stride.1 + 1,
            ),
        })
    }
}

/// Extracts the convolution patches of the channels `channels` of `x`.
///
/// Returns a `(N * out_h * out_w, C_g * kh * kw)` matrix, rows ordered by `(n, oy, ox)` and
/// columns by `(c, ky, kx)`, so that multiplying with a `(C_g * kh * kw, O_g)` weight matrix
/// yields the convolution. Out-of-bounds taps read `zero`.
pub(crate) fn unfold<T: Clone>(
    x: &ArrayD<T>,
    zero: T,
    conv: &Conv2d,
    shape: &ConvShape,
    channels: std::ops::Range<usize>,
) -> Result<ArrayD<T>> {
    let x = x.view().into_dimensionality::<Ix4>()?;
    let (h, w) = (x.dim().2 as isize, x.dim().3 as isize);
    let (kh, kw) = shape.kernel;
    let (oh, ow) = shape.out;
    let cols = channels.len() * kh * kw;
    let mut out = Array2::from_elem((shape.batch * oh * ow, cols), zero.clone());
    for n in 0..shape.batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let row = (n * oh + oy) * ow + ox;
                for (ci, c) in channels.clone().enumerate() {
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = (oy * conv.stride.0 + ky * conv.dilation.0) as isize
                                - conv.padding.0 as isize;
                            let ix = (ox * conv.stride.1 + kx * conv.dilation.1) as isize
                                - conv.padding.1 as isize;
                            if iy >= 0 && iy < h && ix >= 0 && ix < w {
                                let col = (ci * kh + ky) * kw + kx;
                                out[[row, col]] = x[[n, c, iy as usize, ix as usize]].clone();
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out.into_dyn())
}

/// Turns the weights of one group into a `(C_g * kh * kw, O_g)` matrix.
pub(crate) fn weight_matrix<T: Clone>(
    weight: &ArrayD<T>,
    shape: &ConvShape,
    groups: usize,
    group: usize,
) -> Result<ArrayD<T>> {
    let per_group = shape.out_channels / groups;
    let block = weight.slice_axis(
        Axis(0),
        ndarray::Slice::from(group * per_group..(group + 1) * per_group),
    );
    let rows = block.len() / per_group.max(1);
    let matrix = block
        .as_standard_layout()
        .into_owned()
        .into_shape((per_group, rows))?;
    Ok(matrix.reversed_axes().as_standard_layout().into_owned().into_dyn())
}

/// Turns the `(N * out_h * out_w, O_g)` products of all groups into `(N, O, out_h, out_w)`.
pub(crate) fn fold_output<T: Clone>(groups: Vec<ArrayD<T>>, shape: &ConvShape) -> Result<ArrayD<T>> {
    let (oh, ow) = shape.out;
    let mut blocks = Vec::with_capacity(groups.len());
    for g in groups {
        let per_group = g.shape()[1];
        let block = g
            .into_shape(IxDyn(&[shape.batch, oh, ow, per_group]))?
            .permuted_axes(IxDyn(&[0, 3, 1, 2]));
        blocks.push(block);
    }
    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    Ok(ndarray::concatenate(Axis(1), &views)?
        .as_standard_layout()
        .into_owned())
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array};

    use super::*;

    #[test]
    fn broadcasting_follows_numpy_rules() {
        assert_eq!(broadcast_shape(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shape(&[2, 1], &[1, 4]), Some(vec![2, 4]));
        assert_eq!(broadcast_shape(&[], &[5]), Some(vec![5]));
        assert_eq!(broadcast_shape(&[2, 3], &[2]), None);
    }

    #[test]
    fn plain_matmul() -> Result<()> {
        let a = arr2(&[[1i64, 2], [3, 4]]).into_dyn();
        let c = matmul(&a, &a, 0, |x, y| x + y, |x, y| x * y)?;
        assert_eq!(c, arr2(&[[7, 10], [15, 22]]).into_dyn());
        let b = arr2(&[[1i64, 2, 3]]).into_dyn();
        assert!(matches!(
            matmul(&a, &b, 0, |x, y| x + y, |x, y| x * y),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn fold_axes_with_keepdim() -> Result<()> {
        let t = arr2(&[[1i64, 2, 4], [8, 5, 6]]).into_dyn();
        let s = fold_axes(&t, &[0], false, 0, |a, b| a + b)?;
        assert_eq!(s.into_raw_vec(), vec![9, 7, 10]);
        let s = fold_axes(&t, &[1], true, 0, |a, b| a + b)?;
        assert_eq!(s.shape(), &[2, 1]);
        assert_eq!(s.into_raw_vec(), vec![7, 19]);
        let s = fold_axes(&t, &[0, 1], false, 0, |a, b| a + b)?;
        assert_eq!(s.shape(), &[] as &[usize]);
        assert!(fold_axes(&t, &[2], false, 0, |a, b| a + b).is_err());
        Ok(())
    }

    #[test]
    fn floor_mod_follows_the_divisor() {
        assert_eq!(floor_mod(21, 8), 5);
        assert_eq!(floor_mod(21, -8), -3);
        assert_eq!(floor_mod(-21, 8), 3);
        assert_eq!(floor_mod(-21, -8), -5);
        assert_eq!(floor_mod(16, -8), 0);
    }

    #[test]
    fn first_maximum_wins() -> Result<()> {
        let t = arr2(&[[1i64, 2, 4], [3, 9, 9]]).into_dyn();
        let (values, indices) = max_along(&t, Some(1), false)?;
        assert_eq!(values.into_raw_vec(), vec![4, 9]);
        assert_eq!(indices.into_raw_vec(), vec![2, 1]);
        let (values, indices) = max_along(&t, None, true)?;
        assert_eq!(values.shape(), &[1, 1]);
        assert_eq!(indices.into_raw_vec(), vec![4]);
        Ok(())
    }

    #[test]
    fn conv_output_geometry() -> Result<()> {
        let conv = Conv2d::default().stride(2).padding(3).dilation(2).groups(2);
        let shape = conv.shape(&[1, 2, 3, 3], &[2, 1, 2, 2])?;
        assert_eq!(shape.out, (4, 4));
        assert!(Conv2d::default().shape(&[1, 2, 3, 3], &[2, 1, 2, 2]).is_err());
        Ok(())
    }

    #[test]
    fn unfold_then_matmul_is_a_convolution() -> Result<()> {
        let x = Array::from_shape_vec((1, 1, 3, 3), (0..9).collect::<Vec<i64>>())?.into_dyn();
        let w = Array::from_shape_vec((1, 1, 2, 2), vec![1i64, 0, 0, 1])?.into_dyn();
        let conv = Conv2d::default();
        let shape = conv.shape(x.shape(), w.shape())?;
        let cols = unfold(&x, 0, &conv, &shape, 0..1)?;
        let wm = weight_matrix(&w, &shape, 1, 0)?;
        let y = matmul(&cols, &wm, 0, |a, b| a + b, |a, b| a * b)?;
        let y = fold_output(vec![y], &shape)?;
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.into_raw_vec(), vec![4, 6, 10, 12]);
        Ok(())
    }
}
