//! 2-D convolution with shared and public operands, computed as patch extraction plus matmul.

use ndarray::{ArrayD, IxDyn};
use tracing::{Level, instrument};

use super::{Scratch, SharedTensor, arith::ring_add, ring_matmul, single};
use crate::{
    error::{Error, Result},
    field::Field,
    kernel::{Conv2d, ConvShape, fold_output, unfold, weight_matrix},
    party::Tensor,
};

/// An operand of a mixed shared/public operation.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// A secret-shared tensor.
    Shared(&'a SharedTensor),
    /// A plaintext tensor known to every party.
    Public(&'a ArrayD<i64>),
}

impl Operand<'_> {
    fn shape(&self) -> &[usize] {
        match self {
            Operand::Shared(x) => x.shape(),
            Operand::Public(x) => x.shape(),
        }
    }
}

/// The convolution of two local tensors over the ring, one group at a time.
fn local_conv(
    f: &Field,
    input: &Tensor,
    weight: &Tensor,
    conv: &Conv2d,
    shape: &ConvShape,
) -> Result<Tensor> {
    let per_group = shape.in_channels / conv.groups;
    let blocks = (0..conv.groups)
        .map(|g| {
            let cols = unfold(input, 0, conv, shape, g * per_group..(g + 1) * per_group)?;
            ring_matmul(f, &cols, &weight_matrix(weight, shape, conv.groups, g)?)
        })
        .collect::<Result<Vec<_>>>()?;
    fold_output(blocks, shape)
}

/// Convolves `input` of shape `(N, C, H, W)` with `weight` of shape `(O, C / groups, kh, kw)`
/// and adds the optional `bias` of shape `(O,)`.
///
/// At least one of `input` and `weight` must be shared. A public operand costs no triple, two
/// shared operands cost one matrix triple per group.
#[instrument(level = Level::DEBUG, skip_all, fields(conv = ?conv), err)]
pub fn conv2d(
    input: Operand<'_>,
    weight: Operand<'_>,
    bias: Option<Operand<'_>>,
    conv: &Conv2d,
) -> Result<SharedTensor> {
    let shape = conv.shape(input.shape(), weight.shape())?;
    let out = match (input, weight) {
        (Operand::Shared(x), Operand::Public(w)) => {
            let f = x.field;
            let w = f.lift(w)?;
            x.map_shares(|_, s| local_conv(&f, &s, &w, conv, &shape))?
        }
        (Operand::Public(x), Operand::Shared(w)) => {
            let f = w.field;
            let x = f.lift(x)?;
            w.map_shares(|_, s| local_conv(&f, &x, &s, conv, &shape))?
        }
        (Operand::Shared(x), Operand::Shared(w)) => shared_conv(x, w, conv, &shape)?,
        (Operand::Public(_), Operand::Public(_)) => {
            return Err(Error::InvalidArgument(
                "conv2d needs at least one shared operand".into(),
            ));
        }
    };
    match bias {
        Some(bias) => {
            let mut scratch = Scratch::default();
            scratch.keep(out).add_bias(bias)
        }
        None => Ok(out),
    }
}

fn shared_conv(
    x: &SharedTensor,
    w: &SharedTensor,
    conv: &Conv2d,
    shape: &ConvShape,
) -> Result<SharedTensor> {
    let per_group = shape.in_channels / conv.groups;
    let mut scratch = Scratch::default();
    let mut blocks = Vec::with_capacity(conv.groups);
    for g in 0..conv.groups {
        let channels = g * per_group..(g + 1) * per_group;
        let cols = x.map_shares(|_, s| unfold(&s, 0, conv, shape, channels.clone()))?;
        let cols = scratch.keep(cols);
        let matrix = w.map_shares(|_, s| weight_matrix(&s, shape, conv.groups, g))?;
        let matrix = scratch.keep(matrix);
        blocks.push(scratch.keep(cols.matmul(&matrix)?));
    }
    let refs: Vec<_> = blocks.iter().collect();
    single(SharedTensor::local(&refs, |_, v| Ok(vec![fold_output(v, shape)?]))?)
}

impl SharedTensor {
    /// Adds a per-channel bias of shape `(O,)` to an `(N, O, H, W)` tensor.
    pub(crate) fn add_bias(&self, bias: Operand<'_>) -> Result<SharedTensor> {
        let channels = match self.shape() {
            [_, o, _, _] if bias.shape() == [*o] => *o,
            _ => {
                return Err(Error::ShapeMismatch {
                    op: "conv2d bias",
                    left: self.shape().to_vec(),
                    right: bias.shape().to_vec(),
                });
            }
        };
        let f = self.field;
        let column = IxDyn(&[1, channels, 1, 1]);
        match bias {
            Operand::Shared(b) => {
                self.zip_shares(b, |_, y, b| ring_add(&f, &y, &b.into_shape(column.clone())?))
            }
            Operand::Public(b) => self.add_ring(&f.lift(b)?.into_shape(column)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;
    use crate::{party::Party, provider::CryptoProvider};

    struct Fixture {
        parties: Vec<Party>,
        provider: CryptoProvider,
        field: Field,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                parties: vec![Party::new("bob"), Party::new("alice")],
                provider: CryptoProvider::with_seed(Party::new("james"), 3),
                field: Field::new(1 << 62),
            }
        }

        fn share(&self, t: &ArrayD<i64>) -> Result<SharedTensor> {
            SharedTensor::share(t, &self.parties, &self.provider, self.field)
        }
    }

    fn image() -> Result<ArrayD<i64>> {
        let values = (0..9).chain(10..19).collect::<Vec<i64>>();
        Ok(Array::from_shape_vec((1, 2, 3, 3), values)?.into_dyn())
    }

    fn weights() -> Result<ArrayD<i64>> {
        let values = vec![1, 1, 1, 1, 2, 2, 2, 2, -1, -2, -3, -4, 0, 0, 0, 0];
        Ok(Array::from_shape_vec((2, 2, 2, 2), values)?.into_dyn())
    }

    fn expected() -> Result<ArrayD<i64>> {
        let values = vec![104, 116, 140, 152, -22, -32, -52, -62];
        Ok(Array::from_shape_vec((1, 2, 2, 2), values)?.into_dyn())
    }

    #[test]
    fn every_operand_mode_agrees() -> Result<()> {
        let fx = Fixture::new();
        let (im, w) = (image()?, weights()?);
        let bias = ndarray::arr1(&[0i64, 5]).into_dyn();
        let (im_s, w_s, bias_s) = (fx.share(&im)?, fx.share(&w)?, fx.share(&bias)?);
        let conv = Conv2d::default();

        let out = conv2d(
            Operand::Shared(&im_s),
            Operand::Shared(&w_s),
            Some(Operand::Shared(&bias_s)),
            &conv,
        )?;
        assert_eq!(out.get()?, expected()?);
        let out = conv2d(
            Operand::Shared(&im_s),
            Operand::Public(&w),
            Some(Operand::Public(&bias)),
            &conv,
        )?;
        assert_eq!(out.get()?, expected()?);
        let out = conv2d(
            Operand::Public(&im),
            Operand::Shared(&w_s),
            Some(Operand::Shared(&bias_s)),
            &conv,
        )?;
        assert_eq!(out.get()?, expected()?);
        assert!(conv2d(Operand::Public(&im), Operand::Public(&w), None, &conv).is_err());
        Ok(())
    }

    #[test]
    fn grouped_strided_dilated() -> Result<()> {
        let fx = Fixture::new();
        let im = image()?;
        let w = Array::from_shape_vec((2, 1, 2, 2), vec![1, 1, 1, 1, -1, -2, -3, -4])?.into_dyn();
        let bias = ndarray::arr1(&[0i64, 5]).into_dyn();
        let conv = Conv2d::default().stride(2).padding(3).dilation(2).groups(2);
        let out = conv2d(
            Operand::Shared(&fx.share(&im)?),
            Operand::Shared(&fx.share(&w)?),
            Some(Operand::Public(&bias)),
            &conv,
        )?;
        #[rustfmt::skip]
        let values = vec![
            0, 0, 0, 0,   0, 4, 4, 0,     0, 4, 4, 0,     0, 0, 0, 0,
            5, 5, 5, 5,   5, -51, -37, 5, 5, -23, -9, 5,  5, 5, 5, 5,
        ];
        assert_eq!(out.get()?, Array::from_shape_vec((1, 2, 4, 4), values)?.into_dyn());
        Ok(())
    }

    #[test]
    fn bias_must_match_the_output_channels() -> Result<()> {
        let fx = Fixture::new();
        let bias = ndarray::arr1(&[1i64, 2, 3]).into_dyn();
        let res = conv2d(
            Operand::Shared(&fx.share(&image()?)?),
            Operand::Public(&weights()?),
            Some(Operand::Public(&bias)),
            &Conv2d::default(),
        );
        assert!(matches!(res, Err(Error::ShapeMismatch { .. })));
        Ok(())
    }
}
