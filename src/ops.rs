use crate::result::Result;
use anyhow::{bail, ensure};
use ndarray::{parallel::prelude::*, Array, Array2, Array4, ArrayView2, ArrayView4, Axis};

/// Options for [`im2col_conv2`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Im2ColConv2Options {
    /// Filter height and width.
    pub filter: [usize; 2],
    /// Zero padding added to both sides.
    pub padding: [usize; 2],
    /// Stride.
    pub stride: [usize; 2],
}

impl Im2ColConv2Options {
    /// The shape of the convolution output given the image shape.
    ///
    /// **Errors**
    /// The padded image is smaller than the filter.
    pub fn output_shape(&self, input_shape: [usize; 2]) -> Result<[usize; 2]> {
        let mut output_shape = [0; 2];
        for (i, output) in output_shape.iter_mut().enumerate() {
            let padded = input_shape[i] + 2 * self.padding[i];
            if padded < self.filter[i] || self.stride[i] == 0 {
                bail!(
                    "Filter {:?} with stride {:?} does not fit input {:?} padded by {:?}!",
                    self.filter,
                    self.stride,
                    input_shape,
                    self.padding
                );
            }
            *output = (padded - self.filter[i]) / self.stride[i] + 1;
        }
        Ok(output_shape)
    }
    /// The shape of the transposed convolution output given the input shape.
    ///
    /// Inverse of [`.output_shape()`](Self::output_shape) when the stride divides evenly.
    pub fn transposed_output_shape(&self, input_shape: [usize; 2]) -> Result<[usize; 2]> {
        let mut output_shape = [0; 2];
        for (i, output) in output_shape.iter_mut().enumerate() {
            let full = input_shape[i].saturating_sub(1) * self.stride[i] + self.filter[i];
            if input_shape[i] == 0 || full <= 2 * self.padding[i] {
                bail!(
                    "Transposed filter {:?} with padding {:?} produces an empty output for input {:?}!",
                    self.filter,
                    self.padding,
                    input_shape
                );
            }
            *output = full - 2 * self.padding[i];
        }
        Ok(output_shape)
    }
}

/// Options for [`col2im_conv2`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Col2ImConv2Options {
    /// The grid of patches, ie the convolution output shape.
    pub shape: [usize; 2],
    /// The image shape.
    pub output_shape: [usize; 2],
    /// Filter height and width.
    pub filter: [usize; 2],
    /// Zero padding.
    pub padding: [usize; 2],
    /// Stride.
    pub stride: [usize; 2],
}

/// Unfolds image patches into rows.
///
/// Input shape = [bs, c, ih, iw].\
/// Output shape = [bs * oh * ow, c * fh * fw], rows ordered (batch, y, x) and columns ordered
/// (channel, filter y, filter x). Padded positions are 0.
pub fn im2col_conv2(input: ArrayView4<f32>, options: &Im2ColConv2Options) -> Result<Array2<f32>> {
    let (bs, c, ih, iw) = input.dim();
    let [oh, ow] = options.output_shape([ih, iw])?;
    let Im2ColConv2Options {
        filter: [fh, fw],
        padding: [ph, pw],
        stride: [sh, sw],
    } = *options;
    let mut output = Array::<f32, _>::zeros([bs, oh, ow, c, fh * fw]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(batch, mut output)| {
            let input = input.index_axis(Axis(0), batch);
            for (hid, mut output) in output.outer_iter_mut().enumerate() {
                for (wid, mut output) in output.outer_iter_mut().enumerate() {
                    for (input, mut output) in input.outer_iter().zip(output.outer_iter_mut()) {
                        for fi in 0..fh {
                            for fj in 0..fw {
                                let hidx = (fi + sh * hid) as isize - ph as isize;
                                let widx = (fj + sw * wid) as isize - pw as isize;
                                if hidx >= 0
                                    && hidx < ih as isize
                                    && widx >= 0
                                    && widx < iw as isize
                                {
                                    output[fi * fw + fj] = input[(hidx as usize, widx as usize)];
                                }
                            }
                        }
                    }
                }
            }
        });
    Ok(output.into_shape([bs * oh * ow, c * fh * fw])?)
}

/// Folds rows back into images, summing overlapping patches.
///
/// The adjoint of [`im2col_conv2`].\
/// Input shape = [bs * ih * iw, c * fh * fw] where [ih, iw] = `options.shape`.\
/// Output shape = [bs, c, oh, ow] where [oh, ow] = `options.output_shape`.
pub fn col2im_conv2(input: ArrayView2<f32>, options: &Col2ImConv2Options) -> Result<Array4<f32>> {
    let Col2ImConv2Options {
        shape: [ih, iw],
        output_shape: [oh, ow],
        filter: [fh, fw],
        padding: [ph, pw],
        stride: [sh, sw],
    } = *options;
    let (rows, cols) = input.dim();
    ensure!(
        ih * iw > 0 && rows % (ih * iw) == 0 && fh * fw > 0 && cols % (fh * fw) == 0,
        "col2im input {:?} does not match grid {:?} and filter {:?}!",
        input.shape(),
        options.shape,
        options.filter
    );
    let bs = rows / (ih * iw);
    let c = cols / (fh * fw);
    let input = input.as_standard_layout();
    let input = input.into_shape([bs, ih, iw, c, fh * fw])?;
    let mut output = Array::<f32, _>::zeros([bs, c, oh, ow]);
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(batch, mut output)| {
            let input = input.index_axis(Axis(0), batch);
            for (cid, mut output) in output.outer_iter_mut().enumerate() {
                for hid in 0..ih {
                    for wid in 0..iw {
                        for fi in 0..fh {
                            for fj in 0..fw {
                                let hidx = (fi + sh * hid) as isize - ph as isize;
                                let widx = (fj + sw * wid) as isize - pw as isize;
                                if hidx >= 0
                                    && hidx < oh as isize
                                    && widx >= 0
                                    && widx < ow as isize
                                {
                                    output[(hidx as usize, widx as usize)] +=
                                        input[(hid, wid, cid, fi * fw + fj)];
                                }
                            }
                        }
                    }
                }
            }
        });
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn options() -> Im2ColConv2Options {
        Im2ColConv2Options {
            filter: [3, 2],
            padding: [1, 1],
            stride: [2, 1],
        }
    }

    #[test]
    fn output_shapes() -> Result<()> {
        let options = Im2ColConv2Options {
            filter: [4, 4],
            padding: [1, 1],
            stride: [2, 2],
        };
        assert_eq!(options.output_shape([64, 64])?, [32, 32]);
        assert_eq!(options.transposed_output_shape([32, 32])?, [64, 64]);
        let options = Im2ColConv2Options {
            filter: [4, 4],
            padding: [0, 0],
            stride: [1, 1],
        };
        assert_eq!(options.output_shape([4, 4])?, [1, 1]);
        assert_eq!(options.transposed_output_shape([1, 1])?, [4, 4]);
        assert!(options.output_shape([2, 2]).is_err());
        Ok(())
    }

    #[test]
    fn im2col_patches() -> Result<()> {
        let input = Array::from_shape_vec([1, 1, 3, 3], (1..=9).map(|x| x as f32).collect())?;
        let options = Im2ColConv2Options {
            filter: [2, 2],
            padding: [0, 0],
            stride: [1, 1],
        };
        let output = im2col_conv2(input.view(), &options)?;
        let expected = Array::from_shape_vec(
            [4, 4],
            vec![
                1., 2., 4., 5., //
                2., 3., 5., 6., //
                4., 5., 7., 8., //
                5., 6., 8., 9.,
            ],
        )?;
        assert_eq!(output, expected);
        Ok(())
    }

    #[test]
    fn col2im_is_adjoint_of_im2col() -> Result<()> {
        let options = options();
        let x = Array::from_shape_fn([2, 3, 5, 4], |(b, c, h, w)| {
            ((b * 7 + c * 5 + h * 3 + w) % 11) as f32 - 5.
        });
        let cols = im2col_conv2(x.view(), &options)?;
        let y = Array::from_shape_fn(cols.raw_dim(), |(r, c)| ((r * 3 + c) % 7) as f32 - 3.);
        let [oh, ow] = options.output_shape([5, 4])?;
        let x_t = col2im_conv2(
            y.view(),
            &Col2ImConv2Options {
                shape: [oh, ow],
                output_shape: [5, 4],
                filter: options.filter,
                padding: options.padding,
                stride: options.stride,
            },
        )?;
        assert_eq!(x_t.dim(), x.dim());
        let lhs: f32 = (&cols * &y).sum();
        let rhs: f32 = (&x * &x_t).sum();
        assert_relative_eq!(lhs, rhs, max_relative = 1e-5);
        Ok(())
    }
}
