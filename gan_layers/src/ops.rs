//! Stateless NHWC kernels: convolution, 2x2 pooling and ReLU.

use crate::error::{LayerError, LayerResult};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Output extent `ceil(in / stride)`; odd padding goes to the bottom/right.
    Same,
    /// No padding; output extent `(in - k) / stride + 1`.
    Valid,
}

impl Padding {
    /// Returns `(output_extent, leading_pad)` along one spatial axis.
    pub fn output_extent(
        self,
        input: usize,
        kernel: usize,
        stride: usize,
    ) -> LayerResult<(usize, usize)> {
        if stride == 0 || kernel == 0 {
            return Err(LayerError::config("kernel size and stride must be non-zero"));
        }
        match self {
            Padding::Same => {
                let out = input.div_ceil(stride);
                let pad_total = (out.saturating_sub(1) * stride + kernel).saturating_sub(input);
                Ok((out, pad_total / 2))
            }
            Padding::Valid => {
                if input < kernel {
                    return Err(LayerError::config(format!(
                        "input extent {input} is smaller than kernel extent {kernel}"
                    )));
                }
                Ok(((input - kernel) / stride + 1, 0))
            }
        }
    }
}

pub fn relu(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// 2D convolution.
/// input: [batch, h, w, in], kernel: [kh, kw, in, out], bias: [out]
pub fn conv2d(
    input: &Tensor,
    kernel: &Tensor,
    bias: Option<&[f32]>,
    strides: (usize, usize),
    padding: Padding,
) -> LayerResult<Tensor> {
    let (batch, in_h, in_w, in_c) = input.dims4()?;
    let (k_h, k_w, k_in, k_out) = kernel.dims4()?;
    if k_in != in_c {
        return Err(LayerError::shape_mismatch(
            &[k_h, k_w, in_c, k_out],
            kernel.shape(),
        ));
    }
    if let Some(b) = bias {
        if b.len() != k_out {
            return Err(LayerError::shape_mismatch(&[k_out], &[b.len()]));
        }
    }
    let (out_h, pad_top) = padding.output_extent(in_h, k_h, strides.0)?;
    let (out_w, pad_left) = padding.output_extent(in_w, k_w, strides.1)?;

    let mut out = vec![0.0; batch * out_h * out_w * k_out];
    if out.is_empty() {
        return Tensor::new(vec![batch, out_h, out_w, k_out], out);
    }
    let x = input.data();
    let w = kernel.data();
    out.par_chunks_mut(out_w * k_out)
        .enumerate()
        .for_each(|(row, out_row)| {
            let b = row / out_h;
            let oy = row % out_h;
            for ox in 0..out_w {
                let acc = &mut out_row[ox * k_out..(ox + 1) * k_out];
                if let Some(bias) = bias {
                    acc.copy_from_slice(bias);
                }
                for ky in 0..k_h {
                    let iy = (oy * strides.0 + ky) as isize - pad_top as isize;
                    if iy < 0 || iy >= in_h as isize {
                        continue;
                    }
                    for kx in 0..k_w {
                        let ix = (ox * strides.1 + kx) as isize - pad_left as isize;
                        if ix < 0 || ix >= in_w as isize {
                            continue;
                        }
                        let x_off = ((b * in_h + iy as usize) * in_w + ix as usize) * in_c;
                        let w_off = (ky * k_w + kx) * in_c * k_out;
                        for ci in 0..in_c {
                            let xv = x[x_off + ci];
                            let w_row = &w[w_off + ci * k_out..w_off + (ci + 1) * k_out];
                            for (a, wv) in acc.iter_mut().zip(w_row) {
                                *a += xv * wv;
                            }
                        }
                    }
                }
            }
        });
    Tensor::new(vec![batch, out_h, out_w, k_out], out)
}

pub fn max_pool_2x2(input: &Tensor) -> LayerResult<Tensor> {
    pool_2x2(input, |window| {
        window.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    })
}

pub fn avg_pool_2x2(input: &Tensor) -> LayerResult<Tensor> {
    pool_2x2(input, |window| window.iter().sum::<f32>() / 4.0)
}

/// 2x2 window, stride 2, valid padding: odd trailing rows/columns are dropped.
fn pool_2x2(input: &Tensor, reduce: impl Fn(&[f32; 4]) -> f32 + Sync) -> LayerResult<Tensor> {
    let (batch, in_h, in_w, c) = input.dims4()?;
    let (out_h, out_w) = (in_h / 2, in_w / 2);
    if out_h == 0 || out_w == 0 {
        return Err(LayerError::config(format!(
            "cannot pool a {in_h}x{in_w} feature map with a 2x2 window"
        )));
    }
    let mut out = vec![0.0; batch * out_h * out_w * c];
    if out.is_empty() {
        return Tensor::new(vec![batch, out_h, out_w, c], out);
    }
    let x = input.data();
    out.par_chunks_mut(out_w * c)
        .enumerate()
        .for_each(|(row, out_row)| {
            let b = row / out_h;
            let oy = row % out_h;
            for ox in 0..out_w {
                let at = |dy: usize, dx: usize, ch: usize| {
                    x[((b * in_h + 2 * oy + dy) * in_w + 2 * ox + dx) * c + ch]
                };
                for ch in 0..c {
                    let window = [at(0, 0, ch), at(0, 1, ch), at(1, 0, ch), at(1, 1, ch)];
                    out_row[ox * c + ch] = reduce(&window);
                }
            }
        });
    Tensor::new(vec![batch, out_h, out_w, c], out)
}
