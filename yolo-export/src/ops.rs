//! CPU kernels shared by the eager backend and the graph executor.
//!
//! All feature maps are NCHW `f32`.

use ndarray::{
    concatenate, s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView4, Axis, ShapeError,
};

/// Output spatial size of a convolution or pooling window.
pub fn conv_out_dim(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding).saturating_sub(kernel) / stride + 1
}

/// 2D convolution via im2col and a single matrix product per batch item.
pub fn conv2d(
    x: ArrayView4<f32>,
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let (n, c_in, h, w) = x.dim();
    let (c_out, _, kh, kw) = weight.dim();
    let oh = conv_out_dim(h, kh, stride, padding);
    let ow = conv_out_dim(w, kw, stride, padding);
    let k = c_in * kh * kw;

    let w2 = Array2::from_shape_fn((c_out, k), |(o, idx)| {
        weight[[o, idx / (kh * kw), (idx / kw) % kh, idx % kw]]
    });

    let mut out = Array4::<f32>::zeros((n, c_out, oh, ow));
    for b in 0..n {
        let mut cols = Array2::<f32>::zeros((k, oh * ow));
        for c in 0..c_in {
            for i in 0..kh {
                for j in 0..kw {
                    let mut row = cols.row_mut((c * kh + i) * kw + j);
                    for y in 0..oh {
                        let iy = (y * stride + i) as isize - padding as isize;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for xx in 0..ow {
                            let ix = (xx * stride + j) as isize - padding as isize;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            row[y * ow + xx] = x[[b, c, iy as usize, ix as usize]];
                        }
                    }
                }
            }
        }
        let y = w2.dot(&cols);
        for o in 0..c_out {
            let bv = bias.as_ref().map_or(0.0, |bias| bias[o]);
            for p in 0..oh * ow {
                out[[b, o, p / ow, p % ow]] = y[[o, p]] + bv;
            }
        }
    }
    out
}

/// Inference-mode batch normalisation over the channel axis.
pub fn batch_norm(
    x: ArrayView4<f32>,
    gamma: ArrayView1<f32>,
    beta: ArrayView1<f32>,
    mean: ArrayView1<f32>,
    var: ArrayView1<f32>,
    eps: f32,
) -> Array4<f32> {
    let mut out = x.to_owned();
    for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let scale = gamma[c] / (var[c] + eps).sqrt();
        let shift = beta[c] - mean[c] * scale;
        plane.mapv_inplace(|v| v * scale + shift);
    }
    out
}

/// Folds a batch norm into the weight and bias of the convolution before it.
pub fn fold_batch_norm(
    weight: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    gamma: ArrayView1<f32>,
    beta: ArrayView1<f32>,
    mean: ArrayView1<f32>,
    var: ArrayView1<f32>,
    eps: f32,
) -> (Array4<f32>, Array1<f32>) {
    let c_out = weight.dim().0;
    let mut fused = weight.to_owned();
    let mut fused_bias = Array1::<f32>::zeros(c_out);
    for o in 0..c_out {
        let scale = gamma[o] / (var[o] + eps).sqrt();
        fused.slice_mut(s![o, .., .., ..]).mapv_inplace(|v| v * scale);
        let b = bias.as_ref().map_or(0.0, |b| b[o]);
        fused_bias[o] = (b - mean[o]) * scale + beta[o];
    }
    (fused, fused_bias)
}

pub fn silu(v: f32) -> f32 {
    v / (1.0 + (-v).exp())
}

pub fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

pub fn silu_inplace(x: &mut Array4<f32>) {
    x.mapv_inplace(silu);
}

pub fn add(a: ArrayView4<f32>, b: ArrayView4<f32>) -> Array4<f32> {
    &a + &b
}

/// Concatenates along the channel axis. Spatial dims must agree.
pub fn concat_channels(xs: &[ArrayView4<f32>]) -> Result<Array4<f32>, ShapeError> {
    concatenate(Axis(1), xs)
}

pub fn slice_channels(x: ArrayView4<f32>, start: usize, end: usize) -> Array4<f32> {
    x.slice(s![.., start..end, .., ..]).to_owned()
}

/// Max pooling with implicit `-inf` padding.
pub fn max_pool2d(x: ArrayView4<f32>, kernel: usize, stride: usize, padding: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    let oh = conv_out_dim(h, kernel, stride, padding);
    let ow = conv_out_dim(w, kernel, stride, padding);
    let mut out = Array4::<f32>::from_elem((n, c, oh, ow), f32::NEG_INFINITY);
    for ((b, ch, y, xx), v) in out.indexed_iter_mut() {
        let y0 = (y * stride) as isize - padding as isize;
        let x0 = (xx * stride) as isize - padding as isize;
        for iy in y0.max(0)..(y0 + kernel as isize).min(h as isize) {
            for ix in x0.max(0)..(x0 + kernel as isize).min(w as isize) {
                *v = (*v).max(x[[b, ch, iy as usize, ix as usize]]);
            }
        }
    }
    out
}

pub fn upsample_nearest(x: ArrayView4<f32>, scale: usize) -> Array4<f32> {
    let (n, c, h, w) = x.dim();
    Array4::from_shape_fn((n, c, h * scale, w * scale), |(b, ch, y, xx)| {
        x[[b, ch, y / scale, xx / scale]]
    })
}

/// Decodes the per-level box and class maps of the detection head into
/// `[batch, 4 + num_classes, anchors]`: xywh boxes in input pixels
/// followed by per-class sigmoid scores.
pub fn detect_decode(
    levels: &[(ArrayView4<f32>, ArrayView4<f32>)],
    strides: &[usize],
    reg_max: usize,
    num_classes: usize,
) -> Array3<f32> {
    let batch = levels.first().map_or(0, |(b, _)| b.dim().0);
    let anchors: usize = levels.iter().map(|(b, _)| b.dim().2 * b.dim().3).sum();
    let mut out = Array3::<f32>::zeros((batch, 4 + num_classes, anchors));

    for n in 0..batch {
        let mut a = 0;
        for ((boxes, cls), &stride) in levels.iter().zip(strides) {
            let (_, _, h, w) = boxes.dim();
            let stride = stride as f32;
            for y in 0..h {
                for x in 0..w {
                    let mut dist = [0.0f32; 4];
                    for (side, d) in dist.iter_mut().enumerate() {
                        let bins = (0..reg_max).map(|i| boxes[[n, side * reg_max + i, y, x]]);
                        *d = dfl_expectation(bins);
                    }
                    let (ax, ay) = (x as f32 + 0.5, y as f32 + 0.5);
                    let x1 = ax - dist[0];
                    let y1 = ay - dist[1];
                    let x2 = ax + dist[2];
                    let y2 = ay + dist[3];
                    out[[n, 0, a]] = (x1 + x2) / 2.0 * stride;
                    out[[n, 1, a]] = (y1 + y2) / 2.0 * stride;
                    out[[n, 2, a]] = (x2 - x1) * stride;
                    out[[n, 3, a]] = (y2 - y1) * stride;
                    for c in 0..num_classes {
                        out[[n, 4 + c, a]] = sigmoid(cls[[n, c, y, x]]);
                    }
                    a += 1;
                }
            }
        }
    }
    out
}

/// Softmax over the distribution bins followed by the expected bin index.
fn dfl_expectation(bins: impl Iterator<Item = f32> + Clone) -> f32 {
    let max = bins.clone().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    let mut acc = 0.0;
    for (i, v) in bins.enumerate() {
        let e = (v - max).exp();
        sum += e;
        acc += e * i as f32;
    }
    if sum == 0.0 {
        0.0
    } else {
        acc / sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn conv_identity_kernel_preserves_input() {
        let x = Array::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        let mut w = Array4::<f32>::zeros((1, 1, 3, 3));
        w[[0, 0, 1, 1]] = 1.0;
        let y = conv2d(x.view(), w.view(), None, 1, 1);
        assert_eq!(y, x);
    }

    #[test]
    fn conv_stride_two_halves_spatial_dims() {
        let x = Array4::<f32>::ones((1, 3, 8, 8));
        let w = Array4::<f32>::ones((2, 3, 3, 3));
        let b = Array1::from(vec![0.5, -0.5]);
        let y = conv2d(x.view(), w.view(), Some(b.view()), 2, 1);
        assert_eq!(y.dim(), (1, 2, 4, 4));
        // interior window sees all 27 ones
        assert_eq!(y[[0, 0, 1, 1]], 27.5);
        // top-left corner has one padded row and column
        assert_eq!(y[[0, 1, 0, 0]], 12.0 - 0.5);
    }

    #[test]
    fn folded_batch_norm_matches_conv_then_bn() {
        let x = Array::from_shape_fn((1, 2, 5, 5), |(_, c, y, x)| (c + y * x) as f32 * 0.1);
        let w = Array::from_shape_fn((3, 2, 3, 3), |(o, i, y, x)| {
            ((o + i + y + x) % 4) as f32 * 0.2 - 0.3
        });
        let gamma = Array1::from(vec![1.2, 0.7, 0.9]);
        let beta = Array1::from(vec![0.1, -0.2, 0.0]);
        let mean = Array1::from(vec![0.05, 0.3, -0.1]);
        let var = Array1::from(vec![0.9, 1.4, 0.6]);

        let reference = batch_norm(
            conv2d(x.view(), w.view(), None, 1, 1).view(),
            gamma.view(),
            beta.view(),
            mean.view(),
            var.view(),
            1e-3,
        );
        let (fw, fb) = fold_batch_norm(
            w.view(),
            None,
            gamma.view(),
            beta.view(),
            mean.view(),
            var.view(),
            1e-3,
        );
        let fused = conv2d(x.view(), fw.view(), Some(fb.view()), 1, 1);
        for (a, b) in reference.iter().zip(fused.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn max_pool_same_padding_keeps_shape() {
        let x = Array::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        let y = max_pool2d(x.view(), 5, 1, 2);
        assert_eq!(y.dim(), (1, 1, 4, 4));
        assert_eq!(y[[0, 0, 0, 0]], 10.0);
        assert_eq!(y[[0, 0, 3, 3]], 15.0);
    }

    #[test]
    fn upsample_repeats_pixels() {
        let x = Array::from_shape_vec((1, 1, 1, 2), vec![1.0, 2.0]).unwrap();
        let y = upsample_nearest(x.view(), 2);
        assert_eq!(y.dim(), (1, 1, 2, 4));
        assert_eq!(y.slice(s![0, 0, 1, ..]).to_vec(), vec![1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn decode_places_box_at_anchor_centre() {
        // uniform bins give an expected distance of (reg_max - 1) / 2 on every side
        let reg_max = 4;
        let boxes = Array4::<f32>::zeros((1, 4 * reg_max, 2, 2));
        let cls = Array4::<f32>::zeros((1, 2, 2, 2));
        let out = detect_decode(&[(boxes.view(), cls.view())], &[8], reg_max, 2);
        assert_eq!(out.dim(), (1, 6, 4));
        // anchor (x=1, y=0) -> centre (1.5, 0.5) * 8
        assert!((out[[0, 0, 1]] - 12.0).abs() < 1e-5);
        assert!((out[[0, 1, 1]] - 4.0).abs() < 1e-5);
        assert!((out[[0, 2, 1]] - 3.0 * 8.0).abs() < 1e-5);
        assert!((out[[0, 4, 0]] - 0.5).abs() < 1e-6);
    }
}
