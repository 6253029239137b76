//! Execution backends for [`DetectionModel::run`](crate::model::DetectionModel::run).

use ndarray::{Array3, Array4, ArrayView4};

use crate::error::{Error, Result};
use crate::model::{BatchNorm2d, Conv2d, DetectSpec};
use crate::ops;

/// The operations a YOLOv8 forward pass is built from.
///
/// `Eager` computes them on tensors; the tracer records them as graph nodes.
pub trait Backend {
    type Value;
    type Output;

    /// Convolution, optionally followed by batch norm and SiLU.
    fn conv(
        &mut self,
        x: &Self::Value,
        conv: &Conv2d,
        bn: Option<&BatchNorm2d>,
        silu: bool,
    ) -> Result<Self::Value>;

    fn add(&mut self, a: &Self::Value, b: &Self::Value) -> Result<Self::Value>;

    /// Channel-axis concatenation.
    fn concat(&mut self, xs: &[&Self::Value]) -> Result<Self::Value>;

    /// Channels `start..end`.
    fn slice_channels(&mut self, x: &Self::Value, start: usize, end: usize) -> Result<Self::Value>;

    fn max_pool(
        &mut self,
        x: &Self::Value,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Self::Value>;

    /// Nearest-neighbour upsampling.
    fn upsample(&mut self, x: &Self::Value, scale: usize) -> Result<Self::Value>;

    /// Decodes per-level `(box, class)` maps into final predictions.
    fn detect(
        &mut self,
        levels: &[(Self::Value, Self::Value)],
        spec: &DetectSpec,
    ) -> Result<Self::Output>;
}

/// Immediate execution on `ndarray` tensors.
pub struct Eager;

impl Backend for Eager {
    type Value = Array4<f32>;
    type Output = Array3<f32>;

    fn conv(
        &mut self,
        x: &Array4<f32>,
        conv: &Conv2d,
        bn: Option<&BatchNorm2d>,
        silu: bool,
    ) -> Result<Array4<f32>> {
        if x.dim().1 != conv.in_channels() {
            return Err(Error::ShapeMismatch {
                expected: vec![conv.in_channels()],
                got: vec![x.dim().1],
            });
        }
        let mut y = ops::conv2d(
            x.view(),
            conv.weight.view(),
            conv.bias.as_ref().map(|b| b.view()),
            conv.stride,
            conv.padding,
        );
        if let Some(bn) = bn {
            y = ops::batch_norm(
                y.view(),
                bn.weight.view(),
                bn.bias.view(),
                bn.running_mean.view(),
                bn.running_var.view(),
                bn.eps,
            );
        }
        if silu {
            ops::silu_inplace(&mut y);
        }
        Ok(y)
    }

    fn add(&mut self, a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
        if a.shape() != b.shape() {
            return Err(Error::ShapeMismatch {
                expected: a.shape().to_vec(),
                got: b.shape().to_vec(),
            });
        }
        Ok(ops::add(a.view(), b.view()))
    }

    fn concat(&mut self, xs: &[&Array4<f32>]) -> Result<Array4<f32>> {
        let views: Vec<ArrayView4<f32>> = xs.iter().map(|x| x.view()).collect();
        Ok(ops::concat_channels(&views)?)
    }

    fn slice_channels(&mut self, x: &Array4<f32>, start: usize, end: usize) -> Result<Array4<f32>> {
        if start > end || end > x.dim().1 {
            return Err(Error::InvalidGraph(format!(
                "channel slice {start}..{end} out of range for {} channels",
                x.dim().1
            )));
        }
        Ok(ops::slice_channels(x.view(), start, end))
    }

    fn max_pool(
        &mut self,
        x: &Array4<f32>,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Array4<f32>> {
        Ok(ops::max_pool2d(x.view(), kernel, stride, padding))
    }

    fn upsample(&mut self, x: &Array4<f32>, scale: usize) -> Result<Array4<f32>> {
        Ok(ops::upsample_nearest(x.view(), scale))
    }

    fn detect(
        &mut self,
        levels: &[(Array4<f32>, Array4<f32>)],
        spec: &DetectSpec,
    ) -> Result<Array3<f32>> {
        let views: Vec<_> = levels.iter().map(|(b, c)| (b.view(), c.view())).collect();
        Ok(ops::detect_decode(&views, &spec.strides, spec.reg_max, spec.num_classes))
    }
}
