//! YOLOv8 detection network.
//!
//! Layers are written once against [`Backend`] so the same code runs
//! eagerly on `ndarray` tensors and symbolically under the tracer.

use std::collections::BTreeMap;
use std::str::FromStr;

use ndarray::{Array1, Array3, Array4, ArrayD, ArrayViewD, ArrayViewMutD};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Eager};
use crate::error::{Error, Result};
use crate::trace::{TracedModule, Tracer};

/// Feature map strides of the three detection levels (P3, P4, P5).
pub const STRIDES: [usize; 3] = [8, 16, 32];

/// Named parameters of a model, keyed like `model.0.conv.weight`.
pub type StateDict = BTreeMap<String, ArrayD<f32>>;

/// Width/depth presets of the YOLOv8 family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelScale {
    N,
    S,
    M,
    L,
    X,
}

impl ModelScale {
    pub fn base_channels(self) -> usize {
        match self {
            ModelScale::N => 16,
            ModelScale::S => 32,
            ModelScale::M => 48,
            ModelScale::L => 64,
            ModelScale::X => 80,
        }
    }

    pub fn depth(self) -> usize {
        match self {
            ModelScale::N | ModelScale::S => 1,
            ModelScale::M => 2,
            ModelScale::L | ModelScale::X => 3,
        }
    }
}

impl FromStr for ModelScale {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "n" => Ok(ModelScale::N),
            "s" => Ok(ModelScale::S),
            "m" => Ok(ModelScale::M),
            "l" => Ok(ModelScale::L),
            "x" => Ok(ModelScale::X),
            other => Err(Error::Config(format!("unknown model scale '{other}'"))),
        }
    }
}

/// Configuration for the detection model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArgs {
    /// Number of object classes.
    pub num_classes: usize,
    /// Channels of the stem; deeper stages use 2x, 4x, 8x and 16x this.
    pub base_channels: usize,
    /// Bottleneck repeats in each C2f block of the neck and outer backbone stages.
    pub depth: usize,
    /// Number of distribution bins per box side.
    pub reg_max: usize,
}

impl Default for ModelArgs {
    fn default() -> Self {
        Self::from_scale(ModelScale::N, 80)
    }
}

impl ModelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_scale(scale: ModelScale, num_classes: usize) -> Self {
        Self {
            num_classes,
            base_channels: scale.base_channels(),
            depth: scale.depth(),
            reg_max: 16,
        }
    }

    /// Output channels of the five backbone stages.
    pub fn channels(&self) -> [usize; 5] {
        let b = self.base_channels;
        [b, 2 * b, 4 * b, 8 * b, 16 * b]
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be positive".into()));
        }
        if self.base_channels < 2 || self.base_channels % 2 != 0 {
            return Err(Error::Config(format!(
                "base_channels must be an even number >= 2, got {}",
                self.base_channels
            )));
        }
        if self.depth == 0 || self.reg_max == 0 {
            return Err(Error::Config("depth and reg_max must be positive".into()));
        }
        Ok(())
    }
}

/// Visitor over named parameter tensors.
pub trait Parameters {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()>;
}

/// Plain 2D convolution with "same" padding for odd kernels.
#[derive(Clone, Debug)]
pub struct Conv2d {
    pub weight: Array4<f32>, // out x in x kh x kw
    pub bias: Option<Array1<f32>>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    pub fn new<R: Rng>(c1: usize, c2: usize, k: usize, s: usize, bias: bool, rng: &mut R) -> Self {
        let bound = 1.0 / ((c1 * k * k) as f32).sqrt();
        let weight = Array4::from_shape_fn((c2, c1, k, k), |_| rng.gen_range(-bound..bound));
        let bias = if bias {
            Some(Array1::from_shape_fn(c2, |_| rng.gen_range(-bound..bound)))
        } else {
            None
        };
        Self { weight, bias, stride: s, padding: k / 2 }
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn kernel(&self) -> (usize, usize) {
        let (_, _, kh, kw) = self.weight.dim();
        (kh, kw)
    }
}

impl Parameters for Conv2d {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&format!("{prefix}.weight"), self.weight.view().into_dyn());
        if let Some(b) = &self.bias {
            f(&format!("{prefix}.bias"), b.view().into_dyn());
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        f(&format!("{prefix}.weight"), self.weight.view_mut().into_dyn())?;
        if let Some(b) = &mut self.bias {
            f(&format!("{prefix}.bias"), b.view_mut().into_dyn())?;
        }
        Ok(())
    }
}

/// Batch normalisation with frozen running statistics.
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    pub weight: Array1<f32>,
    pub bias: Array1<f32>,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    pub eps: f32,
}

impl BatchNorm2d {
    /// Random statistics close to identity.
    pub fn new<R: Rng>(c: usize, rng: &mut R) -> Self {
        Self {
            weight: Array1::from_shape_fn(c, |_| rng.gen_range(0.8..1.2)),
            bias: Array1::from_shape_fn(c, |_| rng.gen_range(-0.05..0.05)),
            running_mean: Array1::from_shape_fn(c, |_| rng.gen_range(-0.05..0.05)),
            running_var: Array1::from_shape_fn(c, |_| rng.gen_range(0.8..1.2)),
            eps: 1e-3,
        }
    }
}

impl Parameters for BatchNorm2d {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        f(&format!("{prefix}.weight"), self.weight.view().into_dyn());
        f(&format!("{prefix}.bias"), self.bias.view().into_dyn());
        f(&format!("{prefix}.running_mean"), self.running_mean.view().into_dyn());
        f(&format!("{prefix}.running_var"), self.running_var.view().into_dyn());
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        f(&format!("{prefix}.weight"), self.weight.view_mut().into_dyn())?;
        f(&format!("{prefix}.bias"), self.bias.view_mut().into_dyn())?;
        f(&format!("{prefix}.running_mean"), self.running_mean.view_mut().into_dyn())?;
        f(&format!("{prefix}.running_var"), self.running_var.view_mut().into_dyn())
    }
}

/// Convolution, batch norm and SiLU.
#[derive(Clone, Debug)]
pub struct Conv {
    pub conv: Conv2d,
    pub bn: BatchNorm2d,
}

impl Conv {
    pub fn new<R: Rng>(c1: usize, c2: usize, k: usize, s: usize, rng: &mut R) -> Self {
        Self {
            conv: Conv2d::new(c1, c2, k, s, false, rng),
            bn: BatchNorm2d::new(c2, rng),
        }
    }

    pub fn forward<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Value> {
        b.conv(x, &self.conv, Some(&self.bn), true)
    }
}

impl Parameters for Conv {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.conv.visit(&format!("{prefix}.conv"), f);
        self.bn.visit(&format!("{prefix}.bn"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.conv.visit_mut(&format!("{prefix}.conv"), f)?;
        self.bn.visit_mut(&format!("{prefix}.bn"), f)
    }
}

/// Two 3x3 convolutions with an optional residual connection.
#[derive(Clone, Debug)]
pub struct Bottleneck {
    cv1: Conv,
    cv2: Conv,
    add: bool,
}

impl Bottleneck {
    pub fn new<R: Rng>(c1: usize, c2: usize, shortcut: bool, rng: &mut R) -> Self {
        Self {
            cv1: Conv::new(c1, c2, 3, 1, rng),
            cv2: Conv::new(c2, c2, 3, 1, rng),
            add: shortcut && c1 == c2,
        }
    }

    pub fn forward<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Value> {
        let h = self.cv1.forward(b, x)?;
        let h = self.cv2.forward(b, &h)?;
        if self.add {
            b.add(x, &h)
        } else {
            Ok(h)
        }
    }
}

impl Parameters for Bottleneck {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.cv1.visit(&format!("{prefix}.cv1"), f);
        self.cv2.visit(&format!("{prefix}.cv2"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.cv1.visit_mut(&format!("{prefix}.cv1"), f)?;
        self.cv2.visit_mut(&format!("{prefix}.cv2"), f)
    }
}

/// Cross-stage partial block with two convolutions: the input is split
/// in half and every bottleneck output is kept for the final concat.
#[derive(Clone, Debug)]
pub struct C2f {
    c: usize,
    cv1: Conv,
    cv2: Conv,
    m: Vec<Bottleneck>,
}

impl C2f {
    pub fn new<R: Rng>(c1: usize, c2: usize, n: usize, shortcut: bool, rng: &mut R) -> Self {
        let c = c2 / 2;
        let cv1 = Conv::new(c1, 2 * c, 1, 1, rng);
        let cv2 = Conv::new((2 + n) * c, c2, 1, 1, rng);
        let m = (0..n).map(|_| Bottleneck::new(c, c, shortcut, rng)).collect();
        Self { c, cv1, cv2, m }
    }

    pub fn forward<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Value> {
        let y = self.cv1.forward(b, x)?;
        let mut ys = vec![
            b.slice_channels(&y, 0, self.c)?,
            b.slice_channels(&y, self.c, 2 * self.c)?,
        ];
        for m in &self.m {
            let next = m.forward(b, &ys[ys.len() - 1])?;
            ys.push(next);
        }
        let refs: Vec<&B::Value> = ys.iter().collect();
        let cat = b.concat(&refs)?;
        self.cv2.forward(b, &cat)
    }
}

impl Parameters for C2f {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.cv1.visit(&format!("{prefix}.cv1"), f);
        self.cv2.visit(&format!("{prefix}.cv2"), f);
        for (i, m) in self.m.iter().enumerate() {
            m.visit(&format!("{prefix}.m.{i}"), f);
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.cv1.visit_mut(&format!("{prefix}.cv1"), f)?;
        self.cv2.visit_mut(&format!("{prefix}.cv2"), f)?;
        for (i, m) in self.m.iter_mut().enumerate() {
            m.visit_mut(&format!("{prefix}.m.{i}"), f)?;
        }
        Ok(())
    }
}

/// Spatial pyramid pooling, fast variant: three chained max pools.
#[derive(Clone, Debug)]
pub struct Sppf {
    cv1: Conv,
    cv2: Conv,
    k: usize,
}

impl Sppf {
    pub fn new<R: Rng>(c1: usize, c2: usize, k: usize, rng: &mut R) -> Self {
        let c = c1 / 2;
        Self {
            cv1: Conv::new(c1, c, 1, 1, rng),
            cv2: Conv::new(c * 4, c2, 1, 1, rng),
            k,
        }
    }

    pub fn forward<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Value> {
        let y0 = self.cv1.forward(b, x)?;
        let y1 = b.max_pool(&y0, self.k, 1, self.k / 2)?;
        let y2 = b.max_pool(&y1, self.k, 1, self.k / 2)?;
        let y3 = b.max_pool(&y2, self.k, 1, self.k / 2)?;
        let cat = b.concat(&[&y0, &y1, &y2, &y3])?;
        self.cv2.forward(b, &cat)
    }
}

impl Parameters for Sppf {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.cv1.visit(&format!("{prefix}.cv1"), f);
        self.cv2.visit(&format!("{prefix}.cv2"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.cv1.visit_mut(&format!("{prefix}.cv1"), f)?;
        self.cv2.visit_mut(&format!("{prefix}.cv2"), f)
    }
}

/// Static description of the detection head, recorded in traced graphs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectSpec {
    pub strides: Vec<usize>,
    pub reg_max: usize,
    pub num_classes: usize,
}

/// Conv, conv, then a biased 1x1 prediction layer.
#[derive(Clone, Debug)]
struct HeadBranch {
    a: Conv,
    b: Conv,
    pred: Conv2d,
}

impl HeadBranch {
    fn new<R: Rng>(c1: usize, c: usize, out: usize, bias: f32, rng: &mut R) -> Self {
        let mut pred = Conv2d::new(c, out, 1, 1, true, rng);
        pred.bias = Some(Array1::from_elem(out, bias));
        Self {
            a: Conv::new(c1, c, 3, 1, rng),
            b: Conv::new(c, c, 3, 1, rng),
            pred,
        }
    }

    fn forward<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Value> {
        let h = self.a.forward(b, x)?;
        let h = self.b.forward(b, &h)?;
        b.conv(&h, &self.pred, None, false)
    }
}

impl Parameters for HeadBranch {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.a.visit(&format!("{prefix}.0"), f);
        self.b.visit(&format!("{prefix}.1"), f);
        self.pred.visit(&format!("{prefix}.2"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.a.visit_mut(&format!("{prefix}.0"), f)?;
        self.b.visit_mut(&format!("{prefix}.1"), f)?;
        self.pred.visit_mut(&format!("{prefix}.2"), f)
    }
}

/// Decoupled detection head: one box branch and one class branch per level.
#[derive(Clone, Debug)]
pub struct Detect {
    spec: DetectSpec,
    box_branches: Vec<HeadBranch>,
    cls_branches: Vec<HeadBranch>,
}

impl Detect {
    pub fn new<R: Rng>(num_classes: usize, reg_max: usize, ch: &[usize], rng: &mut R) -> Self {
        let c_box = 16.max(ch[0] / 4).max(reg_max * 4);
        let c_cls = ch[0].max(num_classes.min(100));
        let box_branches = ch
            .iter()
            .map(|&c| HeadBranch::new(c, c_box, 4 * reg_max, 1.0, rng))
            .collect();
        let cls_branches = ch
            .iter()
            .zip(STRIDES)
            .map(|(&c, s)| {
                // prior of ~5 objects per 640px image spread over the level's cells
                let cells = (640.0 / s as f32).powi(2);
                let prior = (5.0 / num_classes as f32 / cells).ln();
                HeadBranch::new(c, c_cls, num_classes, prior, rng)
            })
            .collect();
        Self {
            spec: DetectSpec {
                strides: STRIDES.to_vec(),
                reg_max,
                num_classes,
            },
            box_branches,
            cls_branches,
        }
    }

    pub fn spec(&self) -> &DetectSpec {
        &self.spec
    }

    pub fn forward<B: Backend>(&self, b: &mut B, xs: &[&B::Value]) -> Result<B::Output> {
        let mut levels = Vec::with_capacity(xs.len());
        let branches = self.box_branches.iter().zip(&self.cls_branches);
        for (x, (box_branch, cls_branch)) in xs.iter().zip(branches) {
            let boxes = box_branch.forward(b, x)?;
            let cls = cls_branch.forward(b, x)?;
            levels.push((boxes, cls));
        }
        b.detect(&levels, &self.spec)
    }
}

impl Parameters for Detect {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        for (i, branch) in self.box_branches.iter().enumerate() {
            branch.visit(&format!("{prefix}.cv2.{i}"), f);
        }
        for (i, branch) in self.cls_branches.iter().enumerate() {
            branch.visit(&format!("{prefix}.cv3.{i}"), f);
        }
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        for (i, branch) in self.box_branches.iter_mut().enumerate() {
            branch.visit_mut(&format!("{prefix}.cv2.{i}"), f)?;
        }
        for (i, branch) in self.cls_branches.iter_mut().enumerate() {
            branch.visit_mut(&format!("{prefix}.cv3.{i}"), f)?;
        }
        Ok(())
    }
}

/// Full YOLOv8 detector: backbone, PAN-FPN neck and detection head.
///
/// Layer indices in parameter names follow the usual YOLOv8 layout; the
/// parameter-free upsample (10, 13) and concat (11, 14, 17, 20) layers
/// only show up in the forward pass.
#[derive(Clone, Debug)]
pub struct DetectionModel {
    pub args: ModelArgs,
    stem: Conv,     // 0
    down1: Conv,    // 1
    stage1: C2f,    // 2
    down2: Conv,    // 3
    stage2: C2f,    // 4, P3
    down3: Conv,    // 5
    stage3: C2f,    // 6, P4
    down4: Conv,    // 7
    stage4: C2f,    // 8
    sppf: Sppf,     // 9, P5
    top_down1: C2f, // 12
    top_down2: C2f, // 15, P3 out
    bu_conv1: Conv, // 16
    bottom_up1: C2f, // 18, P4 out
    bu_conv2: Conv, // 19
    bottom_up2: C2f, // 21, P5 out
    detect: Detect, // 22
}

impl DetectionModel {
    pub fn new<R: Rng>(args: ModelArgs, rng: &mut R) -> Self {
        let [c0, c1, c2, c3, c4] = args.channels();
        let n = args.depth;
        Self {
            stem: Conv::new(3, c0, 3, 2, rng),
            down1: Conv::new(c0, c1, 3, 2, rng),
            stage1: C2f::new(c1, c1, n, true, rng),
            down2: Conv::new(c1, c2, 3, 2, rng),
            stage2: C2f::new(c2, c2, 2 * n, true, rng),
            down3: Conv::new(c2, c3, 3, 2, rng),
            stage3: C2f::new(c3, c3, 2 * n, true, rng),
            down4: Conv::new(c3, c4, 3, 2, rng),
            stage4: C2f::new(c4, c4, n, true, rng),
            sppf: Sppf::new(c4, c4, 5, rng),
            top_down1: C2f::new(c4 + c3, c3, n, false, rng),
            top_down2: C2f::new(c3 + c2, c2, n, false, rng),
            bu_conv1: Conv::new(c2, c2, 3, 2, rng),
            bottom_up1: C2f::new(c2 + c3, c3, n, false, rng),
            bu_conv2: Conv::new(c3, c3, 3, 2, rng),
            bottom_up2: C2f::new(c3 + c4, c4, n, false, rng),
            detect: Detect::new(args.num_classes, args.reg_max, &[c2, c3, c4], rng),
            args,
        }
    }

    /// Deterministic random initialisation.
    pub fn seeded(args: ModelArgs, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(args, &mut rng)
    }

    /// Largest feature map stride; input sizes must be a multiple of it.
    pub fn stride(&self) -> usize {
        STRIDES[STRIDES.len() - 1]
    }

    pub fn detect_spec(&self) -> &DetectSpec {
        self.detect.spec()
    }

    /// Runs the network on any backend.
    pub fn run<B: Backend>(&self, b: &mut B, x: &B::Value) -> Result<B::Output> {
        let h = self.stem.forward(b, x)?;
        let h = self.down1.forward(b, &h)?;
        let h = self.stage1.forward(b, &h)?;
        let h = self.down2.forward(b, &h)?;
        let p3 = self.stage2.forward(b, &h)?;
        let h = self.down3.forward(b, &p3)?;
        let p4 = self.stage3.forward(b, &h)?;
        let h = self.down4.forward(b, &p4)?;
        let h = self.stage4.forward(b, &h)?;
        let p5 = self.sppf.forward(b, &h)?;

        let up = b.upsample(&p5, 2)?;
        let cat = b.concat(&[&up, &p4])?;
        let n4 = self.top_down1.forward(b, &cat)?;

        let up = b.upsample(&n4, 2)?;
        let cat = b.concat(&[&up, &p3])?;
        let out3 = self.top_down2.forward(b, &cat)?;

        let down = self.bu_conv1.forward(b, &out3)?;
        let cat = b.concat(&[&down, &n4])?;
        let out4 = self.bottom_up1.forward(b, &cat)?;

        let down = self.bu_conv2.forward(b, &out4)?;
        let cat = b.concat(&[&down, &p5])?;
        let out5 = self.bottom_up2.forward(b, &cat)?;

        self.detect.forward(b, &[&out3, &out4, &out5])
    }

    /// Eager forward pass returning `[batch, 4 + num_classes, anchors]`.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array3<f32>> {
        self.run(&mut Eager, x)
    }

    /// Records the forward pass on a `[batch, 3, imgsz, imgsz]` input.
    pub fn trace(&self, batch: usize, imgsz: usize) -> Result<TracedModule> {
        let (mut tracer, input) = Tracer::new([batch, 3, imgsz, imgsz]);
        let output = self.run(&mut tracer, &input)?;
        tracer.finish(output)
    }

    pub fn state_dict(&self) -> StateDict {
        let mut sd = StateDict::new();
        self.visit("model", &mut |name, t| {
            sd.insert(name.to_string(), t.to_owned());
        });
        sd
    }

    /// Copies every parameter from `sd`. Missing, unexpected or
    /// mis-shaped entries are errors.
    pub fn load_state_dict(&mut self, sd: &StateDict) -> Result<()> {
        let mut used = 0;
        self.visit_mut("model", &mut |name, mut dst| {
            let src = sd
                .get(name)
                .ok_or_else(|| Error::StateDict(format!("missing tensor '{name}'")))?;
            if src.shape() != dst.shape() {
                return Err(Error::StateDict(format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    src.shape(),
                    dst.shape()
                )));
            }
            dst.assign(src);
            used += 1;
            Ok(())
        })?;
        if used != sd.len() {
            let expected: std::collections::BTreeSet<String> =
                self.state_dict().into_keys().collect();
            let extra: Vec<&String> = sd.keys().filter(|k| !expected.contains(*k)).collect();
            return Err(Error::StateDict(format!("unexpected tensors {extra:?}")));
        }
        Ok(())
    }

    pub fn num_params(&self) -> usize {
        let mut total = 0;
        self.visit("model", &mut |_, t| total += t.len());
        total
    }
}

impl Parameters for DetectionModel {
    fn visit(&self, prefix: &str, f: &mut dyn FnMut(&str, ArrayViewD<'_, f32>)) {
        self.stem.visit(&format!("{prefix}.0"), f);
        self.down1.visit(&format!("{prefix}.1"), f);
        self.stage1.visit(&format!("{prefix}.2"), f);
        self.down2.visit(&format!("{prefix}.3"), f);
        self.stage2.visit(&format!("{prefix}.4"), f);
        self.down3.visit(&format!("{prefix}.5"), f);
        self.stage3.visit(&format!("{prefix}.6"), f);
        self.down4.visit(&format!("{prefix}.7"), f);
        self.stage4.visit(&format!("{prefix}.8"), f);
        self.sppf.visit(&format!("{prefix}.9"), f);
        self.top_down1.visit(&format!("{prefix}.12"), f);
        self.top_down2.visit(&format!("{prefix}.15"), f);
        self.bu_conv1.visit(&format!("{prefix}.16"), f);
        self.bottom_up1.visit(&format!("{prefix}.18"), f);
        self.bu_conv2.visit(&format!("{prefix}.19"), f);
        self.bottom_up2.visit(&format!("{prefix}.21"), f);
        self.detect.visit(&format!("{prefix}.22"), f);
    }

    fn visit_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>) -> Result<()>,
    ) -> Result<()> {
        self.stem.visit_mut(&format!("{prefix}.0"), f)?;
        self.down1.visit_mut(&format!("{prefix}.1"), f)?;
        self.stage1.visit_mut(&format!("{prefix}.2"), f)?;
        self.down2.visit_mut(&format!("{prefix}.3"), f)?;
        self.stage2.visit_mut(&format!("{prefix}.4"), f)?;
        self.down3.visit_mut(&format!("{prefix}.5"), f)?;
        self.stage3.visit_mut(&format!("{prefix}.6"), f)?;
        self.down4.visit_mut(&format!("{prefix}.7"), f)?;
        self.stage4.visit_mut(&format!("{prefix}.8"), f)?;
        self.sppf.visit_mut(&format!("{prefix}.9"), f)?;
        self.top_down1.visit_mut(&format!("{prefix}.12"), f)?;
        self.top_down2.visit_mut(&format!("{prefix}.15"), f)?;
        self.bu_conv1.visit_mut(&format!("{prefix}.16"), f)?;
        self.bottom_up1.visit_mut(&format!("{prefix}.18"), f)?;
        self.bu_conv2.visit_mut(&format!("{prefix}.19"), f)?;
        self.bottom_up2.visit_mut(&format!("{prefix}.21"), f)?;
        self.detect.visit_mut(&format!("{prefix}.22"), f)
    }
}
