//! Graph capture.
//!
//! [`Tracer`] is a [`Backend`] that performs no arithmetic: every call
//! appends a [`Node`] with its inferred output shape. Parameters are
//! copied out as the graph is built, with batch norms folded into the
//! convolution that precedes them.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::model::{BatchNorm2d, Conv2d, DetectSpec};
use crate::ops;

pub type NodeId = usize;

/// One recorded operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Input,
    Conv {
        weight: usize,
        bias: Option<usize>,
        stride: usize,
        padding: usize,
        silu: bool,
    },
    Add,
    Concat,
    Slice {
        start: usize,
        end: usize,
    },
    MaxPool {
        kernel: usize,
        stride: usize,
        padding: usize,
    },
    Upsample {
        scale: usize,
    },
    /// Inputs alternate box and class maps, one pair per level.
    Detect(DetectSpec),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub shape: Vec<usize>,
}

/// A fixed-shape computation graph in topological order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub input_shape: [usize; 4],
    pub nodes: Vec<Node>,
    pub output: NodeId,
}

impl Graph {
    pub fn output_shape(&self) -> &[usize] {
        self.nodes
            .get(self.output)
            .map(|n| n.shape.as_slice())
            .unwrap_or(&[])
    }

    /// Image size `(height, width)` the graph was traced at.
    pub fn imgsz(&self) -> (usize, usize) {
        (self.input_shape[2], self.input_shape[3])
    }

    /// Checks the graph against its parameter tensors. Every node must
    /// read only earlier nodes, take the right number of inputs and record
    /// the shape its inputs and parameters actually produce.
    pub fn validate(&self, params: &[ArrayD<f32>]) -> Result<()> {
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(&bad) = node.inputs.iter().find(|&&i| i >= id) {
                return Err(Error::InvalidGraph(format!(
                    "node {id} reads node {bad} which is not computed before it"
                )));
            }
            let shape = self
                .infer_shape(id, node, params)
                .map_err(|reason| Error::InvalidGraph(format!("node {id}: {reason}")))?;
            let numel = shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d));
            if numel.map_or(true, |n| n > isize::MAX as usize) {
                return Err(Error::InvalidGraph(format!("node {id} has oversized shape {shape:?}")));
            }
            if shape != node.shape {
                return Err(Error::InvalidGraph(format!(
                    "node {id} records shape {:?} but computes {shape:?}",
                    node.shape
                )));
            }
        }
        match self.nodes.get(self.output) {
            Some(Node { op: Op::Detect(_), .. }) => Ok(()),
            _ => Err(Error::InvalidGraph("graph output must be a detect node".into())),
        }
    }

    /// Output shape of `node`, derived from the recorded shapes of its inputs.
    fn infer_shape(
        &self,
        id: NodeId,
        node: &Node,
        params: &[ArrayD<f32>],
    ) -> std::result::Result<Vec<usize>, String> {
        let arity = |n: usize| {
            if node.inputs.len() == n {
                Ok(())
            } else {
                Err(format!("expects {n} inputs, has {}", node.inputs.len()))
            }
        };
        let input = |i: usize| feature_map(&self.nodes[node.inputs[i]].shape);

        match &node.op {
            Op::Input => {
                arity(0)?;
                if id != 0 {
                    return Err("only the first node may be the input".into());
                }
                Ok(self.input_shape.to_vec())
            }
            _ if id == 0 => Err("the first node must be the input".into()),
            Op::Conv {
                weight,
                bias,
                stride,
                padding,
                ..
            } => {
                arity(1)?;
                let [n, c, h, w] = input(0)?;
                let [co, ci, kh, kw] = match params.get(*weight).map(|p| p.shape()) {
                    Some(&[co, ci, kh, kw]) => [co, ci, kh, kw],
                    Some(other) => return Err(format!("conv weight has shape {other:?}")),
                    None => return Err(format!("conv weight {weight} is missing")),
                };
                if ci != c {
                    return Err(format!("conv expects {ci} input channels, gets {c}"));
                }
                if let Some(b) = bias {
                    match params.get(*b).map(|p| p.shape()) {
                        Some(&[len]) if len == co => {}
                        Some(other) => {
                            return Err(format!("conv bias has shape {other:?} for {co} channels"))
                        }
                        None => return Err(format!("conv bias {b} is missing")),
                    }
                }
                Ok(vec![
                    n,
                    co,
                    window_out_dim(h, kh, *stride, *padding)?,
                    window_out_dim(w, kw, *stride, *padding)?,
                ])
            }
            Op::Add => {
                arity(2)?;
                let (a, b) = (input(0)?, input(1)?);
                if a != b {
                    return Err(format!("adds {a:?} to {b:?}"));
                }
                Ok(a.to_vec())
            }
            Op::Concat => {
                if node.inputs.is_empty() {
                    return Err("concat of nothing".into());
                }
                let [n, _, h, w] = input(0)?;
                let mut channels = 0usize;
                for i in 0..node.inputs.len() {
                    let [xn, xc, xh, xw] = input(i)?;
                    if (xn, xh, xw) != (n, h, w) {
                        return Err(format!("concatenates {:?} with {:?}", [n, h, w], [xn, xh, xw]));
                    }
                    channels = channels.checked_add(xc).ok_or("channel count overflows")?;
                }
                Ok(vec![n, channels, h, w])
            }
            Op::Slice { start, end } => {
                arity(1)?;
                let [n, c, h, w] = input(0)?;
                if start > end || *end > c {
                    return Err(format!(
                        "channel slice {start}..{end} out of range for {c} channels"
                    ));
                }
                Ok(vec![n, end - start, h, w])
            }
            Op::MaxPool {
                kernel,
                stride,
                padding,
            } => {
                arity(1)?;
                let [n, c, h, w] = input(0)?;
                if *padding > kernel / 2 {
                    return Err(format!("pool padding {padding} exceeds half of kernel {kernel}"));
                }
                Ok(vec![
                    n,
                    c,
                    window_out_dim(h, *kernel, *stride, *padding)?,
                    window_out_dim(w, *kernel, *stride, *padding)?,
                ])
            }
            Op::Upsample { scale } => {
                arity(1)?;
                let [n, c, h, w] = input(0)?;
                let scaled = |d: usize| {
                    d.checked_mul(*scale)
                        .filter(|&d| d > 0)
                        .ok_or_else(|| format!("upsample scale {scale} is out of range"))
                };
                Ok(vec![n, c, scaled(h)?, scaled(w)?])
            }
            Op::Detect(spec) => {
                if spec.strides.is_empty() || spec.reg_max == 0 || spec.num_classes == 0 {
                    return Err("detect head needs levels, box bins and classes".into());
                }
                arity(2 * spec.strides.len())?;
                let box_channels = spec.reg_max.checked_mul(4).ok_or("box bins overflow")?;
                let batch = input(0)?[0];
                let mut anchors = 0usize;
                for level in 0..spec.strides.len() {
                    let [bn, bc, bh, bw] = input(2 * level)?;
                    let [cn, cc, ch, cw] = input(2 * level + 1)?;
                    if bc != box_channels || cc != spec.num_classes {
                        return Err(format!(
                            "level {level} has {bc} box and {cc} class channels, \
                             expected {box_channels} and {}",
                            spec.num_classes
                        ));
                    }
                    if (bn, bh, bw) != (cn, ch, cw) || bn != batch {
                        return Err(format!("level {level} box and class maps disagree"));
                    }
                    anchors = bh
                        .checked_mul(bw)
                        .and_then(|cells| anchors.checked_add(cells))
                        .ok_or("anchor count overflows")?;
                }
                Ok(vec![batch, 4 + spec.num_classes, anchors])
            }
        }
    }
}

/// A traced graph together with the parameter tensors it references.
#[derive(Clone, Debug, PartialEq)]
pub struct TracedModule {
    pub graph: Graph,
    pub params: Vec<ArrayD<f32>>,
}

/// Symbolic value flowing through the tracer.
#[derive(Clone, Debug)]
pub struct Traced {
    pub id: NodeId,
    pub shape: Vec<usize>,
}

pub struct Tracer {
    input_shape: [usize; 4],
    nodes: Vec<Node>,
    params: Vec<ArrayD<f32>>,
}

impl Tracer {
    /// Starts a trace and returns the value standing for the input.
    pub fn new(input_shape: [usize; 4]) -> (Self, Traced) {
        let mut tracer = Self {
            input_shape,
            nodes: Vec::new(),
            params: Vec::new(),
        };
        let input = tracer.push(Op::Input, Vec::new(), input_shape.to_vec());
        (tracer, input)
    }

    pub fn finish(self, output: Traced) -> Result<TracedModule> {
        let graph = Graph {
            input_shape: self.input_shape,
            nodes: self.nodes,
            output: output.id,
        };
        graph.validate(&self.params)?;
        tracing::debug!(
            nodes = graph.nodes.len(),
            params = self.params.len(),
            "trace complete"
        );
        Ok(TracedModule {
            graph,
            params: self.params,
        })
    }

    fn push(&mut self, op: Op, inputs: Vec<NodeId>, shape: Vec<usize>) -> Traced {
        let id = self.nodes.len();
        self.nodes.push(Node {
            op,
            inputs,
            shape: shape.clone(),
        });
        Traced { id, shape }
    }

    fn push_param(&mut self, t: ArrayD<f32>) -> usize {
        self.params.push(t);
        self.params.len() - 1
    }
}

fn feature_map(shape: &[usize]) -> std::result::Result<[usize; 4], String> {
    match *shape {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(format!("expected a feature map, got shape {shape:?}")),
    }
}

/// Like [`ops::conv_out_dim`], but rejects a zero stride or kernel, a
/// window larger than the padded input and sizes past `isize::MAX`.
fn window_out_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
) -> std::result::Result<usize, String> {
    if kernel == 0 || stride == 0 {
        return Err(format!("kernel {kernel} with stride {stride}"));
    }
    let padded = padding
        .checked_mul(2)
        .and_then(|p| p.checked_add(input))
        .filter(|&p| p <= isize::MAX as usize)
        .ok_or_else(|| format!("padding {padding} is out of range"))?;
    if kernel > padded {
        return Err(format!("kernel {kernel} exceeds padded input {padded}"));
    }
    Ok((padded - kernel) / stride + 1)
}

fn expect_rank4(v: &Traced) -> Result<[usize; 4]> {
    match v.shape[..] {
        [n, c, h, w] => Ok([n, c, h, w]),
        _ => Err(Error::InvalidGraph(format!(
            "expected a feature map, got shape {:?}",
            v.shape
        ))),
    }
}

impl Backend for Tracer {
    type Value = Traced;
    type Output = Traced;

    fn conv(
        &mut self,
        x: &Traced,
        conv: &Conv2d,
        bn: Option<&BatchNorm2d>,
        silu: bool,
    ) -> Result<Traced> {
        let [n, c, h, w] = expect_rank4(x)?;
        if c != conv.in_channels() {
            return Err(Error::ShapeMismatch {
                expected: vec![n, conv.in_channels(), h, w],
                got: x.shape.clone(),
            });
        }
        let (weight, bias) = match bn {
            Some(bn) => {
                let (w, b) = ops::fold_batch_norm(
                    conv.weight.view(),
                    conv.bias.as_ref().map(|b| b.view()),
                    bn.weight.view(),
                    bn.bias.view(),
                    bn.running_mean.view(),
                    bn.running_var.view(),
                    bn.eps,
                );
                (w, Some(b))
            }
            None => (conv.weight.clone(), conv.bias.clone()),
        };
        let weight = self.push_param(weight.into_dyn());
        let bias = bias.map(|b| self.push_param(b.into_dyn()));

        let (kh, kw) = conv.kernel();
        let shape = vec![
            n,
            conv.out_channels(),
            ops::conv_out_dim(h, kh, conv.stride, conv.padding),
            ops::conv_out_dim(w, kw, conv.stride, conv.padding),
        ];
        let op = Op::Conv {
            weight,
            bias,
            stride: conv.stride,
            padding: conv.padding,
            silu,
        };
        Ok(self.push(op, vec![x.id], shape))
    }

    fn add(&mut self, a: &Traced, b: &Traced) -> Result<Traced> {
        if a.shape != b.shape {
            return Err(Error::ShapeMismatch {
                expected: a.shape.clone(),
                got: b.shape.clone(),
            });
        }
        Ok(self.push(Op::Add, vec![a.id, b.id], a.shape.clone()))
    }

    fn concat(&mut self, xs: &[&Traced]) -> Result<Traced> {
        let first = xs
            .first()
            .ok_or_else(|| Error::InvalidGraph("concat of nothing".into()))?;
        let [n, _, h, w] = expect_rank4(first)?;
        let mut channels = 0;
        for x in xs {
            let [xn, xc, xh, xw] = expect_rank4(x)?;
            if (xn, xh, xw) != (n, h, w) {
                return Err(Error::ShapeMismatch {
                    expected: vec![n, xc, h, w],
                    got: x.shape.clone(),
                });
            }
            channels += xc;
        }
        let inputs = xs.iter().map(|x| x.id).collect();
        Ok(self.push(Op::Concat, inputs, vec![n, channels, h, w]))
    }

    fn slice_channels(&mut self, x: &Traced, start: usize, end: usize) -> Result<Traced> {
        let [n, c, h, w] = expect_rank4(x)?;
        if start > end || end > c {
            return Err(Error::InvalidGraph(format!(
                "channel slice {start}..{end} out of range for {c} channels"
            )));
        }
        Ok(self.push(Op::Slice { start, end }, vec![x.id], vec![n, end - start, h, w]))
    }

    fn max_pool(
        &mut self,
        x: &Traced,
        kernel: usize,
        stride: usize,
        padding: usize,
    ) -> Result<Traced> {
        let [n, c, h, w] = expect_rank4(x)?;
        let shape = vec![
            n,
            c,
            ops::conv_out_dim(h, kernel, stride, padding),
            ops::conv_out_dim(w, kernel, stride, padding),
        ];
        let op = Op::MaxPool {
            kernel,
            stride,
            padding,
        };
        Ok(self.push(op, vec![x.id], shape))
    }

    fn upsample(&mut self, x: &Traced, scale: usize) -> Result<Traced> {
        let [n, c, h, w] = expect_rank4(x)?;
        Ok(self.push(Op::Upsample { scale }, vec![x.id], vec![n, c, h * scale, w * scale]))
    }

    fn detect(&mut self, levels: &[(Traced, Traced)], spec: &DetectSpec) -> Result<Traced> {
        let mut inputs = Vec::with_capacity(levels.len() * 2);
        let mut anchors = 0;
        let mut batch = 0;
        for (boxes, cls) in levels {
            let [n, _, h, w] = expect_rank4(boxes)?;
            batch = n;
            anchors += h * w;
            inputs.push(boxes.id);
            inputs.push(cls.id);
        }
        let shape = vec![batch, 4 + spec.num_classes, anchors];
        Ok(self.push(Op::Detect(spec.clone()), inputs, shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectionModel, ModelArgs};

    fn tiny() -> DetectionModel {
        DetectionModel::seeded(
            ModelArgs {
                num_classes: 2,
                base_channels: 4,
                depth: 1,
                reg_max: 4,
            },
            7,
        )
    }

    #[test]
    fn trace_records_input_shape_and_anchor_count() {
        let traced = tiny().trace(1, 64).unwrap();
        assert_eq!(traced.graph.input_shape, [1, 3, 64, 64]);
        // 8x8 + 4x4 + 2x2 cells
        assert_eq!(traced.graph.output_shape(), &[1, 6, 84]);
    }

    #[test]
    fn every_conv_owns_its_parameters() {
        let traced = tiny().trace(1, 32).unwrap();
        let convs = traced
            .graph
            .nodes
            .iter()
            .filter(|n| matches!(n.op, Op::Conv { .. }))
            .count();
        // batch norms are folded, so each conv carries exactly a weight and a bias
        assert_eq!(traced.params.len(), 2 * convs);
    }

    #[test]
    fn validate_rejects_forward_references() {
        let mut traced = tiny().trace(1, 32).unwrap();
        traced.graph.nodes[1].inputs = vec![5];
        assert!(matches!(
            traced.graph.validate(&traced.params),
            Err(Error::InvalidGraph(_))
        ));
    }

    fn first_node(traced: &TracedModule, pred: impl Fn(&Op) -> bool) -> usize {
        traced.graph.nodes.iter().position(|n| pred(&n.op)).unwrap()
    }

    #[test]
    fn validate_rejects_slice_past_channels() {
        let mut traced = tiny().trace(1, 32).unwrap();
        let id = first_node(&traced, |op| matches!(op, Op::Slice { .. }));
        traced.graph.nodes[id].op = Op::Slice { start: 0, end: 4096 };
        let err = traced.graph.validate(&traced.params).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn validate_rejects_missing_inputs() {
        let mut traced = tiny().trace(1, 32).unwrap();
        let conv = first_node(&traced, |op| matches!(op, Op::Conv { .. }));
        traced.graph.nodes[conv].inputs.clear();
        assert!(traced.graph.validate(&traced.params).is_err());

        let mut traced = tiny().trace(1, 32).unwrap();
        let add = first_node(&traced, |op| matches!(op, Op::Add));
        traced.graph.nodes[add].inputs.truncate(1);
        assert!(traced.graph.validate(&traced.params).is_err());
    }

    #[test]
    fn validate_rejects_detect_channel_mismatch() {
        let mut traced = tiny().trace(1, 32).unwrap();
        let out = traced.graph.output;
        if let Op::Detect(spec) = &mut traced.graph.nodes[out].op {
            spec.num_classes = 80;
        }
        traced.graph.nodes[out].shape[1] = 84;
        let err = traced.graph.validate(&traced.params).unwrap_err();
        assert!(err.to_string().contains("class channels"), "{err}");
    }

    #[test]
    fn validate_rejects_bad_conv_parameters() {
        let mut traced = tiny().trace(1, 32).unwrap();
        let conv = first_node(&traced, |op| matches!(op, Op::Conv { .. }));
        if let Op::Conv { weight, .. } = traced.graph.nodes[conv].op {
            traced.params[weight] = ArrayD::zeros(vec![16, 3]);
        }
        assert!(traced.graph.validate(&traced.params).is_err());

        let mut traced = tiny().trace(1, 32).unwrap();
        if let Op::Conv { stride, .. } = &mut traced.graph.nodes[conv].op {
            *stride = 0;
        }
        assert!(traced.graph.validate(&traced.params).is_err());
    }

    #[test]
    fn validate_rejects_wrong_recorded_shape() {
        let mut traced = tiny().trace(1, 32).unwrap();
        let pool = first_node(&traced, |op| matches!(op, Op::MaxPool { .. }));
        traced.graph.nodes[pool].shape[2] += 1;
        assert!(traced.graph.validate(&traced.params).is_err());
    }

    #[test]
    fn graph_survives_json() {
        let traced = tiny().trace(1, 32).unwrap();
        let json = serde_json::to_string(&traced.graph).unwrap();
        let back: Graph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, traced.graph);
    }
}
