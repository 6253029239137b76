//! Interpreter for traced graphs.

use ndarray::{Array3, Array4, ArrayView4, Ix1, Ix4};

use crate::error::{Error, Result};
use crate::ops;
use crate::trace::{Graph, Node, Op, TracedModule};

/// Runs a [`TracedModule`] on fixed-shape inputs.
pub struct Executor {
    module: TracedModule,
    /// Index of the last node that reads each node's value.
    last_use: Vec<usize>,
}

impl Executor {
    pub fn new(module: TracedModule) -> Result<Self> {
        module.graph.validate(&module.params)?;
        let mut last_use: Vec<usize> = (0..module.graph.nodes.len()).collect();
        for (id, node) in module.graph.nodes.iter().enumerate() {
            for &input in &node.inputs {
                last_use[input] = id;
            }
        }
        Ok(Self { module, last_use })
    }

    pub fn graph(&self) -> &Graph {
        &self.module.graph
    }

    pub fn input_shape(&self) -> [usize; 4] {
        self.module.graph.input_shape
    }

    /// Evaluates the graph. The input must match the traced shape exactly.
    pub fn run(&self, input: &Array4<f32>) -> Result<Array3<f32>> {
        let expected = self.input_shape();
        if input.shape() != expected {
            return Err(Error::ShapeMismatch {
                expected: expected.to_vec(),
                got: input.shape().to_vec(),
            });
        }

        let graph = &self.module.graph;
        let mut values: Vec<Option<Array4<f32>>> = vec![None; graph.nodes.len()];
        for (id, node) in graph.nodes.iter().enumerate() {
            let value = match &node.op {
                Op::Input => input.clone(),
                Op::Conv {
                    weight,
                    bias,
                    stride,
                    padding,
                    silu,
                } => {
                    let x = arg(&values, node, 0)?;
                    let w = self.module.params[*weight].view().into_dimensionality::<Ix4>()?;
                    let b = match bias {
                        Some(b) => {
                            Some(self.module.params[*b].view().into_dimensionality::<Ix1>()?)
                        }
                        None => None,
                    };
                    let mut y = ops::conv2d(x, w, b, *stride, *padding);
                    if *silu {
                        ops::silu_inplace(&mut y);
                    }
                    y
                }
                Op::Add => ops::add(arg(&values, node, 0)?, arg(&values, node, 1)?),
                Op::Concat => {
                    let xs = node
                        .inputs
                        .iter()
                        .map(|&i| fetch(&values, i))
                        .collect::<Result<Vec<_>>>()?;
                    ops::concat_channels(&xs)?
                }
                Op::Slice { start, end } => {
                    ops::slice_channels(arg(&values, node, 0)?, *start, *end)
                }
                Op::MaxPool {
                    kernel,
                    stride,
                    padding,
                } => ops::max_pool2d(arg(&values, node, 0)?, *kernel, *stride, *padding),
                Op::Upsample { scale } => ops::upsample_nearest(arg(&values, node, 0)?, *scale),
                Op::Detect(spec) => {
                    let mut levels = Vec::with_capacity(spec.strides.len());
                    for pair in node.inputs.chunks_exact(2) {
                        levels.push((fetch(&values, pair[0])?, fetch(&values, pair[1])?));
                    }
                    if id != graph.output {
                        return Err(Error::InvalidGraph(format!(
                            "detect node {id} is not the output"
                        )));
                    }
                    return Ok(ops::detect_decode(
                        &levels,
                        &spec.strides,
                        spec.reg_max,
                        spec.num_classes,
                    ));
                }
            };

            if value.shape() != node.shape {
                return Err(Error::ShapeMismatch {
                    expected: node.shape.clone(),
                    got: value.shape().to_vec(),
                });
            }
            values[id] = Some(value);
            for &input in &node.inputs {
                if self.last_use[input] == id {
                    values[input] = None;
                }
            }
        }
        Err(Error::InvalidGraph("graph finished without reaching its output".into()))
    }
}

fn arg<'a>(
    values: &'a [Option<Array4<f32>>],
    node: &Node,
    i: usize,
) -> Result<ArrayView4<'a, f32>> {
    let id = node
        .inputs
        .get(i)
        .ok_or_else(|| Error::InvalidGraph(format!("{:?} is missing input {i}", node.op)))?;
    fetch(values, *id)
}

fn fetch(values: &[Option<Array4<f32>>], id: usize) -> Result<ArrayView4<'_, f32>> {
    values
        .get(id)
        .and_then(|v| v.as_ref())
        .map(|v| v.view())
        .ok_or_else(|| Error::InvalidGraph(format!("value of node {id} is not available")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectionModel, ModelArgs};
    use ndarray::Array;

    fn tiny() -> DetectionModel {
        DetectionModel::seeded(
            ModelArgs {
                num_classes: 2,
                base_channels: 4,
                depth: 1,
                reg_max: 4,
            },
            11,
        )
    }

    #[test]
    fn traced_graph_matches_eager_forward() {
        let model = tiny();
        let exec = Executor::new(model.trace(1, 64).unwrap()).unwrap();
        let x = Array::from_shape_fn((1, 3, 64, 64), |(_, c, y, x)| {
            ((c * 31 + y * 7 + x) % 17) as f32 / 17.0
        });
        let eager = model.forward(&x).unwrap();
        let traced = exec.run(&x).unwrap();
        assert_eq!(eager.dim(), traced.dim());
        for (a, b) in eager.iter().zip(traced.iter()) {
            assert!((a - b).abs() <= 1e-3 * (1.0 + a.abs()), "{a} vs {b}");
        }
    }

    #[test]
    fn rejects_input_of_other_size() {
        let exec = Executor::new(tiny().trace(1, 32).unwrap()).unwrap();
        let x = Array4::<f32>::zeros((1, 3, 64, 64));
        assert!(matches!(exec.run(&x), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn rejects_graph_with_out_of_range_slice() {
        let mut module = tiny().trace(1, 32).unwrap();
        for node in &mut module.graph.nodes {
            if let Op::Slice { end, .. } = &mut node.op {
                *end += 1000;
            }
        }
        assert!(matches!(Executor::new(module), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn exposes_traced_image_size() {
        let exec = Executor::new(tiny().trace(1, 64).unwrap()).unwrap();
        assert_eq!(exec.graph().imgsz(), (64, 64));
    }
}
