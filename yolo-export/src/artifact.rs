//! Exported model artifact: a traced graph, its parameters and metadata
//! for downstream runtimes.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use bytemuck::cast_slice;
use memmap2::MmapOptions;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::{self, DType, TensorEntry};
use crate::runtime::Executor;
use crate::trace::{Graph, TracedModule};

pub const ARTIFACT_MAGIC: &[u8; 8] = b"YOLOTRCE";
pub const ARTIFACT_VERSION: u32 = 1;

/// Descriptive metadata embedded in every artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub description: String,
    pub author: String,
    /// RFC 3339 export timestamp.
    pub date: String,
    pub version: String,
    pub task: String,
    pub format: String,
    pub stride: usize,
    pub batch: usize,
    pub imgsz: [usize; 2],
    pub names: BTreeMap<usize, String>,
    #[serde(default)]
    pub int8: bool,
}

#[derive(Serialize, Deserialize)]
struct ArtifactHeader {
    metadata: ExportMetadata,
    graph: Graph,
    tensors: Vec<TensorEntry>,
}

/// Symmetric per-tensor quantisation to `i8`. Returns the data and the
/// scale that maps it back to `f32`.
fn quantize_tensor(t: &ArrayD<f32>) -> (Vec<i8>, f32) {
    let max = t.iter().fold(0.0_f32, |m, &v| m.max(v.abs()));
    let scale = if max == 0.0 { 1.0 } else { 127.0 / max };
    let data = t.iter().map(|&v| (v * scale).round() as i8).collect();
    (data, 1.0 / scale)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub metadata: ExportMetadata,
    pub module: TracedModule,
}

impl Artifact {
    /// Writes the artifact. Convolution weights are stored as `i8` when
    /// `metadata.int8` is set; everything else stays `f32`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let mut tensors = Vec::with_capacity(self.module.params.len());
        let mut blob = Vec::new();
        for t in &self.module.params {
            let offset = blob.len();
            if self.metadata.int8 && t.ndim() == 4 {
                let (data, scale) = quantize_tensor(t);
                blob.extend_from_slice(cast_slice::<i8, u8>(&data));
                tensors.push(TensorEntry {
                    name: String::new(),
                    shape: t.shape().to_vec(),
                    dtype: DType::I8,
                    scale: Some(scale),
                    offset,
                });
            } else {
                format::append_f32(&mut blob, t.iter().copied());
                tensors.push(TensorEntry {
                    name: String::new(),
                    shape: t.shape().to_vec(),
                    dtype: DType::F32,
                    scale: None,
                    offset,
                });
            }
        }
        let header = serde_json::to_vec(&ArtifactHeader {
            metadata: self.metadata.clone(),
            graph: self.module.graph.clone(),
            tensors,
        })?;
        Ok(format::write(
            path.as_ref(),
            ARTIFACT_MAGIC,
            ARTIFACT_VERSION,
            &header,
            &blob,
        )?)
    }

    /// Memory-maps and decodes an artifact. Quantised tensors come back
    /// dequantised.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |reason: String| Error::InvalidArtifact {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let container = format::parse(&mmap[..], ARTIFACT_MAGIC).map_err(invalid)?;
        if container.version != ARTIFACT_VERSION {
            return Err(invalid(format!(
                "artifact version {} is not supported (expected {ARTIFACT_VERSION})",
                container.version
            )));
        }
        let header: ArtifactHeader = serde_json::from_slice(container.header)
            .map_err(|e| invalid(format!("malformed header: {e}")))?;

        let mut params = Vec::with_capacity(header.tensors.len());
        for entry in &header.tensors {
            let bytes = format::tensor_bytes(container.blob, entry).map_err(invalid)?;
            let data = match entry.dtype {
                DType::F32 => format::read_f32(bytes),
                DType::I8 => {
                    let scale = entry
                        .scale
                        .ok_or_else(|| invalid("quantised tensor without a scale".into()))?;
                    cast_slice::<u8, i8>(bytes)
                        .iter()
                        .map(|&q| q as f32 * scale)
                        .collect()
                }
            };
            let t = ArrayD::from_shape_vec(IxDyn(&entry.shape), data)
                .map_err(|e| invalid(format!("tensor {}: {e}", params.len())))?;
            params.push(t);
        }
        header
            .graph
            .validate(&params)
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            metadata: header.metadata,
            module: TracedModule {
                graph: header.graph,
                params,
            },
        })
    }

    pub fn into_executor(self) -> Result<(ExportMetadata, Executor)> {
        let exec = Executor::new(self.module)?;
        Ok((self.metadata, exec))
    }
}
