//! Native weights file.
//!
//! A checkpoint stores the model arguments, the class names and every
//! named parameter as little-endian `f32`, using the framing in
//! [`crate::format`].

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::{self, DType, TensorEntry};
use crate::model::{DetectionModel, ModelArgs, StateDict};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"YOLOCKPT";
pub const CHECKPOINT_VERSION: u32 = 1;

/// The 80 COCO class names used by pretrained YOLOv8 detectors.
pub const COCO_NAMES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// COCO names for 80-class models, `class<i>` otherwise.
pub fn default_names(num_classes: usize) -> Vec<String> {
    if num_classes == COCO_NAMES.len() {
        COCO_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        (0..num_classes).map(|i| format!("class{i}")).collect()
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointHeader {
    args: ModelArgs,
    names: Vec<String>,
    tensors: Vec<TensorEntry>,
}

/// Contents of a weights file.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub args: ModelArgs,
    pub names: Vec<String>,
    pub state_dict: StateDict,
}

impl Checkpoint {
    pub fn from_model(model: &DetectionModel, names: Vec<String>) -> Self {
        Self {
            args: model.args.clone(),
            names,
            state_dict: model.state_dict(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        let mut tensors = Vec::with_capacity(self.state_dict.len());
        let mut blob = Vec::new();
        for (name, t) in &self.state_dict {
            tensors.push(TensorEntry {
                name: name.clone(),
                shape: t.shape().to_vec(),
                dtype: DType::F32,
                scale: None,
                offset: blob.len(),
            });
            format::append_f32(&mut blob, t.iter().copied());
        }
        let header = serde_json::to_vec(&CheckpointHeader {
            args: self.args.clone(),
            names: self.names.clone(),
            tensors,
        })?;
        Ok(format::write(
            path.as_ref(),
            CHECKPOINT_MAGIC,
            CHECKPOINT_VERSION,
            &header,
            &blob,
        )?)
    }

    /// Reads a weights file. A missing file is `WeightsNotFound`; anything
    /// unreadable as a checkpoint is `IncompatibleWeights`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::WeightsNotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path)?;
        let incompatible = |reason: String| Error::IncompatibleWeights {
            path: path.to_path_buf(),
            reason,
        };

        let container = format::parse(&bytes, CHECKPOINT_MAGIC).map_err(incompatible)?;
        if container.version != CHECKPOINT_VERSION {
            return Err(incompatible(format!(
                "checkpoint version {} is not supported (expected {CHECKPOINT_VERSION})",
                container.version
            )));
        }
        let header: CheckpointHeader = serde_json::from_slice(container.header)
            .map_err(|e| incompatible(format!("malformed header: {e}")))?;
        header.args.validate().map_err(|e| incompatible(e.to_string()))?;
        if header.names.len() != header.args.num_classes {
            return Err(incompatible(format!(
                "{} class names for {} classes",
                header.names.len(),
                header.args.num_classes
            )));
        }

        let mut state_dict = StateDict::new();
        for entry in &header.tensors {
            if entry.dtype != DType::F32 {
                return Err(incompatible(format!("tensor '{}' is not f32", entry.name)));
            }
            let data = format::tensor_bytes(container.blob, entry).map_err(incompatible)?;
            let t = ArrayD::from_shape_vec(IxDyn(&entry.shape), format::read_f32(data))
                .map_err(|e| incompatible(format!("tensor '{}': {e}", entry.name)))?;
            state_dict.insert(entry.name.clone(), t);
        }
        tracing::debug!(path = %path.display(), tensors = state_dict.len(), "checkpoint read");

        Ok(Self {
            args: header.args,
            names: header.names,
            state_dict,
        })
    }

    /// Builds the model described by this checkpoint.
    pub fn into_model(self) -> Result<DetectionModel> {
        let mut model = DetectionModel::seeded(self.args, 0);
        model.load_state_dict(&self.state_dict)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn tiny_args() -> ModelArgs {
        ModelArgs {
            num_classes: 2,
            base_channels: 4,
            depth: 1,
            reg_max: 4,
        }
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let model = DetectionModel::seeded(tiny_args(), 3);
        let ckpt = Checkpoint::from_model(&model, default_names(2));
        let file = NamedTempFile::new()?;
        ckpt.save(file.path())?;
        let loaded = Checkpoint::load(file.path())?;
        assert_eq!(loaded, ckpt);
        assert_eq!(loaded.into_model()?.state_dict(), model.state_dict());
        Ok(())
    }

    #[test]
    fn default_names_are_coco_for_80_classes() {
        let names = default_names(80);
        assert_eq!(names[0], "person");
        assert_eq!(names[79], "toothbrush");
        assert_eq!(default_names(2), vec!["class0", "class1"]);
    }

    #[test]
    fn truncated_file_is_incompatible() -> Result<()> {
        let model = DetectionModel::seeded(tiny_args(), 3);
        let file = NamedTempFile::new()?;
        Checkpoint::from_model(&model, default_names(2)).save(file.path())?;
        let bytes = std::fs::read(file.path())?;
        std::fs::write(file.path(), &bytes[..bytes.len() - 10])?;
        assert!(matches!(
            Checkpoint::load(file.path()),
            Err(Error::IncompatibleWeights { .. })
        ));
        Ok(())
    }

    #[test]
    fn newer_version_is_incompatible() -> Result<()> {
        let model = DetectionModel::seeded(tiny_args(), 3);
        let file = NamedTempFile::new()?;
        Checkpoint::from_model(&model, default_names(2)).save(file.path())?;
        let mut bytes = std::fs::read(file.path())?;
        bytes[8..12].copy_from_slice(&2u32.to_le_bytes());
        std::fs::write(file.path(), &bytes)?;
        let err = Checkpoint::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("version 2"));
        Ok(())
    }
    #[test]
    fn overflowing_tensor_shape_is_incompatible() -> Result<()> {
        let file = NamedTempFile::new()?;
        let header = serde_json::to_vec(&CheckpointHeader {
            args: tiny_args(),
            names: default_names(2),
            tensors: vec![TensorEntry {
                name: "model.0.conv.weight".into(),
                shape: vec![1 << 40, 1 << 40],
                dtype: DType::F32,
                scale: None,
                offset: 0,
            }],
        })?;
        format::write(file.path(), CHECKPOINT_MAGIC, CHECKPOINT_VERSION, &header, &[0u8; 16])?;
        match Checkpoint::load(file.path()) {
            Err(Error::IncompatibleWeights { reason, .. }) => assert!(reason.contains("oversized")),
            other => panic!("expected IncompatibleWeights, got {other:?}"),
        }
        Ok(())
    }
}
