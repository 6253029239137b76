//! Loaded detector handle.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::error::{Error, Result};
use crate::export::{ExportOptions, Exporter};
use crate::model::DetectionModel;

/// A detection model together with its class names and the weights file
/// it came from. Exports are written next to that file.
#[derive(Clone, Debug)]
pub struct Yolo {
    model: DetectionModel,
    names: Vec<String>,
    path: PathBuf,
}

impl Yolo {
    /// Reads a checkpoint and builds the model it describes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ckpt = Checkpoint::load(path)?;
        let names = ckpt.names.clone();
        let model = ckpt.into_model().map_err(|e| match e {
            Error::StateDict(reason) | Error::Config(reason) => Error::IncompatibleWeights {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        info!(
            path = %path.display(),
            classes = model.args.num_classes,
            params = model.num_params(),
            "loaded weights"
        );
        Ok(Self {
            model,
            names,
            path: path.to_path_buf(),
        })
    }

    /// Wraps an in-memory model. `path` only decides where exports go.
    pub fn from_model(
        model: DetectionModel,
        names: Vec<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        if names.len() != model.args.num_classes {
            return Err(Error::Config(format!(
                "{} class names for {} classes",
                names.len(),
                model.args.num_classes
            )));
        }
        Ok(Self {
            model,
            names,
            path: path.into(),
        })
    }

    pub fn model(&self) -> &DetectionModel {
        &self.model
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exports the model and returns the artifact path.
    pub fn export(&self, options: &ExportOptions) -> Result<PathBuf> {
        Exporter::new(options.clone()).export(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::default_names;
    use crate::model::ModelArgs;

    fn tiny() -> DetectionModel {
        DetectionModel::seeded(
            ModelArgs {
                num_classes: 2,
                base_channels: 4,
                depth: 1,
                reg_max: 4,
            },
            5,
        )
    }

    #[test]
    fn load_missing_file() {
        let err = Yolo::load("/definitely/not/here/yolov8n.pt").unwrap_err();
        assert!(matches!(err, Error::WeightsNotFound(_)));
    }

    #[test]
    fn load_round_trips_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiny.pt");
        let model = tiny();
        Checkpoint::from_model(&model, default_names(2)).save(&path)?;

        let yolo = Yolo::load(&path)?;
        assert_eq!(yolo.names(), &["class0", "class1"]);
        assert_eq!(yolo.path(), path.as_path());
        assert_eq!(yolo.model().state_dict(), model.state_dict());
        Ok(())
    }

    #[test]
    fn missing_tensor_is_incompatible() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiny.pt");
        let mut ckpt = Checkpoint::from_model(&tiny(), default_names(2));
        let first = ckpt.state_dict.keys().next().cloned().unwrap();
        ckpt.state_dict.remove(&first);
        ckpt.save(&path)?;

        match Yolo::load(&path) {
            Err(Error::IncompatibleWeights { reason, .. }) => assert!(reason.contains(&first)),
            other => panic!("expected IncompatibleWeights, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn from_model_checks_names() {
        assert!(Yolo::from_model(tiny(), vec!["a".into()], "x.pt").is_err());
        assert!(Yolo::from_model(tiny(), default_names(2), "x.pt").is_ok());
    }
}
