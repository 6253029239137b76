//! Export configuration files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::export::{ExportFormat, ExportOptions};

fn default_weights() -> PathBuf {
    PathBuf::from("yolov8n.pt")
}

fn default_format() -> String {
    "torchscript".to_string()
}

fn default_imgsz() -> usize {
    640
}

fn default_batch() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Settings for one export run, as read from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Path to the weights file.
    #[serde(default = "default_weights")]
    pub weights: PathBuf,

    /// Target format name.
    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default = "default_imgsz")]
    pub imgsz: usize,

    #[serde(default = "default_batch")]
    pub batch: usize,

    #[serde(default)]
    pub int8: bool,

    #[serde(default = "default_true")]
    pub verify: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            format: default_format(),
            imgsz: default_imgsz(),
            batch: default_batch(),
            int8: false,
            verify: true,
        }
    }
}

impl ExportConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Picks the parser from the file extension; anything but `.json` is YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json(path),
            _ => Self::from_yaml(path),
        }
    }

    pub fn to_options(&self) -> Result<ExportOptions> {
        let format: ExportFormat = self.format.parse()?;
        if self.imgsz == 0 {
            return Err(Error::InvalidImageSize(0));
        }
        if self.batch == 0 {
            return Err(Error::Config("batch must be positive".into()));
        }
        Ok(ExportOptions {
            format,
            imgsz: self.imgsz,
            batch: self.batch,
            int8: self.int8,
            verify: self.verify,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_reference_export() {
        let cfg = ExportConfig::default();
        assert_eq!(cfg.weights, PathBuf::from("yolov8n.pt"));
        let opts = cfg.to_options().unwrap();
        assert_eq!(opts, ExportOptions::default());
        assert_eq!(opts.format, ExportFormat::TorchScript);
        assert_eq!(opts.imgsz, 640);
    }

    #[test]
    fn partial_yaml_fills_defaults() -> Result<()> {
        let mut file = NamedTempFile::with_suffix(".yaml")?;
        writeln!(file, "weights: models/best.pt\nimgsz: 320\nint8: true")?;
        let cfg = ExportConfig::from_file(file.path())?;
        assert_eq!(cfg.weights, PathBuf::from("models/best.pt"));
        assert_eq!(cfg.imgsz, 320);
        assert!(cfg.int8);
        assert_eq!(cfg.format, "torchscript");
        assert!(cfg.verify);
        Ok(())
    }

    #[test]
    fn json_config() -> Result<()> {
        let mut file = NamedTempFile::with_suffix(".json")?;
        write!(file, r#"{{"format": "onnx", "batch": 4}}"#)?;
        let cfg = ExportConfig::from_file(file.path())?;
        assert_eq!(cfg.batch, 4);
        assert_eq!(cfg.to_options()?.format, ExportFormat::Onnx);
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_format = ExportConfig {
            format: "pt".into(),
            ..Default::default()
        };
        assert!(matches!(bad_format.to_options(), Err(Error::InvalidFormat { .. })));

        let zero = ExportConfig {
            imgsz: 0,
            ..Default::default()
        };
        assert!(matches!(zero.to_options(), Err(Error::InvalidImageSize(0))));
    }
}
