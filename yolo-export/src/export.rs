//! Model export.
//!
//! ```no_run
//! use yolo_export::export_model;
//!
//! let artifact = export_model("yolov8n.pt", "torchscript", 640)?;
//! println!("saved {}", artifact.display());
//! # Ok::<(), yolo_export::Error>(())
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, ExportMetadata};
use crate::error::{Error, Result};
use crate::model::DetectionModel;
use crate::runtime::Executor;
use crate::trace::TracedModule;
use crate::yolo::Yolo;

/// Export targets known to the YOLOv8 tooling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    TorchScript,
    Onnx,
    OpenVino,
    Engine,
    CoreMl,
    SavedModel,
    Pb,
    TfLite,
    EdgeTpu,
    TfJs,
    Paddle,
    Ncnn,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 12] = [
        ExportFormat::TorchScript,
        ExportFormat::Onnx,
        ExportFormat::OpenVino,
        ExportFormat::Engine,
        ExportFormat::CoreMl,
        ExportFormat::SavedModel,
        ExportFormat::Pb,
        ExportFormat::TfLite,
        ExportFormat::EdgeTpu,
        ExportFormat::TfJs,
        ExportFormat::Paddle,
        ExportFormat::Ncnn,
    ];

    /// The identifier accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            ExportFormat::TorchScript => "torchscript",
            ExportFormat::Onnx => "onnx",
            ExportFormat::OpenVino => "openvino",
            ExportFormat::Engine => "engine",
            ExportFormat::CoreMl => "coreml",
            ExportFormat::SavedModel => "saved_model",
            ExportFormat::Pb => "pb",
            ExportFormat::TfLite => "tflite",
            ExportFormat::EdgeTpu => "edgetpu",
            ExportFormat::TfJs => "tfjs",
            ExportFormat::Paddle => "paddle",
            ExportFormat::Ncnn => "ncnn",
        }
    }

    /// File extension, or directory suffix for directory-style formats.
    pub fn suffix(self) -> &'static str {
        match self {
            ExportFormat::TorchScript => "torchscript",
            ExportFormat::Onnx => "onnx",
            ExportFormat::OpenVino => "_openvino_model",
            ExportFormat::Engine => "engine",
            ExportFormat::CoreMl => "mlpackage",
            ExportFormat::SavedModel => "_saved_model",
            ExportFormat::Pb => "pb",
            ExportFormat::TfLite => "tflite",
            ExportFormat::EdgeTpu => "_edgetpu.tflite",
            ExportFormat::TfJs => "_web_model",
            ExportFormat::Paddle => "_paddle_model",
            ExportFormat::Ncnn => "_ncnn_model",
        }
    }

    pub fn is_supported(self) -> bool {
        matches!(self, ExportFormat::TorchScript)
    }

    /// Where the artifact for `weights` goes: next to it, same stem.
    pub fn artifact_path(self, weights: &Path) -> PathBuf {
        let suffix = self.suffix();
        if suffix.starts_with('_') {
            let stem = weights
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            weights.with_file_name(format!("{stem}{suffix}"))
        } else {
            weights.with_extension(suffix)
        }
    }

    fn supported_list() -> String {
        Self::ALL
            .iter()
            .filter(|f| f.is_supported())
            .map(|f| f.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    /// Accepts format names case-insensitively, plus a few aliases.
    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase();
        let key = match key.as_str() {
            "tensorrt" | "trt" => "engine",
            "mlmodel" => "coreml",
            "tf" => "saved_model",
            other => other,
        };
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name() == key)
            .ok_or_else(|| Error::InvalidFormat {
                format: s.to_string(),
                valid: Self::ALL.iter().map(|f| f.name()).collect::<Vec<_>>().join(", "),
            })
    }
}

/// Parameters of one export run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Square input resolution used when tracing.
    pub imgsz: usize,
    pub batch: usize,
    /// Store convolution weights as `i8`.
    pub int8: bool,
    /// Run the traced graph once and compare it with the eager model, then
    /// read the written file back. An `i8` file only has to keep the graph
    /// and produce finite output of the right shape; its dequantised
    /// numerics are not compared with the eager model.
    pub verify: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::TorchScript,
            imgsz: 640,
            batch: 1,
            int8: false,
            verify: true,
        }
    }
}

impl ExportOptions {
    pub fn new(format: ExportFormat, imgsz: usize) -> Self {
        Self {
            format,
            imgsz,
            ..Default::default()
        }
    }
}

/// Rounds `imgsz` up to a multiple of `stride`. Zero is rejected.
pub fn check_imgsz(imgsz: usize, stride: usize) -> Result<usize> {
    if imgsz == 0 {
        return Err(Error::InvalidImageSize(imgsz));
    }
    let rounded = imgsz.div_ceil(stride) * stride;
    if rounded != imgsz {
        warn!(imgsz, rounded, stride, "image size is not a multiple of the max stride, updating");
    }
    Ok(rounded)
}

pub struct Exporter {
    options: ExportOptions,
}

impl Exporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Exports `yolo` next to its weights file and returns the artifact path.
    pub fn export(&self, yolo: &Yolo) -> Result<PathBuf> {
        let opts = &self.options;
        if !opts.format.is_supported() {
            return Err(Error::UnsupportedFormat {
                format: opts.format.name().to_string(),
                supported: ExportFormat::supported_list(),
            });
        }
        if opts.batch == 0 {
            return Err(Error::Config("batch must be positive".into()));
        }
        let model = yolo.model();
        let imgsz = check_imgsz(opts.imgsz, model.stride())?;
        let path = opts.format.artifact_path(yolo.path());

        let start = Instant::now();
        info!(
            format = %opts.format,
            weights = %yolo.path().display(),
            imgsz,
            batch = opts.batch,
            int8 = opts.int8,
            params = model.num_params(),
            "starting export"
        );

        let module = model.trace(opts.batch, imgsz)?;
        debug!(nodes = module.graph.nodes.len(), output = ?module.graph.output_shape(), "traced");
        if opts.verify {
            verify(model, &module)?;
        }

        let artifact = Artifact {
            metadata: self.metadata(yolo, imgsz),
            module,
        };
        let suffix = opts.format.suffix().trim_start_matches('_');
        let tmp = path.with_extension(format!("{suffix}.partial"));
        let written = artifact.save(&tmp).and_then(|n| {
            if opts.verify {
                check_written(&tmp, &artifact.module, opts.int8)?;
            }
            std::fs::rename(&tmp, &path)?;
            Ok(n)
        });
        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        };

        info!(
            elapsed_s = start.elapsed().as_secs_f64(),
            bytes = written,
            path = %path.display(),
            "export success"
        );
        Ok(path)
    }

    fn metadata(&self, yolo: &Yolo, imgsz: usize) -> ExportMetadata {
        let stem = yolo
            .path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        ExportMetadata {
            description: format!("YOLOv8 detection model exported from {stem}"),
            author: env!("CARGO_PKG_NAME").to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            task: "detect".to_string(),
            format: self.options.format.name().to_string(),
            stride: yolo.model().stride(),
            batch: self.options.batch,
            imgsz: [imgsz, imgsz],
            names: yolo.names().iter().cloned().enumerate().collect(),
            int8: self.options.int8,
        }
    }
}

/// Dry run: the traced graph must reproduce the eager forward pass.
fn verify(model: &DetectionModel, module: &TracedModule) -> Result<()> {
    let sample = sample_input(module.graph.input_shape);
    let expected = model.forward(&sample)?;
    let got = Executor::new(module.clone())?.run(&sample)?;
    if expected.shape() != got.shape() {
        return Err(Error::VerificationFailed(format!(
            "output shape {:?} differs from eager {:?}",
            got.shape(),
            expected.shape()
        )));
    }
    if got.iter().any(|v| !v.is_finite()) {
        return Err(Error::VerificationFailed("traced output is not finite".into()));
    }
    let worst = expected
        .iter()
        .zip(got.iter())
        .map(|(a, b)| (a - b).abs() / (1.0 + a.abs()))
        .fold(0.0_f32, f32::max);
    if worst > 1e-3 {
        return Err(Error::VerificationFailed(format!(
            "traced output deviates from eager by {worst:e}"
        )));
    }
    debug!(max_rel_err = worst, "verified traced graph");
    Ok(())
}

fn sample_input([n, c, h, w]: [usize; 4]) -> Array4<f32> {
    let mut rng = StdRng::seed_from_u64(0);
    Array4::from_shape_fn((n, c, h, w), |_| rng.gen_range(0.0..1.0))
}

/// Reads a freshly written artifact back. Full precision files must decode
/// to `module` exactly.
fn check_written(path: &Path, module: &TracedModule, int8: bool) -> Result<()> {
    let loaded = Artifact::load(path)?;
    if loaded.module.graph != module.graph {
        return Err(Error::VerificationFailed(
            "written graph differs from the traced one".into(),
        ));
    }
    if !int8 {
        if loaded.module.params != module.params {
            return Err(Error::VerificationFailed(
                "written parameters differ from the traced ones".into(),
            ));
        }
        return Ok(());
    }
    let (_, exec) = loaded.into_executor()?;
    let out = exec.run(&sample_input(module.graph.input_shape))?;
    if out.shape() != module.graph.output_shape() {
        return Err(Error::VerificationFailed(format!(
            "quantised output shape {:?}, expected {:?}",
            out.shape(),
            module.graph.output_shape()
        )));
    }
    if out.iter().any(|v| !v.is_finite()) {
        return Err(Error::VerificationFailed("quantised output is not finite".into()));
    }
    debug!(path = %path.display(), "verified written artifact");
    Ok(())
}

/// Loads `weights_path` and exports it to `format` at `image_size`.
///
/// The artifact is written next to the weights with the format's suffix,
/// e.g. `yolov8n.pt` becomes `yolov8n.torchscript`.
pub fn export_model<P: AsRef<Path>>(
    weights_path: P,
    format: &str,
    image_size: usize,
) -> Result<PathBuf> {
    let format: ExportFormat = format.parse()?;
    let yolo = Yolo::load(weights_path)?;
    yolo.export(&ExportOptions::new(format, image_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("torchscript".parse::<ExportFormat>().unwrap(), ExportFormat::TorchScript);
        assert_eq!("TorchScript".parse::<ExportFormat>().unwrap(), ExportFormat::TorchScript);
        assert_eq!("trt".parse::<ExportFormat>().unwrap(), ExportFormat::Engine);
        assert!(matches!(
            "torch-script".parse::<ExportFormat>(),
            Err(Error::InvalidFormat { .. })
        ));
    }

    #[test]
    fn only_torchscript_is_supported() {
        let supported: Vec<_> = ExportFormat::ALL.iter().filter(|f| f.is_supported()).collect();
        assert_eq!(supported, vec![&ExportFormat::TorchScript]);
    }

    #[test]
    fn artifact_path_replaces_extension() {
        let p = Path::new("/models/yolov8n.pt");
        assert_eq!(
            ExportFormat::TorchScript.artifact_path(p),
            PathBuf::from("/models/yolov8n.torchscript")
        );
        assert_eq!(
            ExportFormat::OpenVino.artifact_path(p),
            PathBuf::from("/models/yolov8n_openvino_model")
        );
    }

    #[test]
    fn imgsz_rounds_up_to_stride() {
        assert_eq!(check_imgsz(640, 32).unwrap(), 640);
        assert_eq!(check_imgsz(641, 32).unwrap(), 672);
        assert_eq!(check_imgsz(1, 32).unwrap(), 32);
        assert!(matches!(check_imgsz(0, 32), Err(Error::InvalidImageSize(0))));
    }
    fn tiny_yolo() -> Yolo {
        let model = DetectionModel::seeded(
            crate::model::ModelArgs {
                num_classes: 2,
                base_channels: 4,
                depth: 1,
                reg_max: 4,
            },
            9,
        );
        Yolo::from_model(model, crate::checkpoint::default_names(2), "tiny.pt").unwrap()
    }

    #[test]
    fn written_artifact_must_match_traced_module() -> Result<()> {
        let yolo = tiny_yolo();
        let module = yolo.model().trace(1, 32)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiny.torchscript");
        let exporter = Exporter::new(ExportOptions::new(ExportFormat::TorchScript, 32));
        Artifact {
            metadata: exporter.metadata(&yolo, 32),
            module: module.clone(),
        }
        .save(&path)?;
        check_written(&path, &module, false)?;

        let mut other = module.clone();
        other.params[0].mapv_inplace(|v| v + 1.0);
        assert!(matches!(
            check_written(&path, &other, false),
            Err(Error::VerificationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn quantised_artifact_still_runs() -> Result<()> {
        let yolo = tiny_yolo();
        let module = yolo.model().trace(1, 32)?;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiny.torchscript");
        let exporter = Exporter::new(ExportOptions {
            int8: true,
            ..ExportOptions::new(ExportFormat::TorchScript, 32)
        });
        Artifact {
            metadata: exporter.metadata(&yolo, 32),
            module: module.clone(),
        }
        .save(&path)?;
        // dequantised weights differ, so only the full precision check fails
        assert!(check_written(&path, &module, false).is_err());
        check_written(&path, &module, true)
    }
}
