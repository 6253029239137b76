//! Object detection on exported YOLOv8 artifacts, with a C ABI for
//! embedding in other applications.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use ndarray::Axis;
use tracing::{debug, info};
use yolo_export::{Artifact, ExportMetadata, Executor};

pub mod draw;
pub mod error;
pub mod ffi;
pub mod postprocess;
pub mod preprocess;

pub use error::{Error, Result};
pub use ffi::*;
pub use postprocess::{Detection, PostprocessConfig};

/// JPEG quality used for annotated frames.
pub const JPEG_QUALITY: u8 = 100;

/// A loaded artifact ready to run on single frames.
pub struct Detector {
    executor: Executor,
    metadata: ExportMetadata,
    config: PostprocessConfig,
}

impl Detector {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (metadata, executor) = Artifact::load(path)?.into_executor()?;
        let shape = executor.input_shape();
        if shape[0] != 1 || shape[1] != 3 {
            return Err(Error::UnsupportedInput(shape));
        }
        info!(
            path = %path.display(),
            imgsz = ?metadata.imgsz,
            classes = metadata.names.len(),
            "loaded model"
        );
        Ok(Self {
            executor,
            metadata,
            config: PostprocessConfig::default(),
        })
    }

    pub fn with_config(mut self, config: PostprocessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &PostprocessConfig {
        &self.config
    }

    /// Network input `(width, height)`.
    pub fn input_size(&self) -> (u32, u32) {
        let (h, w) = self.executor.graph().imgsz();
        (w as u32, h as u32)
    }

    /// Runs the model on `img` and returns boxes in `img` coordinates.
    pub fn detect(&self, img: &RgbImage) -> Result<Vec<Detection>> {
        let (iw, ih) = self.input_size();
        let input = preprocess::to_tensor(&preprocess::resize(img, iw, ih));
        let output = self.executor.run(&input)?;
        if output.shape()[0] != 1 || output.shape()[1] < 5 {
            return Err(Error::UnexpectedOutput(output.shape().to_vec()));
        }

        let (fw, fh) = img.dimensions();
        let scale = (fw as f32 / iw as f32, fh as f32 / ih as f32);
        let detections = postprocess::decode(
            output.index_axis(Axis(0), 0),
            &self.metadata.names,
            &self.config,
            scale,
            (fw, fh),
        );
        debug!(count = detections.len(), "detect");
        Ok(detections)
    }

    /// Reads `frame_path`, draws every detection and writes the result to
    /// `output_path` as JPEG. Returns the number of detections.
    pub fn process_frame<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        frame_path: P,
        output_path: Q,
    ) -> Result<usize> {
        let mut frame = preprocess::imread(frame_path)?;
        let detections = self.detect(&frame)?;
        draw::draw_detections(&mut frame, &detections);
        save_jpeg(output_path.as_ref(), &frame)?;
        Ok(detections.len())
    }
}

/// Writes `img` as a JPEG regardless of the file extension.
pub fn save_jpeg(path: &Path, img: &RgbImage) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(file, JPEG_QUALITY).encode_image(img)?;
    Ok(())
}
