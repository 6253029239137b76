//! Export a YOLOv8 weights file.
//!
//! With no arguments this exports `yolov8n.pt` to TorchScript at 640x640.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use yolo_export::{logging, ExportConfig, Yolo};

#[derive(Parser)]
#[command(about = "Export YOLOv8 weights to a deployable format")]
struct Args {
    /// YAML or JSON file with export settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Weights file to export
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Target format
    #[arg(long)]
    format: Option<String>,

    /// Square input size
    #[arg(long)]
    imgsz: Option<usize>,

    #[arg(long)]
    batch: Option<usize>,

    /// Quantise convolution weights to int8
    #[arg(long)]
    int8: bool,

    /// Skip comparing the traced graph against the eager model
    #[arg(long)]
    no_verify: bool,
}

impl Args {
    /// Config file (or defaults) with command line overrides applied.
    fn resolve(self) -> Result<ExportConfig> {
        let mut cfg = match &self.config {
            Some(path) => ExportConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => ExportConfig::default(),
        };
        if let Some(w) = self.weights {
            cfg.weights = w;
        }
        if let Some(f) = self.format {
            cfg.format = f;
        }
        if let Some(s) = self.imgsz {
            cfg.imgsz = s;
        }
        if let Some(b) = self.batch {
            cfg.batch = b;
        }
        cfg.int8 |= self.int8;
        cfg.verify &= !self.no_verify;
        Ok(cfg)
    }
}

/// Application that loads weights and writes the exported artifact.
pub struct ExportApp {
    config: ExportConfig,
}

impl ExportApp {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    pub fn run(&self) -> Result<PathBuf> {
        let options = self.config.to_options()?;
        let yolo = Yolo::load(&self.config.weights)?;
        Ok(yolo.export(&options)?)
    }
}

fn main() -> Result<()> {
    logging::init();
    let config = Args::parse().resolve()?;
    let path = ExportApp::new(config).run()?;
    println!("{}", path.display());
    Ok(())
}
