//! YOLOv8 detection models and their export to a traced, self-contained
//! artifact.
//!
//! The usual entry point is [`export_model`]; [`Yolo`] and [`Exporter`]
//! give finer control, and [`Executor`] runs an exported artifact.

pub mod artifact;
pub mod backend;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod format;
pub mod logging;
pub mod model;
pub mod ops;
pub mod runtime;
pub mod trace;
pub mod yolo;

pub use artifact::{Artifact, ExportMetadata};
pub use checkpoint::Checkpoint;
pub use config::ExportConfig;
pub use error::{Error, Result};
pub use export::{export_model, ExportFormat, ExportOptions, Exporter};
pub use model::{DetectionModel, ModelArgs, ModelScale};
pub use runtime::Executor;
pub use yolo::Yolo;
