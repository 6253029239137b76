//! Write a randomly initialised YOLOv8 checkpoint.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use yolo_export::checkpoint::default_names;
use yolo_export::{logging, Checkpoint, DetectionModel, ModelArgs, ModelScale};

#[derive(Parser)]
struct Args {
    /// Output weights file
    #[arg(long, default_value = "yolov8n.pt")]
    out: PathBuf,

    /// Model scale: n, s, m, l or x
    #[arg(long, default_value = "n")]
    scale: ModelScale,

    /// Number of classes
    #[arg(long, default_value_t = 80)]
    classes: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();
    let model_args = ModelArgs::from_scale(args.scale, args.classes);
    model_args.validate()?;
    let model = DetectionModel::seeded(model_args, args.seed);
    let bytes = Checkpoint::from_model(&model, default_names(args.classes)).save(&args.out)?;
    info!(params = model.num_params(), bytes, "initialised weights");
    println!("Saved weights to {:?}", args.out);
    Ok(())
}
