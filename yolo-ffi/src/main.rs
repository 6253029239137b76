use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use yolo_ffi::{Detector, PostprocessConfig};

/// Detect objects in an image and save an annotated JPEG
#[derive(Parser)]
struct Args {
    /// Exported model artifact
    #[arg(long, default_value = "yolov8n.torchscript")]
    model: PathBuf,

    /// Input frame
    #[arg(long)]
    input: PathBuf,

    /// Annotated output (always JPEG)
    #[arg(long, default_value = "output.jpg")]
    output: PathBuf,

    #[arg(long, default_value_t = 0.25)]
    conf: f32,

    #[arg(long, default_value_t = 0.7)]
    iou: f32,

    #[arg(long, default_value_t = 300)]
    max_det: usize,
}

fn main() -> Result<()> {
    yolo_export::logging::init();
    let args = Args::parse();
    let detector = Detector::load(&args.model)?.with_config(PostprocessConfig {
        conf_threshold: args.conf,
        iou_threshold: args.iou,
        max_det: args.max_det,
    });

    let frame = yolo_ffi::preprocess::imread(&args.input)?;
    let detections = detector.detect(&frame)?;
    for d in &detections {
        println!(
            "{:<16} {:.2}  [{:.0}, {:.0}, {:.0}, {:.0}]",
            d.label, d.confidence, d.bbox[0], d.bbox[1], d.bbox[2], d.bbox[3]
        );
    }
    let mut frame = frame;
    yolo_ffi::draw::draw_detections(&mut frame, &detections);
    yolo_ffi::save_jpeg(&args.output, &frame)?;
    println!("Saved {} detections to {:?}", detections.len(), args.output);
    Ok(())
}
