// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_inference::{decoder::Layout, stage::StageParams};
use std::path::PathBuf;

/// Output tensor layout of the model.
///
/// Selects which of the two trailing output dimensions holds the proposals.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum LayoutSetting {
    /// `[.., object_size, proposals]` as exported by YOLOv8
    ProposalsLast,
    /// `[.., proposals, object_size]`
    ProposalsFirst,
}

impl From<LayoutSetting> for Layout {
    fn from(setting: LayoutSetting) -> Self {
        match setting {
            LayoutSetting::ProposalsLast => Layout::ProposalsLast,
            LayoutSetting::ProposalsFirst => Layout::ProposalsFirst,
        }
    }
}

/// Command-line arguments for the EdgeFirst Inference Stage.
///
/// Runs a model through the inference stage and prints the decoded
/// detections of each frame as one JSON line. Arguments can be specified via
/// command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-inference --model yolov8n.json --input frame.bin --nms-iou 0.45
///
/// # Via environment variables
/// export MODEL=yolov8n.json
/// export REQUEST_POOL_SIZE=4
/// edgefirst-inference
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Model descriptor path
    #[arg(short, long, env = "MODEL")]
    pub model: PathBuf,

    /// Target device for inference
    #[arg(short, long, env = "DEVICE", default_value = "CPU")]
    pub device: String,

    /// Comma separated KEY=VALUE engine configuration
    #[arg(long, env = "CONFIG", default_value = "")]
    pub config: String,

    /// Batch size, applied when greater than 1
    #[arg(long, env = "BATCH_SIZE", default_value = "1")]
    pub batch_size: usize,

    /// Number of reusable inference requests
    #[arg(long, env = "REQUEST_POOL_SIZE", default_value = "16")]
    pub request_pool_size: usize,

    /// Raw input tensor file, zero-filled input when omitted
    #[arg(short, long, env = "INPUT")]
    pub input: Option<PathBuf>,

    /// Feed input through shared memory buffers instead of system memory
    #[arg(long, env = "SHARED")]
    pub shared: bool,

    /// Number of frames to run
    #[arg(short = 'n', long, env = "ITERATIONS", default_value = "1")]
    pub iterations: usize,

    /// Detection confidence threshold
    #[arg(short, long, env = "THRESHOLD", default_value = "0.5")]
    pub threshold: f32,

    /// Labels file with one class name per line
    #[arg(long, env = "LABELS")]
    pub labels: Option<PathBuf>,

    /// Output tensor layout
    #[arg(long, env = "LAYOUT", default_value = "proposals-last", value_enum)]
    pub layout: LayoutSetting,

    /// Scale applied to detected boxes around their centre
    #[arg(long, env = "ROI_SCALE", default_value = "1.0")]
    pub roi_scale: f32,

    /// Apply non-max suppression with this IoU threshold
    #[arg(long, env = "NMS_IOU")]
    pub nms_iou: Option<f32>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl From<&Args> for StageParams {
    fn from(args: &Args) -> Self {
        Self {
            model: args.model.clone(),
            device: args.device.clone(),
            config: args.config.clone(),
            batch_size: args.batch_size,
            request_pool_size: args.request_pool_size,
        }
    }
}
