// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_inference::{
    buffer::{MemfdAllocator, SharedBuffer},
    decoder::{Decoder, DecoderConfig},
    engine::replay::ReplayEngine,
    frame::{Frame, Tensor},
    memory::{AccessMode, FrameInfo, MemoryDomain},
    nms,
    stage::{InferenceStage, StageParams},
};
use serde_json::json;
use std::{error::Error, fs, sync::Arc, time::Instant};
use tracing::{debug, error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, Layer};

fn init_logging(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    if args.tracy {
        tracy_client::Client::start();
    }

    let stdout = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(level);
    let journald = if args.journald {
        tracing_journald::layer().ok().map(|l| l.with_filter(level))
    } else {
        None
    };
    let tracy = args.tracy.then(tracing_tracy::TracyLayer::default);
    let console = args.tokio_console.then(console_subscriber::spawn);

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(stdout)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

/// Reads the input tensors, or zeros when no input file is given.
fn input_tensors(args: &Args, info: &FrameInfo) -> Result<Vec<Tensor>, Box<dyn Error>> {
    let total: usize = info.tensors.iter().map(|t| t.nbytes()).sum();
    let data = match &args.input {
        Some(path) => fs::read(path)?,
        None => vec![0; total],
    };
    if data.len() < total {
        return Err(format!(
            "{} holds {} bytes, model input {} needs {total}",
            args.input.as_ref().map_or("input".into(), |p| p.display().to_string()),
            data.len(),
            info
        )
        .into());
    }

    let mut offset = 0;
    let mut tensors = Vec::with_capacity(info.tensors.len());
    for tensor in &info.tensors {
        let bytes = &data[offset..offset + tensor.nbytes()];
        offset += tensor.nbytes();
        tensors.push(if args.shared {
            let buffer = SharedBuffer::allocate(&MemfdAllocator, bytes.len())?;
            let mut region = buffer.mmap(AccessMode::Write)?;
            region.as_slice_mut().ok_or("shared input mapped read-only")?[..bytes.len()]
                .copy_from_slice(bytes);
            drop(region);
            Tensor::from_shared(tensor.clone(), Arc::new(buffer))?
        } else {
            Tensor::from_host(tensor.clone(), bytes.to_vec())?
        });
    }
    Ok(tensors)
}

fn read_labels(args: &Args) -> Result<Vec<String>, Box<dyn Error>> {
    let Some(path) = &args.labels else {
        return Ok(Vec::new());
    };
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(&args)?;
    info!("EdgeFirst Inference Stage");

    let engine = Arc::new(ReplayEngine::new());
    let mut stage = InferenceStage::configure(engine, StageParams::from(&args), None)?;

    let domain = if args.shared {
        MemoryDomain::SharedBuffer
    } else {
        MemoryDomain::System
    };
    let input = stage.negotiated_input().in_domain(domain);
    stage.set_input_info(input.clone())?;
    stage.init()?;
    let stage = Arc::new(stage);

    let tensors = input_tensors(&args, &input)?;
    let labels = read_labels(&args)?;

    let (tx, rx) = kanal::bounded(stage.params().pool_size());
    let producer = {
        let stage = Arc::clone(&stage);
        let iterations = args.iterations;
        tokio::task::spawn_blocking(move || -> Result<(), edgefirst_inference::Error> {
            for index in 0..iterations {
                let frame = Arc::new(Frame::new(input.clone(), tensors.clone())?);
                let output = stage.process(frame)?;
                if tx.send((index, output, Instant::now())).is_err() {
                    break;
                }
            }
            Ok(())
        })
    };

    let rx = rx.to_async();
    let mut decoder: Option<Arc<Decoder>> = None;
    while let Ok((index, output, started)) = rx.recv().await {
        let active = match decoder.clone() {
            Some(active) => active,
            None => {
                let model = output
                    .model_info()
                    .ok_or("inference output carries no model info")?;
                let config = DecoderConfig::from_model_info(&model, args.layout.into())?
                    .with_labels(labels.clone())
                    .with_threshold(args.threshold)
                    .with_roi_scale(args.roi_scale);
                debug!(?config, "decoder configured");
                let active = Arc::new(Decoder::new(config));
                decoder = Some(Arc::clone(&active));
                active
            }
        };

        let table = match tokio::task::spawn_blocking(move || active.process(&output)).await? {
            Ok(table) => table,
            Err(e) => {
                error!(index, "decoding failed: {e}");
                continue;
            }
        };
        let table = match args.nms_iou {
            Some(iou) => nms::suppress_table(&table, iou),
            None => table,
        };

        let detections: usize = table.iter().map(Vec::len).sum();
        debug!(index, detections, elapsed = ?started.elapsed(), "frame decoded");
        println!("{}", json!({ "frame": index, "detections": table }));
    }

    producer.await??;
    stage.shutdown();
    if let Some(metrics) = stage.metrics() {
        info!(?metrics, "request pool");
    }
    Ok(())
}
