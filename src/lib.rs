// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Inference Stage Library
//!
//! This library provides a hardware-accelerated inference stage for video
//! analytics pipelines. Frames arrive in any of several memory domains, are
//! mapped into the form the inference engine expects without unnecessary
//! copies, run asynchronously through a bounded pool of inference requests
//! and are decoded into detections.
//!
//! ## Features
//!
//! - **Memory Domains**: System memory, hardware video surfaces, DMA buffers
//!   shared by file descriptor and accelerator-private tensors, each owned
//!   through a [`Context`] holding the native handle it needs.
//! - **Mapper Registry**: A closed table of domain conversions resolved once
//!   per context and cached, zero-copy wherever the domains alias.
//! - **Asynchronous Inference**: Output frames are returned immediately and
//!   wait for their request on first access; slot reuse bounds the requests
//!   in flight.
//! - **YOLOv8 Decoding**: Raw output tensors to per-image detection lists.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_inference::{
//!     decoder::{Decoder, DecoderConfig},
//!     engine::replay::ReplayEngine,
//!     frame::{Frame, Tensor},
//!     memory::{DataType, MemoryDomain, TensorInfo},
//!     stage::{InferenceStage, StageParams},
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(ReplayEngine::new());
//! let stage = InferenceStage::configure(engine, StageParams::new("yolov8n.json"), None)?;
//!
//! let info = TensorInfo::new(vec![1, 3, 640, 640], DataType::U8);
//! let input = Tensor::from_host(info, vec![0; 3 * 640 * 640])?;
//! let frame = Arc::new(Frame::from_tensors(MemoryDomain::System, vec![input])?);
//!
//! let output = stage.process(frame)?;
//! let model = output.model_info().ok_or("no model info")?;
//! let decoder = Decoder::new(DecoderConfig::from_model_info(&model, Default::default())?);
//! for detection in &decoder.convert(&output)?[0] {
//!     println!("{} {:.2}", detection.label, detection.confidence);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Kernel 5.10+ with DMA heap support for shared buffers
//!   (memfd-backed buffers are available everywhere)
//! - **Hardware Surfaces**: A display binding implementing
//!   [`buffer::SurfaceDisplay`] supplied by the host application
//!
//! ## Safety
//!
//! This library uses `unsafe` code for memory mapping DMA buffers. All
//! unsafe operations are isolated to the [`buffer`] module and wrapped with
//! safe APIs.

pub mod buffer;
pub mod completion;
pub mod context;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod frame;
pub mod mapper;
pub mod memory;
pub mod nms;
pub mod stage;

pub use context::Context;
pub use error::{Error, Result};
pub use frame::{Frame, Tensor};
pub use memory::{AccessMode, MemoryDomain};
pub use stage::InferenceStage;
