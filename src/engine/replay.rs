// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Engine replaying recorded model outputs.
//!
//! The model file is a JSON descriptor naming the model's ports and the
//! output each request produces, given inline or as a raw little-endian
//! file next to the descriptor:
//!
//! ```json
//! {
//!   "name": "yolov8n",
//!   "latency_ms": 5,
//!   "inputs": [{ "name": "images", "shape": [1, 3, 640, 640], "dtype": "u8" }],
//!   "outputs": [{ "name": "output0", "shape": [1, 84, 8400], "dtype": "f32",
//!                 "file": "output0.bin" }]
//! }
//! ```
//!
//! Each compiled model runs its requests on one worker thread fed by a
//! channel, so completions arrive in submission order and independently of
//! the calling thread.

use super::{CompileOptions, CompiledModel, Engine, InferRequest, ModelDesc, Port, RemoteContext};
use crate::{
    buffer::{
        is_valid_display, Buffer, HostMemory, RemoteTensor, SharedBuffer, Surface, SurfaceDisplay,
    },
    completion::Promise,
    error::{Error, Result},
    frame::Tensor,
    memory::{AccessMode, DataType, TensorInfo},
};
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Deserialize)]
struct Descriptor {
    name: String,
    #[serde(default)]
    latency_ms: u64,
    inputs: Vec<PortRecord>,
    outputs: Vec<OutputRecord>,
}

#[derive(Debug, Deserialize)]
struct PortRecord {
    name: String,
    shape: Vec<usize>,
    dtype: DataType,
}

impl PortRecord {
    fn port(&self) -> Port {
        Port {
            name: self.name.clone(),
            info: TensorInfo::new(self.shape.clone(), self.dtype),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OutputRecord {
    #[serde(flatten)]
    port: PortRecord,
    /// Inline `f32` values.
    #[serde(default)]
    values: Vec<f32>,
    /// Raw bytes, relative to the descriptor.
    #[serde(default)]
    file: Option<PathBuf>,
}

impl OutputRecord {
    /// Recorded bytes, zeros when nothing was recorded.
    fn recording(&self, base: &Path) -> Result<Vec<u8>> {
        if let Some(file) = &self.file {
            let path = base.join(file);
            return fs::read(&path)
                .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())));
        }
        if !self.values.is_empty() {
            if self.port.dtype != DataType::F32 {
                return Err(Error::ModelLoad(format!(
                    "inline values of output {} need an f32 port",
                    self.port.name
                )));
            }
            return Ok(self.values.iter().flat_map(|v| v.to_le_bytes()).collect());
        }
        Ok(Vec::new())
    }
}

fn load(path: &Path) -> Result<Descriptor> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))
}

/// Fits a recording to `len` bytes, repeating a single-image recording
/// across the batch.
fn fit(name: &str, recording: Vec<u8>, len: usize) -> Result<Vec<u8>> {
    match recording.len() {
        0 => Ok(vec![0; len]),
        n if n == len => Ok(recording),
        n if len % n == 0 => Ok(recording.repeat(len / n)),
        n => Err(Error::ModelLoad(format!(
            "recorded output {name} holds {n} bytes, the port needs {len}"
        ))),
    }
}

/// [`Engine`] serving recorded outputs.
#[derive(Debug, Default)]
pub struct ReplayEngine {
    latency: Option<Duration>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the per-request latency of every model.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
        }
    }
}

impl Engine for ReplayEngine {
    fn name(&self) -> &str {
        "replay"
    }

    fn read_model(&self, path: &Path) -> Result<ModelDesc> {
        let desc = load(path)?;
        if desc.inputs.is_empty() || desc.outputs.is_empty() {
            return Err(Error::ModelLoad(format!(
                "{}: model needs at least one input and one output",
                path.display()
            )));
        }
        Ok(ModelDesc {
            name: desc.name,
            path: path.to_owned(),
            inputs: desc.inputs.iter().map(PortRecord::port).collect(),
            outputs: desc.outputs.iter().map(|o| o.port.port()).collect(),
        })
    }

    fn create_remote_context(
        &self,
        device: &str,
        display: &Arc<dyn SurfaceDisplay>,
    ) -> Result<Arc<dyn RemoteContext>> {
        if !device.contains("GPU") {
            return Err(Error::Inference(format!(
                "device {device} cannot share surfaces"
            )));
        }
        if !is_valid_display(display.as_ref()) {
            return Err(Error::InvalidHandle("display rejected".to_owned()));
        }
        Ok(Arc::new(ReplayRemote {
            device: device.to_owned(),
        }))
    }

    #[instrument(skip_all, fields(model = %model.name, device = %options.device))]
    fn compile(
        &self,
        model: &ModelDesc,
        options: &CompileOptions,
    ) -> Result<Arc<dyn CompiledModel>> {
        let desc = load(&model.path)?;
        let base = model.path.parent().unwrap_or_else(|| Path::new("."));

        let mut inputs = model.inputs.clone();
        let mut required = inputs.iter().map(|p| p.info.nbytes()).collect::<Vec<_>>();
        if !options.preprocess.is_identity() {
            let ([input], [bytes]) = (inputs.as_mut_slice(), required.as_mut_slice()) else {
                return Err(Error::UnsupportedInput(
                    "preprocessing needs a single-input model".to_owned(),
                ));
            };
            *bytes = options.preprocess.input_bytes(&input.info);
            input.info = options.preprocess.apply(&input.info);
        }

        let recordings = desc
            .outputs
            .iter()
            .zip(&model.outputs)
            .map(|(record, port)| fit(&port.name, record.recording(base)?, port.info.nbytes()))
            .collect::<Result<Vec<_>>>()?;
        for (key, value) in &options.config {
            debug!(%key, %value, "replay ignores engine config");
        }

        let latency = self
            .latency
            .unwrap_or(Duration::from_millis(desc.latency_ms));
        let shared = Arc::new(Shared {
            inputs,
            required,
            outputs: model.outputs.clone(),
            recordings,
            latency,
        });

        let (tx, rx) = kanal::unbounded::<Job>();
        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("replay-{}", model.name))
            .spawn(move || run(rx, worker))?;

        info!(
            remote = options.remote.is_some(),
            ?latency,
            "model compiled"
        );
        Ok(Arc::new(ReplayModel { shared, tx }))
    }
}

struct Shared {
    inputs: Vec<Port>,
    /// Minimum bytes of each bound input.
    required: Vec<usize>,
    outputs: Vec<Port>,
    recordings: Vec<Vec<u8>>,
    latency: Duration,
}

impl Shared {
    fn execute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        for ((tensor, port), required) in inputs.iter().zip(&self.inputs).zip(&self.required) {
            let len = tensor.buffer().len();
            if len < *required {
                return Err(Error::Inference(format!(
                    "input {} holds {len} bytes, expects {required}",
                    port.name
                )));
            }
        }
        Ok(self
            .outputs
            .iter()
            .zip(&self.recordings)
            .map(|(port, data)| {
                let memory = HostMemory::from_vec(data.clone());
                Tensor::new(port.info.clone(), Buffer::Host(Arc::new(memory)))
            })
            .collect())
    }
}

struct Job {
    inputs: Vec<Tensor>,
    promise: Promise,
}

fn run(rx: kanal::Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = rx.recv() {
        if !shared.latency.is_zero() {
            thread::sleep(shared.latency);
        }
        let outcome = shared.execute(&job.inputs);
        if let Err(e) = &outcome {
            warn!("replay request failed: {e}");
        }
        job.promise.fulfil(outcome);
    }
    debug!("replay worker stopped");
}

struct ReplayModel {
    shared: Arc<Shared>,
    tx: kanal::Sender<Job>,
}

impl CompiledModel for ReplayModel {
    fn inputs(&self) -> &[Port] {
        &self.shared.inputs
    }

    fn outputs(&self) -> &[Port] {
        &self.shared.outputs
    }

    fn create_request(&self) -> Result<Box<dyn InferRequest>> {
        Ok(Box::new(ReplayRequest {
            expected: self.shared.inputs.len(),
            tx: self.tx.clone(),
        }))
    }
}

struct ReplayRequest {
    expected: usize,
    tx: kanal::Sender<Job>,
}

impl InferRequest for ReplayRequest {
    fn start_async(&mut self, inputs: Vec<Tensor>, promise: Promise) -> Result<()> {
        if inputs.len() != self.expected {
            return Err(Error::UnsupportedInput(format!(
                "model takes {} inputs, {} bound",
                self.expected,
                inputs.len()
            )));
        }
        self.tx
            .send(Job { inputs, promise })
            .map_err(|_| Error::Inference("replay worker stopped".to_owned()))
    }
}

struct ReplayRemote {
    device: String,
}

impl RemoteContext for ReplayRemote {
    fn device(&self) -> &str {
        &self.device
    }

    fn import_surface(
        &self,
        surface: &Arc<Surface>,
        info: &TensorInfo,
    ) -> Result<Arc<dyn RemoteTensor>> {
        let buffer = surface.export()?;
        debug!(?surface, %info, "surface shared with {}", self.device);
        Ok(Arc::new(SurfaceTensor {
            buffer,
            _surface: Arc::clone(surface),
        }))
    }
}

/// Surface memory seen by the engine through its exported descriptor.
struct SurfaceTensor {
    buffer: SharedBuffer,
    _surface: Arc<Surface>,
}

impl RemoteTensor for SurfaceTensor {
    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn read_into(&self, dst: &mut [u8]) -> io::Result<()> {
        let region = self.buffer.mmap(AccessMode::Read)?;
        let n = dst.len().min(region.len());
        dst[..n].copy_from_slice(&region.as_slice()[..n]);
        Ok(())
    }
}
