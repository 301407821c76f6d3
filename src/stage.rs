// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Inference execution stage.
//!
//! An [`InferenceStage`] owns one compiled model and a bounded pool of
//! reusable inference requests. Each call to [`InferenceStage::process`]
//! maps the input into the accelerator domain, binds it to the next request
//! slot and returns a pending output frame immediately. Reusing a slot first
//! waits for the request it last carried, which bounds the number of
//! requests in flight to the pool size.

use crate::{
    completion::{self, Completion},
    context::Context,
    engine::{
        parse_config, CompileOptions, CompiledModel, Engine, InferRequest, ModelDesc, Preprocess,
        RemoteContext,
    },
    error::{ElementContext, Error, Result},
    frame::{Frame, ModelInfo, Tensor, MODEL_INFO},
    mapper::MapperChain,
    memory::{AccessMode, DataType, FrameInfo, ImageFormat, MediaType, MemoryDomain},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tracing::{debug, error, info, instrument, trace, warn};

/// Name errors of this stage are attributed to.
pub const ELEMENT: &str = "tensor_inference";

/// Description of one recognised configuration parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamDesc {
    pub name: &'static str,
    pub description: &'static str,
    pub default: &'static str,
    /// Inclusive range of integer parameters.
    pub range: Option<(u64, u64)>,
}

pub const PARAMS: [ParamDesc; 5] = [
    ParamDesc {
        name: "model",
        description: "Path to the model file",
        default: "",
        range: None,
    },
    ParamDesc {
        name: "device",
        description: "Target device for inference",
        default: "CPU",
        range: None,
    },
    ParamDesc {
        name: "config",
        description: "Comma separated list of KEY=VALUE engine parameters",
        default: "",
        range: None,
    },
    ParamDesc {
        name: "batch-size",
        description: "Batch size",
        default: "1",
        range: Some((0, i32::MAX as u64)),
    },
    ParamDesc {
        name: "request-pool-size",
        description: "Number of reusable inference requests, bounding requests in flight",
        default: "16",
        range: Some((0, i32::MAX as u64)),
    },
];

fn default_device() -> String {
    "CPU".to_owned()
}

fn default_batch_size() -> usize {
    1
}

fn default_request_pool_size() -> usize {
    16
}

/// Stage configuration, read from the host's parameter dictionary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StageParams {
    pub model: PathBuf,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub config: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_pool_size")]
    pub request_pool_size: usize,
}

impl StageParams {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            device: default_device(),
            config: String::new(),
            batch_size: default_batch_size(),
            request_pool_size: default_request_pool_size(),
        }
    }

    /// Reads the recognised keys of `dictionary`; see [`PARAMS`]. Unknown
    /// keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Param`] when `model` is missing or a value has the
    /// wrong type or range.
    pub fn from_dictionary(dictionary: &Map<String, Value>) -> Result<Self> {
        let params: Self = serde_json::from_value(Value::Object(dictionary.clone()))
            .map_err(|e| Error::Param(e.to_string()))?;
        if params.model.as_os_str().is_empty() {
            return Err(Error::Param("model path is empty".to_owned()));
        }
        check_range("batch-size", params.batch_size)?;
        check_range("request-pool-size", params.request_pool_size)?;
        Ok(params)
    }

    pub fn is_device_gpu(&self) -> bool {
        self.device.contains("GPU")
    }

    /// Request slots to allocate; a pool always has at least one.
    pub fn pool_size(&self) -> usize {
        self.request_pool_size.max(1)
    }
}

fn check_range(name: &str, value: usize) -> Result<()> {
    let range = PARAMS.iter().find(|d| d.name == name).and_then(|d| d.range);
    match range {
        Some((lo, hi)) if !(lo..=hi).contains(&(value as u64)) => Err(Error::Param(format!(
            "{name} = {value} outside {lo}..={hi}"
        ))),
        _ => Ok(()),
    }
}

/// Lifecycle of a stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageState {
    /// Model metadata loaded, shapes known.
    Configured,
    /// Model compiled and request pool sized.
    Ready,
    /// At least one frame dispatched.
    Running,
    /// Initialization failed; every later call returns that error.
    Failed,
}

/// Counters of request pool activity.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Requests started.
    pub dispatched: AtomicU64,
    /// Slot acquisitions that found a previous request on the slot.
    pub slot_reuse_count: AtomicU64,
    /// Slot acquisitions of a slot never used before.
    pub slot_first_use_count: AtomicU64,
    /// Reuses that had to block because the previous request was still
    /// running.
    pub backpressure_waits: AtomicU64,
}

impl PoolMetrics {
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            slot_reuse_count: self.slot_reuse_count.load(Ordering::Relaxed),
            slot_first_use_count: self.slot_first_use_count.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub dispatched: u64,
    pub slot_reuse_count: u64,
    pub slot_first_use_count: u64,
    pub backpressure_waits: u64,
}

struct Slot {
    request: Box<dyn InferRequest>,
    /// Completion of the last request started on this slot.
    pending: Option<Arc<Completion>>,
}

/// Round-robin ring of inference requests.
///
/// A slot stays locked from acquisition until its new request has started,
/// so it is never bound to two frames at once.
struct RequestPool {
    slots: Vec<Mutex<Slot>>,
    cursor: AtomicUsize,
    metrics: PoolMetrics,
}

impl RequestPool {
    fn new(model: &dyn CompiledModel, size: usize) -> Result<Self> {
        let slots = (0..size.max(1))
            .map(|_| {
                model.create_request().map(|request| {
                    Mutex::new(Slot {
                        request,
                        pending: None,
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(size = slots.len(), "request pool allocated");
        Ok(Self {
            slots,
            cursor: AtomicUsize::new(0),
            metrics: PoolMetrics::default(),
        })
    }

    fn dispatch(&self, inputs: Vec<Tensor>) -> Result<Arc<Completion>> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match slot.pending.take() {
            Some(previous) => {
                if !previous.is_ready() {
                    self.metrics
                        .backpressure_waits
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(index, "waiting for request slot");
                }
                // a failure here belongs to the frame that owned the request
                let _ = previous.wait();
                self.metrics
                    .slot_reuse_count
                    .fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.metrics
                    .slot_first_use_count
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let (promise, completion) = completion::channel();
        slot.request.start_async(inputs, promise)?;
        slot.pending = Some(Arc::clone(&completion));
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(completion)
    }

    /// Waits for every outstanding request.
    fn drain(&self) {
        for slot in &self.slots {
            let pending = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .take();
            if let Some(completion) = pending {
                let _ = completion.wait();
            }
        }
    }
}

/// State created by [`InferenceStage::init`].
struct Runtime {
    compiled: Arc<dyn CompiledModel>,
    pool: RequestPool,
    mapper: MapperChain,
    accelerator: Arc<Context>,
    output: FrameInfo,
    model_info: Value,
}

/// Outcome of the first initialization, kept for the stage's lifetime.
type RuntimeSlot = Option<std::result::Result<Arc<Runtime>, Arc<Error>>>;

/// Inference stage over one model.
pub struct InferenceStage {
    engine: Arc<dyn Engine>,
    params: StageParams,
    app_context: Option<Arc<Context>>,
    model: ModelDesc,
    model_input: FrameInfo,
    model_output: FrameInfo,
    input_info: Option<FrameInfo>,
    runtime: Mutex<RuntimeSlot>,
    running: AtomicBool,
}

impl InferenceStage {
    /// Loads model metadata through `engine` and applies the batch size.
    ///
    /// `app_context` is the host's context; device-surface input takes its
    /// display from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] when the model cannot be read.
    pub fn configure(
        engine: Arc<dyn Engine>,
        params: StageParams,
        app_context: Option<Arc<Context>>,
    ) -> Result<Self> {
        let mut model = engine.read_model(&params.model).element(ELEMENT)?;
        if params.batch_size > 1 {
            model.set_batch(params.batch_size).element(ELEMENT)?;
        }

        let model_input = FrameInfo::tensors(
            MemoryDomain::System,
            model.inputs.iter().map(|p| p.info.clone()).collect(),
        );
        let model_output = FrameInfo::tensors(
            MemoryDomain::AcceleratorTensor,
            model.outputs.iter().map(|p| p.info.clone()).collect(),
        );
        info!(
            model = %model.name,
            engine = engine.name(),
            device = %params.device,
            input = %model_input,
            output = %model_output,
            "model configured"
        );

        Ok(Self {
            engine,
            params,
            app_context,
            model,
            model_input,
            model_output,
            input_info: None,
            runtime: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &StageParams {
        &self.params
    }

    pub fn model(&self) -> &ModelDesc {
        &self.model
    }

    pub fn state(&self) -> StageState {
        if self.running.load(Ordering::Acquire) {
            return StageState::Running;
        }
        match &*self.lock_runtime() {
            Some(Ok(_)) => StageState::Ready,
            Some(Err(_)) => StageState::Failed,
            None => StageState::Configured,
        }
    }

    /// Accepted inputs: the model input in system memory and shared buffers,
    /// as `u8` or `f32`, plus NV12 device surfaces on GPU devices.
    pub fn input_info(&self) -> Vec<FrameInfo> {
        let mut infos = Vec::new();
        for domain in [MemoryDomain::System, MemoryDomain::SharedBuffer] {
            for dtype in [DataType::U8, DataType::F32] {
                let tensors = self
                    .model_input
                    .tensors
                    .iter()
                    .map(|t| t.with_dtype(dtype))
                    .collect();
                infos.push(FrameInfo::tensors(domain, tensors));
            }
        }
        if self.params.is_device_gpu() && self.model_input.tensors.len() == 1 {
            infos.push(FrameInfo::image(
                ImageFormat::NV12,
                MemoryDomain::DeviceSurface,
                self.model_input.tensors.clone(),
            ));
        }
        infos
    }

    /// Produced output: the model output in the accelerator domain.
    pub fn output_info(&self) -> Vec<FrameInfo> {
        vec![self.model_output.clone()]
    }

    /// Records the negotiated input.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInput`] once the stage is initialized.
    pub fn set_input_info(&mut self, info: FrameInfo) -> Result<()> {
        if self.lock_runtime().is_some() {
            return Err::<(), _>(Error::UnsupportedInput(
                "input negotiated after initialization".to_owned(),
            ))
            .element(ELEMENT);
        }
        debug!(%info, "input negotiated");
        self.input_info = Some(info);
        Ok(())
    }

    /// Negotiated input, the model's native input when none was set.
    pub fn negotiated_input(&self) -> &FrameInfo {
        self.input_info.as_ref().unwrap_or(&self.model_input)
    }

    /// Compiles the model and sizes the request pool. Runs once; later calls
    /// and [`process`](Self::process) reuse the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInput`] when the negotiated input cannot
    /// be fed to the model, and [`Error::InvalidHandle`] when a context it
    /// needs cannot be created.
    pub fn init(&self) -> Result<()> {
        self.runtime().map(|_| ()).element(ELEMENT)
    }

    fn lock_runtime(&self) -> std::sync::MutexGuard<'_, RuntimeSlot> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialized runtime, if initialization succeeded.
    fn ready_runtime(&self) -> Option<Arc<Runtime>> {
        match &*self.lock_runtime() {
            Some(Ok(runtime)) => Some(Arc::clone(runtime)),
            _ => None,
        }
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        let mut slot = self.lock_runtime();
        let outcome = slot.get_or_insert_with(|| {
            self.build_runtime().map(Arc::new).map_err(|e| {
                error!(code = e.error_code(), "initialization failed: {e}");
                Arc::new(e)
            })
        });
        match outcome {
            Ok(runtime) => Ok(Arc::clone(runtime)),
            Err(e) => Err(Error::InitFailed(Arc::clone(e))),
        }
    }

    #[instrument(skip_all, fields(model = %self.model.name))]
    fn build_runtime(&self) -> Result<Runtime> {
        let input = self.negotiated_input().clone();

        let mut remote = None;
        if input.media != MediaType::Tensors && input.domain == MemoryDomain::DeviceSurface {
            if !self.params.is_device_gpu() {
                return Err(Error::UnsupportedInput(format!(
                    "device surface input needs a GPU device, not {}",
                    self.params.device
                )));
            }
            remote = self.create_remote_context();
        }

        let preprocess = self.preprocessing(&input)?;
        let options = CompileOptions {
            device: self.params.device.clone(),
            config: parse_config(&self.params.config),
            preprocess,
            remote: remote.clone(),
        };
        debug!(?options, "compiling");
        let compiled = self.engine.compile(&self.model, &options)?;
        let pool = RequestPool::new(compiled.as_ref(), self.params.pool_size())?;

        let accelerator = Context::accelerator(remote, self.app_context.as_ref());
        let source = match &self.app_context {
            Some(context) if context.domain() == input.domain => Arc::clone(context),
            _ => Context::create(input.domain, self.app_context.as_ref())?,
        };
        let mapper = MapperChain::between(&source, &accelerator)?;

        let output = FrameInfo::tensors(
            MemoryDomain::AcceleratorTensor,
            compiled.outputs().iter().map(|p| p.info.clone()).collect(),
        );
        let model_info = serde_json::to_value(ModelInfo {
            model_name: self.model.name.clone(),
            input: self.model_input.clone(),
            output: self.model_output.clone(),
            input_layers: self.model.inputs.iter().map(|p| p.name.clone()).collect(),
            output_layers: self.model.outputs.iter().map(|p| p.name.clone()).collect(),
        })?;

        info!(
            input = %input,
            pool = self.params.pool_size(),
            mappers = mapper.len(),
            zero_copy = mapper.is_zero_copy(),
            "stage ready"
        );
        Ok(Runtime {
            compiled,
            pool,
            mapper,
            accelerator,
            output,
            model_info,
        })
    }

    /// Remote context sharing the host display with the device. Falls back
    /// to no remote context, in which case surfaces reach the engine through
    /// host memory.
    fn create_remote_context(&self) -> Option<Arc<dyn RemoteContext>> {
        let display = self.app_context.as_ref().and_then(|c| c.display());
        let Some(display) = display else {
            warn!("no display in the application context, surfaces will be copied");
            return None;
        };
        match self
            .engine
            .create_remote_context(&self.params.device, display)
        {
            Ok(remote) => Some(remote),
            Err(e) => {
                warn!("creating remote context failed, surfaces will be copied: {e}");
                None
            }
        }
    }

    fn preprocessing(&self, input: &FrameInfo) -> Result<Preprocess> {
        match input.media {
            MediaType::Tensors => {
                if input.tensors == self.model_input.tensors {
                    return Ok(Preprocess::default());
                }
                let ([requested], [native]) =
                    (input.tensors.as_slice(), self.model_input.tensors.as_slice())
                else {
                    return Err(Error::UnsupportedInput(
                        "preprocessing needs a single-tensor model input".to_owned(),
                    ));
                };
                Ok(Preprocess {
                    element_type: (requested.dtype != native.dtype).then_some(requested.dtype),
                    shape: (requested.shape != native.shape).then(|| requested.shape.clone()),
                    nv12_to_bgr: false,
                })
            }
            MediaType::Image(ImageFormat::NV12)
                if input.domain == MemoryDomain::DeviceSurface
                    && self.model_input.tensors.len() == 1 =>
            {
                Ok(Preprocess {
                    nv12_to_bgr: true,
                    ..Preprocess::default()
                })
            }
            MediaType::Image(format) => Err(Error::UnsupportedInput(format!(
                "image input is supported only as NV12 device surfaces, got {format:?} in {}",
                input.domain
            ))),
        }
    }

    /// Starts inference on `input` and returns the pending output frame.
    ///
    /// Blocks while the next request slot still carries an unfinished
    /// request. The output keeps the mapped input alive until it is dropped
    /// and carries the model description under
    /// [`MODEL_INFO`](crate::frame::MODEL_INFO). Execution failures are
    /// reported by the output frame's `wait()`.
    ///
    /// # Errors
    ///
    /// Initialization errors, [`Error::NullData`] for a frame without
    /// tensors, and mapping or binding failures.
    #[instrument(skip_all, fields(model = %self.model.name))]
    pub fn process(&self, input: Arc<Frame>) -> Result<Arc<Frame>> {
        self.dispatch(input).element(ELEMENT)
    }

    fn dispatch(&self, input: Arc<Frame>) -> Result<Arc<Frame>> {
        let runtime = self.runtime()?;
        if input.info().tensors.is_empty() {
            return Err(Error::NullData("input frame carries no tensors".to_owned()));
        }

        let mapped = runtime.mapper.map(&input, AccessMode::Read)?;
        let tensors = mapped.wait()?.to_vec();
        if let Some(empty) = tensors.iter().find(|t| t.buffer().is_empty()) {
            return Err(Error::NullData(format!(
                "input tensor {} has no data",
                empty.info()
            )));
        }

        let completion = runtime.pool.dispatch(tensors)?;
        let output = Frame::pending(
            runtime.output.clone(),
            completion,
            Some(mapped),
            Some(Arc::clone(&runtime.accelerator)),
        );
        output
            .metadata()
            .insert(MODEL_INFO.to_owned(), runtime.model_info.clone());
        self.running.store(true, Ordering::Release);
        Ok(Arc::new(output))
    }

    /// Request pool counters, once initialized.
    pub fn metrics(&self) -> Option<PoolMetricsSnapshot> {
        self.ready_runtime()
            .map(|runtime| runtime.pool.metrics.snapshot())
    }

    /// Compiled inputs, once initialized.
    pub fn compiled_inputs(&self) -> Option<Vec<FrameInfo>> {
        self.ready_runtime().map(|runtime| {
            vec![FrameInfo::tensors(
                MemoryDomain::AcceleratorTensor,
                runtime
                    .compiled
                    .inputs()
                    .iter()
                    .map(|p| p.info.clone())
                    .collect(),
            )]
        })
    }

    /// Waits for every outstanding request. In-flight work is never
    /// aborted.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.ready_runtime() {
            runtime.pool.drain();
            let metrics = runtime.pool.metrics.snapshot();
            debug!(?metrics, "stage drained");
        }
    }
}

impl Drop for InferenceStage {
    fn drop(&mut self) {
        self.shutdown();
    }
}
