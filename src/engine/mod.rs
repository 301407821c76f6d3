// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Inference engine contract.
//!
//! The stage never parses model files or talks to accelerator drivers
//! itself. An [`Engine`] reads model metadata, compiles the model for a
//! device and hands out [`InferRequest`]s that execute asynchronously on the
//! engine's own queue and report through a [`Promise`].

pub mod replay;

use crate::{
    buffer::{RemoteTensor, Surface, SurfaceDisplay},
    completion::Promise,
    error::{Error, Result},
    frame::Tensor,
    memory::{DataType, ImageFormat, TensorInfo},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::debug;

/// Named model input or output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub name: String,
    pub info: TensorInfo,
}

/// Model metadata as read from the model file.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelDesc {
    pub name: String,
    pub path: PathBuf,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

impl ModelDesc {
    /// Sets the leading (batch) dimension of every port.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedShape`] for scalar ports, which have no
    /// batch dimension.
    pub fn set_batch(&mut self, batch: usize) -> Result<()> {
        for port in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            let Some(first) = port.info.shape.first_mut() else {
                return Err(Error::UnsupportedShape(format!(
                    "port {} has no batch dimension",
                    port.name
                )));
            };
            *first = batch;
            port.info = TensorInfo::new(port.info.shape.clone(), port.info.dtype);
        }
        Ok(())
    }
}

/// Preprocessing folded into the compiled model so it accepts the
/// negotiated input instead of its native one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preprocess {
    /// Element type supplied by the caller.
    pub element_type: Option<DataType>,
    /// Shape supplied by the caller.
    pub shape: Option<Vec<usize>>,
    /// Two-plane NV12 surface input, colour converted to BGR for an `NCHW`
    /// model.
    pub nv12_to_bgr: bool,
}

impl Preprocess {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Input description after preprocessing is applied to `native`.
    pub fn apply(&self, native: &TensorInfo) -> TensorInfo {
        if self.nv12_to_bgr {
            return native.with_dtype(DataType::U8);
        }
        let shape = self.shape.clone().unwrap_or_else(|| native.shape.clone());
        TensorInfo::new(shape, self.element_type.unwrap_or(native.dtype))
    }

    /// Bytes one input buffer must hold once preprocessing is applied to
    /// `native`. NV12 input is smaller than the tensor it becomes.
    pub fn input_bytes(&self, native: &TensorInfo) -> usize {
        let info = self.apply(native);
        match (self.nv12_to_bgr, info.image_dims()) {
            (true, Some((width, height))) => {
                let batch = match info.shape.as_slice() {
                    [n, _, _, _] => *n,
                    _ => 1,
                };
                batch * ImageFormat::NV12.image_size(width as u32, height as u32)
            }
            _ => info.nbytes(),
        }
    }
}

/// Options for [`Engine::compile`].
#[derive(Clone, Default)]
pub struct CompileOptions {
    pub device: String,
    /// Engine-specific configuration, passed through opaquely.
    pub config: BTreeMap<String, String>,
    pub preprocess: Preprocess,
    /// Remote context sharing memory with another device. Compiling against
    /// it lets requests consume that device's buffers without copies.
    pub remote: Option<Arc<dyn RemoteContext>>,
}

impl std::fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CompileOptions")
            .field("device", &self.device)
            .field("config", &self.config)
            .field("preprocess", &self.preprocess)
            .field("remote", &self.remote.as_ref().map(|r| r.device().to_owned()))
            .finish()
    }
}

/// An inference backend.
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Reads shape and type metadata of the model at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] when the path is unreadable or the
    /// format is invalid.
    fn read_model(&self, path: &Path) -> Result<ModelDesc>;

    /// Creates a context sharing memory between `display` and `device`.
    fn create_remote_context(
        &self,
        device: &str,
        display: &Arc<dyn SurfaceDisplay>,
    ) -> Result<Arc<dyn RemoteContext>>;

    /// Compiles `model` for the device named in `options`.
    fn compile(&self, model: &ModelDesc, options: &CompileOptions)
        -> Result<Arc<dyn CompiledModel>>;
}

/// A model bound to a device.
pub trait CompiledModel: Send + Sync {
    /// Inputs as accepted by the compiled model, preprocessing included.
    fn inputs(&self) -> &[Port];

    fn outputs(&self) -> &[Port];

    fn create_request(&self) -> Result<Box<dyn InferRequest>>;
}

/// One reusable inference request.
pub trait InferRequest: Send {
    /// Starts executing on `inputs` and returns without waiting.
    ///
    /// The engine fulfils `promise` exactly once from its own queue, with
    /// the output tensors or the execution error.
    ///
    /// # Errors
    ///
    /// Returns binding errors detected before execution starts; the promise
    /// is then dropped.
    fn start_async(&mut self, inputs: Vec<Tensor>, promise: Promise) -> Result<()>;
}

/// Engine-side context of a shared device.
pub trait RemoteContext: Send + Sync {
    fn device(&self) -> &str;

    /// Wraps `surface` as an engine tensor without copying.
    fn import_surface(
        &self,
        surface: &Arc<Surface>,
        info: &TensorInfo,
    ) -> Result<Arc<dyn RemoteTensor>>;
}

/// Parses a comma separated `KEY=VALUE` list. Whitespace around keys and
/// values is dropped, as are records without a key.
pub fn parse_config(config: &str) -> BTreeMap<String, String> {
    config
        .split(',')
        .filter_map(|record| {
            let Some((key, value)) = record.split_once('=') else {
                if !record.trim().is_empty() {
                    debug!(record, "config record without value ignored");
                }
                return None;
            };
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_owned(), value.trim().to_owned()))
        })
        .collect()
}
