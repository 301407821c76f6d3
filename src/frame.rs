// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frames and tensors.
//!
//! A [`Frame`] is one unit of data: a domain-tagged set of [`Tensor`]s, the
//! [`FrameInfo`] describing them and a metadata map for side information.
//! Frames are shared through `Arc`; backing memory is released when the last
//! reference is dropped. Frames produced by an inference stage are pending
//! until their request completes and wait transparently on first access.

use crate::{
    buffer::{Buffer, BufferView, HostMemory, RemoteTensor, SharedBuffer, Surface},
    completion::Completion,
    context::Context,
    error::{Error, Result},
    memory::{AccessMode, DataType, FrameInfo, MemoryDomain, TensorInfo},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Side-channel metadata attached to a frame.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata key of the [`ModelInfo`] record.
pub const MODEL_INFO: &str = "model_info";

/// One tensor: its description and backing storage.
#[derive(Clone, Debug)]
pub struct Tensor {
    info: TensorInfo,
    buffer: Buffer,
}

impl Tensor {
    pub fn new(info: TensorInfo, buffer: Buffer) -> Self {
        Self { info, buffer }
    }

    /// Wraps host bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedShape`] when `data` is smaller than the
    /// tensor described by `info`.
    pub fn from_host(info: TensorInfo, data: Vec<u8>) -> Result<Self> {
        check_len(&info, data.len())?;
        Ok(Self::new(info, Buffer::Host(Arc::new(HostMemory::from_vec(data)))))
    }

    /// Copies `data` into a new contiguous `f32` host tensor.
    pub fn from_f32(shape: Vec<usize>, data: &[f32]) -> Result<Self> {
        let bytes = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_host(TensorInfo::new(shape, DataType::F32), bytes)
    }

    pub fn from_shared(info: TensorInfo, buffer: Arc<SharedBuffer>) -> Result<Self> {
        check_len(&info, buffer.len())?;
        Ok(Self::new(info, Buffer::Shared(buffer)))
    }

    pub fn from_surface(info: TensorInfo, surface: Arc<Surface>) -> Self {
        Self::new(info, Buffer::Surface(surface))
    }

    pub fn from_remote(info: TensorInfo, remote: Arc<dyn RemoteTensor>) -> Self {
        Self::new(info, Buffer::Remote(remote))
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn map(&self, access: AccessMode) -> Result<TensorView<'_>> {
        Ok(TensorView {
            info: &self.info,
            view: self.buffer.map(access)?,
        })
    }
}

fn check_len(info: &TensorInfo, len: usize) -> Result<()> {
    if len < info.nbytes() {
        return Err(Error::UnsupportedShape(format!(
            "tensor {info} needs {} bytes, buffer holds {len}",
            info.nbytes()
        )));
    }
    Ok(())
}

/// Host view of one tensor.
pub struct TensorView<'a> {
    info: &'a TensorInfo,
    view: BufferView<'a>,
}

impl TensorView<'_> {
    pub fn info(&self) -> &TensorInfo {
        self.info
    }

    pub fn as_slice(&self) -> &[u8] {
        self.view.as_slice()
    }

    pub fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.view.as_slice_mut()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        self.view.as_f32()
    }
}

/// Host views of every tensor of a frame.
pub struct FrameView<'a> {
    tensors: Vec<TensorView<'a>>,
}

impl<'a> FrameView<'a> {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TensorView<'a>> {
        self.tensors.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TensorView<'a>> {
        self.tensors.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorView<'a>> {
        self.tensors.iter()
    }
}

/// Model identity and layer names attached to frames produced by an
/// inference stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub input: FrameInfo,
    pub output: FrameInfo,
    pub input_layers: Vec<String>,
    pub output_layers: Vec<String>,
}

/// One unit of image or tensor data.
pub struct Frame {
    info: FrameInfo,
    content: Arc<Completion>,
    metadata: Mutex<Metadata>,
    parent: Option<Arc<Frame>>,
    context: Option<Arc<Context>>,
}

impl Frame {
    /// Builds a ready frame from tensors at the domain boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInput`] when a tensor's storage is not
    /// legal for `info.domain`, or [`Error::UnsupportedShape`] when the tensor
    /// count disagrees with `info`.
    pub fn new(info: FrameInfo, tensors: Vec<Tensor>) -> Result<Self> {
        validate(&info, &tensors)?;
        Ok(Self::assemble(info, Completion::ready(tensors), None, None))
    }

    /// Builds a ready tensor-set frame, deriving its description from the
    /// tensors.
    pub fn from_tensors(domain: MemoryDomain, tensors: Vec<Tensor>) -> Result<Self> {
        let infos = tensors.iter().map(|t| t.info.clone()).collect();
        Self::new(FrameInfo::tensors(domain, infos), tensors)
    }

    /// A frame whose tensors arrive when `completion` resolves. The parent is
    /// kept alive for the lifetime of the frame.
    pub(crate) fn pending(
        info: FrameInfo,
        completion: Arc<Completion>,
        parent: Option<Arc<Frame>>,
        context: Option<Arc<Context>>,
    ) -> Self {
        Self::assemble(info, completion, parent, context)
    }

    /// Ready frame derived from `parent` by a mapper.
    pub(crate) fn derived(
        info: FrameInfo,
        tensors: Vec<Tensor>,
        parent: Arc<Frame>,
        context: Option<Arc<Context>>,
    ) -> Result<Self> {
        validate(&info, &tensors)?;
        Ok(Self::assemble(
            info,
            Completion::ready(tensors),
            Some(parent),
            context,
        ))
    }

    fn assemble(
        info: FrameInfo,
        content: Arc<Completion>,
        parent: Option<Arc<Frame>>,
        context: Option<Arc<Context>>,
    ) -> Self {
        Self {
            info,
            content,
            metadata: Mutex::new(Metadata::new()),
            parent,
            context,
        }
    }

    /// Attaches the context the frame's memory belongs to.
    pub fn with_context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn domain(&self) -> MemoryDomain {
        self.info.domain
    }

    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    /// The frame this one was derived from, kept alive while this frame
    /// exists.
    pub fn parent(&self) -> Option<&Arc<Frame>> {
        self.parent.as_ref()
    }

    /// Whether the tensors are available without blocking.
    pub fn is_ready(&self) -> bool {
        self.content.is_ready()
    }

    /// Blocks until the producing request has completed.
    ///
    /// # Errors
    ///
    /// Returns the request's failure; it concerns this frame only.
    pub fn wait(&self) -> Result<&[Tensor]> {
        self.content.wait()
    }

    /// Tensors of the frame, waiting for them when pending.
    pub fn tensors(&self) -> Result<&[Tensor]> {
        self.wait()
    }

    /// Maps every tensor into a host view, waiting first when pending.
    pub fn map(&self, access: AccessMode) -> Result<FrameView<'_>> {
        let tensors = self
            .wait()?
            .iter()
            .map(|t| t.map(access))
            .collect::<Result<Vec<_>>>()?;
        Ok(FrameView { tensors })
    }

    pub fn metadata(&self) -> MutexGuard<'_, Metadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        let meta = self.metadata();
        let value = meta.get(MODEL_INFO)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set_model_info(&self, info: &ModelInfo) -> Result<()> {
        let value = serde_json::to_value(info)?;
        self.metadata().insert(MODEL_INFO.to_owned(), value);
        Ok(())
    }
}

fn validate(info: &FrameInfo, tensors: &[Tensor]) -> Result<()> {
    if tensors.len() != info.tensors.len() {
        return Err(Error::UnsupportedShape(format!(
            "frame {info} declares {} tensors, got {}",
            info.tensors.len(),
            tensors.len()
        )));
    }
    if let Some(t) = tensors.iter().find(|t| !t.buffer.allowed_in(info.domain)) {
        return Err(Error::UnsupportedInput(format!(
            "{:?} cannot back a tensor in the {} domain",
            t.buffer, info.domain
        )));
    }
    Ok(())
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("info", &self.info)
            .field("ready", &self.is_ready())
            .field("parent", &self.parent.is_some())
            .finish()
    }
}
