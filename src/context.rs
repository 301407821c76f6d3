// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory contexts.
//!
//! A [`Context`] identifies a memory domain and owns or borrows the native
//! handle needed to allocate or interpret buffers in it: the display for
//! device surfaces, the allocator for shared buffers and the engine's remote
//! context for accelerator tensors. Each context caches the mappers resolved
//! through it; the cache is local to the instance and safe to share between
//! stages running on the same device.

use crate::{
    buffer::{is_valid_display, BufferAllocator, DmaHeapAllocator, SurfaceDisplay},
    engine::RemoteContext,
    error::{Error, Result},
    mapper::Mapper,
    memory::MemoryDomain,
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, Weak},
};
use tracing::debug;

/// Native handle held by a context.
#[derive(Clone)]
pub enum NativeHandle {
    /// System memory needs no handle.
    None,
    Display(Arc<dyn SurfaceDisplay>),
    /// Allocator for new shared buffers; `None` when no heap could be opened,
    /// in which case the context can only interpret existing buffers.
    Allocator(Option<Arc<dyn BufferAllocator>>),
    /// Remote context of the inference engine, when the engine shares memory
    /// with another device.
    Remote(Option<Arc<dyn RemoteContext>>),
}

type MapperKey = (MemoryDomain, MemoryDomain);

pub struct Context {
    domain: MemoryDomain,
    handle: NativeHandle,
    parent: Option<Weak<Context>>,
    mappers: RwLock<HashMap<MapperKey, Arc<Mapper>>>,
}

impl Context {
    fn build(domain: MemoryDomain, handle: NativeHandle, parent: Option<&Arc<Context>>) -> Self {
        Self {
            domain,
            handle,
            parent: parent.map(Arc::downgrade),
            mappers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a context for `domain`, deriving its native handle from
    /// `parent` where the domain requires one.
    ///
    /// The parent is referenced weakly: the caller guarantees it outlives
    /// any use of handles derived from it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] for a device-surface context whose
    /// parent has no display, or whose display fails its integrity check.
    pub fn create(domain: MemoryDomain, parent: Option<&Arc<Context>>) -> Result<Arc<Self>> {
        let handle = match domain {
            MemoryDomain::System => NativeHandle::None,
            MemoryDomain::DeviceSurface => {
                let display = parent.and_then(|p| p.display()).ok_or_else(|| {
                    Error::InvalidHandle("no display handle in parent context".to_owned())
                })?;
                check_display(display.as_ref())?;
                NativeHandle::Display(Arc::clone(display))
            }
            MemoryDomain::SharedBuffer => {
                NativeHandle::Allocator(parent.and_then(|p| p.allocator().cloned()).or_else(open_heap))
            }
            MemoryDomain::AcceleratorTensor => {
                NativeHandle::Remote(parent.and_then(|p| p.remote().cloned()))
            }
        };
        debug!(%domain, parent = parent.is_some(), "context created");
        Ok(Arc::new(Self::build(domain, handle, parent)))
    }

    pub fn system() -> Arc<Self> {
        Arc::new(Self::build(MemoryDomain::System, NativeHandle::None, None))
    }

    /// Root device-surface context over a host-supplied display.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] when the display fails its integrity
    /// check.
    pub fn with_display(display: Arc<dyn SurfaceDisplay>) -> Result<Arc<Self>> {
        check_display(display.as_ref())?;
        Ok(Arc::new(Self::build(
            MemoryDomain::DeviceSurface,
            NativeHandle::Display(display),
            None,
        )))
    }

    /// Root shared-buffer context allocating through `allocator`.
    pub fn with_allocator(allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Arc::new(Self::build(
            MemoryDomain::SharedBuffer,
            NativeHandle::Allocator(Some(allocator)),
            None,
        ))
    }

    /// Accelerator context, optionally bound to an engine remote context.
    pub fn accelerator(
        remote: Option<Arc<dyn RemoteContext>>,
        parent: Option<&Arc<Context>>,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            MemoryDomain::AcceleratorTensor,
            NativeHandle::Remote(remote),
            parent,
        ))
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    /// The context this one was derived from, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Context>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn display(&self) -> Option<&Arc<dyn SurfaceDisplay>> {
        match &self.handle {
            NativeHandle::Display(d) => Some(d),
            _ => None,
        }
    }

    pub fn allocator(&self) -> Option<&Arc<dyn BufferAllocator>> {
        match &self.handle {
            NativeHandle::Allocator(a) => a.as_ref(),
            _ => None,
        }
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteContext>> {
        match &self.handle {
            NativeHandle::Remote(r) => r.as_ref(),
            _ => None,
        }
    }

    /// Mapper converting buffers of `input`'s domain into `output`'s domain.
    ///
    /// The mapper is resolved once per domain pair and cached in this
    /// context. Returns `None` when the pair has no registered conversion or
    /// the destination lacks the native handle the conversion needs.
    pub fn get_mapper(&self, input: &Context, output: &Context) -> Option<Arc<Mapper>> {
        let key = (input.domain, output.domain);
        if let Some(mapper) = self
            .mappers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(Arc::clone(mapper));
        }

        let mapper = Arc::new(Mapper::resolve(input, output)?);
        let mut cache = self.mappers.write().unwrap_or_else(PoisonError::into_inner);
        let cached = cache.entry(key).or_insert_with(|| {
            debug!(from = %key.0, to = %key.1, "mapper attached");
            mapper
        });
        Some(Arc::clone(cached))
    }

    /// Number of mappers cached in this context.
    pub fn cached_mappers(&self) -> usize {
        self.mappers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn check_display(display: &dyn SurfaceDisplay) -> Result<()> {
    if !is_valid_display(display) {
        return Err(Error::InvalidHandle(format!(
            "display magic {:#x} does not match",
            display.magic()
        )));
    }
    Ok(())
}

fn open_heap() -> Option<Arc<dyn BufferAllocator>> {
    match DmaHeapAllocator::system().or_else(|_| DmaHeapAllocator::cma()) {
        Ok(heap) => Some(Arc::new(heap)),
        Err(e) => {
            debug!("no dma-heap available: {e}");
            None
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let handle = match &self.handle {
            NativeHandle::None => "none",
            NativeHandle::Display(_) => "display",
            NativeHandle::Allocator(Some(_)) => "allocator",
            NativeHandle::Allocator(None) => "no allocator",
            NativeHandle::Remote(Some(_)) => "remote",
            NativeHandle::Remote(None) => "no remote",
        };
        f.debug_struct("Context")
            .field("domain", &self.domain)
            .field("handle", &handle)
            .field("mappers", &self.cached_mappers())
            .finish()
    }
}
