// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory mapper registry.
//!
//! The set of legal conversions between memory domains is closed and known
//! at compile time. A [`Mapper`] is resolved for one ordered domain pair when
//! first looked up through a [`Context`] and captures the native handles its
//! strategy needs, so mapping a frame never reconstructs native resources.

use crate::{
    buffer::{Buffer, BufferAllocator, HostMemory, SharedBuffer, Surface, SurfaceDisplay},
    context::Context,
    engine::RemoteContext,
    error::{Error, Result},
    frame::{Frame, Tensor},
    memory::{AccessMode, FrameInfo, MediaType, MemoryDomain},
};
use std::{collections::VecDeque, fmt, sync::Arc};
use tracing::trace;

use crate::memory::MemoryDomain::{AcceleratorTensor, DeviceSurface, SharedBuffer as Shared, System};

/// Ordered domain pairs with a registered conversion, besides identity.
pub const CONVERSIONS: [(MemoryDomain, MemoryDomain); 7] = [
    (System, AcceleratorTensor),
    (AcceleratorTensor, System),
    (Shared, System),
    (System, Shared),
    (DeviceSurface, Shared),
    (Shared, DeviceSurface),
    (DeviceSurface, AcceleratorTensor),
];

/// Whether a conversion from `from` to `to` is registered.
pub fn is_registered(from: MemoryDomain, to: MemoryDomain) -> bool {
    from == to || CONVERSIONS.contains(&(from, to))
}

/// Shortest sequence of domains leading from `from` to `to` over the
/// registered conversions, both ends included.
pub fn route(from: MemoryDomain, to: MemoryDomain) -> Option<Vec<MemoryDomain>> {
    route_with(from, to, |_, _| true)
}

/// [`route`] over the conversions accepted by `usable`.
fn route_with(
    from: MemoryDomain,
    to: MemoryDomain,
    usable: impl Fn(MemoryDomain, MemoryDomain) -> bool,
) -> Option<Vec<MemoryDomain>> {
    if from == to {
        return Some(vec![from]);
    }
    let mut queue = VecDeque::from([vec![from]]);
    while let Some(path) = queue.pop_front() {
        let last = *path.last()?;
        for (_, next) in CONVERSIONS.iter().filter(|(src, _)| *src == last) {
            if path.contains(next) || !usable(last, *next) {
                continue;
            }
            let mut extended = path.clone();
            extended.push(*next);
            if *next == to {
                return Some(extended);
            }
            queue.push_back(extended);
        }
    }
    None
}

/// How a mapper converts the buffers of a frame.
#[derive(Clone)]
pub enum Strategy {
    Identity,
    /// Host memory is handed to the engine as is.
    HostToTensor,
    /// Host-visible tensors are aliased, remote tensors are read back.
    TensorToHost,
    /// The DMA buffer is mapped into the process.
    SharedToHost,
    /// A new DMA buffer is allocated and the host bytes copied into it.
    HostToShared(Arc<dyn BufferAllocator>),
    /// The surface is exported as a DMA descriptor aliasing its memory.
    SurfaceToShared,
    /// The DMA descriptor is imported as a surface of the display.
    SharedToSurface(Arc<dyn SurfaceDisplay>),
    /// The surface is shared with the engine through its remote context.
    SurfaceToTensor(Arc<dyn RemoteContext>),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Strategy::Identity => "Identity",
            Strategy::HostToTensor => "HostToTensor",
            Strategy::TensorToHost => "TensorToHost",
            Strategy::SharedToHost => "SharedToHost",
            Strategy::HostToShared(a) => return write!(f, "HostToShared({})", a.name()),
            Strategy::SurfaceToShared => "SurfaceToShared",
            Strategy::SharedToSurface(_) => "SharedToSurface",
            Strategy::SurfaceToTensor(r) => return write!(f, "SurfaceToTensor({})", r.device()),
        };
        f.write_str(name)
    }
}

/// Conversion between one ordered pair of memory domains.
#[derive(Debug)]
pub struct Mapper {
    input: MemoryDomain,
    output: MemoryDomain,
    strategy: Strategy,
}

impl Mapper {
    /// Resolves the strategy for `input` to `output`, capturing the native
    /// handle of the destination where one is needed.
    pub(crate) fn resolve(input: &Context, output: &Context) -> Option<Self> {
        let strategy = match (input.domain(), output.domain()) {
            (a, b) if a == b => Strategy::Identity,
            (System, AcceleratorTensor) => Strategy::HostToTensor,
            (AcceleratorTensor, System) => Strategy::TensorToHost,
            (Shared, System) => Strategy::SharedToHost,
            (System, Shared) => Strategy::HostToShared(Arc::clone(output.allocator()?)),
            (DeviceSurface, Shared) => Strategy::SurfaceToShared,
            (Shared, DeviceSurface) => Strategy::SharedToSurface(Arc::clone(output.display()?)),
            (DeviceSurface, AcceleratorTensor) => {
                Strategy::SurfaceToTensor(Arc::clone(output.remote()?))
            }
            _ => return None,
        };
        Some(Self {
            input: input.domain(),
            output: output.domain(),
            strategy,
        })
    }

    pub fn input(&self) -> MemoryDomain {
        self.input
    }

    pub fn output(&self) -> MemoryDomain {
        self.output
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Whether the mapped frame aliases the source memory. Reading back
    /// remote tensors copies, so `TensorToHost` does not qualify.
    pub fn is_zero_copy(&self) -> bool {
        !matches!(
            self.strategy,
            Strategy::HostToShared(_) | Strategy::TensorToHost
        )
    }

    /// Maps `frame` into the output domain.
    ///
    /// Pending frames are waited on first. The result keeps `frame` alive as
    /// its parent so aliased memory outlives every view of it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInput`] when the frame is not in this
    /// mapper's input domain or a buffer cannot be represented in the output
    /// domain, and propagates native mapping failures.
    pub fn map(
        &self,
        frame: &Arc<Frame>,
        access: AccessMode,
        context: Option<&Arc<Context>>,
    ) -> Result<Arc<Frame>> {
        if frame.domain() != self.input {
            return Err(Error::UnsupportedInput(format!(
                "{} to {} mapper given a {} frame",
                self.input,
                self.output,
                frame.domain()
            )));
        }
        if let Strategy::Identity = self.strategy {
            return Ok(Arc::clone(frame));
        }

        let info = frame.info();
        let tensors = frame
            .wait()?
            .iter()
            .map(|tensor| self.map_tensor(tensor, info, access))
            .collect::<Result<Vec<_>>>()?;
        trace!(strategy = ?self.strategy, count = tensors.len(), "frame mapped");
        let mapped = Frame::derived(
            info.in_domain(self.output),
            tensors,
            Arc::clone(frame),
            context.cloned(),
        )?;
        Ok(Arc::new(mapped))
    }

    fn map_tensor(&self, tensor: &Tensor, frame: &FrameInfo, access: AccessMode) -> Result<Tensor> {
        let info = tensor.info().clone();
        let buffer = match (&self.strategy, tensor.buffer()) {
            (Strategy::HostToTensor, Buffer::Host(mem)) => Buffer::Host(Arc::clone(mem)),
            (Strategy::TensorToHost, Buffer::Host(mem)) => Buffer::Host(Arc::clone(mem)),
            (Strategy::TensorToHost, Buffer::Remote(remote)) => {
                let mut data = vec![0; remote.len()];
                remote.read_into(&mut data)?;
                Buffer::Host(Arc::new(HostMemory::from_vec(data)))
            }
            (Strategy::SharedToHost, Buffer::Shared(shared)) => {
                Buffer::Host(Arc::new(HostMemory::mapped(Arc::clone(shared), access)?))
            }
            (Strategy::HostToShared(allocator), Buffer::Host(mem)) => {
                let shared = SharedBuffer::allocate(allocator.as_ref(), mem.len())?;
                let mut region = shared.mmap(AccessMode::ReadWrite)?;
                region
                    .as_slice_mut()
                    .ok_or_else(|| Error::Map(format!("{shared} mapped read-only")))?
                    .copy_from_slice(&mem.read());
                drop(region);
                Buffer::Shared(Arc::new(shared))
            }
            (Strategy::SurfaceToShared, Buffer::Surface(surface)) => {
                Buffer::Shared(Arc::new(surface.export()?))
            }
            (Strategy::SharedToSurface(display), Buffer::Shared(shared)) => {
                let MediaType::Image(format) = frame.media else {
                    return Err(Error::UnsupportedInput(
                        "only image frames can become surfaces".to_owned(),
                    ));
                };
                let (width, height) = info.image_dims().ok_or_else(|| {
                    Error::UnsupportedShape(format!("{info} does not describe an image"))
                })?;
                let surface = Surface::import(
                    Arc::clone(display),
                    Arc::clone(shared),
                    width as u32,
                    height as u32,
                    format,
                )?;
                Buffer::Surface(Arc::new(surface))
            }
            (Strategy::SurfaceToTensor(remote), Buffer::Surface(surface)) => {
                Buffer::Remote(remote.import_surface(surface, &info)?)
            }
            (strategy, buffer) => {
                return Err(Error::UnsupportedInput(format!(
                    "{strategy:?} cannot map {buffer:?} for {access:?} access"
                )))
            }
        };
        Ok(Tensor::new(info, buffer))
    }
}

/// Whether `output` holds the native handle a conversion from `from` needs.
fn has_handle(from: MemoryDomain, output: &Context) -> bool {
    match (from, output.domain()) {
        (System, Shared) => output.allocator().is_some(),
        (Shared, DeviceSurface) => output.display().is_some(),
        (DeviceSurface, AcceleratorTensor) => output.remote().is_some(),
        _ => true,
    }
}

/// Mapper lookup between two contexts, cached in the destination context.
pub fn get_mapper(input: &Context, output: &Context) -> Option<Arc<Mapper>> {
    output.get_mapper(input, output)
}

/// Several mappers applied in sequence, for domain pairs without a direct
/// conversion.
#[derive(Debug, Clone)]
pub struct MapperChain {
    mappers: Vec<Arc<Mapper>>,
    contexts: Vec<Arc<Context>>,
}

impl MapperChain {
    /// Chain passing through each context in order. The first context is the
    /// source, the last the destination.
    pub fn new(contexts: &[Arc<Context>]) -> Option<Self> {
        let mappers = contexts
            .windows(2)
            .map(|pair| get_mapper(&pair[0], &pair[1]))
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            mappers,
            contexts: contexts.iter().skip(1).cloned().collect(),
        })
    }

    /// Chain from `input` to `output` along the shortest usable [`route`],
    /// creating intermediate contexts as children of `output`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedInput`] when no route or mapper exists.
    pub fn between(input: &Arc<Context>, output: &Arc<Context>) -> Result<Self> {
        let unsupported = || {
            Error::UnsupportedInput(format!(
                "no conversion from {} to {}",
                input.domain(),
                output.domain()
            ))
        };
        // conversions into `output` that lack its native handle are routed
        // around, e.g. surfaces reach an accelerator without a remote
        // context through host memory
        let domains = route_with(input.domain(), output.domain(), |from, to| {
            to != output.domain() || has_handle(from, output)
        })
        .ok_or_else(unsupported)?;
        let mut contexts = vec![Arc::clone(input)];
        if let [_, inner @ .., _] = domains.as_slice() {
            for domain in inner {
                contexts.push(Context::create(*domain, Some(output))?);
            }
        }
        if domains.len() > 1 {
            contexts.push(Arc::clone(output));
        }
        Self::new(&contexts).ok_or_else(unsupported)
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    pub fn is_zero_copy(&self) -> bool {
        self.mappers.iter().all(|m| m.is_zero_copy())
    }

    /// Applies every mapper in turn; an empty chain returns `frame`.
    pub fn map(&self, frame: &Arc<Frame>, access: AccessMode) -> Result<Arc<Frame>> {
        self.mappers
            .iter()
            .zip(&self.contexts)
            .try_fold(Arc::clone(frame), |frame, (mapper, context)| {
                mapper.map(&frame, access, Some(context))
            })
    }
}
