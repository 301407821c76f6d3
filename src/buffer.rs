// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Backing memory for tensors in every memory domain.
//!
//! Host memory lives on the heap or aliases a memory-mapped shared buffer,
//! shared buffers are DMA-capable file descriptors allocated from a dma-heap
//! (or a memfd where no heap is available), device surfaces are handles owned
//! by a [`SurfaceDisplay`], and remote tensors are opaque accelerator memory
//! owned by the inference engine.

use crate::{
    error::{Error, Result},
    memory::{AccessMode, ImageFormat, MemoryDomain},
};
use core::fmt;
use dma_buf::DmaBuf;
use dma_heap::{Heap, HeapKind};
use std::{
    ffi::{c_void, CString},
    io,
    ops::{Deref, DerefMut},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd},
        unix::io::OwnedFd,
    },
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{debug, warn};

/// Source of shareable, mmap-able file descriptors.
pub trait BufferAllocator: Send + Sync {
    /// Allocates `len` bytes and returns the owning descriptor.
    fn allocate(&self, len: usize) -> io::Result<OwnedFd>;

    fn name(&self) -> &str;
}

/// Allocator backed by a Linux dma-heap (`/dev/dma_heap/*`).
pub struct DmaHeapAllocator {
    heap: Heap,
    name: &'static str,
}

impl DmaHeapAllocator {
    /// Opens the CMA heap, required by most hardware accelerators.
    pub fn cma() -> io::Result<Self> {
        Self::open(HeapKind::Cma, "cma")
    }

    /// Opens the system heap.
    pub fn system() -> io::Result<Self> {
        Self::open(HeapKind::System, "system")
    }

    fn open(kind: HeapKind, name: &'static str) -> io::Result<Self> {
        let heap = Heap::new(kind).map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self { heap, name })
    }
}

impl BufferAllocator for DmaHeapAllocator {
    fn allocate(&self, len: usize) -> io::Result<OwnedFd> {
        self.heap
            .allocate(len)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// Allocator backed by anonymous memfd files. Used where no dma-heap is
/// exposed; the descriptors are shareable and mmap-able but not
/// physically contiguous.
#[derive(Default)]
pub struct MemfdAllocator;

impl BufferAllocator for MemfdAllocator {
    fn allocate(&self, len: usize) -> io::Result<OwnedFd> {
        let name = CString::new("edgefirst-inference").map_err(io::Error::other)?;
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn name(&self) -> &str {
        "memfd"
    }
}

/// DMA-capable buffer shared by file descriptor.
///
/// The descriptor is closed when the buffer is dropped; mapped views and
/// surfaces imported from it hold an `Arc` to keep it alive.
#[derive(Debug)]
pub struct SharedBuffer {
    fd: OwnedFd,
    len: usize,
}

impl SharedBuffer {
    /// Allocates a new buffer of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator cannot provide the memory.
    pub fn allocate(allocator: &dyn BufferAllocator, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::NullData("zero-sized shared buffer".to_owned()));
        }
        let fd = allocator.allocate(len)?;
        debug!(len, allocator = allocator.name(), "shared buffer allocated");
        Ok(Self { fd, len })
    }

    /// Wraps an existing descriptor, for example one exported by a camera or
    /// a display.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Self {
        Self { fd, len }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Duplicates the descriptor as a [`DmaBuf`] for cache-synchronized CPU
    /// access.
    pub fn dmabuf(&self) -> Result<DmaBuf> {
        let fd = self.fd.try_clone()?;
        Ok(DmaBuf::from(fd))
    }

    /// Maps the whole buffer into the process address space.
    ///
    /// # Errors
    ///
    /// Returns the OS error when `mmap` fails.
    pub fn mmap(&self, access: AccessMode) -> io::Result<MappedRegion> {
        let prot = if access.writable() {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                self.len,
                prot,
                libc::MAP_SHARED,
                self.raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MappedRegion {
            ptr: ptr.cast::<u8>(),
            len: self.len,
            writable: access.writable(),
        })
    }
}

impl fmt::Display for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} bytes fd:{:?}", self.len, self.fd)
    }
}

/// Memory-mapped view of a [`SharedBuffer`].
///
/// The mapping is removed when dropped.
///
/// # Safety
///
/// While the API is safe, concurrent access from hardware and CPU can lead to
/// races. Hardware operations must complete before CPU access.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
    writable: bool,
}

// The region is plain memory; synchronization is the owner's concern.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable bytes, `None` for a read-only mapping.
    pub fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        if !self.writable {
            return None;
        }
        Some(unsafe { from_raw_parts_mut(self.ptr, self.len) })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}

enum HostStorage {
    Heap(Box<[u8]>),
    Mapped {
        region: MappedRegion,
        _source: Arc<SharedBuffer>,
    },
}

impl HostStorage {
    fn as_slice(&self) -> &[u8] {
        match self {
            HostStorage::Heap(data) => &data[..],
            HostStorage::Mapped { region, .. } => region.as_slice(),
        }
    }

    fn as_slice_mut(&mut self) -> &mut [u8] {
        match self {
            HostStorage::Heap(data) => &mut data[..],
            // only writable storage hands out a HostWrite
            HostStorage::Mapped { region, .. } => region.as_slice_mut().unwrap_or_default(),
        }
    }
}

/// Host-addressable memory, either owned or aliasing a mapped shared buffer.
pub struct HostMemory {
    storage: RwLock<HostStorage>,
    len: usize,
}

impl HostMemory {
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            storage: RwLock::new(HostStorage::Heap(data.into_boxed_slice())),
            len,
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Aliases `source` through a mapping with `access`. No bytes are copied.
    pub fn mapped(source: Arc<SharedBuffer>, access: AccessMode) -> io::Result<Self> {
        let region = source.mmap(access)?;
        let len = region.len();
        Ok(Self {
            storage: RwLock::new(HostStorage::Mapped {
                region,
                _source: source,
            }),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether [`write`](Self::write) is allowed.
    pub fn is_writable(&self) -> bool {
        match &*self.read_storage() {
            HostStorage::Heap(_) => true,
            HostStorage::Mapped { region, .. } => region.is_writable(),
        }
    }

    /// Whether the memory aliases a shared buffer.
    pub fn is_mapped(&self) -> bool {
        matches!(*self.read_storage(), HostStorage::Mapped { .. })
    }

    pub fn read(&self) -> HostRead<'_> {
        HostRead(self.read_storage())
    }

    /// Exclusive access to the bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Map`] when the memory aliases a read-only mapping.
    pub fn write(&self) -> Result<HostWrite<'_>> {
        let storage = self.storage.write().unwrap_or_else(PoisonError::into_inner);
        if let HostStorage::Mapped { region, .. } = &*storage {
            if !region.is_writable() {
                return Err(Error::Map(format!(
                    "{} byte host view of a read-only mapping",
                    self.len
                )));
            }
        }
        Ok(HostWrite(storage))
    }

    fn read_storage(&self) -> RwLockReadGuard<'_, HostStorage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.len)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Shared read lock on [`HostMemory`].
pub struct HostRead<'a>(RwLockReadGuard<'a, HostStorage>);

impl Deref for HostRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Exclusive write lock on [`HostMemory`].
pub struct HostWrite<'a>(RwLockWriteGuard<'a, HostStorage>);

impl Deref for HostWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl DerefMut for HostWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.0.as_slice_mut()
    }
}

/// Magic number found at the start of a valid VA display structure.
pub const DISPLAY_MAGIC: u32 = 0x5641_4430;

/// Identifier of a surface within its display.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

/// A surface exported as a DMA buffer.
#[derive(Debug)]
pub struct ExportedSurface {
    pub fd: OwnedFd,
    pub len: usize,
}

/// Native display owning hardware surfaces. Implemented by the driver
/// binding supplied by the host application.
pub trait SurfaceDisplay: Send + Sync {
    /// Integrity word of the underlying display; valid displays report
    /// [`DISPLAY_MAGIC`].
    fn magic(&self) -> u32;

    /// Exports the surface memory as a DMA buffer descriptor.
    fn export_surface(&self, id: SurfaceId) -> io::Result<ExportedSurface>;

    /// Creates a surface backed by the given DMA buffer.
    fn import_surface(
        &self,
        buffer: &SharedBuffer,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> io::Result<SurfaceId>;

    fn destroy_surface(&self, id: SurfaceId);
}

/// Validates a display handle against [`DISPLAY_MAGIC`].
pub fn is_valid_display(display: &dyn SurfaceDisplay) -> bool {
    display.magic() == DISPLAY_MAGIC
}

/// Hardware surface owned by a [`SurfaceDisplay`].
pub struct Surface {
    id: SurfaceId,
    width: u32,
    height: u32,
    format: ImageFormat,
    display: Arc<dyn SurfaceDisplay>,
    owned: bool,
    _backing: Option<Arc<SharedBuffer>>,
}

impl Surface {
    /// Wraps a surface owned by the host (for example a decoder output).
    /// The surface is not destroyed on drop.
    pub fn borrowed(
        display: Arc<dyn SurfaceDisplay>,
        id: SurfaceId,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Self {
        Self {
            id,
            width,
            height,
            format,
            display,
            owned: false,
            _backing: None,
        }
    }

    /// Imports `backing` as a new surface that aliases its memory. The
    /// surface keeps the buffer alive and is destroyed on drop.
    pub fn import(
        display: Arc<dyn SurfaceDisplay>,
        backing: Arc<SharedBuffer>,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> io::Result<Self> {
        let id = display.import_surface(&backing, width, height, format)?;
        debug!(?id, width, height, ?format, "surface imported");
        Ok(Self {
            id,
            width,
            height,
            format,
            display,
            owned: true,
            _backing: Some(backing),
        })
    }

    /// Exports the surface memory. The returned buffer aliases the surface.
    pub fn export(&self) -> io::Result<SharedBuffer> {
        let exported = self.display.export_surface(self.id)?;
        Ok(SharedBuffer::from_fd(exported.fd, exported.len))
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn display(&self) -> &Arc<dyn SurfaceDisplay> {
        &self.display
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if self.owned {
            self.display.destroy_surface(self.id);
            debug!(id = ?self.id, "surface destroyed");
        }
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Surface({} {}x{} {:?})",
            self.id.0, self.width, self.height, self.format
        )
    }
}

/// Accelerator-private tensor memory owned by an inference engine.
pub trait RemoteTensor: Send + Sync {
    /// Size in bytes.
    fn len(&self) -> usize;

    /// Copies the tensor contents into host memory.
    fn read_into(&self, dst: &mut [u8]) -> io::Result<()>;
}

/// Backing storage of one tensor.
#[derive(Clone)]
pub enum Buffer {
    Host(Arc<HostMemory>),
    Shared(Arc<SharedBuffer>),
    Surface(Arc<Surface>),
    Remote(Arc<dyn RemoteTensor>),
}

impl Buffer {
    /// Whether this storage is legal for tensors of `domain`.
    pub fn allowed_in(&self, domain: MemoryDomain) -> bool {
        matches!(
            (self, domain),
            (Buffer::Host(_), MemoryDomain::System)
                | (Buffer::Shared(_), MemoryDomain::SharedBuffer)
                | (Buffer::Surface(_), MemoryDomain::DeviceSurface)
                | (Buffer::Host(_), MemoryDomain::AcceleratorTensor)
                | (Buffer::Remote(_), MemoryDomain::AcceleratorTensor)
        )
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::Host(m) => m.len(),
            Buffer::Shared(b) => b.len(),
            Buffer::Surface(s) => s.format().image_size(s.width(), s.height()),
            Buffer::Remote(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps the storage into a host view.
    ///
    /// # Errors
    ///
    /// Surfaces cannot be addressed by the host and must first be mapped to a
    /// shared buffer. Remote tensors are read-only from the host.
    pub fn map(&self, access: AccessMode) -> Result<BufferView<'_>> {
        match self {
            Buffer::Host(mem) if access.writable() => Ok(BufferView::Write(mem.write()?)),
            Buffer::Host(mem) => Ok(BufferView::Read(mem.read())),
            Buffer::Shared(buf) => Ok(BufferView::Region(buf.mmap(access)?)),
            Buffer::Surface(surface) => Err(Error::UnsupportedInput(format!(
                "{surface:?} is not host addressable, map it to a shared buffer first"
            ))),
            Buffer::Remote(_) if access.writable() => Err(Error::Map(
                "remote tensors are read-only from the host".to_owned(),
            )),
            Buffer::Remote(remote) => {
                let mut data = vec![0; remote.len()];
                remote.read_into(&mut data)?;
                Ok(BufferView::Owned(data))
            }
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Buffer::Host(m) => write!(f, "{m:?}"),
            Buffer::Shared(b) => write!(f, "SharedBuffer({b})"),
            Buffer::Surface(s) => write!(f, "{s:?}"),
            Buffer::Remote(r) => write!(f, "RemoteTensor({} bytes)", r.len()),
        }
    }
}

/// Host view over a [`Buffer`], valid for the lifetime of the borrow.
pub enum BufferView<'a> {
    Read(HostRead<'a>),
    Write(HostWrite<'a>),
    Region(MappedRegion),
    Owned(Vec<u8>),
}

impl BufferView<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BufferView::Read(g) => &g[..],
            BufferView::Write(g) => &g[..],
            BufferView::Region(r) => r.as_slice(),
            BufferView::Owned(v) => &v[..],
        }
    }

    /// Mutable bytes, `None` for read-only views.
    pub fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            BufferView::Write(g) => Some(&mut g[..]),
            BufferView::Region(r) => r.as_slice_mut(),
            BufferView::Read(_) | BufferView::Owned(_) => None,
        }
    }

    /// Reinterprets the bytes as `f32` without copying when aligned.
    pub fn as_f32(&self) -> Option<&[f32]> {
        let bytes = self.as_slice();
        let (head, body, tail) = unsafe { bytes.align_to::<f32>() };
        if head.is_empty() && tail.is_empty() {
            Some(body)
        } else {
            None
        }
    }
}
