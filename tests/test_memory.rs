// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::{nv12_surface, shared_buffer, FakeDisplay};
use dma_buf::MappedDmaBuf;
use edgefirst_inference::{
    buffer::{DmaHeapAllocator, HostMemory, MemfdAllocator, SharedBuffer, SurfaceDisplay},
    completion,
    context::Context,
    frame::{Frame, Tensor},
    mapper::{self, route, MapperChain, Strategy},
    memory::{AccessMode, DataType, FrameInfo, ImageFormat, TensorInfo},
    Error,
};
use serial_test::serial;
use std::{
    error::Error as StdError,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use edgefirst_inference::memory::MemoryDomain::{
    AcceleratorTensor, DeviceSurface, SharedBuffer as Shared, System,
};

fn host_frame(bytes: &[u8]) -> Result<Arc<Frame>, Box<dyn StdError>> {
    let info = TensorInfo::new(vec![bytes.len()], DataType::U8);
    let tensor = Tensor::from_host(info, bytes.to_vec())?;
    Ok(Arc::new(Frame::from_tensors(System, vec![tensor])?))
}

fn read_all(frame: &Frame) -> Result<Vec<u8>, Box<dyn StdError>> {
    let view = frame.map(AccessMode::Read)?;
    Ok(view.get(0).ok_or("no tensor")?.as_slice().to_vec())
}

#[test]
fn test_routes() {
    assert_eq!(route(System, System), Some(vec![System]));
    assert_eq!(
        route(System, AcceleratorTensor),
        Some(vec![System, AcceleratorTensor])
    );
    assert_eq!(
        route(DeviceSurface, System),
        Some(vec![DeviceSurface, Shared, System])
    );
    assert_eq!(
        route(Shared, AcceleratorTensor),
        Some(vec![Shared, System, AcceleratorTensor])
    );
    assert_eq!(
        route(AcceleratorTensor, DeviceSurface),
        Some(vec![AcceleratorTensor, System, Shared, DeviceSurface])
    );

    assert!(mapper::is_registered(DeviceSurface, AcceleratorTensor));
    assert!(!mapper::is_registered(AcceleratorTensor, DeviceSurface));
    assert!(!mapper::is_registered(DeviceSurface, System));
}

#[test]
fn test_context_handles() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    assert_eq!(system.domain(), System);
    assert!(system.display().is_none());

    let err = Context::create(DeviceSurface, None).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)), "{err}");
    let err = Context::create(DeviceSurface, Some(&system)).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)), "{err}");

    let err = Context::with_display(FakeDisplay::with_magic(0xdead_beef)).unwrap_err();
    assert!(matches!(err, Error::InvalidHandle(_)), "{err}");

    let display = Context::with_display(FakeDisplay::new())?;
    let child = Context::create(DeviceSurface, Some(&display))?;
    assert!(Arc::ptr_eq(
        child.display().ok_or("no display")?,
        display.display().ok_or("no display")?
    ));
    assert!(Arc::ptr_eq(&child.parent().ok_or("no parent")?, &display));

    let shared = Context::with_allocator(Arc::new(MemfdAllocator));
    let child = Context::create(Shared, Some(&shared))?;
    assert_eq!(child.allocator().map(|a| a.name()), Some("memfd"));

    let accelerator = Context::accelerator(None, Some(&system));
    assert!(accelerator.remote().is_none());
    Ok(())
}

#[test]
fn test_mapper_cached_once() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let accelerator = Context::accelerator(None, None);
    assert_eq!(accelerator.cached_mappers(), 0);

    let first = mapper::get_mapper(&system, &accelerator).ok_or("no mapper")?;
    let second = mapper::get_mapper(&system, &accelerator).ok_or("no mapper")?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(accelerator.cached_mappers(), 1);
    assert_eq!(first.input(), System);
    assert_eq!(first.output(), AcceleratorTensor);
    assert!(first.is_zero_copy());

    // the lookup is cached in the destination only
    assert_eq!(system.cached_mappers(), 0);
    Ok(())
}

#[test]
fn test_mapper_unregistered_or_missing_handle() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let accelerator = Context::accelerator(None, None);
    let surfaces = Context::with_display(FakeDisplay::new())?;

    assert!(mapper::get_mapper(&surfaces, &system).is_none());
    assert!(mapper::get_mapper(&accelerator, &surfaces).is_none());
    // no remote context to share surfaces through
    assert!(mapper::get_mapper(&surfaces, &accelerator).is_none());
    assert_eq!(accelerator.cached_mappers(), 0);
    Ok(())
}

#[test]
fn test_identity_mapper() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let identity = mapper::get_mapper(&system, &system).ok_or("no mapper")?;
    assert!(matches!(identity.strategy(), Strategy::Identity));

    let frame = host_frame(b"abcd")?;
    let mapped = identity.map(&frame, AccessMode::Read, None)?;
    assert!(Arc::ptr_eq(&frame, &mapped));
    Ok(())
}

#[test]
fn test_mapper_rejects_wrong_domain() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let accelerator = Context::accelerator(None, None);
    let mapper = mapper::get_mapper(&accelerator, &system).ok_or("no mapper")?;

    let frame = host_frame(b"abcd")?;
    let err = mapper.map(&frame, AccessMode::Read, None).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInput(_)), "{err}");
    Ok(())
}

#[test]
fn test_shared_to_system_aliases() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let shared = Context::with_allocator(Arc::new(MemfdAllocator));
    let mapper = mapper::get_mapper(&shared, &system).ok_or("no mapper")?;
    assert!(mapper.is_zero_copy());

    let buffer = shared_buffer(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let info = TensorInfo::new(vec![8], DataType::U8);
    let tensor = Tensor::from_shared(info, Arc::clone(&buffer))?;
    let frame = Arc::new(Frame::from_tensors(Shared, vec![tensor])?);

    let mapped = mapper.map(&frame, AccessMode::ReadWrite, Some(&system))?;
    assert_eq!(mapped.domain(), System);
    assert!(Arc::ptr_eq(mapped.parent().ok_or("no parent")?, &frame));
    assert!(Arc::ptr_eq(mapped.context().ok_or("no context")?, &system));
    assert_eq!(read_all(&mapped)?, [1, 2, 3, 4, 5, 6, 7, 8]);

    // writes through the host view land in the shared buffer
    {
        let mut view = mapped.map(AccessMode::Write)?;
        let tensor = view.get_mut(0).ok_or("no tensor")?;
        tensor.as_slice_mut().ok_or("read-only view")?[0] = 42;
    }
    let region = buffer.mmap(AccessMode::Read)?;
    assert_eq!(region.as_slice()[0], 42);
    Ok(())
}

#[test]
fn test_system_to_shared_copies() -> Result<(), Box<dyn StdError>> {
    let system = Context::system();
    let shared = Context::with_allocator(Arc::new(MemfdAllocator));
    let to_shared = mapper::get_mapper(&system, &shared).ok_or("no mapper")?;
    assert!(matches!(to_shared.strategy(), Strategy::HostToShared(_)));
    assert!(!to_shared.is_zero_copy());

    let frame = host_frame(b"edgefirst")?;
    let mapped = to_shared.map(&frame, AccessMode::Read, Some(&shared))?;
    assert_eq!(mapped.domain(), Shared);

    let back = MapperChain::new(&[Arc::clone(&shared), Arc::clone(&system)]).ok_or("no chain")?;
    let host = back.map(&mapped, AccessMode::Read)?;
    assert_eq!(read_all(&host)?, b"edgefirst");
    Ok(())
}

#[test]
fn test_surface_round_trip() -> Result<(), Box<dyn StdError>> {
    let display = FakeDisplay::new();
    let dyn_display: Arc<dyn SurfaceDisplay> = display.clone();
    let surfaces = Context::with_display(dyn_display)?;
    let shared = Context::create(Shared, Some(&surfaces))?;
    let system = Context::system();

    // 4x4 NV12
    let pixels = (0..24).collect::<Vec<u8>>();
    let info = TensorInfo::new(vec![1, 3, 4, 4], DataType::U8);
    let frame = Arc::new(Frame::new(
        FrameInfo::image(ImageFormat::NV12, Shared, vec![info.clone()]),
        vec![Tensor::from_shared(info.clone(), shared_buffer(&pixels))?],
    )?);

    let to_surface = mapper::get_mapper(&shared, &surfaces).ok_or("no mapper")?;
    let surface = to_surface.map(&frame, AccessMode::Read, Some(&surfaces))?;
    assert_eq!(surface.domain(), DeviceSurface);
    assert_eq!(display.live(), 1);

    let chain = MapperChain::between(&surfaces, &system)?;
    assert_eq!(chain.len(), 2);
    assert!(chain.is_zero_copy());
    let host = chain.map(&surface, AccessMode::Read)?;
    assert_eq!(read_all(&host)?, pixels);

    drop(host);
    drop(surface);
    assert_eq!(display.live(), 0);
    Ok(())
}

#[test]
fn test_surface_needs_image_frame() -> Result<(), Box<dyn StdError>> {
    let surfaces = Context::with_display(FakeDisplay::new())?;
    let shared = Context::with_allocator(Arc::new(MemfdAllocator));

    let info = TensorInfo::new(vec![24], DataType::U8);
    let tensor = Tensor::from_shared(info, shared_buffer(&[0; 24]))?;
    let frame = Arc::new(Frame::from_tensors(Shared, vec![tensor])?);

    let mapper = mapper::get_mapper(&shared, &surfaces).ok_or("no mapper")?;
    let err = mapper.map(&frame, AccessMode::Read, None).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInput(_)), "{err}");
    Ok(())
}

#[test]
fn test_surfaces_are_not_host_addressable() -> Result<(), Box<dyn StdError>> {
    let display = FakeDisplay::new();
    let surface = nv12_surface(&display, 4, 4, &[0; 24]);
    let info = TensorInfo::new(vec![1, 3, 4, 4], DataType::U8);
    let frame = Frame::new(
        FrameInfo::image(ImageFormat::NV12, DeviceSurface, vec![info.clone()]),
        vec![Tensor::from_surface(info, surface)],
    )?;
    assert!(frame.map(AccessMode::Read).is_err());
    Ok(())
}

#[test]
fn test_chain_routes_around_missing_remote() -> Result<(), Box<dyn StdError>> {
    let display = FakeDisplay::new();
    let surfaces = Context::with_display(display.clone())?;
    let accelerator = Context::accelerator(None, None);

    let chain = MapperChain::between(&surfaces, &accelerator)?;
    assert_eq!(chain.len(), 3);

    let pixels = (0..24).rev().collect::<Vec<u8>>();
    let info = TensorInfo::new(vec![1, 3, 4, 4], DataType::U8);
    let frame = Arc::new(Frame::new(
        FrameInfo::image(ImageFormat::NV12, DeviceSurface, vec![info.clone()]),
        vec![Tensor::from_surface(info, nv12_surface(&display, 4, 4, &pixels))],
    )?);

    let tensor = chain.map(&frame, AccessMode::Read)?;
    assert_eq!(tensor.domain(), AcceleratorTensor);
    assert_eq!(read_all(&tensor)?, pixels);
    Ok(())
}

#[test]
fn test_frame_validation() -> Result<(), Box<dyn StdError>> {
    let info = TensorInfo::new(vec![4], DataType::U8);
    let host = Tensor::from_host(info.clone(), vec![0; 4])?;

    let err = Frame::from_tensors(Shared, vec![host.clone()]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedInput(_)), "{err}");

    let err = Frame::new(FrameInfo::tensors(System, vec![info.clone(); 2]), vec![host.clone()])
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");

    let err = Tensor::from_host(info, vec![0; 3]).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");

    // host memory is directly usable by the accelerator
    assert!(Frame::from_tensors(AcceleratorTensor, vec![host]).is_ok());
    Ok(())
}

#[test]
fn test_completion_shared_outcome() -> Result<(), Box<dyn StdError>> {
    let (promise, completion) = completion::channel();
    assert!(!completion.is_ready());

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let tensor = Tensor::from_f32(vec![2], &[1.0, 2.0]).unwrap();
        promise.fulfil(Ok(vec![tensor]));
    });

    let waiters = (0..3)
        .map(|_| {
            let completion = Arc::clone(&completion);
            thread::spawn(move || completion.wait().map(|t| t.len()).unwrap_or(0))
        })
        .collect::<Vec<_>>();
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), 1);
    }
    producer.join().unwrap();
    assert!(completion.is_ready());
    Ok(())
}

#[test]
#[serial]
fn test_completion_polled_while_waited() -> Result<(), Box<dyn StdError>> {
    let (promise, completion) = completion::channel();
    let waiter = {
        let completion = Arc::clone(&completion);
        thread::spawn(move || completion.wait().map(|t| t.len()).unwrap_or(0))
    };
    // let the waiter block inside wait()
    thread::sleep(Duration::from_millis(50));

    let polled = Instant::now();
    assert!(!completion.is_ready());
    assert!(polled.elapsed() < Duration::from_millis(40));

    let tensor = Tensor::from_f32(vec![1], &[3.0])?;
    promise.fulfil(Ok(vec![tensor]));
    assert_eq!(waiter.join().unwrap(), 1);
    assert!(completion.is_ready());
    Ok(())
}

#[test]
fn test_completion_failure() {
    let (promise, completion) = completion::channel();
    promise.fulfil(Err(Error::Inference("device lost".to_owned())));

    for _ in 0..2 {
        let err = completion.wait().unwrap_err();
        assert!(matches!(err, Error::RequestFailed(_)));
        assert!(matches!(err.root(), Error::Inference(_)), "{err}");
        assert!(err.is_recoverable());
    }

    let (promise, completion) = completion::channel();
    drop(promise);
    let err = completion.wait().unwrap_err();
    assert!(matches!(err.root(), Error::Inference(_)), "{err}");
}

#[test]
fn test_host_memory_views() -> Result<(), Box<dyn StdError>> {
    let memory = HostMemory::zeroed(8);
    assert!(!memory.is_mapped());
    memory.write()?[..2].copy_from_slice(&[7, 9]);
    assert_eq!(&memory.read()[..2], &[7, 9]);

    let mapped = HostMemory::mapped(shared_buffer(&[5; 16]), AccessMode::ReadWrite)?;
    assert!(mapped.is_mapped());
    assert!(mapped.is_writable());
    assert_eq!(mapped.len(), 16);
    assert_eq!(mapped.read()[15], 5);
    mapped.write()?[15] = 6;
    assert_eq!(mapped.read()[15], 6);
    Ok(())
}

#[test]
fn test_read_only_mapping_refuses_writes() -> Result<(), Box<dyn StdError>> {
    let buffer = shared_buffer(&[5; 16]);
    let mut region = buffer.mmap(AccessMode::Read)?;
    assert!(!region.is_writable());
    assert!(region.as_slice_mut().is_none());
    drop(region);

    let mapped = HostMemory::mapped(Arc::clone(&buffer), AccessMode::Read)?;
    assert!(!mapped.is_writable());
    assert_eq!(mapped.read()[0], 5);
    let err = mapped.write().err().ok_or("read-only memory handed out a writer")?;
    assert!(matches!(err, Error::Map(_)), "{err}");

    // a frame mapped for reading aliases the buffer read-only
    let system = Context::system();
    let shared = Context::with_allocator(Arc::new(MemfdAllocator));
    let mapper = mapper::get_mapper(&shared, &system).ok_or("no mapper")?;
    let info = TensorInfo::new(vec![16], DataType::U8);
    let frame = Arc::new(Frame::from_tensors(
        Shared,
        vec![Tensor::from_shared(info, buffer)?],
    )?);
    let host = mapper.map(&frame, AccessMode::Read, Some(&system))?;
    assert_eq!(read_all(&host)?, [5; 16]);
    let err = host.map(AccessMode::Write).err().ok_or("writable view")?;
    assert!(matches!(err.root(), Error::Map(_)), "{err}");
    Ok(())
}

/// Requires a dma-heap, usually only present on the target board.
#[test]
#[ignore]
#[serial]
fn test_dma_heap_buffer() -> Result<(), Box<dyn StdError>> {
    let heap = DmaHeapAllocator::cma()?;
    let buffer = SharedBuffer::allocate(&heap, 4096)?;
    let info = TensorInfo::new(vec![4096], DataType::U8);
    let frame = Arc::new(Frame::from_tensors(
        Shared,
        vec![Tensor::from_shared(info, Arc::new(buffer))?],
    )?);

    let host = MapperChain::between(&Context::with_allocator(Arc::new(heap)), &Context::system())?
        .map(&frame, AccessMode::ReadWrite)?;
    {
        let mut view = host.map(AccessMode::Write)?;
        view.get_mut(0).ok_or("no tensor")?.as_slice_mut().ok_or("read-only")?[..4]
            .copy_from_slice(b"dma!");
    }

    let Some(tensor) = frame.tensors()?.first() else {
        return Err("no tensor".into());
    };
    let edgefirst_inference::buffer::Buffer::Shared(shared) = tensor.buffer() else {
        return Err("not a shared buffer".into());
    };
    let dma: MappedDmaBuf = shared.dmabuf()?.memory_map()?;
    let head = dma.read(prefix, None)?;
    assert_eq!(&head, b"dma!");
    Ok(())
}

fn prefix(data: &[u8], _: Option<()>) -> Result<[u8; 4], Box<dyn StdError>> {
    Ok(data[..4].try_into()?)
}
