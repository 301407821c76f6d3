// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

use edgefirst_inference::{
    buffer::{
        ExportedSurface, MemfdAllocator, SharedBuffer, Surface, SurfaceDisplay, SurfaceId,
        DISPLAY_MAGIC,
    },
    memory::{AccessMode, ImageFormat},
};
use std::{
    collections::HashMap,
    fs, io,
    os::fd::OwnedFd,
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

/// Two proposals of four classes, proposals last. Only the first, a class 1
/// box centred in the input, scores above 0.5.
pub const PROPOSALS: [f32; 16] = [
    320.0, 100.0, 320.0, 100.0, 64.0, 10.0, 32.0, 10.0, //
    0.1, 0.2, 0.9, 0.3, 0.2, 0.4, 0.3, 0.1,
];

/// Display whose surfaces are memfd buffers kept by descriptor.
pub struct FakeDisplay {
    magic: u32,
    next: AtomicU32,
    surfaces: Mutex<HashMap<u32, (OwnedFd, usize)>>,
}

impl FakeDisplay {
    pub fn new() -> Arc<Self> {
        Self::with_magic(DISPLAY_MAGIC)
    }

    pub fn with_magic(magic: u32) -> Arc<Self> {
        Arc::new(Self {
            magic,
            next: AtomicU32::new(1),
            surfaces: Mutex::new(HashMap::new()),
        })
    }

    /// Surfaces imported and not yet destroyed.
    pub fn live(&self) -> usize {
        self.surfaces.lock().unwrap().len()
    }
}

impl SurfaceDisplay for FakeDisplay {
    fn magic(&self) -> u32 {
        self.magic
    }

    fn export_surface(&self, id: SurfaceId) -> io::Result<ExportedSurface> {
        let surfaces = self.surfaces.lock().unwrap();
        let (fd, len) = surfaces
            .get(&id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such surface"))?;
        Ok(ExportedSurface {
            fd: fd.try_clone()?,
            len: *len,
        })
    }

    fn import_surface(
        &self,
        buffer: &SharedBuffer,
        _width: u32,
        _height: u32,
        _format: ImageFormat,
    ) -> io::Result<SurfaceId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let fd = buffer.fd().try_clone_to_owned()?;
        self.surfaces.lock().unwrap().insert(id, (fd, buffer.len()));
        Ok(SurfaceId(id))
    }

    fn destroy_surface(&self, id: SurfaceId) {
        self.surfaces.lock().unwrap().remove(&id.0);
    }
}

/// memfd shared buffer holding `bytes`.
pub fn shared_buffer(bytes: &[u8]) -> Arc<SharedBuffer> {
    let buffer = SharedBuffer::allocate(&MemfdAllocator, bytes.len()).unwrap();
    let mut region = buffer.mmap(AccessMode::Write).unwrap();
    region.as_slice_mut().unwrap().copy_from_slice(bytes);
    drop(region);
    Arc::new(buffer)
}

/// NV12 surface of `display` holding `bytes`.
pub fn nv12_surface(
    display: &Arc<FakeDisplay>,
    width: u32,
    height: u32,
    bytes: &[u8],
) -> Arc<Surface> {
    let display: Arc<dyn SurfaceDisplay> = display.clone();
    let surface = Surface::import(
        display,
        shared_buffer(bytes),
        width,
        height,
        ImageFormat::NV12,
    )
    .unwrap();
    Arc::new(surface)
}

/// Writes a replay model descriptor under the temporary directory.
pub fn write_model(name: &str, descriptor: &serde_json::Value) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("edgefirst-inference-{}", std::process::id()))
        .join(name);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("model.json");
    fs::write(&path, serde_json::to_vec_pretty(descriptor).unwrap()).unwrap();
    path
}

/// Descriptor of an 8x8 image model producing [`PROPOSALS`].
pub fn detector(name: &str, latency_ms: u64) -> PathBuf {
    write_model(
        name,
        &serde_json::json!({
            "name": name,
            "latency_ms": latency_ms,
            "inputs": [{ "name": "images", "shape": [1, 3, 8, 8], "dtype": "u8" }],
            "outputs": [{
                "name": "output0",
                "shape": [1, 8, 2],
                "dtype": "f32",
                "values": PROPOSALS,
            }],
        }),
    )
}
