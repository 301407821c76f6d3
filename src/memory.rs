// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Memory domains and the shape/type descriptions exchanged during
//! capability negotiation.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Physical or logical location class of a buffer.
///
/// The domain of a buffer never changes once it is created; moving data to
/// another domain always goes through a [`Mapper`](crate::mapper::Mapper).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryDomain {
    /// Host-addressable general system memory.
    System,
    /// Hardware video surfaces owned by a display (VA-API style).
    DeviceSurface,
    /// DMA buffers shared between devices and processes by file descriptor.
    SharedBuffer,
    /// Accelerator-private tensor memory owned by the inference engine.
    AcceleratorTensor,
}

impl MemoryDomain {
    pub const ALL: [MemoryDomain; 4] = [
        MemoryDomain::System,
        MemoryDomain::DeviceSurface,
        MemoryDomain::SharedBuffer,
        MemoryDomain::AcceleratorTensor,
    ];
}

impl fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MemoryDomain::System => "system",
            MemoryDomain::DeviceSurface => "device-surface",
            MemoryDomain::SharedBuffer => "shared-buffer",
            MemoryDomain::AcceleratorTensor => "accelerator-tensor",
        };
        f.write_str(name)
    }
}

/// Requested access when mapping a buffer into a view.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn writable(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Tensor element type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    I32,
    I64,
    F16,
    F32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::F16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 => 8,
        }
    }
}

/// Pixel layout of image frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// 4:2:0 semi-planar, Y plane followed by interleaved UV.
    NV12,
    /// 4:2:0 planar.
    I420,
    BGR,
    RGB,
    BGRX,
    RGBX,
}

impl ImageFormat {
    /// Number of memory planes.
    pub const fn planes(self) -> usize {
        match self {
            ImageFormat::NV12 => 2,
            ImageFormat::I420 => 3,
            _ => 1,
        }
    }

    /// Bytes in one row of the first plane.
    pub const fn row_stride(self, width: u32) -> usize {
        match self {
            ImageFormat::NV12 | ImageFormat::I420 => width as usize,
            ImageFormat::BGR | ImageFormat::RGB => 3 * width as usize,
            ImageFormat::BGRX | ImageFormat::RGBX => 4 * width as usize,
        }
    }

    /// Total bytes of a tightly packed image.
    pub const fn image_size(self, width: u32, height: u32) -> usize {
        let luma = self.row_stride(width) * height as usize;
        match self {
            ImageFormat::NV12 | ImageFormat::I420 => luma + luma / 2,
            _ => luma,
        }
    }
}

/// Media kind carried by a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Tensors,
    Image(ImageFormat),
}

/// Shape, element type and byte strides of one tensor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    /// Byte stride of each dimension.
    pub stride: Vec<usize>,
}

/// Row-major byte strides for a densely packed tensor.
pub fn contiguous_stride(shape: &[usize], dtype: DataType) -> Vec<usize> {
    let mut stride = vec![0; shape.len()];
    let mut acc = dtype.size();
    for (s, dim) in stride.iter_mut().zip(shape).rev() {
        *s = acc;
        acc *= *dim;
    }
    stride
}

impl TensorInfo {
    pub fn new(shape: Vec<usize>, dtype: DataType) -> Self {
        let stride = contiguous_stride(&shape, dtype);
        Self {
            shape,
            dtype,
            stride,
        }
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes spanned by the tensor including any row padding.
    pub fn nbytes(&self) -> usize {
        match (self.shape.first(), self.stride.first()) {
            (Some(dim), Some(stride)) => dim * stride,
            _ => self.dtype.size(),
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.stride == contiguous_stride(&self.shape, self.dtype)
    }

    /// Width and height when the tensor holds an image: `NCHW` when the
    /// second of four dimensions looks like a channel count, `NHWC`
    /// otherwise, and `HWC` for three dimensions.
    pub fn image_dims(&self) -> Option<(usize, usize)> {
        match self.shape.as_slice() {
            [_, c, h, w] if matches!(c, 1 | 3 | 4) => Some((*w, *h)),
            [_, h, w, _] => Some((*w, *h)),
            [h, w, _] => Some((*w, *h)),
            _ => None,
        }
    }

    /// Copy with another element type, strides recomputed.
    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self::new(self.shape.clone(), dtype)
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}:{:?}", self.shape, self.dtype)
    }
}

/// Declared description of a frame, used to match what a stage accepts or
/// produces against what it is given.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub media: MediaType,
    pub domain: MemoryDomain,
    pub tensors: Vec<TensorInfo>,
}

impl FrameInfo {
    pub fn tensors(domain: MemoryDomain, tensors: Vec<TensorInfo>) -> Self {
        Self {
            media: MediaType::Tensors,
            domain,
            tensors,
        }
    }

    pub fn image(format: ImageFormat, domain: MemoryDomain, tensors: Vec<TensorInfo>) -> Self {
        Self {
            media: MediaType::Image(format),
            domain,
            tensors,
        }
    }

    /// Same description placed in another memory domain.
    pub fn in_domain(&self, domain: MemoryDomain) -> Self {
        Self {
            domain,
            ..self.clone()
        }
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}@{} [", self.media, self.domain)?;
        for (i, t) in self.tensors.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{t}")?;
        }
        f.write_str("]")
    }
}
