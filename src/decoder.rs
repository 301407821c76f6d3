// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! YOLOv8 output decoding.
//!
//! The raw output tensor holds one row of `4 + num_classes` values per
//! proposal: the box centre, width and height in model input pixels followed
//! by the class scores. Exported models place proposals in the last
//! dimension (`[1, 84, 8400]`), some toolchains transpose the two. The
//! layout is configured, never guessed.
//!
//! Detections are emitted in proposal order without suppressing overlaps;
//! see [`crate::nms`] for the downstream filter.

use crate::{
    error::{ElementContext, Error, Result},
    frame::{Frame, ModelInfo},
    memory::{AccessMode, DataType},
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::trace;

/// Name errors of the decoder are attributed to.
pub const ELEMENT: &str = "yolov8";

/// Metadata key of attached detections.
pub const DETECTION: &str = "detection";

/// Fewest dimensions an output tensor may have.
pub const MIN_DIMS: usize = 2;

/// Values preceding the class scores in each proposal.
const BOX_SIZE: usize = 4;

/// One detected object. Coordinates are normalized to the model input:
/// `x`/`y` is the top-left corner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub class_id: usize,
    pub label: String,
    pub confidence: f32,
}

/// Detections per image, in batch order.
pub type DetectionTable = Vec<Vec<Detection>>;

/// Order of the two trailing output dimensions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `[..., object_size, proposals]`, the YOLOv8 export default.
    #[default]
    ProposalsLast,
    /// `[..., proposals, object_size]`.
    ProposalsFirst,
}

impl Layout {
    /// `(object_size, proposals)` of the trailing dimensions.
    fn split(self, dims: &[usize]) -> Option<(usize, usize)> {
        let [.., a, b] = dims else {
            return None;
        };
        Some(match self {
            Layout::ProposalsLast => (*a, *b),
            Layout::ProposalsFirst => (*b, *a),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub input_width: usize,
    pub input_height: usize,
    pub batch_size: usize,
    pub num_classes: usize,
    /// Class names indexed by class id; ids without a name are labelled
    /// with the id itself.
    pub labels: Vec<String>,
    /// Scores must exceed this value.
    pub threshold: f32,
    pub layout: Layout,
    /// Scale applied to box width and height around the box centre.
    pub roi_scale: f32,
}

impl DecoderConfig {
    pub fn new(input_width: usize, input_height: usize, num_classes: usize) -> Self {
        Self {
            input_width,
            input_height,
            batch_size: 1,
            num_classes,
            labels: Vec::new(),
            threshold: 0.5,
            layout: Layout::default(),
            roi_scale: 1.0,
        }
    }

    /// Derives input size, batch size and class count from the model
    /// description attached to inference output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedShape`] when the model input is not an
    /// image or the output is too small to hold a box and one class.
    pub fn from_model_info(info: &ModelInfo, layout: Layout) -> Result<Self> {
        let input = info
            .input
            .tensors
            .first()
            .ok_or_else(|| Error::UnsupportedShape("model has no input tensor".to_owned()))?;
        let (width, height) = input.image_dims().ok_or_else(|| {
            Error::UnsupportedShape(format!("model input {input} is not an image"))
        })?;
        let batch_size = match input.shape.as_slice() {
            [n, _, _, _] => (*n).max(1),
            _ => 1,
        };

        let output = info
            .output
            .tensors
            .first()
            .ok_or_else(|| Error::UnsupportedShape("model has no output tensor".to_owned()))?;
        let (object_size, _) = layout.split(&output.shape).ok_or_else(|| {
            Error::UnsupportedShape(format!("model output {output} has fewer than {MIN_DIMS} dims"))
        })?;
        if object_size <= BOX_SIZE {
            return Err(Error::UnsupportedShape(format!(
                "object size {object_size} leaves no class scores"
            )));
        }

        Ok(Self {
            batch_size,
            layout,
            ..Self::new(width, height, object_size - BOX_SIZE)
        })
    }

    /// Sets the labels and the class count to match.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        if !labels.is_empty() {
            self.num_classes = labels.len();
        }
        self.labels = labels;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_roi_scale(mut self, roi_scale: f32) -> Self {
        self.roi_scale = roi_scale;
        self
    }

    pub fn object_size(&self) -> usize {
        BOX_SIZE + self.num_classes
    }

    pub fn label(&self, class_id: usize) -> String {
        self.labels
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }
}

/// YOLOv8 detection decoder.
#[derive(Clone, Debug)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decodes the proposals of one image.
    ///
    /// `dims` are the dimensions of the output tensor; only the trailing
    /// two describe `raw`, the leading batch dimension is ignored and any
    /// other must be 1.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedShape`] when no classes are configured,
    /// the dimensions are not supported, the object size does not match the
    /// class count or `raw` is too short. Nothing is emitted on error.
    pub fn parse(&self, raw: &[f32], dims: &[usize], threshold: f32) -> Result<Vec<Detection>> {
        if self.config.num_classes == 0 {
            return Err(Error::UnsupportedShape(
                "decoder configured without classes".to_owned(),
            ));
        }
        if dims.len() < MIN_DIMS {
            return Err(Error::UnsupportedShape(format!(
                "output has {} dims, at least {MIN_DIMS} required",
                dims.len()
            )));
        }
        if let Some(dim) = dims
            .iter()
            .skip(1)
            .take(dims.len().saturating_sub(MIN_DIMS + 1))
            .find(|d| **d != 1)
        {
            return Err(Error::UnsupportedShape(format!(
                "output dims {dims:?} have extra dimension {dim}, all but batch, object size and proposals must be 1"
            )));
        }

        let (object_size, proposals) = self
            .config
            .layout
            .split(dims)
            .ok_or_else(|| Error::UnsupportedShape(format!("output dims {dims:?}")))?;
        if object_size != self.config.object_size() {
            return Err(Error::UnsupportedShape(format!(
                "object size {object_size}, expected {} for {} classes",
                self.config.object_size(),
                self.config.num_classes
            )));
        }
        if raw.len() < object_size * proposals {
            return Err(Error::UnsupportedShape(format!(
                "{} values cannot hold {proposals} proposals of {object_size}",
                raw.len()
            )));
        }

        let at = |proposal: usize, field: usize| match self.config.layout {
            Layout::ProposalsLast => raw[field * proposals + proposal],
            Layout::ProposalsFirst => raw[proposal * object_size + field],
        };

        let width = self.config.input_width as f32;
        let height = self.config.input_height as f32;
        let mut detections = Vec::new();
        for proposal in 0..proposals {
            let mut class_id = 0;
            let mut score = at(proposal, BOX_SIZE);
            for class in 1..self.config.num_classes {
                let s = at(proposal, BOX_SIZE + class);
                if s > score {
                    score = s;
                    class_id = class;
                }
            }
            if score <= threshold {
                continue;
            }

            let w = at(proposal, 2) * self.config.roi_scale;
            let h = at(proposal, 3) * self.config.roi_scale;
            detections.push(Detection {
                x: (at(proposal, 0) - w / 2.0) / width,
                y: (at(proposal, 1) - h / 2.0) / height,
                width: w / width,
                height: h / height,
                class_id,
                label: self.config.label(class_id),
                confidence: score,
            });
        }
        trace!(proposals, detections = detections.len(), "parsed");
        Ok(detections)
    }

    /// Decodes every output tensor of `frame`, waiting for it if pending.
    ///
    /// Each tensor is split into `batch_size` equal segments, one per image.
    ///
    /// # Errors
    ///
    /// [`Error::NullData`] for an empty or non-`f32` tensor, and every
    /// [`parse`](Self::parse) error, attributed to the decoder.
    pub fn convert(&self, frame: &Frame) -> Result<DetectionTable> {
        self.decode(frame).element(ELEMENT)
    }

    /// [`convert`](Self::convert), then [`attach`] the table to `frame`.
    pub fn process(&self, frame: &Frame) -> Result<DetectionTable> {
        let table = self.convert(frame)?;
        attach(frame, &table)?;
        Ok(table)
    }

    fn decode(&self, frame: &Frame) -> Result<DetectionTable> {
        let batch = self.config.batch_size.max(1);
        let mut table = vec![Vec::new(); batch];

        let view = frame.map(AccessMode::Read)?;
        for tensor in view.iter() {
            let info = tensor.info();
            if info.dtype != DataType::F32 {
                return Err(Error::NullData(format!("output {info} is not f32")));
            }
            let values = match tensor.as_f32() {
                Some(values) => Cow::Borrowed(values),
                None => Cow::Owned(
                    tensor
                        .as_slice()
                        .chunks_exact(4)
                        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                        .collect::<Vec<_>>(),
                ),
            };
            let values = &values[..info.size().min(values.len())];
            if values.is_empty() {
                return Err(Error::NullData(format!("output {info} holds no data")));
            }
            if values.len() % batch != 0 {
                return Err(Error::UnsupportedShape(format!(
                    "{} values do not split into {batch} images",
                    values.len()
                )));
            }

            let unbatched = values.len() / batch;
            for (objects, image) in table.iter_mut().zip(values.chunks_exact(unbatched)) {
                objects.extend(self.parse(image, &info.shape, self.config.threshold)?);
            }
        }
        Ok(table)
    }
}

/// Stores `table` in the frame's metadata under [`DETECTION`].
pub fn attach(frame: &Frame, table: &DetectionTable) -> Result<()> {
    let value = serde_json::to_value(table)?;
    frame.metadata().insert(DETECTION.to_owned(), value);
    Ok(())
}

/// Detections previously attached to `frame`.
pub fn detections(frame: &Frame) -> Option<DetectionTable> {
    let value = frame.metadata().get(DETECTION)?.clone();
    serde_json::from_value(value).ok()
}
