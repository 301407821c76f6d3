// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_inference::{
    decoder::{self, Decoder, DecoderConfig, Detection, Layout},
    frame::{Frame, ModelInfo, Tensor},
    memory::{DataType, FrameInfo, MemoryDomain, TensorInfo},
    nms, Error,
};
use std::error::Error as StdError;

/// Two proposals of four classes, proposals in the last dimension. The first
/// is a class 1 box centred in a 640x640 input, the second stays below 0.5.
const PROPOSALS_LAST: [f32; 16] = [
    320.0, 100.0, // cx
    320.0, 100.0, // cy
    64.0, 10.0, // w
    32.0, 10.0, // h
    0.1, 0.2, // class 0
    0.9, 0.3, // class 1
    0.2, 0.4, // class 2
    0.3, 0.1, // class 3
];

const PROPOSALS_FIRST: [f32; 16] = [
    320.0, 320.0, 64.0, 32.0, 0.1, 0.9, 0.2, 0.3, //
    100.0, 100.0, 10.0, 10.0, 0.2, 0.3, 0.4, 0.1,
];

fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-5
}

fn assert_centre_box(d: &Detection) {
    assert_eq!(d.class_id, 1);
    assert!(close(d.confidence, 0.9), "{d:?}");
    assert!(close(d.x, 0.45), "{d:?}");
    assert!(close(d.y, 0.475), "{d:?}");
    assert!(close(d.width, 0.1), "{d:?}");
    assert!(close(d.height, 0.05), "{d:?}");
}

fn decoder() -> Decoder {
    Decoder::new(DecoderConfig::new(640, 640, 4))
}

#[test]
fn test_parse_proposals_last() -> Result<(), Box<dyn StdError>> {
    let decoder = decoder();
    assert_eq!(decoder.config().object_size(), 8);

    let detections = decoder.parse(&PROPOSALS_LAST, &[1, 8, 2], 0.5)?;
    assert_eq!(detections.len(), 1);
    assert_centre_box(&detections[0]);
    assert_eq!(detections[0].label, "1");
    Ok(())
}

#[test]
fn test_parse_proposals_first() -> Result<(), Box<dyn StdError>> {
    let decoder = Decoder::new(DecoderConfig::new(640, 640, 4).with_layout(Layout::ProposalsFirst));
    let detections = decoder.parse(&PROPOSALS_FIRST, &[1, 2, 8], 0.5)?;
    assert_eq!(detections.len(), 1);
    assert_centre_box(&detections[0]);
    Ok(())
}

#[test]
fn test_parse_lower_threshold() -> Result<(), Box<dyn StdError>> {
    let detections = decoder().parse(&PROPOSALS_LAST, &[1, 8, 2], 0.35)?;
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[1].class_id, 2);
    assert!(close(detections[1].x, 95.0 / 640.0));
    Ok(())
}

#[test]
fn test_threshold_is_exclusive() -> Result<(), Box<dyn StdError>> {
    let detections = decoder().parse(&PROPOSALS_LAST, &[1, 8, 2], 0.9)?;
    assert!(detections.is_empty());
    Ok(())
}

#[test]
fn test_first_max_wins_ties() -> Result<(), Box<dyn StdError>> {
    let raw = [10.0, 10.0, 4.0, 4.0, 0.7, 0.7, 0.7, 0.1];
    let detections = decoder().parse(&raw, &[1, 8, 1], 0.5)?;
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].class_id, 0);
    Ok(())
}

#[test]
fn test_parse_rejects_dims() {
    let decoder = decoder();

    let err = decoder.parse(&PROPOSALS_LAST, &[16], 0.5).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");

    let err = decoder.parse(&PROPOSALS_LAST, &[1, 2, 8, 2], 0.5).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");

    // unit extra dimensions and a bare two dimensional output are fine
    assert!(decoder.parse(&PROPOSALS_LAST, &[1, 1, 8, 2], 0.5).is_ok());
    assert!(decoder.parse(&PROPOSALS_LAST, &[8, 2], 0.5).is_ok());
}

#[test]
fn test_parse_rejects_object_size() {
    let err = decoder()
        .parse(&[0.0; 18], &[1, 9, 2], 0.5)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
}

#[test]
fn test_parse_rejects_short_data() {
    let err = decoder()
        .parse(&PROPOSALS_LAST[..12], &[1, 8, 2], 0.5)
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
}

#[test]
fn test_parse_rejects_no_classes() {
    let decoder = Decoder::new(DecoderConfig::new(640, 640, 0).with_labels(Vec::new()));
    assert_eq!(decoder.config().object_size(), 4);

    let err = decoder.parse(&[1.0; 8], &[1, 4, 2], 0.5).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");

    let decoder = Decoder::new(
        DecoderConfig::new(640, 640, 0).with_layout(Layout::ProposalsFirst),
    );
    let err = decoder.parse(&[1.0; 8], &[1, 2, 4], 0.5).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
}

#[test]
fn test_labels_and_roi_scale() -> Result<(), Box<dyn StdError>> {
    let labels = ["person", "car", "dog", "cat"].map(String::from).to_vec();
    let decoder = Decoder::new(
        DecoderConfig::new(640, 640, 0)
            .with_labels(labels)
            .with_roi_scale(2.0),
    );
    assert_eq!(decoder.config().num_classes, 4);

    let detections = decoder.parse(&PROPOSALS_LAST, &[1, 8, 2], 0.5)?;
    let d = &detections[0];
    assert_eq!(d.label, "car");
    assert!(close(d.width, 0.2));
    assert!(close(d.height, 0.1));
    // centre unchanged
    assert!(close(d.x + d.width / 2.0, 0.5));
    assert!(close(d.y + d.height / 2.0, 0.5));
    Ok(())
}

#[test]
fn test_convert_batch() -> Result<(), Box<dyn StdError>> {
    let mut raw = PROPOSALS_LAST.to_vec();
    raw.extend_from_slice(&[0.0; 16]);
    let tensor = Tensor::from_f32(vec![2, 8, 2], &raw)?;
    let frame = Frame::from_tensors(MemoryDomain::System, vec![tensor])?;

    let decoder = Decoder::new(DecoderConfig::new(640, 640, 4).with_batch_size(2));
    let table = decoder.convert(&frame)?;
    assert_eq!(table.len(), 2);
    assert_eq!(table[0].len(), 1);
    assert_centre_box(&table[0][0]);
    assert!(table[1].is_empty());
    Ok(())
}

#[test]
fn test_convert_uneven_batch() -> Result<(), Box<dyn StdError>> {
    let tensor = Tensor::from_f32(vec![1, 8, 2], &PROPOSALS_LAST)?;
    let frame = Frame::from_tensors(MemoryDomain::System, vec![tensor])?;

    let decoder = Decoder::new(DecoderConfig::new(640, 640, 4).with_batch_size(3));
    let err = decoder.convert(&frame).unwrap_err();
    assert!(matches!(err, Error::Element { .. }));
    assert!(matches!(err.root(), Error::UnsupportedShape(_)), "{err}");
    Ok(())
}

#[test]
fn test_convert_rejects_non_float() -> Result<(), Box<dyn StdError>> {
    let info = TensorInfo::new(vec![1, 8, 2], DataType::U8);
    let tensor = Tensor::from_host(info, vec![0; 16])?;
    let frame = Frame::from_tensors(MemoryDomain::System, vec![tensor])?;

    let err = decoder().convert(&frame).unwrap_err();
    assert!(err.to_string().starts_with(decoder::ELEMENT));
    assert!(matches!(err.root(), Error::NullData(_)), "{err}");
    Ok(())
}

#[test]
fn test_process_attaches_detections() -> Result<(), Box<dyn StdError>> {
    let tensor = Tensor::from_f32(vec![1, 8, 2], &PROPOSALS_LAST)?;
    let frame = Frame::from_tensors(MemoryDomain::System, vec![tensor])?;
    assert!(decoder::detections(&frame).is_none());

    let table = decoder().process(&frame)?;
    assert_eq!(decoder::detections(&frame), Some(table));
    Ok(())
}

#[test]
fn test_config_from_model_info() -> Result<(), Box<dyn StdError>> {
    let info = ModelInfo {
        model_name: "yolov8n".to_owned(),
        input: FrameInfo::tensors(
            MemoryDomain::System,
            vec![TensorInfo::new(vec![2, 3, 480, 640], DataType::U8)],
        ),
        output: FrameInfo::tensors(
            MemoryDomain::AcceleratorTensor,
            vec![TensorInfo::new(vec![2, 84, 6300], DataType::F32)],
        ),
        input_layers: vec!["images".to_owned()],
        output_layers: vec!["output0".to_owned()],
    };

    let config = DecoderConfig::from_model_info(&info, Layout::ProposalsLast)?;
    assert_eq!(config.input_width, 640);
    assert_eq!(config.input_height, 480);
    assert_eq!(config.batch_size, 2);
    assert_eq!(config.num_classes, 80);

    let boxes_only = ModelInfo {
        output: FrameInfo::tensors(
            MemoryDomain::AcceleratorTensor,
            vec![TensorInfo::new(vec![1, 4, 8400], DataType::F32)],
        ),
        ..info
    };
    let err = DecoderConfig::from_model_info(&boxes_only, Layout::ProposalsLast).unwrap_err();
    assert!(matches!(err, Error::UnsupportedShape(_)), "{err}");
    Ok(())
}

fn detection(x: f32, class_id: usize, confidence: f32) -> Detection {
    Detection {
        x,
        y: 0.1,
        width: 0.2,
        height: 0.2,
        class_id,
        label: class_id.to_string(),
        confidence,
    }
}

#[test]
fn test_nms() {
    let detections = vec![
        detection(0.10, 0, 0.6),
        detection(0.11, 0, 0.9),
        detection(0.11, 1, 0.7),
        detection(0.60, 0, 0.5),
    ];

    let kept = nms::suppress(&detections, 0.45);
    assert_eq!(kept.len(), 3);
    // proposal order is kept, the weaker overlapping box of class 0 is gone
    assert!(close(kept[0].confidence, 0.9));
    assert_eq!(kept[1].class_id, 1);
    assert!(close(kept[2].x, 0.60));

    assert!(nms::iou(&detections[0], &detections[0]) > 0.999);
    assert_eq!(nms::iou(&detections[0], &detections[3]), 0.0);

    let table = nms::suppress_table(&vec![detections.clone(), Vec::new()], 0.99);
    assert_eq!(table[0].len(), 4);
    assert!(table[1].is_empty());
}
