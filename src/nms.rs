// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Class-wise non-maximum suppression over decoded detections.

use crate::decoder::{Detection, DetectionTable};

/// Intersection over union of two boxes.
#[inline]
pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix1 = a.x.max(b.x);
    let iy1 = a.y.max(b.y);
    let ix2 = (a.x + a.width).min(b.x + b.width);
    let iy2 = (a.y + a.height).min(b.y + b.height);

    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let union = a.width * a.height + b.width * b.height - inter;
    inter / (union + 1e-6)
}

/// Greedy per-class suppression in confidence order. A detection is dropped
/// when it overlaps a kept detection of the same class by more than
/// `iou_threshold`. Survivors keep their original (proposal) order.
pub fn suppress(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut order = (0..detections.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
    });

    let mut kept = vec![false; detections.len()];
    let mut suppressed = vec![false; detections.len()];
    for (rank, &i) in order.iter().enumerate() {
        if suppressed[i] {
            continue;
        }
        kept[i] = true;
        for &j in &order[rank + 1..] {
            if !suppressed[j]
                && detections[j].class_id == detections[i].class_id
                && iou(&detections[i], &detections[j]) > iou_threshold
            {
                suppressed[j] = true;
            }
        }
    }

    detections
        .iter()
        .zip(kept)
        .filter_map(|(d, keep)| keep.then(|| d.clone()))
        .collect()
}

/// [`suppress`] applied to every image of a table.
pub fn suppress_table(table: &DetectionTable, iou_threshold: f32) -> DetectionTable {
    table
        .iter()
        .map(|detections| suppress(detections, iou_threshold))
        .collect()
}
