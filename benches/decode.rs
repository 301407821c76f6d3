// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edgefirst_inference::{
    decoder::{Decoder, DecoderConfig},
    frame::{Frame, Tensor},
    memory::MemoryDomain,
    nms,
};

const CLASSES: usize = 80;
const PROPOSALS: usize = 8400;

/// Synthetic `[1, 84, 8400]` output where every 100th proposal scores high.
fn output() -> Vec<f32> {
    let object_size = 4 + CLASSES;
    let mut raw = vec![0.0; object_size * PROPOSALS];
    for p in 0..PROPOSALS {
        raw[p] = (p % 640) as f32;
        raw[PROPOSALS + p] = (p / 640 * 40) as f32;
        raw[2 * PROPOSALS + p] = 48.0;
        raw[3 * PROPOSALS + p] = 48.0;
        let class = p % CLASSES;
        raw[(4 + class) * PROPOSALS + p] = if p % 100 == 0 { 0.9 } else { 0.1 };
    }
    raw
}

pub fn benchmark_parse(c: &mut Criterion) {
    let raw = output();
    let decoder = Decoder::new(DecoderConfig::new(640, 640, CLASSES));
    let dims = [1, 4 + CLASSES, PROPOSALS];

    let mut group = c.benchmark_group("parse");
    for threshold in [0.05, 0.5] {
        group.bench_with_input(
            BenchmarkId::from_parameter(threshold),
            &threshold,
            |b, threshold| b.iter(|| decoder.parse(&raw, &dims, *threshold)),
        );
    }
    group.finish();
}

pub fn benchmark_convert(c: &mut Criterion) {
    let tensor = Tensor::from_f32(vec![1, 4 + CLASSES, PROPOSALS], &output()).unwrap();
    let frame = Frame::from_tensors(MemoryDomain::System, vec![tensor]).unwrap();
    let decoder = Decoder::new(DecoderConfig::new(640, 640, CLASSES));

    c.bench_function("convert", |b| b.iter(|| decoder.convert(&frame)));

    let table = decoder.convert(&frame).unwrap();
    c.bench_function("nms", |b| b.iter(|| nms::suppress_table(&table, 0.45)));
}

criterion_group!(benches, benchmark_parse, benchmark_convert);
criterion_main!(benches);
