//! Benchmarks for forward protocol encoding and decoding.

use std::collections::BTreeMap;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use femtofluent::{
    Decoder, EventTime, ForwardOptions, Timestamp,
    codec::{encode, encode_batch, encode_forward},
};

fn record(fields: usize) -> BTreeMap<String, String> {
    (0..fields)
        .map(|i| (format!("key{i}"), format!("value number {i}")))
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let time = Timestamp::EventTime(EventTime::new(1_490_061_367, 861_646_890));
    for fields in [1, 8, 64] {
        let data = record(fields);
        group.bench_with_input(BenchmarkId::new("event", fields), &data, |b, data| {
            b.iter(|| encode(black_box("app.bench"), &time, black_box(data)));
        });
    }

    let options = ForwardOptions {
        size: 1,
        chunk: Some("bm9uY2UtY2h1bmstaWQ=".into()),
    };
    let data = record(8);
    group.bench_function("forward", |b| {
        b.iter(|| encode_forward(black_box("app.bench"), &time, black_box(&data), &options));
    });

    let entries: Vec<(Timestamp, BTreeMap<String, String>)> =
        (0..100).map(|_| (time, record(8))).collect();
    group.bench_function("batch_100", |b| {
        b.iter(|| encode_batch(black_box("app.bench"), black_box(&entries)));
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let time = Timestamp::Seconds(1_490_061_367);
    let stream: Vec<u8> = (0..100)
        .flat_map(|_| encode("app.bench", &time, &record(8)).expect("encodable"))
        .collect();
    c.bench_function("decode_100", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new();
            decoder.feed(black_box(&stream));
            decoder.drain_values().expect("decodable")
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
