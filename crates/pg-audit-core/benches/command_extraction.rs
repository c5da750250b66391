//! Performance benchmarks for command extraction.
//!
//! Measures the keyword scan that runs on every relayed chunk.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pg_audit_core::audit::CommandExtractor;

/// Simple query message with the given SQL text.
fn query_message(sql: &str) -> Vec<u8> {
    let len = (4 + sql.len() + 1) as u32;
    let mut msg = vec![b'Q'];
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(sql.as_bytes());
    msg.push(0);
    msg
}

/// Row data without any keyword, padded to `size` bytes.
fn data_rows(size: usize) -> Vec<u8> {
    b"D\0\0\0\x10\0\x01\0\0\0\x06abcdef"
        .iter()
        .copied()
        .cycle()
        .take(size)
        .collect()
}

/// Benchmark extraction from typical client queries.
fn bench_extract_query(c: &mut Criterion) {
    let extractor = CommandExtractor::new();
    let mut group = c.benchmark_group("extract_query");

    let queries = [
        ("short", "SELECT 1"),
        ("insert", "INSERT INTO events (id, payload) VALUES ($1, $2)"),
        (
            "cte",
            "WITH recent AS (SELECT id FROM orders WHERE created_at > now() - interval '1 day') \
             UPDATE orders SET flagged = true WHERE id IN (SELECT id FROM recent)",
        ),
    ];

    for (name, sql) in queries {
        let msg = query_message(sql);
        group.throughput(Throughput::Bytes(msg.len() as u64));
        group.bench_with_input(BenchmarkId::new("query", name), &msg, |b, m| {
            b.iter(|| black_box(extractor.extract(black_box(m))));
        });
    }

    group.finish();
}

/// Benchmark the miss path over result data of growing size.
fn bench_scan_without_keyword(c: &mut Criterion) {
    let extractor = CommandExtractor::new();
    let mut group = c.benchmark_group("scan_without_keyword");

    for size in [512, 8192, 65536] {
        let chunk = data_rows(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_rows", size), &chunk, |b, chunk| {
            b.iter(|| black_box(extractor.extract(black_box(chunk))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_extract_query, bench_scan_without_keyword);
criterion_main!(benches);
