use cirrus_observability::{Sanitizer, SecretRedactor};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

fn benchmark_redaction(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitizer_throughput");
    let redactor = SecretRedactor::new();

    let clean = "Transferred 1048576 bytes of container/blob.bin in 120ms after 2 tries";
    let dirty = "Error reading https://acct.blob.core.windows.net/c/blob.bin?sv=2021-08-06&se=2030-01-01&sig=Zm9vYmFyYmF6cXV4%3D&sp=r";

    group.throughput(Throughput::Bytes(clean.len() as u64));
    group.bench_function("no_secrets", |b| {
        b.iter(|| black_box(redactor.sanitize(black_box(clean))));
    });

    group.throughput(Throughput::Bytes(dirty.len() as u64));
    group.bench_function("signed_url", |b| {
        b.iter(|| black_box(redactor.sanitize(black_box(dirty))));
    });

    group.finish();
}

criterion_group!(benches, benchmark_redaction);
criterion_main!(benches);
