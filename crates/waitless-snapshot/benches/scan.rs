use criterion::{Criterion, criterion_group, criterion_main};
use waitless_snapshot::AtomicSnapshot;

fn bench_update(c: &mut Criterion) {
    let engine = AtomicSnapshot::new(4);
    let index = engine.register_thread();
    let mut value = 0_i32;
    c.bench_function("update_4_writers_uncontended", |b| {
        b.iter(|| {
            value = value.wrapping_add(1);
            engine.update(value, index);
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    let engine = AtomicSnapshot::new(8);
    let index = engine.register_thread();
    engine.update(42, index);
    c.bench_function("scan_8_writers_quiescent", |b| {
        b.iter(|| engine.scan());
    });
}

criterion_group!(benches, bench_update, bench_scan);
criterion_main!(benches);
