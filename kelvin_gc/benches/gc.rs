//! Allocation and collection throughput over a churning heap.

use criterion::{criterion_group, criterion_main, Criterion};
use kelvin_gc::{Configuration, GcKind, Heap, NoHooks, TempRoots};

fn allocation(criterion: &mut Criterion) {
    criterion.bench_function("allocate_16_cells", |bencher| {
        let mut heap = Heap::new(Configuration::default().with_heap_cells(64 * 1024));
        let roots = TempRoots::new();
        bencher.iter(|| {
            let ptr = heap.allocate(16, GcKind::NoPointers);
            if ptr.is_null() {
                heap.collect(16, &roots, &mut NoHooks).expect("collect");
            }
            ptr
        });
    });
}

fn collection(criterion: &mut Criterion) {
    criterion.bench_function("collect_churned_heap", |bencher| {
        let mut heap = Heap::new(Configuration::default().with_heap_cells(64 * 1024));
        let roots = TempRoots::new();
        let kept = heap.allocate(64, GcKind::NoPointers);
        let _root = roots.push(kept);
        bencher.iter(|| {
            for _ in 0..64 {
                let _garbage = heap.allocate(16, GcKind::NoPointers);
            }
            heap.collect(0, &roots, &mut NoHooks).expect("collect")
        });
    });
}

criterion_group!(benches, allocation, collection);
criterion_main!(benches);
