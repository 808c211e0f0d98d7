use std::hint::black_box;

use budloc::BuddyAllocator;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const OPS: u64 = 100_000;

/// Buddy alloc/free throughput.
fn buddy_alloc_free(allocator: &BuddyAllocator, size: usize) {
    for _ in 0..OPS {
        let ptr = allocator.allocate(size);
        black_box(ptr);
        unsafe { allocator.deallocate(ptr) };
    }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = libc::malloc(size);
            black_box(ptr);
            libc::free(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let allocator = BuddyAllocator::new(1 << 20, 32).expect("could not build the allocator");

    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("budloc", size), &size, |b, &size| {
            b.iter(|| buddy_alloc_free(&allocator, size))
        });

        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
