// Benchmarks fabricating chains of the demo library, from a fresh chain
// each iteration so every run crafts the same segments.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ostinato_content::demo::demo_library;
use ostinato_fabric::{CraftWork, FabricatorFactory};

fn fabricate_chain(c: &mut Criterion) {
    let content = demo_library();
    let mut group = c.benchmark_group("fabricate_chain");
    for segments in [1u32, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, &segments| {
            b.iter(|| {
                let mut work = CraftWork::start(&content, None, FabricatorFactory::new(7)).unwrap();
                for _ in 0..segments {
                    black_box(work.fabricate_next().unwrap());
                }
                work
            });
        });
    }
    group.finish();
}

criterion_group!(benches, fabricate_chain);
criterion_main!(benches);
