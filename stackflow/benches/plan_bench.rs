//! Benchmarks for graph building.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stackflow::core::{ReferenceSpec, StackDefinition};
use stackflow::graph::StackGraph;
use stackflow::testing::reference_stack_set;

/// A layered set where each stack exports a value read by the next layer.
fn layered(layers: usize, width: usize) -> Vec<StackDefinition> {
    let mut stacks = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for slot in 0..width {
            let name = format!("L{layer}S{slot}");
            let mut def = StackDefinition::new(&name, format!("{name}.json")).with_export(
                "Out",
                "value",
                format!("l{layer}-s{slot}"),
            );
            if layer > 0 {
                def = def.with_reference(
                    "upstream",
                    ReferenceSpec::export(format!("l{}-s{}", layer - 1, slot)),
                );
            }
            stacks.push(def);
        }
    }
    stacks
}

fn plan_benchmark(c: &mut Criterion) {
    c.bench_function("reference_set", |b| {
        b.iter(|| StackGraph::new(black_box(reference_stack_set())).build())
    });

    let mut group = c.benchmark_group("layered");
    for size in [10, 50, 100] {
        let stacks = layered(size, 10);
        group.bench_with_input(BenchmarkId::from_parameter(size * 10), &stacks, |b, stacks| {
            b.iter(|| StackGraph::new(black_box(stacks.clone())).build())
        });
    }
    group.finish();
}

criterion_group!(benches, plan_benchmark);
criterion_main!(benches);
