use candle_core::{DType, Device, Tensor};
use candle_core::backprop::GradStore;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use latte_rs::grad_norm::observe_and_clip;
use latte_rs::{EmaShadow, ParameterSet};

// Parameter sets shaped like a small transformer block stack
fn parameter_set(blocks: usize, hidden: usize) -> ParameterSet {
    let params = ParameterSet::new();
    for i in 0..blocks {
        let w = Tensor::randn(0f32, 0.02, (hidden, hidden), &Device::Cpu).unwrap();
        let b = Tensor::zeros(hidden, DType::F32, &Device::Cpu).unwrap();
        params.insert(format!("blocks.{i}.attn.weight"), &w).unwrap();
        params.insert(format!("blocks.{i}.attn.bias"), &b).unwrap();
    }
    params
}

// Gradients of the sum of squares, so every parameter gets one
fn gradients(params: &ParameterSet) -> GradStore {
    let mut loss = Tensor::new(0f32, &Device::Cpu).unwrap();
    for (_, var) in params.named_vars().unwrap() {
        loss = loss.add(&var.as_tensor().sqr().unwrap().sum_all().unwrap()).unwrap();
    }
    loss.backward().unwrap()
}

fn bench_ema_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("ema_update");
    for blocks in [2, 8, 32] {
        let live = parameter_set(blocks, 128);
        let ema = EmaShadow::new(&live).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(blocks), &blocks, |b, _| {
            b.iter(|| ema.update(black_box(&live), black_box(0.9999)).unwrap());
        });
    }
    group.finish();
}

fn bench_observe_and_clip(c: &mut Criterion) {
    let mut group = c.benchmark_group("observe_and_clip");
    for blocks in [2, 8, 32] {
        let params = parameter_set(blocks, 128);
        let mut grads = gradients(&params);

        group.bench_with_input(BenchmarkId::new("enforced", blocks), &blocks, |b, _| {
            b.iter_batched(
                || gradients(&params),
                |mut g| observe_and_clip(black_box(&params), &mut g, 1.0, true).unwrap(),
                BatchSize::SmallInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("observe_only", blocks), &blocks, |b, _| {
            b.iter(|| observe_and_clip(black_box(&params), &mut grads, 1.0, false).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ema_update, bench_observe_and_clip);
criterion_main!(benches);
