#![recursion_limit = "256"]

use std::hint::black_box;

use burn::tensor::backend::Backend as BackendTrait;
use burn_ndarray::NdArray;
use burn_tiny_lm::{
    BigramConfig, BigramLm, CharVocab, NucleusPolicy, NucleusSettings, generate_argmax,
    generate_nucleus,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Clone, Copy)]
struct DecodeConfig {
    name: &'static str,
    batch: usize,
    max_len: usize,
}

const DECODE_CONFIGS: &[DecodeConfig] = &[
    DecodeConfig {
        name: "b1_l32",
        batch: 1,
        max_len: 32,
    },
    DecodeConfig {
        name: "b8_l64",
        batch: 8,
        max_len: 64,
    },
    DecodeConfig {
        name: "b16_l128",
        batch: 16,
        max_len: 128,
    },
];

fn decode_bench(c: &mut Criterion) {
    type B = NdArray<f32>;
    let device = <B as BackendTrait>::Device::default();
    <B as BackendTrait>::seed(&device, 1337);

    let vocab = CharVocab::fit(
        std::iter::once("abcdefghijklmnopqrstuvwxyz .,"),
        true,
    )
    .expect("vocab");
    let model = BigramLm::<B>::new(
        BigramConfig {
            n_embd: 64,
            dropout: 0.0,
            vocab_size: vocab.len(),
        },
        &device,
    );

    let mut group = c.benchmark_group("decode/ndarray");
    for cfg in DECODE_CONFIGS {
        group.throughput(Throughput::Elements((cfg.batch * cfg.max_len) as u64));

        group.bench_with_input(BenchmarkId::new("argmax", cfg.name), cfg, |b, cfg| {
            b.iter(|| {
                let tokens =
                    generate_argmax(&model, &vocab, &device, cfg.batch, None, cfg.max_len)
                        .expect("argmax decode");
                black_box(tokens);
            })
        });

        for (label, policy) in [
            ("nucleus_per_sequence", NucleusPolicy::PerSequence),
            ("nucleus_shared_legacy", NucleusPolicy::SharedLegacy),
        ] {
            group.bench_with_input(BenchmarkId::new(label, cfg.name), cfg, |b, cfg| {
                let mut rng = StdRng::seed_from_u64(7);
                let settings = NucleusSettings {
                    max_len: cfg.max_len,
                    nucleus: 0.9,
                    policy,
                };
                b.iter(|| {
                    let tokens = generate_nucleus(
                        &model, &vocab, &device, cfg.batch, None, settings, &mut rng,
                    )
                    .expect("nucleus decode");
                    black_box(tokens);
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, decode_bench);
criterion_main!(benches);
