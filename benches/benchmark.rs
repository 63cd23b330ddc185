#[macro_use]
extern crate criterion;

extern crate ctxseq;
extern crate rand;

use criterion::Criterion;
use rand::{Rng, SeedableRng, XorShiftRng};

use ctxseq::data::{Event, SequenceStore};
use ctxseq::evaluation::{evaluate, EvaluationSettings, RankLogTable};
use ctxseq::models::{Hyperparameters, Model, Variant};

fn synthetic_store(num_entities: usize, num_items: usize, len: usize) -> SequenceStore {
    let mut rng = XorShiftRng::from_seed([42; 16]);

    let raw: Vec<Vec<Event>> = (0..num_entities)
        .map(|_| {
            (0..len)
                .map(|_| {
                    Event::new(
                        rng.gen_range(1, num_items),
                        rng.gen_range(1, 8),
                        rng.gen_range(1, 25),
                        rng.gen_range(0, 32),
                    )
                })
                .collect()
        })
        .collect();

    SequenceStore::build(&raw, 0.8, None)
}

fn build_model(store: &SequenceStore, variant: Variant) -> Model {
    Hyperparameters::new(store.num_items(), 32)
        .variant(variant)
        .learning_rate(0.01)
        .build()
}

fn bench_fit(c: &mut Criterion) {
    let store = synthetic_store(256, 500, 20);

    for &variant in &[Variant::Star, Variant::Sitar] {
        let model = build_model(&store, variant);
        let optimizer = model.optimizer();
        let store = store.clone();
        let mut rng = XorShiftRng::from_seed([1; 16]);

        c.bench_function(&format!("fit_epoch_{}", variant), move |b| {
            b.iter(|| model.fit_epoch(&store, &optimizer, 64, &mut rng).unwrap())
        });
    }
}

fn bench_evaluate(c: &mut Criterion) {
    let store = synthetic_store(64, 500, 20);
    let table = RankLogTable::new(store.num_items());

    for &variant in &[Variant::Star, Variant::Sitar] {
        let model = build_model(&store, variant);
        let store = store.clone();
        let table = table.clone();
        let mut rng = XorShiftRng::from_seed([1; 16]);

        c.bench_function(&format!("evaluate_{}", variant), move |b| {
            b.iter(|| {
                evaluate(
                    &model,
                    &store,
                    &table,
                    &EvaluationSettings::default(),
                    &mut rng,
                ).unwrap()
            })
        });
    }
}

criterion_group!{
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_fit, bench_evaluate
}
criterion_main!(benches);
