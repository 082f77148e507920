use std::collections::HashMap;
use std::sync::Mutex;

use criterion::{
    criterion_group, criterion_main, measurement::Measurement, BenchmarkGroup, BenchmarkId,
    Criterion, SamplingMode,
};

use kmvd::Sketch;

struct TrialTracker {
    tracker: Mutex<HashMap<u64, HashMap<String, f64>>>,
}

impl TrialTracker {
    fn observe(&self, name: &str, expected: u64, actual: f64) {
        let mut tracker = self.tracker.lock().unwrap();
        let tracker = tracker.entry(expected).or_insert_with(HashMap::new);
        let entry = tracker.entry(name.to_owned()).or_insert(0.0);
        let relerr = (expected as f64 - actual) / (expected as f64);
        *entry = entry.max(relerr.abs());
    }

    fn to_map(self) -> HashMap<u64, HashMap<String, f64>> {
        self.tracker.into_inner().unwrap()
    }
}

fn bench_input<I, F, E, M: Measurement>(
    group: &mut BenchmarkGroup<M>,
    sz: u64,
    name: &str,
    k: usize,
    init: I,
    update: F,
    estimate: E,
    tracker: &TrialTracker,
) where
    I: Fn(usize) -> Sketch,
    F: Fn(&mut Sketch, u64),
    E: Fn(&Sketch) -> f64,
{
    group.bench_with_input(BenchmarkId::new(name, sz), &sz, |b, i| {
        b.iter(|| {
            let mut sketch = init(k);
            for key in 0..(*i) {
                update(&mut sketch, key);
            }
            let e = estimate(&sketch);
            tracker.observe(name, sz, e);
        })
    });
}

fn bench_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("add-hash-throughput");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);
    let million = 1000 * 1000;
    let tracker = TrialTracker {
        tracker: Mutex::new(HashMap::new()),
    };
    for i in [million].iter().copied() {
        bench_input(
            &mut group,
            i,
            "kmvd::Sketch k=1024",
            1024,
            Sketch::new,
            |sketch, key| {
                sketch.add_hash(key);
            },
            Sketch::cardinality,
            &tracker,
        );
        bench_input(
            &mut group,
            i,
            "kmvd::Sketch k=16384",
            16384,
            Sketch::new,
            |sketch, key| {
                sketch.add_hash(key);
            },
            Sketch::cardinality,
            &tracker,
        );
    }
    group.finish();

    eprintln!("relative errors");
    for (sz, map) in tracker.to_map().into_iter() {
        eprintln!("size: {}", sz);
        let mut v: Vec<_> = map.into_iter().collect();
        v.sort_by(|(an, ar), (bn, br)| ar.total_cmp(br).then_with(|| an.cmp(bn)));
        for (name, relerr) in v.into_iter() {
            eprintln!("  relerr: {:5.1}% name: {}", relerr * 100.0, name);
        }
    }
}

fn bench_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("union");
    group.sample_size(10);
    let k = 4096usize;
    let mut a = Sketch::new(k);
    let mut b = Sketch::new(k);
    for key in 0..200_000u64 {
        a.add_hash(key);
    }
    for key in 100_000..300_000u64 {
        b.add_hash(key);
    }
    group.bench_function("union(a, b)", |bench| {
        bench.iter(|| kmvd::sketch::union(&[&a, &b]))
    });
    group.finish();
}

criterion_group!(benches, bench_speed, bench_union);
criterion_main!(benches);
