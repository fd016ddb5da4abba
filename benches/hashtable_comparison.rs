use core::hash::BuildHasherDefault;
use core::hint::black_box;

use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;
use group_hash::HashMap as GroupHashMap;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use siphasher::sip::SipHasher;

type SipBuild = BuildHasherDefault<SipHasher>;

const SIZES: &[usize] = &[
    ((1 << 10) as f32 * 0.87) as usize,
    ((1 << 14) as f32 * 0.87) as usize,
    ((1 << 17) as f32 * 0.87) as usize,
];

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_function(format!("group_hash/{}", size), |b| {
            b.iter(|| {
                let mut map: GroupHashMap<u64, u64, SipBuild> = GroupHashMap::new();
                for key in 0..*size as u64 {
                    black_box(map.insert(key, key).1);
                }
                black_box(map)
            })
        });
        group.bench_function(format!("group_hash_preallocated/{}", size), |b| {
            b.iter(|| {
                let mut map: GroupHashMap<u64, u64, SipBuild> =
                    GroupHashMap::with_capacity(size * 8 / 7 + 1);
                for key in 0..*size as u64 {
                    black_box(map.insert(key, key).1);
                }
                black_box(map)
            })
        });
        group.bench_function(format!("std/{}", size), |b| {
            b.iter(|| {
                let mut map: std::collections::HashMap<u64, u64, SipBuild> =
                    std::collections::HashMap::default();
                for key in 0..*size as u64 {
                    black_box(map.insert(key, key));
                }
                black_box(map)
            })
        });
        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                let mut map: hashbrown::HashMap<u64, u64, SipBuild> =
                    hashbrown::HashMap::default();
                for key in 0..*size as u64 {
                    black_box(map.insert(key, key));
                }
                black_box(map)
            })
        });
    }

    group.finish();
}

fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        let mut ours: GroupHashMap<u64, u64, SipBuild> = GroupHashMap::new();
        let mut std_map: std::collections::HashMap<u64, u64, SipBuild> =
            std::collections::HashMap::default();
        let mut brown: hashbrown::HashMap<u64, u64, SipBuild> = hashbrown::HashMap::default();
        for key in 0..*size as u64 {
            ours.insert(key, key);
            std_map.insert(key, key);
            brown.insert(key, key);
        }

        group.bench_function(format!("group_hash/{}", size), |b| {
            b.iter(|| {
                for key in 0..*size as u64 {
                    black_box(ours.get(&key));
                }
            })
        });
        group.bench_function(format!("std/{}", size), |b| {
            b.iter(|| {
                for key in 0..*size as u64 {
                    black_box(std_map.get(&key));
                }
            })
        });
        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                for key in 0..*size as u64 {
                    black_box(brown.get(&key));
                }
            })
        });
    }

    group.finish();
}

fn bench_lookup_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_miss");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        let mut ours: GroupHashMap<u64, u64, SipBuild> = GroupHashMap::new();
        let mut brown: hashbrown::HashMap<u64, u64, SipBuild> = hashbrown::HashMap::default();
        for key in 0..*size as u64 {
            ours.insert(key, key);
            brown.insert(key, key);
        }

        group.bench_function(format!("group_hash/{}", size), |b| {
            b.iter(|| {
                for key in 0..*size as u64 {
                    black_box(ours.get(&(key + u32::MAX as u64)));
                }
            })
        });
        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                for key in 0..*size as u64 {
                    black_box(brown.get(&(key + u32::MAX as u64)));
                }
            })
        });
    }

    group.finish();
}

/// Paired erase/insert at a steady population, the workload the tombstone
/// reclamation rules exist for.
fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");

    for size in SIZES.iter() {
        group.throughput(Throughput::Elements(1));

        let mut rng = StdRng::seed_from_u64(0x9e3779b97f4a7c15);
        let mut ours: GroupHashMap<u64, u64, SipBuild> = GroupHashMap::new();
        let mut brown: hashbrown::HashMap<u64, u64, SipBuild> = hashbrown::HashMap::default();
        for _ in 0..*size {
            let key = rng.random_range(2..*size as u64);
            ours.insert(key, key);
            brown.insert(key, key);
        }

        let mut victim = rng.random_range(2..*size as u64);
        group.bench_function(format!("group_hash/{}", size), |b| {
            b.iter(|| {
                ours.remove(&victim);
                victim = rng.random_range(2..*size as u64);
                black_box(ours.insert(victim, victim).1);
            })
        });

        let mut victim = rng.random_range(2..*size as u64);
        group.bench_function(format!("hashbrown/{}", size), |b| {
            b.iter(|| {
                brown.remove(&victim);
                victim = rng.random_range(2..*size as u64);
                black_box(brown.insert(victim, victim));
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_lookup_hit,
    bench_lookup_miss,
    bench_churn
);
criterion_main!(benches);
