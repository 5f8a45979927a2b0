//! Plan construction cost for growing chains and device counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use gg_deploy::planner::{Artifact, DeployPlanner, DeviceInfo, ModelQueueInfo, ModelRelation, QueueDef, Submodel};

/// q0 -> [m0] -> q1 -> [m1] -> ... -> q{len}
fn chain(len: usize) -> (Vec<Submodel>, ModelRelation) {
    let artifact = Artifact::from_bytes(vec![0u8; 4096]);
    let mut relation = ModelRelation::default();
    relation.queue_defs = (0..=len).map(|i| QueueDef::new(format!("q{i}"), 16)).collect();
    let first = "q0".to_string();
    let last = format!("q{len}");
    relation.root_model_queue_info = ModelQueueInfo::new(&[first.as_str()], &[last.as_str()]);

    let mut models = Vec::with_capacity(len);
    for i in 0..len {
        let name = format!("m{i}");
        let input = format!("q{i}");
        let output = format!("q{}", i + 1);
        relation
            .submodel_queue_infos
            .insert(name.clone(), ModelQueueInfo::new(&[input.as_str()], &[output.as_str()]));
        models.push(Submodel::new(name, artifact.clone()));
    }
    (models, relation)
}

fn bench_plans(c: &mut Criterion) {
    let planner = DeployPlanner::new();
    let mut group = c.benchmark_group("build_plan");

    for len in [4usize, 32, 128] {
        let (models, relation) = chain(len);
        for device_count in [1u32, 8] {
            let devices: Vec<DeviceInfo> = (0..device_count).map(|d| DeviceInfo::new(0, d, 0)).collect();
            let id = BenchmarkId::new(format!("chain{len}"), format!("{device_count}dev"));
            group.bench_with_input(id, &devices, |b, devices| {
                b.iter(|| {
                    let plan = planner
                        .build_plan(black_box(&models), Some(&relation), devices)
                        .expect("chain must plan");
                    black_box(plan.queue_count())
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_plans);
criterion_main!(benches);
