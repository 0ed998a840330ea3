use std::thread;
use tch::{Device, Kind, Tensor};
use vmail::checkpoint::Checkpointable;
use vmail::data::Batch;
use vmail::prelude::*;
use vmail::training::{SyncGroup, ThreadBackend};

fn config() -> VmailConfig {
    VmailConfig {
        cnn_depth: 2,
        num_units: 8,
        hidden_units: 4,
        out_units: 4,
        ..VmailConfig::default()
    }
    .with_batch(2, 3)
    .with_latent(2, 3)
    .with_horizon(2)
    .with_replicas(2)
}

fn batch(seed: i64) -> Batch {
    tch::manual_seed(seed);
    let opts = (Kind::Float, Device::Cpu);
    Batch {
        image: Tensor::rand([2, 3, 64, 64, 3], opts) - 0.5,
        proprio: Some(Tensor::randn([2, 3, 4], opts)),
        action: Tensor::rand([2, 3, 2], opts) * 2.0 - 1.0,
        reward: None,
        discount: Some(Tensor::ones([2, 3], opts)),
    }
}

fn params(learner: &Learner) -> Vec<(String, Tensor)> {
    learner
        .named_tensors()
        .into_iter()
        .filter(|(name, _)| name.contains("/params/"))
        .collect()
}

#[test]
fn test_replicas_stay_identical() {
    let group = SyncGroup::new(2);
    let worker_group = group.clone();
    let worker = thread::spawn(move || {
        let config = config();
        let backend = ThreadBackend::new(1, worker_group);
        let mut learner = Learner::new(&config, 2, Some(4), Box::new(backend)).unwrap();
        let mut ctx = TrainContext::new(0);
        learner.train_step(&batch(11), &batch(12), &mut ctx).unwrap();
        assert!(ctx.metrics.is_empty(), "only the leader records metrics");
        params(&learner)
    });

    let config = config();
    let mut learner =
        Learner::new(&config, 2, Some(4), Box::new(ThreadBackend::new(0, group))).unwrap();
    let mut ctx = TrainContext::new(0);
    learner.train_step(&batch(21), &batch(22), &mut ctx).unwrap();
    assert!(!ctx.metrics.is_empty());

    let leader = params(&learner);
    let follower = worker.join().unwrap();
    assert_eq!(leader.len(), follower.len());
    for ((name, a), (other, b)) in leader.iter().zip(&follower) {
        assert_eq!(name, other);
        assert!(a.equal(b), "{} diverged", name);
    }
}
