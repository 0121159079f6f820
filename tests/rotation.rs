mod common;

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::Duration;
use bayes_vmp::prelude::*;
use common::*;

const M : usize = 10;
const N : usize = 100;
const D : usize = 9;
const D_Y : usize = 5;

fn scenario() -> (Vb, PcaModel) {
    let mut rng = StdRng::seed_from_u64(45);
    let data = PcaData::simulate(&mut rng, M, N, D_Y, 0.9, Some((20, 40)));
    pca_engine(&mut rng, &data, D, VbConfig::default())
}

fn optimizer(pca : &PcaModel) -> RotationOptimizer {
    RotationOptimizer::new(RotateGaussian::new(pca.x), RotateGaussianArd::new(pca.w), D)
}

#[test]
fn rotations_accelerate_pca() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pca.json");
    let (vb, pca) = scenario();
    let mut vb = Vb::new(vb.graph().clone(), VbConfig::default().autosave(&path, None)).unwrap();
    vb.update(10).unwrap();
    vb.save().unwrap();

    let rot = optimizer(&pca);
    for _ in 0..33 {
        vb.update(3).unwrap();
        let before = vb.lower_bound().unwrap();
        rot.rotate(&mut vb).unwrap();
        assert!(vb.lower_bound().unwrap() >= before);
    }
    assert_eq!(vb.lower_bounds().len(), 10 + 99);
    let l_rot = *vb.lower_bounds().last().unwrap();

    vb.load().unwrap();
    assert_eq!(vb.iteration(), 10);
    vb.update(100).unwrap();
    let l_norot = *vb.lower_bounds().last().unwrap();
    assert!(l_rot >= l_norot - 1e-6 * l_norot.abs(), "with rotations {} < without {}", l_rot, l_norot);
}

#[test]
fn identity_proposal_leaves_state_bit_equal() {
    let (mut vb, pca) = scenario();
    vb.update(2).unwrap();
    let before = vb.snapshot();
    let config = RotationConfig { time_budget : Some(Duration::ZERO), ..RotationConfig::default() };
    let rot = optimizer(&pca).with_config(config);
    assert_eq!(rot.rotate(&mut vb).unwrap(), RotationOutcome::Unchanged);
    assert_eq!(vb.snapshot(), before);
}

#[test]
fn rotation_after_convergence_is_harmless() {
    let (mut vb, pca) = scenario();
    let rot = optimizer(&pca);
    for _ in 0..5 {
        vb.update(2).unwrap();
        rot.rotate(&mut vb).unwrap();
    }
    let first = rot.propose(&vb).unwrap();
    rot.apply(&mut vb, &first).unwrap();
    let before = vb.lower_bound().unwrap();
    let outcome = rot.rotate(&mut vb).unwrap();
    let after = vb.lower_bound().unwrap();
    assert!(after >= before, "{:?}: {} < {}", outcome, after, before);
    if outcome == RotationOutcome::Unchanged {
        assert_eq!(after, before);
    }
}

#[test]
fn terminated_engine_cannot_rotate() {
    let (mut vb, pca) = scenario();
    vb.update(2).unwrap();
    vb.terminate();
    let rot = optimizer(&pca);
    let proposal = rot.propose(&vb).unwrap();
    if !proposal.is_identity() {
        assert!(rot.apply(&mut vb, &proposal).is_err());
    }
    assert!(vb.update(1).is_err());
}
