mod common;

use nalgebra::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use approx::assert_relative_eq;
use bayes_vmp::prelude::*;
use bayes_vmp::distr::Message;
use common::*;

fn small(seed : u64) -> (Vb, PcaModel) {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = PcaData::simulate(&mut rng, 6, 30, 2, 0.8, Some((10, 15)));
    pca_engine(&mut rng, &data, 4, VbConfig::default())
}

#[test]
fn lower_bound_is_monotone() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut vb, _) = small(11);
    vb.update(40).unwrap();
    let l = vb.lower_bounds();
    assert_eq!(l.len(), 40);
    for w in l.windows(2) {
        assert!(w[1] >= w[0] - 1e-9 * w[0].abs(), "{} < {}", w[1], w[0]);
    }
    assert_relative_eq!(vb.lower_bound().unwrap(), l[39], max_relative = 1e-12);
}

#[test]
fn unobserved_data_leaves_prior() {
    let mut g = FactorGraph::new();
    let mu = g.add_gaussian("mu", &[], DVector::from_element(1, 2.0), Precision::Fixed(DMatrix::from_element(1, 1, 4.0))).unwrap();
    let tau = g.add_gamma("tau", &[], 3.0, 2.0).unwrap();
    let y = g.add_normal_with_plates("y", mu, tau, &[5]).unwrap();
    let mut vb = Vb::new(g, VbConfig::default()).unwrap();
    let data = PlateArray::new(&[5], vec![10., 11., 12., 13., 14.]).unwrap();
    vb.observe(y, &data, &PlateArray::filled(&[5], false)).unwrap();
    vb.initialize_from_value(mu, &DMatrix::from_element(1, 1, -3.0)).unwrap();
    vb.initialize_from_value(tau, &DMatrix::from_element(1, 1, 9.0)).unwrap();
    vb.update(1).unwrap();
    let m = vb.graph().gaussian_moments(mu).unwrap();
    assert_relative_eq!(m.mean[0][0], 2.0, epsilon = 1e-12);
    assert_relative_eq!(m.cov[0][(0, 0)], 0.25, epsilon = 1e-12);
    assert_eq!(vb.graph().gamma(tau).unwrap().shape_rate(0), (3.0, 2.0));
    assert_relative_eq!(vb.lower_bound().unwrap(), 0.0, epsilon = 1e-10);
    assert_eq!(vb.graph().message_to(mu).unwrap(), Message::gaussian(1, 1));
}

#[test]
fn dot_mean_is_exact_product_sum() {
    let (vb, pca) = small(12);
    let g = vb.graph();
    let f = g.scalar_moments(pca.wx).unwrap();
    let (w, x) = (g.gaussian_moments(pca.w).unwrap(), g.gaussian_moments(pca.x).unwrap());
    for i in 0..6 {
        for j in 0..30 {
            let expected : f64 = (0..4).map(|d| w.mean[i][d] * x.mean[j][d]).sum();
            assert_relative_eq!(f.mean[i * 30 + j], expected, epsilon = 1e-12, max_relative = 1e-12);
            let second : f64 = (0..4).flat_map(|a| (0..4).map(move |b| (a, b)))
                .map(|(a, b)| w.second[i][(a, b)] * x.second[j][(a, b)])
                .sum();
            assert_relative_eq!(f.second[i * 30 + j], second, epsilon = 1e-12, max_relative = 1e-12);
        }
    }
}

#[test]
fn reloading_reproduces_trajectory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    let (mut vb, _) = small(13);
    vb.update(5).unwrap();
    vb.save_to(&path).unwrap();
    assert_eq!(vb.state(), VbState::Checkpointed);
    vb.update(10).unwrap();
    let first = vb.lower_bounds().to_vec();
    vb.load_from(&path).unwrap();
    assert_eq!(vb.iteration(), 5);
    assert_eq!(vb.lower_bounds(), &first[..5]);
    vb.update(10).unwrap();
    let second = vb.lower_bounds().to_vec();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn mismatched_checkpoint_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    let (mut vb, _) = small(14);
    vb.update(2).unwrap();
    vb.save_to(&path).unwrap();

    let mut rng = StdRng::seed_from_u64(14);
    let data = PcaData::simulate(&mut rng, 6, 30, 2, 0.8, None);
    let (mut other, _) = pca_engine(&mut rng, &data, 3, VbConfig::default());
    other.update(1).unwrap();
    let before = other.snapshot();
    match other.load_from(&path) {
        Err(BayesError::StructuralMismatch(_)) => { },
        r => panic!("Unexpected result: {:?}", r)
    }
    assert_eq!(other.snapshot(), before);
    assert_eq!(other.iteration(), 1);

    vb.terminate();
    assert!(vb.load_from(&path).is_err());
}

#[test]
fn observe_rejects_bad_shapes() {
    let (graph, pca) = pca_model(3, 4, 2).unwrap();
    let mut vb = Vb::new(graph, VbConfig::default()).unwrap();
    let data = PlateArray::filled(&[3, 4], 1.0);
    let mask = PlateArray::filled(&[3, 4], true);
    assert!(matches!(vb.observe(pca.y, &PlateArray::filled(&[4, 3], 1.0), &mask), Err(BayesError::ShapeMismatch { .. })));
    assert!(matches!(vb.observe(pca.y, &data, &PlateArray::filled(&[3], true)), Err(BayesError::ShapeMismatch { .. })));
    assert!(vb.observe(pca.x, &data, &mask).is_err());
    vb.observe(pca.y, &data, &mask).unwrap();
}
