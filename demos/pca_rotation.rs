use nalgebra::*;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand_distr::{Normal, StandardNormal};
use bayes_vmp::prelude::*;

// Compares plain VB updates with rotation-accelerated updates on a PCA model,
// both resumed from the same checkpoint.
//
// RUST_LOG=info cargo run --example pca_rotation
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let (m, n, d_y, d, maxiter) = (10, 100, 5, 9, 100);
    let seed = 45;
    println!("seed = {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);

    let w = DMatrix::<f64>::from_fn(m, d_y, |_, _| rng.sample(StandardNormal));
    let x = DMatrix::<f64>::from_fn(n, d_y, |_, _| rng.sample(StandardNormal));
    let noise = Normal::new(0., 0.5)?;
    let mut y = &w * x.transpose();
    y.iter_mut().for_each(|v| *v += rng.sample(noise));

    // Randomly missing values, plus a gap of 20 columns.
    let mut mask = DMatrix::from_fn(m, n, |_, _| rng.gen::<f64>() < 0.9);
    for j in 20..40 {
        mask.column_mut(j).fill(false);
    }
    y.zip_apply(&mask, |v, obs| if !obs { *v = f64::NAN });

    let (graph, pca) = pca_model(m, n, d)?;
    let checkpoint = tempfile::Builder::new().suffix(".json").tempfile()?;
    let mut vb = Vb::new(graph, VbConfig::default().autosave(checkpoint.path(), None))?;
    vb.observe(pca.y, &(&y).into(), &(&mask).into())?;
    for id in [pca.alpha, pca.tau, pca.x, pca.w] {
        vb.initialize_from_prior(id)?;
    }
    vb.initialize_from_random(pca.x, &mut rng)?;
    vb.initialize_from_random(pca.w, &mut rng)?;

    vb.update(10)?;
    vb.save()?;

    let rot = RotationOptimizer::new(RotateGaussian::new(pca.x), RotateGaussianArd::new(pca.w), d);
    for _ in 0..(maxiter / 3) {
        vb.update(3)?;
        rot.rotate(&mut vb)?;
    }
    let l_rot = vb.lower_bounds().to_vec();

    vb.load()?;
    vb.update(maxiter)?;
    let l_norot = vb.lower_bounds().to_vec();

    println!("{:>10} {:>16} {:>16}", "iteration", "with rotations", "without");
    for i in (0..l_rot.len().max(l_norot.len())).step_by(10) {
        let fmt = |l : &[f64]| l.get(i).map(|v| format!("{:.4}", v)).unwrap_or_default();
        println!("{:>10} {:>16} {:>16}", i + 1, fmt(&l_rot), fmt(&l_norot));
    }
    println!(
        "Final bound: {:.4} (with rotations), {:.4} (without)",
        l_rot.last().copied().unwrap_or(f64::NAN),
        l_norot.last().copied().unwrap_or(f64::NAN)
    );
    Ok(())
}
