//! Times one dense multiply of two random square matrices.

use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;

use cugemm::{DenseMatrix, EngineConfig, GemmEngine};

fn main() -> Result<()> {
    let dim: usize = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("invalid matrix dimension: {arg}"))?,
        None => 100,
    };

    if !GemmEngine::is_available() {
        anyhow::bail!("no CUDA device available");
    }

    let mut rng = StdRng::seed_from_u64(42);
    let a = DenseMatrix::<f32>::random(dim, dim, &mut rng);
    let b = DenseMatrix::<f32>::random(dim, dim, &mut rng);

    let engine = GemmEngine::new(EngineConfig::default()).context("engine setup failed")?;

    let start = Instant::now();
    let c = engine.dot(&a, &b).context("multiply failed")?;
    let elapsed = start.elapsed();

    println!(
        "multiplied two {dim}x{dim} matrices in {:.6} s (checksum {:.6})",
        elapsed.as_secs_f64(),
        c.data().iter().map(|v| *v as f64).sum::<f64>()
    );

    Ok(())
}
