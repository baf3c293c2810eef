//! End-to-end tests against a live CUDA device.
//!
//! Every test degrades to a skip (with a note on stderr) when no
//! device is present, so the suite passes on CPU-only machines.

use rand::rngs::StdRng;
use rand::SeedableRng;

use cugemm::{
    CugemmError, DenseMatrix, EngineConfig, GemmElement, GemmEngine, PersistentGemmEngine,
};

fn engine_or_skip() -> Option<GemmEngine> {
    engine_or_skip_with(EngineConfig::default())
}

fn engine_or_skip_with(config: EngineConfig) -> Option<GemmEngine> {
    if !GemmEngine::is_available() {
        eprintln!("skipping: no CUDA device available");
        return None;
    }
    match GemmEngine::new(config) {
        Ok(engine) => Some(engine),
        Err(err) => {
            eprintln!("skipping: engine setup failed: {err}");
            None
        }
    }
}

/// Host reference product, accumulated in f64.
fn matmul_ref<T: GemmElement>(a: &DenseMatrix<T>, b: &DenseMatrix<T>) -> Vec<f64> {
    assert_eq!(a.cols(), b.rows());
    let mut out = vec![0.0f64; a.rows() * b.cols()];
    for c in 0..b.cols() {
        for r in 0..a.rows() {
            let mut acc = 0.0f64;
            for k in 0..a.cols() {
                acc += a.get(r, k).to_f64() * b.get(k, c).to_f64();
            }
            out[c * a.rows() + r] = acc;
        }
    }
    out
}

fn assert_close<T: GemmElement>(got: &DenseMatrix<T>, want: &[f64], tol: f64) {
    assert_eq!(got.len(), want.len());
    for c in 0..got.cols() {
        for r in 0..got.rows() {
            let g = got.get(r, c).to_f64();
            let w = want[c * got.rows() + r];
            let scale = w.abs().max(1.0);
            assert!(
                (g - w).abs() <= tol * scale,
                "mismatch at ({r}, {c}): got {g}, want {w}"
            );
        }
    }
}

#[test]
fn dot_matches_host_reference_f32() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(1);
    for (m, k, n) in [(2, 3, 2), (17, 9, 23), (64, 64, 64)] {
        let a = DenseMatrix::<f32>::random(m, k, &mut rng);
        let b = DenseMatrix::<f32>::random(k, n, &mut rng);
        let c = engine.dot(&a, &b).unwrap();
        assert_eq!((c.rows(), c.cols()), (m, n));
        assert_close(&c, &matmul_ref(&a, &b), 1e-4);
    }
}

#[test]
fn dot_matches_host_reference_f64() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(2);
    let a = DenseMatrix::<f64>::random(31, 40, &mut rng);
    let b = DenseMatrix::<f64>::random(40, 13, &mut rng);
    let c = engine.dot(&a, &b).unwrap();
    assert_close(&c, &matmul_ref(&a, &b), 1e-10);
}

#[test]
fn dot_through_pinned_staging_matches() {
    let Some(engine) = engine_or_skip_with(EngineConfig {
        pinned: true,
        ..EngineConfig::default()
    }) else {
        return;
    };
    let mut rng = StdRng::seed_from_u64(3);
    let a = DenseMatrix::<f32>::random(20, 30, &mut rng);
    let b = DenseMatrix::<f32>::random(30, 10, &mut rng);
    let c = engine.dot(&a, &b).unwrap();
    assert_close(&c, &matmul_ref(&a, &b), 1e-4);
}

#[test]
fn dot_rejects_inner_dimension_mismatch() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(4);
    let a = DenseMatrix::<f32>::random(4, 5, &mut rng);
    let b = DenseMatrix::<f32>::random(6, 4, &mut rng);
    assert!(matches!(
        engine.dot(&a, &b),
        Err(CugemmError::ShapeMismatch { op: "dot", .. })
    ));
}

#[test]
fn right_matrix_tensor_matches_per_slot_dot() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(5);
    let a = DenseMatrix::<f64>::random(6, 8, &mut rng);
    let tensor: Vec<_> = (0..5)
        .map(|_| DenseMatrix::<f64>::random(8, 7, &mut rng))
        .collect();

    let batched = engine.right_matrix_tensor(&a, &tensor).unwrap();
    assert_eq!(batched.len(), tensor.len());
    for (result, slot) in batched.iter().zip(&tensor) {
        assert_close(result, &matmul_ref(&a, slot), 1e-10);
    }
}

#[test]
fn matrix_tensor_stacks_per_slot_products() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(6);
    let a = DenseMatrix::<f32>::random(3, 4, &mut rng);
    let tensor: Vec<_> = (0..3)
        .map(|_| DenseMatrix::<f32>::random(4, 5, &mut rng))
        .collect();

    let stacked = engine.matrix_tensor(&a, &tensor).unwrap();
    assert_eq!(stacked.rows(), 3 * tensor.len());
    assert_eq!(stacked.cols(), 5);
    for (i, slot) in tensor.iter().enumerate() {
        let want = matmul_ref(&a, slot);
        for c in 0..5 {
            for r in 0..3 {
                let g = stacked.get(i * 3 + r, c) as f64;
                let w = want[c * 3 + r];
                assert!((g - w).abs() <= 1e-4 * w.abs().max(1.0));
            }
        }
    }
}

#[test]
fn triple_tensor_product_matches_host_reference() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(7);
    let a = DenseMatrix::<f64>::random(5, 6, &mut rng);
    let c = DenseMatrix::<f64>::random(4, 9, &mut rng);
    let tensor: Vec<_> = (0..4)
        .map(|_| DenseMatrix::<f64>::random(6, 4, &mut rng))
        .collect();

    let products = engine.triple_tensor_product(&a, &c, &tensor).unwrap();
    assert_eq!(products.len(), tensor.len());
    for (result, slot) in products.iter().zip(&tensor) {
        let mid = matmul_ref(&a, slot);
        let mid = DenseMatrix::<f64>::from_vec(5, 4, mid).unwrap();
        assert_close(result, &matmul_ref(&mid, &c), 1e-10);
    }
}

#[test]
fn triple_product_with_scaled_identities_rescales() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(8);
    let a = DenseMatrix::<f64>::random(4, 4, &mut rng);
    let c = DenseMatrix::<f64>::scaled_identity(4, 3.0);
    let tensor = vec![
        DenseMatrix::<f64>::scaled_identity(4, 1.0),
        DenseMatrix::<f64>::scaled_identity(4, 2.0),
    ];

    let products = engine.triple_tensor_product(&a, &c, &tensor).unwrap();
    for r in 0..4 {
        for col in 0..4 {
            let base = a.get(r, col);
            assert!((products[0].get(r, col) - 3.0 * base).abs() <= 1e-10 * base.abs().max(1.0));
            assert!((products[1].get(r, col) - 6.0 * base).abs() <= 1e-10 * base.abs().max(1.0));
        }
    }
}

#[test]
fn impossible_allocation_reports_out_of_device_memory() {
    let Some(engine) = engine_or_skip() else { return };
    let (free_before, total) = engine.memory().mem_info().unwrap();

    // More elements than the whole card holds.
    let err = engine
        .memory()
        .alloc::<f64>("huge", total / 8 + (1 << 20))
        .unwrap_err();
    match err {
        CugemmError::OutOfDeviceMemory {
            op,
            requested_bytes,
            free_bytes,
            total_bytes,
        } => {
            assert_eq!(op, "huge");
            assert!(requested_bytes > free_bytes);
            assert_eq!(total_bytes, total);
        }
        other => panic!("expected OutOfDeviceMemory, got {other}"),
    }

    // The failed request must not have consumed device memory.
    let (free_after, _) = engine.memory().mem_info().unwrap();
    assert!(free_after >= free_before - (1 << 20));
}

#[test]
fn overflowing_element_count_reports_out_of_device_memory() {
    let Some(engine) = engine_or_skip() else { return };

    // usize::MAX / 2 elements of f64 wraps the byte size.
    let err = engine
        .memory()
        .alloc::<f64>("huge", usize::MAX / 2)
        .unwrap_err();
    match err {
        CugemmError::OutOfDeviceMemory {
            op,
            requested_bytes,
            ..
        } => {
            assert_eq!(op, "huge");
            assert_eq!(requested_bytes, usize::MAX);
        }
        other => panic!("expected OutOfDeviceMemory, got {other}"),
    }
}

#[test]
fn engine_teardown_returns_device_memory() {
    let Some(engine) = engine_or_skip() else { return };
    let mut rng = StdRng::seed_from_u64(12);
    let a = DenseMatrix::<f32>::random(16, 16, &mut rng);

    // First construction pays any one-time driver costs.
    {
        let other = GemmEngine::new(EngineConfig::default()).unwrap();
        other.dot(&a, &a).unwrap();
    }
    let (free_before, _) = engine.memory().mem_info().unwrap();
    for _ in 0..3 {
        let other = GemmEngine::new(EngineConfig::default()).unwrap();
        other.dot(&a, &a).unwrap();
    }
    let (free_after, _) = engine.memory().mem_info().unwrap();
    // Contexts, streams, handles, and coefficient buffers must all be
    // released; allow a small slack for allocator granularity.
    assert!(free_after >= free_before - (8 << 20));
}

#[test]
fn buffers_release_memory_on_drop() {
    let Some(engine) = engine_or_skip() else { return };
    let (free_before, _) = engine.memory().mem_info().unwrap();

    let buffer = engine.memory().alloc::<f32>("probe", 1 << 22).unwrap();
    let (free_held, _) = engine.memory().mem_info().unwrap();
    assert!(free_held < free_before);

    engine.memory().free(buffer);
    let (free_after, _) = engine.memory().mem_info().unwrap();
    assert!(free_after > free_held);
}

#[test]
fn persistent_engine_matches_per_slot_dot() {
    if !GemmEngine::is_available() {
        eprintln!("skipping: no CUDA device available");
        return;
    }
    let persistent =
        match PersistentGemmEngine::<f64>::new(EngineConfig::default(), 3, (5, 6), (6, 2)) {
            Ok(engine) => engine,
            Err(err) => {
                eprintln!("skipping: engine setup failed: {err}");
                return;
            }
        };

    let mut rng = StdRng::seed_from_u64(9);
    let b = DenseMatrix::<f64>::random(6, 2, &mut rng);
    for round in 0..2 {
        let tensor: Vec<_> = (0..3)
            .map(|_| DenseMatrix::<f64>::random(5, 6, &mut rng))
            .collect();
        let products = persistent.tensor_dot_matrix(&tensor, &b).unwrap();
        assert_eq!(products.len(), 3, "round {round}");
        for (result, slot) in products.iter().zip(&tensor) {
            assert_close(result, &matmul_ref(slot, &b), 1e-10);
        }
    }
}

#[test]
fn persistent_engine_rejects_wrong_batch_and_shapes() {
    if !GemmEngine::is_available() {
        eprintln!("skipping: no CUDA device available");
        return;
    }
    assert!(matches!(
        PersistentGemmEngine::<f32>::new(EngineConfig::default(), 2, (3, 4), (5, 2)),
        Err(CugemmError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        PersistentGemmEngine::<f32>::new(EngineConfig::default(), 0, (3, 4), (4, 2)),
        Err(CugemmError::ShapeMismatch { .. })
    ));

    let persistent =
        match PersistentGemmEngine::<f32>::new(EngineConfig::default(), 2, (3, 4), (4, 2)) {
            Ok(engine) => engine,
            Err(err) => {
                eprintln!("skipping: engine setup failed: {err}");
                return;
            }
        };

    let mut rng = StdRng::seed_from_u64(10);
    let b = DenseMatrix::<f32>::random(4, 2, &mut rng);
    let short = vec![DenseMatrix::<f32>::random(3, 4, &mut rng)];
    assert!(matches!(
        persistent.tensor_dot_matrix(&short, &b),
        Err(CugemmError::ShapeMismatch { .. })
    ));

    let wrong_b = DenseMatrix::<f32>::random(4, 3, &mut rng);
    let tensor = vec![
        DenseMatrix::<f32>::random(3, 4, &mut rng),
        DenseMatrix::<f32>::random(3, 4, &mut rng),
    ];
    assert!(matches!(
        persistent.tensor_dot_matrix(&tensor, &wrong_b),
        Err(CugemmError::ShapeMismatch { .. })
    ));
}
