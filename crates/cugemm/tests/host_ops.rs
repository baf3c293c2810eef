//! Host-side behavior that needs no device: shape validation, stacking,
//! and error formatting.

use rand::rngs::StdRng;
use rand::SeedableRng;

use cugemm::{stack, uniform_shape, CugemmError, DenseMatrix, Shapes};

#[test]
fn shapes_gate_runs_before_any_device_work() {
    // Pure validation: must fail identically with or without a device.
    let err = Shapes::for_product("dot", 4, 5, 6, 4).unwrap_err();
    match err {
        CugemmError::ShapeMismatch { op, detail } => {
            assert_eq!(op, "dot");
            assert!(detail.contains("4x5"));
            assert!(detail.contains("6x4"));
        }
        other => panic!("expected ShapeMismatch, got {other}"),
    }
}

#[test]
fn shapes_carry_result_dimensions() {
    let shapes = Shapes::for_product("dot", 7, 3, 3, 5).unwrap();
    assert_eq!(shapes.c_rows, 7);
    assert_eq!(shapes.c_cols(), 5);
    assert_eq!(shapes.c_len(), 35);
}

#[test]
fn uniform_shape_rejects_empty_and_ragged_tensors() {
    let empty: Vec<DenseMatrix<f64>> = Vec::new();
    assert!(matches!(
        uniform_shape("op", &empty),
        Err(CugemmError::ShapeMismatch { .. })
    ));

    let mut rng = StdRng::seed_from_u64(7);
    let ragged = vec![
        DenseMatrix::<f64>::random(2, 3, &mut rng),
        DenseMatrix::<f64>::random(3, 3, &mut rng),
    ];
    assert!(matches!(
        uniform_shape("op", &ragged),
        Err(CugemmError::ShapeMismatch { .. })
    ));
}

#[test]
fn stack_lays_slots_down_the_rows() {
    let a = DenseMatrix::<f32>::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let b = DenseMatrix::<f32>::from_vec(2, 2, vec![5.0, 6.0, 7.0, 8.0]).unwrap();
    let stacked = stack(&[a.clone(), b.clone()]).unwrap();

    assert_eq!(stacked.rows(), 4);
    assert_eq!(stacked.cols(), 2);
    for r in 0..2 {
        for c in 0..2 {
            assert_eq!(stacked.get(r, c), a.get(r, c));
            assert_eq!(stacked.get(r + 2, c), b.get(r, c));
        }
    }
}

#[test]
fn stack_rejects_width_mismatch() {
    let mut rng = StdRng::seed_from_u64(11);
    let tensor = vec![
        DenseMatrix::<f32>::random(2, 3, &mut rng),
        DenseMatrix::<f32>::random(2, 4, &mut rng),
    ];
    assert!(matches!(
        stack(&tensor),
        Err(CugemmError::ShapeMismatch { .. })
    ));
}

#[test]
fn scaled_identity_has_diagonal_only() {
    let m = DenseMatrix::<f64>::scaled_identity(3, 2.5);
    for r in 0..3 {
        for c in 0..3 {
            let expected = if r == c { 2.5 } else { 0.0 };
            assert_eq!(m.get(r, c), expected);
        }
    }
}

#[test]
fn out_of_memory_message_names_all_three_sizes() {
    let err = CugemmError::OutOfDeviceMemory {
        op: "dot",
        requested_bytes: 1024,
        free_bytes: 512,
        total_bytes: 2048,
    };
    let msg = err.to_string();
    assert!(msg.contains("dot"));
    assert!(msg.contains("1024"));
    assert!(msg.contains("512"));
    assert!(msg.contains("2048"));
}
