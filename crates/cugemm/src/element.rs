//! Scalar element types the engine can multiply.

use rand::Rng;

/// Which cuBLAS symbol family a scalar type maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// `cublasSgemm*`
    Single,
    /// `cublasDgemm*`
    Double,
}

/// Trait describing the numeric behaviour required of a device element.
///
/// Both supported precisions run through the same code paths; the only
/// per-type choice is which cuBLAS entry point to call, selected
/// statically via [`Precision`].
pub trait GemmElement: Copy + Default + Send + Sync + 'static {
    const PRECISION: Precision;

    fn zero() -> Self;
    fn one() -> Self;
    /// Draws a uniform sample in `[-1, 1)`.
    fn sample(rng: &mut impl Rng) -> Self;
    /// Converts into an `f64` for tolerance comparisons.
    fn to_f64(self) -> f64;
}

impl GemmElement for f32 {
    const PRECISION: Precision = Precision::Single;

    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn sample(rng: &mut impl Rng) -> Self {
        rng.gen::<f32>() * 2.0 - 1.0
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl GemmElement for f64 {
    const PRECISION: Precision = Precision::Double;

    fn zero() -> Self {
        0.0
    }

    fn one() -> Self {
        1.0
    }

    fn sample(rng: &mut impl Rng) -> Self {
        rng.gen::<f64>() * 2.0 - 1.0
    }

    fn to_f64(self) -> f64 {
        self
    }
}
