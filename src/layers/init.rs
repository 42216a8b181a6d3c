use ndarray::prelude::*;
use ndarray::ShapeBuilder;
use ndarray_rand::rand_distr::{Distribution, Normal};
use rand::Rng;

pub const WEIGHT_STDDEV: f32 = 0.1;
pub const BIAS_INIT: f32 = 0.1;

/// Samples from N(0, stddev^2), redrawing anything further than two standard
/// deviations from the mean.
pub fn truncated_normal<Sh, D, R>(shape: Sh, stddev: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let normal = Normal::new(0.0, stddev).expect("stddev should be finite and non-negative");
    let bound = 2.0 * stddev;
    Array::from_shape_simple_fn(shape, || loop {
        let x: f32 = normal.sample(rng);
        if x.abs() <= bound {
            return x;
        }
    })
}

pub fn constant<Sh, D>(shape: Sh, value: f32) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
{
    Array::from_elem(shape, value)
}
