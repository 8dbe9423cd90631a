//! Parameter-initialization functions.
//!
//! The convolution kernels draw their learnable parameters from *U(−k, k)*
//! with `k = (1. / fan_in as f32).sqrt()`; the functions here are also
//! usable by a driver that wants to re-initialize a layer's parameters.

use ndarray::{Array, Dimension};

use ndarray_rand::{rand_distr::Uniform, RandomExt};

use crate::tensor::Tensor;

/// Fills `param` with draws from *U(low, high)*.
pub fn uniform<D>(param: &Tensor<D>, low: f32, high: f32)
where
    D: Dimension,
{
    let mut data = param.data_mut();
    let dim = data.raw_dim();
    data.assign(&Array::random(dim, Uniform::new(low, high)));
}

/// Fills `param` with `value`.
pub fn constant<D>(param: &Tensor<D>, value: f32)
where
    D: Dimension,
{
    param.data_mut().fill(value);
}

/// Zero-fills `param`.
pub fn zeros<D>(param: &Tensor<D>)
where
    D: Dimension,
{
    constant(param, 0.);
}
