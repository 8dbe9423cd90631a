//! Volumetric neural-network layer kernels.
//!
//! `volumetrika` implements the five layer primitives of video models over
//! 5-axis tensors shaped (batch, channels, length, height, width), with
//! forward and backward passes for each: [`Convolution3d`],
//! [`Deconvolution3d`], [`Pooling3d`], [`Crop3d`] and [`Stretch3d`].
//!
//! Tensor ownership, graph construction, scheduling and optimization belong
//! to the surrounding network driver; this crate fixes only the layer
//! lifecycle it exposes to that driver, the [`Layer`] trait. The driver owns
//! every boundary tensor and hands layers shared references:
//!
//! ```
//! use volumetrika::{Convolution3d, ConvolutionConfig, Layer};
//!
//! let bottom = vec![volumetrika::zeros([1, 3, 8, 16, 16])];
//! let top = vec![volumetrika::zeros([1, 1, 1, 1, 1])];
//!
//! let mut layer = Convolution3d::new(ConvolutionConfig {
//!     kernel_size: 3,
//!     kernel_depth: 3,
//!     stride: 1,
//!     temporal_stride: 1,
//!     pad: 1,
//!     temporal_pad: 1,
//!     num_output: 8,
//!     filter_group: 1,
//!     bias_term: true,
//! });
//!
//! layer.set_up(&bottom, &top);
//! assert_eq!(top[0].raw_dim(), ndarray::Dim([1, 8, 8, 16, 16]));
//!
//! let loss = layer.forward(&bottom, &top);
//! assert_eq!(loss, 0.);
//!
//! layer.backward(&top, &[true], &bottom);
//! ```
//!
//! Geometry and configuration errors are programming errors: they panic in
//! `set_up` and there is no recovery path.

mod convolution;
mod crop;
mod deconvolution;
mod layer;
mod pooling;
mod stretch;
mod tensor;
mod utils;

pub mod init;

#[cfg(feature = "gpu")]
pub mod gpu;

use std::rc::Rc;

use ndarray::{Array5, Dim};

pub use crate::{
    convolution::{Convolution3d, ConvolutionConfig},
    crop::{Crop3d, CropConfig},
    deconvolution::{Deconvolution3d, DeconvolutionConfig},
    layer::Layer,
    pooling::{PoolMethod, Pooling3d, PoolingConfig},
    stretch::{Stretch3d, StretchConfig},
    tensor::{Tensor, Volume},
};

/// Where a layer runs its arithmetic.
///
/// The two backends satisfy the same pre- and post-conditions on tensor
/// shapes and agree numerically; the accelerated one synchronizes every
/// host-visible result before the layer call returns.
#[derive(Clone, Default)]
pub enum Backend {
    /// [ndarray] + [rayon] on the host.
    #[default]
    Native,
    /// wgpu compute pipelines on whatever adapter the context was opened on.
    #[cfg(feature = "gpu")]
    Accelerated(Rc<gpu::GpuContext>),
}

/// Creates a driver-owned volume with zeroed values and gradient.
pub fn zeros(shape: [usize; 5]) -> Rc<Volume> {
    Rc::new(Tensor::zeros(Dim(shape)))
}

/// Creates a driver-owned volume from a [ndarray] array that owns its data.
pub fn from_ndarray(array: Array5<f32>) -> Rc<Volume> {
    Rc::new(Tensor::from_ndarray(array))
}
