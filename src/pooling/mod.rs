use std::rc::Rc;

use ndarray::{Array5, Dim, Zip};

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::{layer::Layer, tensor::Volume, utils::conv_out_shape, Backend};

/// Reduction applied over each pooling window.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolMethod {
    /// Keeps the maximum of the window and remembers where it came from.
    Max,
    /// Averages over the window's valid elements.
    Average,
}

/// Configuration of a [`Pooling3d`] layer, as parsed from the external
/// parameter descriptor.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct PoolingConfig {
    /// Reduction method.
    pub method: PoolMethod,
    /// Window extent along height and width.
    pub kernel_size: usize,
    /// Window extent along the depth/temporal axis.
    pub kernel_depth: usize,
    /// Stride along height and width.
    pub stride: usize,
    /// Stride along the depth/temporal axis.
    pub temporal_stride: usize,
    /// Padding along height and width; padded positions never enter a
    /// window.
    pub pad: usize,
    /// Padding along the depth/temporal axis.
    pub temporal_pad: usize,
}

/// Window geometry of a pooling pass, detached from the layer so that
/// parallel loops can copy it around freely.
#[derive(Clone, Copy)]
pub(crate) struct Windows {
    kernel: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
    input: [usize; 3],
}

/// One pooling window clipped to the valid input range.
#[derive(Clone, Copy)]
pub(crate) struct Window {
    pub(crate) start: [usize; 3],
    pub(crate) end: [usize; 3],
}

impl Windows {
    /// The window of the output cell at (pl, ph, pw).
    pub(crate) fn at(&self, cell: [usize; 3]) -> Window {
        let mut start = [0; 3];
        let mut end = [0; 3];
        for axis in 0..3 {
            let origin = (cell[axis] * self.stride[axis]) as isize - self.pad[axis] as isize;
            start[axis] = origin.max(0) as usize;
            end[axis] = ((origin + self.kernel[axis] as isize) as usize).min(self.input[axis]);
        }

        Window { start, end }
    }
}

impl Window {
    /// Number of valid elements under the window.
    pub(crate) fn len(&self) -> usize {
        (self.end[0] - self.start[0])
            * (self.end[1] - self.start[1])
            * (self.end[2] - self.start[2])
    }
}

/// Volumetric max/average pooling.
///
/// Windows are clipped to the valid input range, so pad-induced out-of-range
/// offsets are excluded both from the maximum scan and from the average
/// divisor. Max pooling records the flat index of the winning element per
/// output cell in a buffer parallel to the top, and backward routes each
/// cell's whole gradient to exactly that element.
pub struct Pooling3d {
    pub(crate) config: PoolingConfig,
    pub backend: Backend,
    pub(crate) max_indices: Array5<usize>,
    pub(crate) num: usize,
    pub(crate) channels: usize,
    pub(crate) length: usize,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) pooled_length: usize,
    pub(crate) pooled_height: usize,
    pub(crate) pooled_width: usize,
}

impl Pooling3d {
    /// Creates the layer on the native backend.
    ///
    /// # Panics
    ///
    /// If a window extent or stride is zero, or a padding is not smaller
    /// than its window extent (such a window could clip to nothing).
    pub fn new(config: PoolingConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    /// Creates the layer on the given backend.
    pub fn with_backend(config: PoolingConfig, backend: Backend) -> Self {
        assert!(
            config.kernel_size > 0 && config.kernel_depth > 0,
            "Window extents must be positive."
        );
        assert!(
            config.stride > 0 && config.temporal_stride > 0,
            "Strides must be positive."
        );
        assert!(
            config.pad < config.kernel_size && config.temporal_pad < config.kernel_depth,
            "Padding must be smaller than the window extent."
        );

        Self {
            config,
            backend,
            max_indices: Array5::zeros((0, 0, 0, 0, 0)),
            num: 0,
            channels: 0,
            length: 0,
            height: 0,
            width: 0,
            pooled_length: 0,
            pooled_height: 0,
            pooled_width: 0,
        }
    }

    pub(crate) fn kernel(&self) -> [usize; 3] {
        [
            self.config.kernel_depth,
            self.config.kernel_size,
            self.config.kernel_size,
        ]
    }

    pub(crate) fn stride(&self) -> [usize; 3] {
        [
            self.config.temporal_stride,
            self.config.stride,
            self.config.stride,
        ]
    }

    pub(crate) fn pad(&self) -> [usize; 3] {
        [self.config.temporal_pad, self.config.pad, self.config.pad]
    }

    pub(crate) fn windows(&self) -> Windows {
        Windows {
            kernel: self.kernel(),
            stride: self.stride(),
            pad: self.pad(),
            input: [self.length, self.height, self.width],
        }
    }
}

impl Layer for Pooling3d {
    fn set_up(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) {
        assert_eq!(bottom.len(), 1, "Pooling3d takes exactly one bottom.");
        assert_eq!(top.len(), 1, "Pooling3d produces exactly one top.");

        let dim = bottom[0].raw_dim();
        let (num, channels) = (dim[0], dim[1]);
        let (length, height, width) = (dim[2], dim[3], dim[4]);

        let [pooled_length, pooled_height, pooled_width] = conv_out_shape(
            [length, height, width],
            self.kernel(),
            self.stride(),
            self.pad(),
        );

        let pooled_dim = Dim([num, channels, pooled_length, pooled_height, pooled_width]);
        top[0].resize(pooled_dim);
        if self.config.method == PoolMethod::Max && self.max_indices.raw_dim() != pooled_dim {
            self.max_indices = Array5::zeros(pooled_dim);
        }

        self.num = num;
        self.channels = channels;
        self.length = length;
        self.height = height;
        self.width = width;
        self.pooled_length = pooled_length;
        self.pooled_height = pooled_height;
        self.pooled_width = pooled_width;
    }

    fn forward(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) -> f32 {
        assert_eq!(
            bottom[0].raw_dim(),
            Dim([self.num, self.channels, self.length, self.height, self.width]),
            "Bottom shape changed since set-up."
        );

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::pooling_forward(&context, self, &bottom[0], &top[0]);
            return 0.;
        }

        let bottom_data = bottom[0].data();
        let mut top_data = top[0].data_mut();
        let windows = self.windows();
        let (height, width) = (self.height, self.width);

        match self.config.method {
            PoolMethod::Max => {
                top_data
                    .outer_iter_mut()
                    .into_par_iter()
                    .zip(self.max_indices.outer_iter_mut())
                    .zip(bottom_data.outer_iter())
                    .for_each(|((mut top_sample, mut indices_sample), bottom_sample)| {
                        top_sample
                            .outer_iter_mut()
                            .zip(indices_sample.outer_iter_mut())
                            .zip(bottom_sample.outer_iter())
                            .for_each(|((mut top_channel, mut indices_channel), bottom_channel)| {
                                Zip::indexed(&mut top_channel)
                                    .and(&mut indices_channel)
                                    .for_each(|(pl, ph, pw), top_el, index_el| {
                                        let window = windows.at([pl, ph, pw]);
                                        let mut best = f32::NEG_INFINITY;
                                        let mut best_index = 0;
                                        for il in window.start[0]..window.end[0] {
                                            for ih in window.start[1]..window.end[1] {
                                                for iw in window.start[2]..window.end[2] {
                                                    let value = bottom_channel[[il, ih, iw]];
                                                    if value > best {
                                                        best = value;
                                                        best_index =
                                                            (il * height + ih) * width + iw;
                                                    }
                                                }
                                            }
                                        }
                                        *top_el = best;
                                        *index_el = best_index;
                                    });
                            });
                    });
            }
            PoolMethod::Average => {
                top_data
                    .outer_iter_mut()
                    .into_par_iter()
                    .zip(bottom_data.outer_iter())
                    .for_each(|(mut top_sample, bottom_sample)| {
                        top_sample
                            .outer_iter_mut()
                            .zip(bottom_sample.outer_iter())
                            .for_each(|(mut top_channel, bottom_channel)| {
                                Zip::indexed(&mut top_channel).for_each(|(pl, ph, pw), top_el| {
                                    let window = windows.at([pl, ph, pw]);
                                    let mut sum = 0.;
                                    for il in window.start[0]..window.end[0] {
                                        for ih in window.start[1]..window.end[1] {
                                            for iw in window.start[2]..window.end[2] {
                                                sum += bottom_channel[[il, ih, iw]];
                                            }
                                        }
                                    }
                                    *top_el = sum / window.len() as f32;
                                });
                            });
                    });
            }
        }

        0.
    }

    fn backward(&mut self, top: &[Rc<Volume>], propagate_down: &[bool], bottom: &[Rc<Volume>]) {
        if !propagate_down.first().copied().unwrap_or(false) {
            return;
        }

        assert_eq!(
            top[0].raw_dim(),
            Dim([
                self.num,
                self.channels,
                self.pooled_length,
                self.pooled_height,
                self.pooled_width,
            ]),
            "Top shape changed since set-up."
        );

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::pooling_backward(&context, self, &top[0], &bottom[0]);
            return;
        }

        let top_grad = top[0].gradient();
        let mut bottom_grad = bottom[0].gradient_mut();
        let windows = self.windows();
        let (height, width) = (self.height, self.width);

        match self.config.method {
            PoolMethod::Max => {
                bottom_grad
                    .outer_iter_mut()
                    .into_par_iter()
                    .zip(top_grad.outer_iter())
                    .zip(self.max_indices.outer_iter())
                    .for_each(|((mut bottom_sample, grad_sample), indices_sample)| {
                        bottom_sample
                            .outer_iter_mut()
                            .zip(grad_sample.outer_iter())
                            .zip(indices_sample.outer_iter())
                            .for_each(|((mut bottom_channel, grad_channel), indices_channel)| {
                                Zip::from(&grad_channel).and(&indices_channel).for_each(
                                    |grad_el, index_el| {
                                        let il = index_el / (height * width);
                                        let ih = index_el / width % height;
                                        let iw = index_el % width;
                                        bottom_channel[[il, ih, iw]] += grad_el;
                                    },
                                );
                            });
                    });
            }
            PoolMethod::Average => {
                bottom_grad
                    .outer_iter_mut()
                    .into_par_iter()
                    .zip(top_grad.outer_iter())
                    .for_each(|(mut bottom_sample, grad_sample)| {
                        bottom_sample
                            .outer_iter_mut()
                            .zip(grad_sample.outer_iter())
                            .for_each(|(mut bottom_channel, grad_channel)| {
                                Zip::indexed(&grad_channel).for_each(|(pl, ph, pw), grad_el| {
                                    let window = windows.at([pl, ph, pw]);
                                    let share = grad_el / window.len() as f32;
                                    for il in window.start[0]..window.end[0] {
                                        for ih in window.start[1]..window.end[1] {
                                            for iw in window.start[2]..window.end[2] {
                                                bottom_channel[[il, ih, iw]] += share;
                                            }
                                        }
                                    }
                                });
                            });
                    });
            }
        }
    }
}
