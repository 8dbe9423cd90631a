use std::rc::Rc;

use ndarray::{
    linalg::{general_mat_mul, general_mat_vec_mul},
    s, Array2, Axis, Dim, Ix1, Ix5,
};

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::{
    init,
    layer::Layer,
    tensor::{Tensor, Volume},
    utils::{check_group_args, col2vol, conv_out_shape, vol2col},
    Backend,
};

/// Configuration of a [`Convolution3d`] layer, as parsed from the external
/// parameter descriptor.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct ConvolutionConfig {
    /// Kernel extent along height and width.
    pub kernel_size: usize,
    /// Kernel extent along the depth/temporal axis.
    pub kernel_depth: usize,
    /// Stride along height and width.
    pub stride: usize,
    /// Stride along the depth/temporal axis.
    pub temporal_stride: usize,
    /// Zero-padding along height and width.
    pub pad: usize,
    /// Zero-padding along the depth/temporal axis.
    pub temporal_pad: usize,
    /// Number of output channels.
    pub num_output: usize,
    /// Number of independent channel groups; must divide both the input and
    /// the output channel count.
    pub filter_group: usize,
    /// Whether a per-output-channel bias is added.
    pub bias_term: bool,
}

/// Volumetric convolution by patch unrolling and matrix multiplication.
///
/// Each forward pass unrolls the receptive fields of one batch item into the
/// layer-owned column buffer, then multiplies each filter group's weight
/// slice against the group's column slice; the optional bias is added as an
/// outer product with the all-ones broadcast vector.
pub struct Convolution3d {
    pub(crate) config: ConvolutionConfig,
    pub backend: Backend,
    pub(crate) weight: Tensor<Ix5>,
    pub(crate) bias: Tensor<Ix1>,
    pub(crate) col_buffer: Array2<f32>,
    pub(crate) bias_multiplier: Array2<f32>,
    pub(crate) num: usize,
    pub(crate) channels: usize,
    pub(crate) length: usize,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) out_length: usize,
    pub(crate) out_height: usize,
    pub(crate) out_width: usize,
}

impl Convolution3d {
    /// Creates the layer on the native backend.
    ///
    /// # Panics
    ///
    /// If a kernel extent, stride or the output channel count is zero.
    pub fn new(config: ConvolutionConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    /// Creates the layer on the given backend.
    pub fn with_backend(config: ConvolutionConfig, backend: Backend) -> Self {
        assert!(
            config.kernel_size > 0 && config.kernel_depth > 0,
            "Kernel extents must be positive."
        );
        assert!(
            config.stride > 0 && config.temporal_stride > 0,
            "Strides must be positive."
        );
        assert!(config.num_output > 0, "Out channels must be positive.");

        Self {
            config,
            backend,
            weight: Tensor::zeros((0, 0, 0, 0, 0)),
            bias: Tensor::zeros(0),
            col_buffer: Array2::zeros((0, 0)),
            bias_multiplier: Array2::zeros((0, 0)),
            num: 0,
            channels: 0,
            length: 0,
            height: 0,
            width: 0,
            out_length: 0,
            out_height: 0,
            out_width: 0,
        }
    }

    /// The learnable filter bank, shaped (num_output, channels /
    /// filter_group, kernel_depth, kernel_size, kernel_size). Allocated and
    /// initialized from *U(−k, k)* on the first set-up.
    pub fn weight(&self) -> &Tensor<Ix5> {
        &self.weight
    }

    /// The learnable per-output-channel bias.
    pub fn bias(&self) -> &Tensor<Ix1> {
        &self.bias
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

    /// Matmul dimensions of one filter group: output channels M, patch taps
    /// K and output sites N.
    pub(crate) fn gemm_dims(&self) -> (usize, usize, usize) {
        let taps = self.config.kernel_depth * self.config.kernel_size * self.config.kernel_size;

        (
            self.config.num_output / self.config.filter_group,
            self.channels / self.config.filter_group * taps,
            self.out_length * self.out_height * self.out_width,
        )
    }
}

impl Layer for Convolution3d {
    fn set_up(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) {
        assert_eq!(bottom.len(), 1, "Convolution3d takes exactly one bottom.");
        assert_eq!(top.len(), 1, "Convolution3d produces exactly one top.");

        let dim = bottom[0].raw_dim();
        let (num, channels) = (dim[0], dim[1]);
        let (length, height, width) = (dim[2], dim[3], dim[4]);
        let ConvolutionConfig {
            num_output,
            filter_group,
            bias_term,
            ..
        } = self.config;

        check_group_args(channels, num_output, filter_group);
        let [out_length, out_height, out_width] = conv_out_shape(
            [length, height, width],
            self.kernel(),
            self.stride(),
            self.pad(),
        );

        let taps = self.config.kernel_depth * self.config.kernel_size * self.config.kernel_size;
        let spatial = out_length * out_height * out_width;

        let weight_dim = Dim([
            num_output,
            channels / filter_group,
            self.config.kernel_depth,
            self.config.kernel_size,
            self.config.kernel_size,
        ]);
        if self.weight.raw_dim() != weight_dim {
            self.weight = Tensor::zeros(weight_dim);
            let k = (1. / (channels / filter_group * taps) as f32).sqrt();
            init::uniform(&self.weight, -k, k);

            if bias_term {
                self.bias = Tensor::zeros(num_output);
                init::uniform(&self.bias, -k, k);
            }
        }

        if self.col_buffer.dim() != (channels * taps, spatial) {
            self.col_buffer = Array2::zeros((channels * taps, spatial));
        }
        if bias_term && self.bias_multiplier.dim() != (1, spatial) {
            self.bias_multiplier = Array2::ones((1, spatial));
        }

        top[0].resize(Dim([num, num_output, out_length, out_height, out_width]));

        self.num = num;
        self.channels = channels;
        self.length = length;
        self.height = height;
        self.width = width;
        self.out_length = out_length;
        self.out_height = out_height;
        self.out_width = out_width;
    }

    fn forward(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) -> f32 {
        assert_eq!(
            bottom[0].raw_dim(),
            Dim([self.num, self.channels, self.length, self.height, self.width]),
            "Bottom shape changed since set-up."
        );

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::convolution_forward(&context, self, &bottom[0], &top[0]);
            return 0.;
        }

        let (kernel, stride, pad) = (self.kernel(), self.stride(), self.pad());
        let groups = self.config.filter_group;
        let (m, k, n) = self.gemm_dims();

        let bottom_data = bottom[0].data();
        let mut top_data = top[0].data_mut();
        let weight = self.weight.data();
        let weight_flat = weight
            .view()
            .into_shape((self.config.num_output, k))
            .unwrap();
        let bias = self.bias.data();
        let bias_flat = bias.view().into_shape((bias.len(), 1)).unwrap();

        for (bottom_sample, top_sample) in
            bottom_data.outer_iter().zip(top_data.outer_iter_mut())
        {
            vol2col(
                bottom_sample,
                self.col_buffer.view_mut(),
                kernel,
                stride,
                pad,
            );

            let mut top_flat = top_sample.into_shape((self.config.num_output, n)).unwrap();
            for group in 0..groups {
                let weight_slice = weight_flat.slice(s![group * m..(group + 1) * m, ..]);
                let col_slice = self.col_buffer.slice(s![group * k..(group + 1) * k, ..]);
                let mut top_slice = top_flat.slice_mut(s![group * m..(group + 1) * m, ..]);
                general_mat_mul(1., &weight_slice, &col_slice, 0., &mut top_slice);
            }

            if self.config.bias_term {
                general_mat_mul(1., &bias_flat, &self.bias_multiplier, 1., &mut top_flat);
            }
        }

        0.
    }

    fn backward(&mut self, top: &[Rc<Volume>], propagate_down: &[bool], bottom: &[Rc<Volume>]) {
        assert_eq!(
            top[0].raw_dim(),
            Dim([
                self.num,
                self.config.num_output,
                self.out_length,
                self.out_height,
                self.out_width,
            ]),
            "Top shape changed since set-up."
        );

        let propagate = propagate_down.first().copied().unwrap_or(false);

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::convolution_backward(&context, self, &top[0], propagate, &bottom[0]);
            return;
        }

        let (kernel, stride, pad) = (self.kernel(), self.stride(), self.pad());
        let groups = self.config.filter_group;
        let (m, k, n) = self.gemm_dims();

        let top_grad = top[0].gradient();

        if self.config.bias_term {
            let mut bias_grad = self.bias.gradient_mut();
            let multiplier = self.bias_multiplier.index_axis(Axis(0), 0);
            for top_sample in top_grad.outer_iter() {
                let top_flat = top_sample.into_shape((self.config.num_output, n)).unwrap();
                general_mat_vec_mul(1., &top_flat, &multiplier, 1., &mut *bias_grad);
            }
        }

        let bottom_data = bottom[0].data();
        let weight = self.weight.data();
        let weight_flat = weight
            .view()
            .into_shape((self.config.num_output, k))
            .unwrap();
        let mut weight_grad = self.weight.gradient_mut();
        let mut weight_grad_flat = weight_grad
            .view_mut()
            .into_shape((self.config.num_output, k))
            .unwrap();
        let mut bottom_grad = propagate.then(|| bottom[0].gradient_mut());

        for (index, top_sample) in top_grad.outer_iter().enumerate() {
            let top_flat = top_sample.into_shape((self.config.num_output, n)).unwrap();

            // The weight gradient needs the unrolled patches of this batch
            // item again.
            vol2col(
                bottom_data.index_axis(Axis(0), index),
                self.col_buffer.view_mut(),
                kernel,
                stride,
                pad,
            );

            for group in 0..groups {
                let top_slice = top_flat.slice(s![group * m..(group + 1) * m, ..]);
                let col_slice = self.col_buffer.slice(s![group * k..(group + 1) * k, ..]);
                let mut weight_grad_slice =
                    weight_grad_flat.slice_mut(s![group * m..(group + 1) * m, ..]);
                general_mat_mul(1., &top_slice, &col_slice.t(), 1., &mut weight_grad_slice);
            }

            if let Some(bottom_grad) = bottom_grad.as_mut() {
                // The column gradient overwrites the buffer, then scatters
                // back to the patch positions it was unrolled from.
                for group in 0..groups {
                    let weight_slice = weight_flat.slice(s![group * m..(group + 1) * m, ..]);
                    let top_slice = top_flat.slice(s![group * m..(group + 1) * m, ..]);
                    let mut col_slice =
                        self.col_buffer.slice_mut(s![group * k..(group + 1) * k, ..]);
                    general_mat_mul(1., &weight_slice.t(), &top_slice, 0., &mut col_slice);
                }

                col2vol(
                    bottom_grad.index_axis_mut(Axis(0), index),
                    self.col_buffer.view(),
                    kernel,
                    stride,
                    pad,
                );
            }
        }
    }
}

#[cfg(test)]
mod test;
