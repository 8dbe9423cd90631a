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
    utils::{check_group_args, col2vol, deconv_out_shape, vol2col},
    Backend,
};

/// Configuration of a [`Deconvolution3d`] layer, as parsed from the external
/// parameter descriptor.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct DeconvolutionConfig {
    /// Kernel extent along height and width.
    pub kernel_size: usize,
    /// Kernel extent along the depth/temporal axis.
    pub kernel_depth: usize,
    /// Stride along height and width.
    pub stride: usize,
    /// Stride along the depth/temporal axis.
    pub temporal_stride: usize,
    /// Output-side padding along height and width.
    pub pad: usize,
    /// Output-side padding along the depth/temporal axis.
    pub temporal_pad: usize,
    /// Number of output channels.
    pub num_output: usize,
    /// Number of independent channel groups; must divide both the input and
    /// the output channel count.
    pub filter_group: usize,
    /// Whether a per-output-channel bias is added.
    pub bias_term: bool,
}

/// Volumetric transposed convolution, the adjoint of [`Convolution3d`].
///
/// The layer treats its bottom as if it were a post-convolution gradient and
/// its top as the larger pre-convolution activation: forward populates the
/// column buffer from the weights and the bottom, then scatter-accumulates
/// it into the top; backward unrolls the top gradient and runs the two
/// matmuls of a convolution forward with the roles reversed.
///
/// [`Convolution3d`]: crate::Convolution3d
pub struct Deconvolution3d {
    pub(crate) config: DeconvolutionConfig,
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

impl Deconvolution3d {
    /// Creates the layer on the native backend.
    ///
    /// # Panics
    ///
    /// If a kernel extent, stride or the output channel count is zero.
    pub fn new(config: DeconvolutionConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    /// Creates the layer on the given backend.
    pub fn with_backend(config: DeconvolutionConfig, backend: Backend) -> Self {
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

    /// The learnable filter bank, shaped (channels, num_output /
    /// filter_group, kernel_depth, kernel_size, kernel_size).
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

    /// Matmul dimensions of one filter group: bottom channels M, patch taps
    /// K and bottom sites N. The roles of [`Convolution3d::gemm_dims`]
    /// reversed.
    ///
    /// [`Convolution3d::gemm_dims`]: crate::Convolution3d::gemm_dims
    pub(crate) fn gemm_dims(&self) -> (usize, usize, usize) {
        let taps = self.config.kernel_depth * self.config.kernel_size * self.config.kernel_size;

        (
            self.channels / self.config.filter_group,
            self.config.num_output / self.config.filter_group * taps,
            self.length * self.height * self.width,
        )
    }
}

impl Layer for Deconvolution3d {
    fn set_up(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) {
        assert_eq!(bottom.len(), 1, "Deconvolution3d takes exactly one bottom.");
        assert_eq!(top.len(), 1, "Deconvolution3d produces exactly one top.");

        let dim = bottom[0].raw_dim();
        let (num, channels) = (dim[0], dim[1]);
        let (length, height, width) = (dim[2], dim[3], dim[4]);
        let DeconvolutionConfig {
            num_output,
            filter_group,
            bias_term,
            ..
        } = self.config;

        check_group_args(channels, num_output, filter_group);
        let [out_length, out_height, out_width] = deconv_out_shape(
            [length, height, width],
            self.kernel(),
            self.stride(),
            self.pad(),
        );

        let taps = self.config.kernel_depth * self.config.kernel_size * self.config.kernel_size;
        let spatial = length * height * width;

        let weight_dim = Dim([
            channels,
            num_output / filter_group,
            self.config.kernel_depth,
            self.config.kernel_size,
            self.config.kernel_size,
        ]);
        if self.weight.raw_dim() != weight_dim {
            self.weight = Tensor::zeros(weight_dim);
            let k = (1. / (num_output / filter_group * taps) as f32).sqrt();
            init::uniform(&self.weight, -k, k);

            if bias_term {
                self.bias = Tensor::zeros(num_output);
                init::uniform(&self.bias, -k, k);
            }
        }

        if self.col_buffer.dim() != (num_output * taps, spatial) {
            self.col_buffer = Array2::zeros((num_output * taps, spatial));
        }
        let out_spatial = out_length * out_height * out_width;
        if bias_term && self.bias_multiplier.dim() != (1, out_spatial) {
            self.bias_multiplier = Array2::ones((1, out_spatial));
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
            crate::gpu::layers::deconvolution_forward(&context, self, &bottom[0], &top[0]);
            return 0.;
        }

        let (kernel, stride, pad) = (self.kernel(), self.stride(), self.pad());
        let groups = self.config.filter_group;
        let (m, k, n) = self.gemm_dims();
        let out_spatial = self.out_length * self.out_height * self.out_width;

        let bottom_data = bottom[0].data();
        let mut top_data = top[0].data_mut();
        let weight = self.weight.data();
        let weight_flat = weight.view().into_shape((self.channels, k)).unwrap();
        let bias = self.bias.data();
        let bias_flat = bias.view().into_shape((bias.len(), 1)).unwrap();

        for (bottom_sample, mut top_sample) in
            bottom_data.outer_iter().zip(top_data.outer_iter_mut())
        {
            let bottom_flat = bottom_sample.into_shape((self.channels, n)).unwrap();
            for group in 0..groups {
                let weight_slice = weight_flat.slice(s![group * m..(group + 1) * m, ..]);
                let bottom_slice = bottom_flat.slice(s![group * m..(group + 1) * m, ..]);
                let mut col_slice = self.col_buffer.slice_mut(s![group * k..(group + 1) * k, ..]);
                general_mat_mul(1., &weight_slice.t(), &bottom_slice, 0., &mut col_slice);
            }

            // The upsampling step: overlapping patches sum into the larger
            // output volume.
            top_sample.fill(0.);
            col2vol(
                top_sample.view_mut(),
                self.col_buffer.view(),
                kernel,
                stride,
                pad,
            );

            if self.config.bias_term {
                let mut top_flat = top_sample
                    .into_shape((self.config.num_output, out_spatial))
                    .unwrap();
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
            crate::gpu::layers::deconvolution_backward(
                &context, self, &top[0], propagate, &bottom[0],
            );
            return;
        }

        let (kernel, stride, pad) = (self.kernel(), self.stride(), self.pad());
        let groups = self.config.filter_group;
        let (m, k, n) = self.gemm_dims();
        let out_spatial = self.out_length * self.out_height * self.out_width;

        let top_grad = top[0].gradient();

        if self.config.bias_term {
            let mut bias_grad = self.bias.gradient_mut();
            let multiplier = self.bias_multiplier.index_axis(Axis(0), 0);
            for top_sample in top_grad.outer_iter() {
                let top_flat = top_sample
                    .into_shape((self.config.num_output, out_spatial))
                    .unwrap();
                general_mat_vec_mul(1., &top_flat, &multiplier, 1., &mut *bias_grad);
            }
        }

        let bottom_data = bottom[0].data();
        let weight = self.weight.data();
        let weight_flat = weight.view().into_shape((self.channels, k)).unwrap();
        let mut weight_grad = self.weight.gradient_mut();
        let mut weight_grad_flat = weight_grad
            .view_mut()
            .into_shape((self.channels, k))
            .unwrap();
        let mut bottom_grad = propagate.then(|| bottom[0].gradient_mut());

        for (index, top_sample) in top_grad.outer_iter().enumerate() {
            // Unrolling the top gradient mirrors forward's scatter.
            vol2col(
                top_sample,
                self.col_buffer.view_mut(),
                kernel,
                stride,
                pad,
            );

            let bottom_flat = bottom_data
                .index_axis(Axis(0), index)
                .into_shape((self.channels, n))
                .unwrap();

            for group in 0..groups {
                let bottom_slice = bottom_flat.slice(s![group * m..(group + 1) * m, ..]);
                let col_slice = self.col_buffer.slice(s![group * k..(group + 1) * k, ..]);
                let mut weight_grad_slice =
                    weight_grad_flat.slice_mut(s![group * m..(group + 1) * m, ..]);
                general_mat_mul(1., &bottom_slice, &col_slice.t(), 1., &mut weight_grad_slice);
            }

            if let Some(bottom_grad) = bottom_grad.as_mut() {
                let mut bottom_grad_flat = bottom_grad
                    .index_axis_mut(Axis(0), index)
                    .into_shape((self.channels, n))
                    .unwrap();
                for group in 0..groups {
                    let weight_slice = weight_flat.slice(s![group * m..(group + 1) * m, ..]);
                    let col_slice = self.col_buffer.slice(s![group * k..(group + 1) * k, ..]);
                    let mut bottom_grad_slice =
                        bottom_grad_flat.slice_mut(s![group * m..(group + 1) * m, ..]);
                    general_mat_mul(1., &weight_slice, &col_slice, 1., &mut bottom_grad_slice);
                }
            }
        }
    }
}
