use std::rc::Rc;

use ndarray::Dim;

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::{layer::Layer, tensor::Volume, Backend};

/// Configuration of a [`Stretch3d`] layer, as parsed from the external
/// parameter descriptor.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct StretchConfig {
    /// Target extent along the depth/temporal axis.
    pub length: usize,
    /// Target extent along the height axis.
    pub height: usize,
    /// Target extent along the width axis.
    pub width: usize,
}

/// Count-preserving reinterpretation of a volume under a new shape.
///
/// The total element count never changes; values keep their flat (row-major)
/// order and only the shape metadata changes meaning: a channel-to-spatial
/// reinterpretation, not a resampling filter. The output channel count is
/// derived from the preserved count and must divide exactly.
pub struct Stretch3d {
    pub(crate) config: StretchConfig,
    pub backend: Backend,
    pub(crate) num: usize,
    pub(crate) channels: usize,
    pub(crate) count: usize,
    pub(crate) bottom_dim: ndarray::Ix5,
}

impl Stretch3d {
    /// Creates the layer on the native backend.
    ///
    /// # Panics
    ///
    /// If a target extent is zero.
    pub fn new(config: StretchConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    /// Creates the layer on the given backend.
    pub fn with_backend(config: StretchConfig, backend: Backend) -> Self {
        assert!(
            config.length > 0 && config.height > 0 && config.width > 0,
            "Target extents must be positive."
        );

        Self {
            config,
            backend,
            num: 0,
            channels: 0,
            count: 0,
            bottom_dim: Dim([0; 5]),
        }
    }
}

impl Layer for Stretch3d {
    fn set_up(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) {
        assert_eq!(bottom.len(), 1, "Stretch3d takes exactly one bottom.");
        assert_eq!(top.len(), 1, "Stretch3d produces exactly one top.");

        let dim = bottom[0].raw_dim();
        let num = dim[0];
        let count = bottom[0].len();
        let spatial = self.config.length * self.config.height * self.config.width;

        assert_eq!(
            count % (num * spatial),
            0,
            "Count {} is not reshapable to {} spatial sites per batch item.",
            count,
            spatial
        );
        let channels = count / (num * spatial);

        top[0].resize(Dim([
            num,
            channels,
            self.config.length,
            self.config.height,
            self.config.width,
        ]));

        self.num = num;
        self.channels = channels;
        self.count = count;
        self.bottom_dim = dim;
    }

    fn forward(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) -> f32 {
        assert_eq!(
            bottom[0].raw_dim(),
            self.bottom_dim,
            "Bottom shape changed since set-up."
        );
        assert_eq!(
            top[0].raw_dim(),
            Dim([
                self.num,
                self.channels,
                self.config.length,
                self.config.height,
                self.config.width,
            ]),
            "Top shape changed since set-up."
        );

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::stretch_forward(&context, &bottom[0], &top[0]);
            return 0.;
        }

        let bottom_data = bottom[0].data();
        let mut top_data = top[0].data_mut();
        let remapped = bottom_data.view().into_shape(top_data.raw_dim()).unwrap();
        top_data.assign(&remapped);

        0.
    }

    fn backward(&mut self, top: &[Rc<Volume>], propagate_down: &[bool], bottom: &[Rc<Volume>]) {
        if !propagate_down.first().copied().unwrap_or(false) {
            return;
        }

        assert_eq!(top[0].len(), self.count, "Top count changed since set-up.");

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::stretch_backward(&context, &top[0], &bottom[0]);
            return;
        }

        // The remapping is its own inverse; overlaps are impossible, so the
        // routing accumulates element against element.
        let top_grad = top[0].gradient();
        let mut bottom_grad = bottom[0].gradient_mut();
        let remapped = top_grad.view().into_shape(bottom_grad.raw_dim()).unwrap();
        *bottom_grad += &remapped;
    }
}
