use std::rc::Rc;

use ndarray::{s, Dim};

#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::{layer::Layer, tensor::Volume, Backend};

/// Configuration of a [`Crop3d`] layer, as parsed from the external
/// parameter descriptor.
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug)]
pub struct CropConfig {
    /// Output extent along the depth/temporal axis.
    pub crop_l: usize,
    /// Output extent along the height axis.
    pub crop_h: usize,
    /// Output extent along the width axis.
    pub crop_w: usize,
    /// Explicit (depth, height, width) origin of the window; the window is
    /// centered when absent.
    pub offset: Option<[usize; 3]>,
}

/// Fixed-size sub-volume extraction.
pub struct Crop3d {
    pub(crate) config: CropConfig,
    pub backend: Backend,
    pub(crate) offsets: [usize; 3],
    pub(crate) num: usize,
    pub(crate) channels: usize,
    pub(crate) length: usize,
    pub(crate) height: usize,
    pub(crate) width: usize,
}

impl Crop3d {
    /// Creates the layer on the native backend.
    ///
    /// # Panics
    ///
    /// If a crop extent is zero.
    pub fn new(config: CropConfig) -> Self {
        Self::with_backend(config, Backend::default())
    }

    /// Creates the layer on the given backend.
    pub fn with_backend(config: CropConfig, backend: Backend) -> Self {
        assert!(
            config.crop_l > 0 && config.crop_h > 0 && config.crop_w > 0,
            "Crop extents must be positive."
        );

        Self {
            config,
            backend,
            offsets: [0; 3],
            num: 0,
            channels: 0,
            length: 0,
            height: 0,
            width: 0,
        }
    }

    pub(crate) fn crop(&self) -> [usize; 3] {
        [self.config.crop_l, self.config.crop_h, self.config.crop_w]
    }
}

impl Layer for Crop3d {
    fn set_up(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) {
        assert_eq!(bottom.len(), 1, "Crop3d takes exactly one bottom.");
        assert_eq!(top.len(), 1, "Crop3d produces exactly one top.");

        let dim = bottom[0].raw_dim();
        let (num, channels) = (dim[0], dim[1]);
        let input = [dim[2], dim[3], dim[4]];
        let crop = self.crop();

        let offsets = self
            .config
            .offset
            .unwrap_or([0, 1, 2].map(|axis| (input[axis].saturating_sub(crop[axis])) / 2));
        for axis in 0..3 {
            assert!(
                offsets[axis] + crop[axis] <= input[axis],
                "Crop window {}+{} exceeds input extent {}.",
                offsets[axis],
                crop[axis],
                input[axis]
            );
        }

        top[0].resize(Dim([
            num,
            channels,
            self.config.crop_l,
            self.config.crop_h,
            self.config.crop_w,
        ]));

        self.offsets = offsets;
        self.num = num;
        self.channels = channels;
        self.length = input[0];
        self.height = input[1];
        self.width = input[2];
    }

    fn forward(&mut self, bottom: &[Rc<Volume>], top: &[Rc<Volume>]) -> f32 {
        assert_eq!(
            bottom[0].raw_dim(),
            Dim([self.num, self.channels, self.length, self.height, self.width]),
            "Bottom shape changed since set-up."
        );

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::crop_forward(&context, self, &bottom[0], &top[0]);
            return 0.;
        }

        let [ol, oh, ow] = self.offsets;
        let [cl, ch, cw] = self.crop();

        top[0].data_mut().assign(&bottom[0].data().slice(s![
            ..,
            ..,
            ol..ol + cl,
            oh..oh + ch,
            ow..ow + cw
        ]));

        0.
    }

    fn backward(&mut self, top: &[Rc<Volume>], propagate_down: &[bool], bottom: &[Rc<Volume>]) {
        if !propagate_down.first().copied().unwrap_or(false) {
            return;
        }

        #[cfg(feature = "gpu")]
        if let Backend::Accelerated(context) = self.backend.clone() {
            crate::gpu::layers::crop_backward(&context, self, &top[0], &bottom[0]);
            return;
        }

        let [ol, oh, ow] = self.offsets;
        let [cl, ch, cw] = self.crop();

        // Everything outside the window stays zero.
        let mut bottom_grad = bottom[0].gradient_mut();
        bottom_grad.fill(0.);
        bottom_grad
            .slice_mut(s![.., .., ol..ol + cl, oh..oh + ch, ow..ow + cw])
            .assign(&*top[0].gradient());
    }
}

#[cfg(test)]
mod test;
