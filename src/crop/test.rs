use std::error::Error;

use ndarray::{Array, Dim};

use crate::{from_ndarray, layer::Layer, utils::are_similar, zeros};

use super::{Crop3d, CropConfig};

fn cubic(extent: usize) -> CropConfig {
    CropConfig {
        crop_l: extent,
        crop_h: extent,
        crop_w: extent,
        offset: None,
    }
}

mod set_up {
    use super::*;

    #[test]
    fn centered_offsets() {
        let bottom = vec![zeros([1, 2, 4, 6, 8])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(2));

        layer.set_up(&bottom, &top);

        assert_eq!(top[0].raw_dim(), Dim([1, 2, 2, 2, 2]));
        assert_eq!(layer.offsets, [1, 2, 3]);
    }

    #[test]
    #[should_panic]
    fn crop_exceeds_input() {
        let bottom = vec![zeros([1, 1, 2, 2, 2])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(3));

        layer.set_up(&bottom, &top);
    }

    #[test]
    #[should_panic]
    fn offset_pushes_window_outside() {
        let bottom = vec![zeros([1, 1, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(CropConfig {
            offset: Some([3, 0, 0]),
            ..cubic(2)
        });

        layer.set_up(&bottom, &top);
    }
}

mod forward {
    use super::*;

    #[test]
    fn extracts_centered_block() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(
            Array::linspace(1., 64., 64).into_shape((1, 1, 4, 4, 4))?.to_owned(),
        )];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(2));

        layer.set_up(&bottom, &top);
        layer.forward(&bottom, &top);

        // Values at (l, h, w) ∈ {1, 2}³ of the 4³ cube.
        let expected = Array::from_shape_vec(
            (1, 1, 2, 2, 2),
            vec![22., 23., 26., 27., 38., 39., 42., 43.],
        )?;
        let result = are_similar(&top[0].data(), &expected);
        result
    }

    #[test]
    fn honors_explicit_offset() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(
            Array::linspace(1., 64., 64).into_shape((1, 1, 4, 4, 4))?.to_owned(),
        )];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(CropConfig {
            offset: Some([0, 0, 0]),
            ..cubic(2)
        });

        layer.set_up(&bottom, &top);
        layer.forward(&bottom, &top);

        let expected =
            Array::from_shape_vec((1, 1, 2, 2, 2), vec![1., 2., 5., 6., 17., 18., 21., 22.])?;
        let result = are_similar(&top[0].data(), &expected);
        result
    }
}

mod backward {
    use super::*;

    #[test]
    fn gradient_fills_only_the_window() -> Result<(), Box<dyn Error>> {
        let bottom = vec![zeros([1, 1, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(2));

        layer.set_up(&bottom, &top);
        layer.forward(&bottom, &top);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[true], &bottom);

        // An all-ones top gradient lands on exactly the 8 cropped positions.
        let grad = bottom[0].gradient();
        assert_eq!(grad.iter().filter(|&&g| g == 1.).count(), 8);
        assert_eq!(grad.sum(), 8.);
        assert_eq!(grad[[0, 0, 1, 1, 1]], 1.);
        assert_eq!(grad[[0, 0, 2, 2, 2]], 1.);
        assert_eq!(grad[[0, 0, 0, 0, 0]], 0.);

        Ok(())
    }

    #[test]
    fn overwrites_stale_gradient() -> Result<(), Box<dyn Error>> {
        let bottom = vec![zeros([1, 1, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(2));

        layer.set_up(&bottom, &top);
        bottom[0].gradient_mut().fill(9.);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[true], &bottom);

        assert_eq!(bottom[0].gradient().sum(), 8.);

        Ok(())
    }

    #[test]
    fn respects_propagate_down() -> Result<(), Box<dyn Error>> {
        let bottom = vec![zeros([1, 1, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Crop3d::new(cubic(2));

        layer.set_up(&bottom, &top);
        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[false], &bottom);

        let result = are_similar(&bottom[0].gradient(), &Array::zeros((1, 1, 4, 4, 4)));
        result
    }
}
