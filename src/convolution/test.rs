use std::error::Error;

use ndarray::{Array, Array5, Dim};

use crate::{from_ndarray, layer::Layer, utils::are_similar, zeros};

use super::{Convolution3d, ConvolutionConfig};

fn config(num_output: usize, filter_group: usize) -> ConvolutionConfig {
    ConvolutionConfig {
        kernel_size: 2,
        kernel_depth: 2,
        stride: 1,
        temporal_stride: 1,
        pad: 0,
        temporal_pad: 0,
        num_output,
        filter_group,
        bias_term: false,
    }
}

mod set_up {
    use super::*;

    #[test]
    fn geometry() {
        let bottom = vec![zeros([2, 4, 5, 6, 7])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(6, 2));

        layer.set_up(&bottom, &top);

        assert_eq!(top[0].raw_dim(), Dim([2, 6, 4, 5, 6]));
        assert_eq!(layer.weight().raw_dim(), Dim([6, 2, 2, 2, 2]));
        assert_eq!(layer.col_buffer.dim(), (4 * 8, 4 * 5 * 6));
    }

    #[test]
    fn worked_example() {
        let bottom = vec![zeros([1, 1, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(5, 1));

        layer.set_up(&bottom, &top);

        assert_eq!(top[0].raw_dim(), Dim([1, 5, 3, 3, 3]));
    }

    #[test]
    fn idempotent() {
        let bottom = vec![zeros([1, 2, 3, 3, 3])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(2, 1));

        layer.set_up(&bottom, &top);
        layer.weight().data_mut().fill(7.);
        layer.set_up(&bottom, &top);

        assert_eq!(
            *layer.weight().data(),
            Array::from_elem((2, 2, 2, 2, 2), 7.)
        );
        assert_eq!(top[0].raw_dim(), Dim([1, 2, 2, 2, 2]));
    }

    #[test]
    #[should_panic]
    fn non_divisible_groups() {
        let bottom = vec![zeros([1, 3, 4, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(4, 2));

        layer.set_up(&bottom, &top);
    }

    #[test]
    #[should_panic]
    fn kernel_overruns_input() {
        let bottom = vec![zeros([1, 1, 1, 4, 4])];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(1, 1));

        layer.set_up(&bottom, &top);
    }
}

mod forward {
    use super::*;

    #[test]
    fn single_patch() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(
            Array::linspace(1., 8., 8).into_shape((1, 1, 2, 2, 2))?.to_owned(),
        )];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(1, 1));

        layer.set_up(&bottom, &top);
        layer
            .weight()
            .data_mut()
            .assign(&Array::linspace(1., 8., 8).into_shape((1, 1, 2, 2, 2))?);
        layer.forward(&bottom, &top);

        // 1·1 + 2·2 + … + 8·8
        let result = are_similar(&top[0].data(), &Array::from_elem((1, 1, 1, 1, 1), 204.));
        result
    }

    #[test]
    fn bias() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(Array5::ones((1, 1, 2, 2, 2)))];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(ConvolutionConfig {
            bias_term: true,
            ..config(1, 1)
        });

        layer.set_up(&bottom, &top);
        layer.weight().data_mut().fill(1.);
        layer.bias().data_mut().fill(0.5);
        layer.forward(&bottom, &top);

        let result = are_similar(&top[0].data(), &Array::from_elem((1, 1, 1, 1, 1), 8.5));
        result
    }

    #[test]
    fn zero_padded_border() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(Array::from_elem((1, 1, 1, 1, 1), 3.))];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(ConvolutionConfig {
            kernel_size: 3,
            kernel_depth: 3,
            pad: 1,
            temporal_pad: 1,
            ..config(1, 1)
        });

        layer.set_up(&bottom, &top);
        layer.weight().data_mut()[[0, 0, 1, 1, 1]] = 2.;

        layer.forward(&bottom, &top);

        // Only the center tap overlaps the input; the border reads as zero.
        assert_eq!(top[0].raw_dim(), Dim([1, 1, 1, 1, 1]));
        let result = are_similar(&top[0].data(), &Array::from_elem((1, 1, 1, 1, 1), 6.));
        result
    }

    #[test]
    fn grouped_matches_block_diagonal() -> Result<(), Box<dyn Error>> {
        let input = Array::linspace(1., 16., 16)
            .into_shape((1, 2, 2, 2, 2))?
            .to_owned();

        let grouped_bottom = vec![from_ndarray(input.clone())];
        let grouped_top = vec![zeros([1, 1, 1, 1, 1])];
        let mut grouped = Convolution3d::new(config(2, 2));
        grouped.set_up(&grouped_bottom, &grouped_top);
        grouped.weight().data_mut().fill(1.);
        grouped.weight().data_mut().slice_mut(ndarray::s![1, .., .., .., ..]).fill(2.);
        grouped.forward(&grouped_bottom, &grouped_top);

        let full_bottom = vec![from_ndarray(input)];
        let full_top = vec![zeros([1, 1, 1, 1, 1])];
        let mut full = Convolution3d::new(config(2, 1));
        full.set_up(&full_bottom, &full_top);
        full.weight().data_mut().fill(0.);
        full.weight().data_mut().slice_mut(ndarray::s![0, 0, .., .., ..]).fill(1.);
        full.weight().data_mut().slice_mut(ndarray::s![1, 1, .., .., ..]).fill(2.);
        full.forward(&full_bottom, &full_top);

        let result = are_similar(&grouped_top[0].data(), &full_top[0].data().to_owned());
        result
    }
}

mod backward {
    use super::*;

    #[test]
    fn single_patch() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(
            Array::linspace(1., 8., 8).into_shape((1, 1, 2, 2, 2))?.to_owned(),
        )];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(ConvolutionConfig {
            bias_term: true,
            ..config(1, 1)
        });

        layer.set_up(&bottom, &top);
        layer
            .weight()
            .data_mut()
            .assign(&Array::from_elem((1, 1, 2, 2, 2), 2.));
        layer.forward(&bottom, &top);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[true], &bottom);

        // With a single output site the weight gradient is the input patch,
        // the bottom gradient is the kernel, and the bias gradient is the
        // top gradient itself.
        are_similar(
            &layer.weight().gradient(),
            &Array::linspace(1., 8., 8).into_shape((1, 1, 2, 2, 2))?.to_owned(),
        )?;
        are_similar(
            &bottom[0].gradient(),
            &Array::from_elem((1, 1, 2, 2, 2), 2.),
        )?;
        let result = are_similar(&layer.bias().gradient(), &ndarray::arr1(&[1.]));
        result
    }

    #[test]
    fn respects_propagate_down() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(Array5::ones((1, 1, 2, 2, 2)))];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(1, 1));

        layer.set_up(&bottom, &top);
        layer.weight().data_mut().fill(1.);
        layer.forward(&bottom, &top);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[false], &bottom);

        are_similar(&bottom[0].gradient(), &Array5::zeros((1, 1, 2, 2, 2)))?;
        let result = are_similar(
            &layer.weight().gradient(),
            &Array::from_elem((1, 1, 2, 2, 2), 1.),
        );
        result
    }

    #[test]
    fn accumulates() -> Result<(), Box<dyn Error>> {
        let bottom = vec![from_ndarray(Array5::ones((1, 1, 2, 2, 2)))];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(1, 1));

        layer.set_up(&bottom, &top);
        layer.weight().data_mut().fill(3.);
        layer.forward(&bottom, &top);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[true], &bottom);
        layer.backward(&top, &[true], &bottom);

        are_similar(
            &bottom[0].gradient(),
            &Array::from_elem((1, 1, 2, 2, 2), 6.),
        )?;
        let result = are_similar(
            &layer.weight().gradient(),
            &Array::from_elem((1, 1, 2, 2, 2), 2.),
        );
        result
    }

    #[test]
    fn overlapping_windows_sum() -> Result<(), Box<dyn Error>> {
        // Stride 1 over a 3-voxel extent: the middle voxel sits in two
        // windows and must collect both contributions.
        let bottom = vec![from_ndarray(Array5::ones((1, 1, 3, 2, 2)))];
        let top = vec![zeros([1, 1, 1, 1, 1])];
        let mut layer = Convolution3d::new(config(1, 1));

        layer.set_up(&bottom, &top);
        layer.weight().data_mut().fill(1.);
        layer.forward(&bottom, &top);

        top[0].gradient_mut().fill(1.);
        layer.backward(&top, &[true], &bottom);

        let expected = Array::from_shape_vec(
            (1, 1, 3, 2, 2),
            vec![1., 1., 1., 1., 2., 2., 2., 2., 1., 1., 1., 1.],
        )?;
        let result = are_similar(&bottom[0].gradient(), &expected);
        result
    }
}
