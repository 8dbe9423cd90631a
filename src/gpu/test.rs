//! Backend-agreement tests: the same fixtures through the native and the
//! accelerated path must match. Every test skips silently on machines with
//! no usable adapter.

use std::error::Error;
use std::rc::Rc;

use ndarray::Array;

use ndarray_rand::{rand_distr::Uniform, RandomExt};

use crate::{
    from_ndarray, zeros, Backend, Convolution3d, ConvolutionConfig, Crop3d, CropConfig,
    Deconvolution3d, DeconvolutionConfig, Layer, PoolMethod, Pooling3d, PoolingConfig, Stretch3d,
    StretchConfig, Volume,
};

use super::GpuContext;

const TOLERANCE: f32 = 1e-4;

fn accelerated() -> Option<Backend> {
    GpuContext::new()
        .ok()
        .map(|context| Backend::Accelerated(Rc::new(context)))
}

fn random_volume(shape: [usize; 5]) -> Rc<Volume> {
    from_ndarray(ndarray::Array5::random(shape, Uniform::new(-1., 1.)))
}

fn assert_agree(native: &Volume, device: &Volume) {
    assert_eq!(native.raw_dim(), device.raw_dim());
    ndarray::Zip::from(&*native.data())
        .and(&*device.data())
        .for_each(|&native, &device| {
            assert!(
                (native - device).abs() <= TOLERANCE,
                "Backends disagree: {} vs {}.",
                native,
                device
            );
        });
}

fn assert_gradients_agree(native: &Volume, device: &Volume) {
    ndarray::Zip::from(&*native.gradient())
        .and(&*device.gradient())
        .for_each(|&native, &device| {
            assert!(
                (native - device).abs() <= TOLERANCE,
                "Backends disagree on a gradient: {} vs {}.",
                native,
                device
            );
        });
}

#[test]
fn convolution_agrees() -> Result<(), Box<dyn Error>> {
    let Some(backend) = accelerated() else {
        return Ok(());
    };

    let config = ConvolutionConfig {
        kernel_size: 2,
        kernel_depth: 2,
        stride: 1,
        temporal_stride: 1,
        pad: 1,
        temporal_pad: 0,
        num_output: 4,
        filter_group: 2,
        bias_term: true,
    };

    let bottom = random_volume([2, 4, 3, 4, 4]);
    let native_bottom = vec![from_ndarray(bottom.data().to_owned())];
    let device_bottom = vec![bottom];
    let native_top = vec![zeros([1, 1, 1, 1, 1])];
    let device_top = vec![zeros([1, 1, 1, 1, 1])];

    let mut native = Convolution3d::new(config);
    let mut device = Convolution3d::with_backend(config, backend);

    native.set_up(&native_bottom, &native_top);
    device.set_up(&device_bottom, &device_top);
    device.weight().data_mut().assign(&*native.weight().data());
    device.bias().data_mut().assign(&*native.bias().data());

    native.forward(&native_bottom, &native_top);
    device.forward(&device_bottom, &device_top);
    assert_agree(&native_top[0], &device_top[0]);

    let projection = ndarray::Array5::random(native_top[0].raw_dim(), Uniform::new(-1., 1.));
    native_top[0].gradient_mut().assign(&projection);
    device_top[0].gradient_mut().assign(&projection);
    native.backward(&native_top, &[true], &native_bottom);
    device.backward(&device_top, &[true], &device_bottom);

    assert_gradients_agree(&native_bottom[0], &device_bottom[0]);
    ndarray::Zip::from(&*native.weight().gradient())
        .and(&*device.weight().gradient())
        .for_each(|&left, &right| assert!((left - right).abs() <= TOLERANCE));
    ndarray::Zip::from(&*native.bias().gradient())
        .and(&*device.bias().gradient())
        .for_each(|&left, &right| assert!((left - right).abs() <= TOLERANCE));

    Ok(())
}

#[test]
fn deconvolution_agrees() -> Result<(), Box<dyn Error>> {
    let Some(backend) = accelerated() else {
        return Ok(());
    };

    let config = DeconvolutionConfig {
        kernel_size: 2,
        kernel_depth: 2,
        stride: 2,
        temporal_stride: 1,
        pad: 0,
        temporal_pad: 0,
        num_output: 2,
        filter_group: 2,
        bias_term: true,
    };

    let bottom = random_volume([2, 4, 2, 3, 3]);
    let native_bottom = vec![from_ndarray(bottom.data().to_owned())];
    let device_bottom = vec![bottom];
    let native_top = vec![zeros([1, 1, 1, 1, 1])];
    let device_top = vec![zeros([1, 1, 1, 1, 1])];

    let mut native = Deconvolution3d::new(config);
    let mut device = Deconvolution3d::with_backend(config, backend);

    native.set_up(&native_bottom, &native_top);
    device.set_up(&device_bottom, &device_top);
    device.weight().data_mut().assign(&*native.weight().data());
    device.bias().data_mut().assign(&*native.bias().data());

    native.forward(&native_bottom, &native_top);
    device.forward(&device_bottom, &device_top);
    assert_agree(&native_top[0], &device_top[0]);

    let projection = ndarray::Array5::random(native_top[0].raw_dim(), Uniform::new(-1., 1.));
    native_top[0].gradient_mut().assign(&projection);
    device_top[0].gradient_mut().assign(&projection);
    native.backward(&native_top, &[true], &native_bottom);
    device.backward(&device_top, &[true], &device_bottom);

    assert_gradients_agree(&native_bottom[0], &device_bottom[0]);
    ndarray::Zip::from(&*native.weight().gradient())
        .and(&*device.weight().gradient())
        .for_each(|&left, &right| assert!((left - right).abs() <= TOLERANCE));

    Ok(())
}

#[test]
fn pooling_agrees() -> Result<(), Box<dyn Error>> {
    let Some(backend) = accelerated() else {
        return Ok(());
    };

    for method in [PoolMethod::Max, PoolMethod::Average] {
        let config = PoolingConfig {
            method,
            kernel_size: 2,
            kernel_depth: 2,
            stride: 2,
            temporal_stride: 1,
            pad: 1,
            temporal_pad: 1,
        };

        let bottom = random_volume([2, 3, 4, 4, 4]);
        let native_bottom = vec![from_ndarray(bottom.data().to_owned())];
        let device_bottom = vec![bottom];
        let native_top = vec![zeros([1, 1, 1, 1, 1])];
        let device_top = vec![zeros([1, 1, 1, 1, 1])];

        let mut native = Pooling3d::new(config);
        let mut device = Pooling3d::with_backend(config, backend.clone());

        native.set_up(&native_bottom, &native_top);
        device.set_up(&device_bottom, &device_top);

        native.forward(&native_bottom, &native_top);
        device.forward(&device_bottom, &device_top);
        assert_agree(&native_top[0], &device_top[0]);

        native_top[0].gradient_mut().fill(1.);
        device_top[0].gradient_mut().fill(1.);
        native.backward(&native_top, &[true], &native_bottom);
        device.backward(&device_top, &[true], &device_bottom);
        assert_gradients_agree(&native_bottom[0], &device_bottom[0]);
    }

    Ok(())
}

#[test]
fn crop_agrees() -> Result<(), Box<dyn Error>> {
    let Some(backend) = accelerated() else {
        return Ok(());
    };

    let config = CropConfig {
        crop_l: 2,
        crop_h: 3,
        crop_w: 2,
        offset: None,
    };

    let bottom = random_volume([2, 2, 4, 5, 4]);
    let native_bottom = vec![from_ndarray(bottom.data().to_owned())];
    let device_bottom = vec![bottom];
    let native_top = vec![zeros([1, 1, 1, 1, 1])];
    let device_top = vec![zeros([1, 1, 1, 1, 1])];

    let mut native = Crop3d::new(config);
    let mut device = Crop3d::with_backend(config, backend);

    native.set_up(&native_bottom, &native_top);
    device.set_up(&device_bottom, &device_top);

    native.forward(&native_bottom, &native_top);
    device.forward(&device_bottom, &device_top);
    assert_agree(&native_top[0], &device_top[0]);

    let projection = ndarray::Array5::random(native_top[0].raw_dim(), Uniform::new(-1., 1.));
    native_top[0].gradient_mut().assign(&projection);
    device_top[0].gradient_mut().assign(&projection);
    native.backward(&native_top, &[true], &native_bottom);
    device.backward(&device_top, &[true], &device_bottom);
    assert_gradients_agree(&native_bottom[0], &device_bottom[0]);

    Ok(())
}

#[test]
fn stretch_agrees() -> Result<(), Box<dyn Error>> {
    let Some(backend) = accelerated() else {
        return Ok(());
    };

    let config = StretchConfig {
        length: 4,
        height: 3,
        width: 3,
    };

    let bottom = random_volume([2, 4, 2, 3, 3]);
    let native_bottom = vec![from_ndarray(bottom.data().to_owned())];
    let device_bottom = vec![bottom];
    let native_top = vec![zeros([1, 1, 1, 1, 1])];
    let device_top = vec![zeros([1, 1, 1, 1, 1])];

    let mut native = Stretch3d::new(config);
    let mut device = Stretch3d::with_backend(config, backend);

    native.set_up(&native_bottom, &native_top);
    device.set_up(&device_bottom, &device_top);

    native.forward(&native_bottom, &native_top);
    device.forward(&device_bottom, &device_top);
    assert_agree(&native_top[0], &device_top[0]);

    let count = native_top[0].len();
    let ramp = Array::linspace(1., count as f32, count).into_shape(native_top[0].raw_dim())?;
    native_top[0].gradient_mut().assign(&ramp);
    device_top[0].gradient_mut().assign(&ramp);
    native.backward(&native_top, &[true], &native_bottom);
    device.backward(&device_top, &[true], &device_bottom);
    assert_gradients_agree(&native_bottom[0], &device_bottom[0]);

    Ok(())
}
