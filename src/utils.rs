use itertools::izip;

use ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Axis};

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

/// Computes the output spatial extents of a volumetric convolution or
/// pooling, ⌊(in + 2·pad − kernel) / stride⌋ + 1 along (depth, height,
/// width).
///
/// # Panics
///
/// If a stride is zero or a kernel extent overruns the padded input; both
/// would make some output extent non-positive.
pub(crate) fn conv_out_shape(
    input: [usize; 3],
    kernel: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
) -> [usize; 3] {
    let mut output = [0; 3];
    izip!(&mut output, input, kernel, stride, pad).for_each(
        |(output, input, kernel, stride, pad)| {
            assert!(stride > 0, "Strides must be positive.");

            let padded = input + 2 * pad;
            assert!(
                kernel > 0 && kernel <= padded,
                "Kernel extent {} doesn't fit in padded input extent {}.",
                kernel,
                padded
            );

            *output = (padded - kernel) / stride + 1;
        },
    );

    output
}

/// Computes the output spatial extents of a volumetric transposed
/// convolution, (in − 1)·stride − 2·pad + kernel along (depth, height,
/// width).
///
/// # Panics
///
/// If a stride is zero, an input extent is zero, or the padding swallows the
/// whole output extent.
pub(crate) fn deconv_out_shape(
    input: [usize; 3],
    kernel: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
) -> [usize; 3] {
    let mut output = [0; 3];
    izip!(&mut output, input, kernel, stride, pad).for_each(
        |(output, input, kernel, stride, pad)| {
            assert!(stride > 0, "Strides must be positive.");
            assert!(input > 0, "Input extents must be positive.");

            let expanded = (input - 1) * stride + kernel;
            assert!(
                expanded > 2 * pad,
                "Padding {} swallows the whole output extent {}.",
                pad,
                expanded
            );

            *output = expanded - 2 * pad;
        },
    );

    output
}

/// Enforces that `groups` exactly partitions both channel counts.
pub(crate) fn check_group_args(channels: usize, num_output: usize, groups: usize) {
    assert!(groups > 0, "Filter groups must be positive.");
    assert_eq!(
        channels % groups,
        0,
        "In channels {} is not divisible by filter groups {}.",
        channels,
        groups
    );
    assert_eq!(
        num_output % groups,
        0,
        "Out channels {} is not divisible by filter groups {}.",
        num_output,
        groups
    );
}

/// Unrolls the receptive-field patches of a (C, L, H, W) volume into a
/// column buffer of shape (C·kd·kh·kw, out_l·out_h·out_w), one flattened
/// patch per column. Taps that fall outside the padded border read as zero.
pub(crate) fn vol2col(
    vol: ArrayView4<f32>,
    mut col: ArrayViewMut2<f32>,
    kernel: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
) {
    let input = [
        vol.len_of(Axis(1)),
        vol.len_of(Axis(2)),
        vol.len_of(Axis(3)),
    ];
    let [out_l, out_h, out_w] = conv_out_shape(input, kernel, stride, pad);
    let [length, height, width] = input;
    let [kd, kh, kw] = kernel;
    let taps = kd * kh * kw;

    debug_assert_eq!(col.dim(), (vol.len_of(Axis(0)) * taps, out_l * out_h * out_w));

    // Channels write disjoint row blocks of the buffer.
    col.axis_chunks_iter_mut(Axis(0), taps)
        .into_par_iter()
        .zip(vol.outer_iter())
        .for_each(|(mut rows, channel)| {
            for (tap, mut row) in rows.outer_iter_mut().enumerate() {
                let (dl, dh, dw) = (tap / (kh * kw), tap / kw % kh, tap % kw);
                let mut column = 0;
                for ol in 0..out_l {
                    let il = (ol * stride[0] + dl) as isize - pad[0] as isize;
                    for oh in 0..out_h {
                        let ih = (oh * stride[1] + dh) as isize - pad[1] as isize;
                        for ow in 0..out_w {
                            let iw = (ow * stride[2] + dw) as isize - pad[2] as isize;
                            let inside = (0..length as isize).contains(&il)
                                && (0..height as isize).contains(&ih)
                                && (0..width as isize).contains(&iw);
                            row[column] = if inside {
                                channel[[il as usize, ih as usize, iw as usize]]
                            } else {
                                0.
                            };
                            column += 1;
                        }
                    }
                }
            }
        });
}

/// Scatter-accumulates a column buffer back into a (C, L, H, W) volume,
/// summing the contributions of overlapping patches. The adjoint of
/// [`vol2col`]; taps that fell outside the border are discarded.
pub(crate) fn col2vol(
    mut vol: ArrayViewMut4<f32>,
    col: ArrayView2<f32>,
    kernel: [usize; 3],
    stride: [usize; 3],
    pad: [usize; 3],
) {
    let input = [
        vol.len_of(Axis(1)),
        vol.len_of(Axis(2)),
        vol.len_of(Axis(3)),
    ];
    let [out_l, out_h, out_w] = conv_out_shape(input, kernel, stride, pad);
    let [length, height, width] = input;
    let [kd, kh, kw] = kernel;
    let taps = kd * kh * kw;

    debug_assert_eq!(col.dim(), (vol.len_of(Axis(0)) * taps, out_l * out_h * out_w));

    // Each channel reads only its own row block, so the accumulation races
    // with nothing.
    vol.outer_iter_mut()
        .into_par_iter()
        .zip(col.axis_chunks_iter(Axis(0), taps))
        .for_each(|(mut channel, rows)| {
            for (tap, row) in rows.outer_iter().enumerate() {
                let (dl, dh, dw) = (tap / (kh * kw), tap / kw % kh, tap % kw);
                let mut column = 0;
                for ol in 0..out_l {
                    let il = (ol * stride[0] + dl) as isize - pad[0] as isize;
                    for oh in 0..out_h {
                        let ih = (oh * stride[1] + dh) as isize - pad[1] as isize;
                        for ow in 0..out_w {
                            let iw = (ow * stride[2] + dw) as isize - pad[2] as isize;
                            let inside = (0..length as isize).contains(&il)
                                && (0..height as isize).contains(&ih)
                                && (0..width as isize).contains(&iw);
                            if inside {
                                channel[[il as usize, ih as usize, iw as usize]] += row[column];
                            }
                            column += 1;
                        }
                    }
                }
            }
        });
}

#[cfg(test)]
pub(crate) const F32_EPSILON: f32 = 4.88e-04;

#[cfg(test)]
pub(crate) fn are_similar<D: ndarray::Dimension>(
    result: &ndarray::Array<f32, D>,
    expected: &ndarray::Array<f32, D>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !result.abs_diff_eq(expected, F32_EPSILON) {
        return Err(format!("Result: {} | Expected: {}", result, expected).into());
    }

    Ok(())
}
