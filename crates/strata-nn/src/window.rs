// Shape arithmetic for sliding-window layers
//
// Forward extent (convolution, pooling):
//
//   span   = (filter - 1) * dilation + 1
//   output = 1 + (input + 2*padding - span) / stride
//
// The division must be exact. A window that would leave input rows
// unvisited is rejected instead of silently truncated.
//
// Reverse extent (transposed convolution):
//
//   output = (input - 1) * stride - 2*padding + span
//
// With stride 1 the two are inverses of each other.
//
// Padding recommendation keeps output parity stable through a stack of
// layers indexed 0..N. Even filters are meant for even-in/even-out stacks,
// odd filters for odd-in/odd-out stacks.

use strata_core::{ConvParams, Error, Result, Shape};

fn span(filter: usize, dilation: usize) -> usize {
    (filter - 1) * dilation + 1
}

fn check_window(filter: usize, stride: usize, dilation: usize) -> Result<()> {
    if filter == 0 {
        return Err(Error::invalid("filter", "extent must be positive"));
    }
    if stride == 0 {
        return Err(Error::invalid("stride", "must be positive"));
    }
    if dilation == 0 {
        return Err(Error::invalid("dilation", "must be positive"));
    }
    Ok(())
}

/// Output extent of one axis of a convolution-like window.
pub fn output_extent(
    input: usize,
    filter: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
) -> Result<usize> {
    check_window(filter, stride, dilation)?;
    let padded = input + 2 * padding;
    let span = span(filter, dilation);
    if padded < span {
        return Err(Error::incompatible(
            &Shape::from(input),
            format!("padded extent {padded} is smaller than the window span {span}"),
        ));
    }
    let room = padded - span;
    if room % stride != 0 {
        return Err(Error::incompatible(
            &Shape::from(input),
            format!(
                "(input + 2*padding - span) = {room} is not a multiple of stride {stride}"
            ),
        ));
    }
    Ok(1 + room / stride)
}

/// Output extent of one axis of a transposed convolution.
pub fn reverse_output_extent(
    input: usize,
    filter: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
) -> Result<usize> {
    check_window(filter, stride, dilation)?;
    if input == 0 {
        return Err(Error::incompatible(&Shape::from(input), "empty input extent"));
    }
    let grown = (input - 1) * stride + span(filter, dilation);
    if grown <= 2 * padding {
        return Err(Error::incompatible(
            &Shape::from(input),
            format!("padding {padding} consumes the whole output"),
        ));
    }
    Ok(grown - 2 * padding)
}

/// Recommend a `(dilation, padding)` pair for layer `index` of a stack.
///
/// `offset` shifts the target output parity. For even filters with stride 1
/// the padded span must come out even, otherwise this fails with
/// [`Error::Parity`].
pub fn recommend_padding(
    filter: usize,
    index: usize,
    stride: usize,
    offset: i64,
) -> Result<(usize, usize)> {
    if filter == 0 {
        return Err(Error::invalid("filter", "extent must be positive"));
    }
    let (f, i) = (filter as i64, index as i64);
    let dilation = if f % 2 == 0 {
        if stride == 1 {
            2 * (i + 1)
        } else {
            2 * i + 1
        }
    } else {
        i + 1
    };
    let span = (f - 1) * dilation + 1 + offset;
    if f % 2 == 0 && stride == 1 && span % 2 != 0 {
        return Err(Error::Parity { value: span });
    }
    let padding = span / 2;
    if padding < 0 {
        return Err(Error::invalid(
            "offset",
            format!("offset {offset} gives negative padding {padding}"),
        ));
    }
    Ok((dilation as usize, padding as usize))
}

fn check_rank(dims: &[usize], params: &ConvParams) -> Result<()> {
    let n = dims.len();
    for (name, len) in [
        ("padding", params.padding.len()),
        ("stride", params.stride.len()),
        ("dilation", params.dilation.len()),
    ] {
        if len != n {
            return Err(Error::invalid(
                name,
                format!("{len} entries given for {n} spatial dimensions"),
            ));
        }
    }
    Ok(())
}

/// [`output_extent`] over every spatial axis.
pub fn output_dims(input: &[usize], filter: &[usize], params: &ConvParams) -> Result<Vec<usize>> {
    check_rank(input, params)?;
    if filter.len() != input.len() {
        return Err(Error::RankMismatch {
            expected: input.len(),
            got: filter.len(),
        });
    }
    (0..input.len())
        .map(|d| {
            output_extent(
                input[d],
                filter[d],
                params.padding[d],
                params.stride[d],
                params.dilation[d],
            )
        })
        .collect()
}

/// [`reverse_output_extent`] over every spatial axis.
pub fn reverse_output_dims(
    input: &[usize],
    filter: &[usize],
    params: &ConvParams,
) -> Result<Vec<usize>> {
    check_rank(input, params)?;
    if filter.len() != input.len() {
        return Err(Error::RankMismatch {
            expected: input.len(),
            got: filter.len(),
        });
    }
    (0..input.len())
        .map(|d| {
            reverse_output_extent(
                input[d],
                filter[d],
                params.padding[d],
                params.stride[d],
                params.dilation[d],
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_extent_basic() {
        assert_eq!(output_extent(4, 2, 0, 1, 1).unwrap(), 3);
        assert_eq!(output_extent(5, 3, 1, 2, 1).unwrap(), 3);
        assert_eq!(output_extent(9, 3, 0, 1, 4).unwrap(), 1);
    }

    #[test]
    fn test_output_extent_rejects_truncation() {
        // (6 + 0 - 3) = 3 is not a multiple of 2
        assert!(matches!(
            output_extent(6, 3, 0, 2, 1),
            Err(Error::IncompatibleShape { .. })
        ));
        assert!(output_extent(2, 5, 0, 1, 1).is_err());
        assert!(matches!(
            output_extent(4, 2, 0, 0, 1),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_reverse_round_trip_stride_one() {
        for i in 1..12 {
            for f in 1..5 {
                for p in 0..3 {
                    for d in 1..3 {
                        if let Ok(o) = output_extent(i, f, p, 1, d) {
                            assert_eq!(reverse_output_extent(o, f, p, 1, d).unwrap(), i);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_reverse_extent_upsamples() {
        assert_eq!(reverse_output_extent(4, 2, 0, 2, 1).unwrap(), 8);
        assert_eq!(reverse_output_extent(3, 3, 1, 2, 1).unwrap(), 5);
    }

    #[test]
    fn test_recommend_even_filter_stride_one() {
        for index in 0..=5 {
            let (dilation, padding) = recommend_padding(8, index, 1, 1).unwrap();
            assert_eq!(dilation, 2 * (index + 1));
            assert_eq!(padding, (7 * dilation + 2) / 2);
            assert_eq!(output_extent(16, 8, padding, 1, dilation).unwrap(), 18);
            // offset -1 keeps the extent through the whole stack
            let (dilation, padding) = recommend_padding(8, index, 1, -1).unwrap();
            assert_eq!(output_extent(16, 8, padding, 1, dilation).unwrap(), 16);
        }
        for index in 0..=5 {
            assert!(matches!(
                recommend_padding(8, index, 1, 0),
                Err(Error::Parity { .. })
            ));
        }
    }

    #[test]
    fn test_recommend_even_filter_stride_two() {
        assert_eq!(recommend_padding(2, 0, 2, 0).unwrap(), (1, 1));
        assert_eq!(recommend_padding(2, 1, 2, 0).unwrap(), (3, 2));
    }

    #[test]
    fn test_recommend_odd_filter() {
        assert_eq!(recommend_padding(3, 0, 1, 0).unwrap(), (1, 1));
        assert_eq!(recommend_padding(3, 2, 1, 0).unwrap(), (3, 3));
        assert_eq!(output_extent(7, 3, 3, 1, 3).unwrap(), 7);
    }

    #[test]
    fn test_recommend_negative_padding() {
        assert!(matches!(
            recommend_padding(3, 0, 1, -10),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_output_dims_per_axis() {
        let params = ConvParams {
            padding: vec![0, 1],
            stride: vec![1, 1],
            dilation: vec![1, 1],
        };
        assert_eq!(output_dims(&[4, 4], &[2, 3], &params).unwrap(), vec![3, 4]);
        assert_eq!(
            reverse_output_dims(&[3, 4], &[2, 3], &params).unwrap(),
            vec![4, 4]
        );
        assert!(output_dims(&[4], &[2, 3], &params).is_err());
    }
}
