use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// Shape — N-dimensional extents of a Volume
//
// Dimensions are listed in memory order, so the position of the channel
// axis depends on the Format:
//   - ChannelFirst (NCHW): [N, C, H, W]
//   - ChannelLast  (NHWC): [N, H, W, C]
//
// Every dimension is positive and the rank is at least 1.

/// N-dimensional shape of a Volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Compute the packed (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::RankMismatch {
            expected: d + 1,
            got: self.rank(),
        })
    }

    /// Reject empty shapes and zero extents.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::incompatible(self, "rank must be at least 1"));
        }
        if self.0.iter().any(|&d| d == 0) {
            return Err(Error::incompatible(self, "every dimension must be positive"));
        }
        Ok(())
    }

    /// Copy of this shape with one dimension replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        dims[axis] = size;
        Shape(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

// Format — where the channel axis lives

/// Memory layout tag: channel-first (NCHW) or channel-last (NHWC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    ChannelFirst,
    ChannelLast,
}

impl Format {
    /// Index of the channel axis for a shape of the given rank.
    pub fn channel_axis(&self, rank: usize) -> usize {
        match self {
            Format::ChannelFirst => 1,
            Format::ChannelLast => rank - 1,
        }
    }

    /// Indices of the spatial axes (everything but batch and channel).
    pub fn spatial_axes(&self, rank: usize) -> std::ops::Range<usize> {
        match self {
            Format::ChannelFirst => 2..rank,
            Format::ChannelLast => 1..rank - 1,
        }
    }

    /// Channel count of `shape` under this format.
    pub fn channels(&self, shape: &Shape) -> Result<usize> {
        if shape.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: shape.rank(),
            });
        }
        shape.dim(self.channel_axis(shape.rank()))
    }

    /// Spatial extents of `shape` under this format.
    pub fn spatial_dims<'a>(&self, shape: &'a Shape) -> &'a [usize] {
        &shape.dims()[self.spatial_axes(shape.rank())]
    }

    /// Assemble a shape from batch, channel and spatial extents.
    pub fn compose(&self, batch: usize, channels: usize, spatial: &[usize]) -> Shape {
        let mut dims = Vec::with_capacity(spatial.len() + 2);
        dims.push(batch);
        match self {
            Format::ChannelFirst => {
                dims.push(channels);
                dims.extend_from_slice(spatial);
            }
            Format::ChannelLast => {
                dims.extend_from_slice(spatial);
                dims.push(channels);
            }
        }
        Shape::new(dims)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::ChannelFirst => write!(f, "NCHW"),
            Format::ChannelLast => write!(f, "NHWC"),
        }
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NCHW" => Ok(Format::ChannelFirst),
            "NHWC" => Ok(Format::ChannelLast),
            other => Err(Error::msg(format!("unsupported format tag: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_4d_strides() {
        let s = Shape::from((2, 3, 4, 5));
        assert_eq!(s.stride_contiguous(), vec![60, 20, 5, 1]);
        assert_eq!(s.elem_count(), 120);
    }

    #[test]
    fn test_display() {
        let s = Shape::from((3, 4));
        assert_eq!(format!("{}", s), "[3, 4]");
    }

    #[test]
    fn test_validate_rejects_zero_extent() {
        assert!(Shape::from((1, 0, 4, 4)).validate().is_err());
        assert!(Shape::new(vec![]).validate().is_err());
        assert!(Shape::from((1, 3, 4, 4)).validate().is_ok());
    }

    #[test]
    fn test_channel_axis_by_format() {
        let nchw = Shape::from((2, 3, 8, 9));
        assert_eq!(Format::ChannelFirst.channels(&nchw).unwrap(), 3);
        assert_eq!(Format::ChannelFirst.spatial_dims(&nchw), &[8, 9]);

        let nhwc = Shape::from((2, 8, 9, 3));
        assert_eq!(Format::ChannelLast.channels(&nhwc).unwrap(), 3);
        assert_eq!(Format::ChannelLast.spatial_dims(&nhwc), &[8, 9]);
    }

    #[test]
    fn test_compose_matches_axes() {
        let s = Format::ChannelLast.compose(2, 5, &[7, 7]);
        assert_eq!(s.dims(), &[2, 7, 7, 5]);
        let s = Format::ChannelFirst.compose(2, 5, &[7, 7]);
        assert_eq!(s.dims(), &[2, 5, 7, 7]);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("nhwc".parse::<Format>().unwrap(), Format::ChannelLast);
        assert!("NCHWvectC".parse::<Format>().is_err());
    }
}
