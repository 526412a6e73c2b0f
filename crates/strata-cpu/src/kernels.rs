// Host kernels — f64 arithmetic over logically ordered buffers
//
// Every buffer here is already gathered into logical (packed) order, so the
// only thing a kernel needs to know about memory placement is the Format:
//
//   channel-first  [N, C, s0, s1, ...]   index = (n*C + c)*S + s
//   channel-last   [N, s0, s1, ..., C]   index = (n*S + s)*C + c
//
// where S is the product of the spatial extents and s the flat spatial
// position. The batch axis is outermost in both formats, so one sample is a
// contiguous chunk; convolution and pooling parallelise over those chunks.
//
// Sliding windows (convolution, its transpose, pooling) are described by a
// tap table: for every output position, the list of (filter position, input
// position) pairs that fall inside the padded input. Padding taps are simply
// absent.

use rayon::prelude::*;
use strata_core::{
    ActivationMode, ConvParams, Error, Format, Layout, PoolMode, PoolParams, Result,
};

/// Batch/channel/spatial decomposition of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub batch: usize,
    pub channels: usize,
    pub spatial: Vec<usize>,
    pub format: Format,
}

impl Geometry {
    pub fn of(layout: &Layout) -> Result<Self> {
        let format = layout.format();
        let shape = layout.shape();
        let channels = format.channels(shape)?;
        Ok(Geometry {
            batch: shape.dims()[0],
            channels,
            spatial: format.spatial_dims(shape).to_vec(),
            format,
        })
    }

    pub fn spatial_count(&self) -> usize {
        self.spatial.iter().product()
    }

    /// Elements in one sample.
    pub fn sample_len(&self) -> usize {
        self.channels * self.spatial_count()
    }

    pub fn len(&self) -> usize {
        self.batch * self.sample_len()
    }

    /// Logical index of (n, c, s).
    #[inline]
    pub fn index(&self, n: usize, c: usize, s: usize) -> usize {
        let sc = self.spatial_count();
        match self.format {
            Format::ChannelFirst => (n * self.channels + c) * sc + s,
            Format::ChannelLast => (n * sc + s) * self.channels + c,
        }
    }

    /// Channel of a logical index.
    #[inline]
    pub fn channel_of(&self, i: usize) -> usize {
        match self.format {
            Format::ChannelFirst => (i / self.spatial_count()) % self.channels,
            Format::ChannelLast => i % self.channels,
        }
    }
}

fn unravel(mut flat: usize, dims: &[usize], out: &mut [usize]) {
    for d in (0..dims.len()).rev() {
        out[d] = flat % dims[d];
        flat /= dims[d];
    }
}

fn ravel(idx: &[usize], dims: &[usize]) -> usize {
    idx.iter().zip(dims).fold(0, |acc, (&i, &d)| acc * d + i)
}

/// Output extent of one sliding-window axis, or None if the window does
/// not fit.
pub(crate) fn window_extent(
    input: usize,
    filter: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
) -> Option<usize> {
    let span = (filter - 1) * dilation + 1;
    let padded = input + 2 * padding;
    if stride == 0 || padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// For every output position, the (filter, input) position pairs that land
/// inside the input.
pub(crate) struct Taps {
    pub out_count: usize,
    pub filter_count: usize,
    table: Vec<Vec<(usize, usize)>>,
}

impl Taps {
    pub fn build(
        input: &[usize],
        filter: &[usize],
        output: &[usize],
        padding: &[usize],
        stride: &[usize],
        dilation: &[usize],
    ) -> Self {
        let rank = input.len();
        let out_count: usize = output.iter().product();
        let filter_count: usize = filter.iter().product();
        let mut o_idx = vec![0; rank];
        let mut f_idx = vec![0; rank];
        let mut p_idx = vec![0; rank];
        let mut table = Vec::with_capacity(out_count);
        for o in 0..out_count {
            unravel(o, output, &mut o_idx);
            let mut row = Vec::new();
            'filter: for f in 0..filter_count {
                unravel(f, filter, &mut f_idx);
                for d in 0..rank {
                    let pos = (o_idx[d] * stride[d] + f_idx[d] * dilation[d]) as i64
                        - padding[d] as i64;
                    if pos < 0 || pos >= input[d] as i64 {
                        continue 'filter;
                    }
                    p_idx[d] = pos as usize;
                }
                row.push((f, ravel(&p_idx, input)));
            }
            table.push(row);
        }
        Taps {
            out_count,
            filter_count,
            table,
        }
    }

    pub fn at(&self, o: usize) -> &[(usize, usize)] {
        &self.table[o]
    }
}

fn check_params(len: usize, name: &'static str, got: usize) -> Result<()> {
    if got != len {
        return Err(Error::invalid(
            name,
            format!("{got} entries given for {len} spatial dimensions"),
        ));
    }
    Ok(())
}

/// Validate convolution operands and build the tap table. `x` is the
/// sliding side, `w` the filter (axis 0 = output channels), `y` the
/// window-output side.
pub(crate) fn conv_taps(
    x: &Geometry,
    w: &Geometry,
    y: &Geometry,
    params: &ConvParams,
) -> Result<Taps> {
    let rank = x.spatial.len();
    if rank == 0 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: 2,
        });
    }
    check_params(rank, "padding", params.padding.len())?;
    check_params(rank, "stride", params.stride.len())?;
    check_params(rank, "dilation", params.dilation.len())?;
    if w.channels != x.channels {
        return Err(Error::DimensionMismatch {
            axis: x.format.channel_axis(rank + 2),
            expected: x.channels,
            got: w.channels,
        });
    }
    if y.channels != w.batch || y.batch != x.batch {
        return Err(Error::DimensionMismatch {
            axis: y.format.channel_axis(rank + 2),
            expected: w.batch,
            got: y.channels,
        });
    }
    for d in 0..rank {
        let expect = window_extent(
            x.spatial[d],
            w.spatial[d],
            params.padding[d],
            params.stride[d],
            params.dilation[d],
        );
        if expect != Some(y.spatial[d]) {
            return Err(Error::DimensionMismatch {
                axis: d,
                expected: expect.unwrap_or(0),
                got: y.spatial[d],
            });
        }
    }
    Ok(Taps::build(
        &x.spatial,
        &w.spatial,
        &y.spatial,
        &params.padding,
        &params.stride,
        &params.dilation,
    ))
}

//  Convolution

pub(crate) fn conv_forward(
    x: &[f64],
    xg: &Geometry,
    w: &[f64],
    wg: &Geometry,
    yg: &Geometry,
    taps: &Taps,
) -> Vec<f64> {
    let mut y = vec![0.0; yg.len()];
    let sample = yg.sample_len();
    if sample == 0 {
        return y;
    }
    y.par_chunks_mut(sample).enumerate().for_each(|(n, out)| {
        for k in 0..yg.channels {
            for o in 0..taps.out_count {
                let mut acc = 0.0;
                for &(f, p) in taps.at(o) {
                    for c in 0..xg.channels {
                        acc += x[xg.index(n, c, p)] * w[wg.index(k, c, f)];
                    }
                }
                out[yg.index(0, k, o)] = acc;
            }
        }
    });
    y
}

/// Gradient with respect to the sliding-side input.
pub(crate) fn conv_backward_data(
    w: &[f64],
    wg: &Geometry,
    dy: &[f64],
    yg: &Geometry,
    xg: &Geometry,
    taps: &Taps,
) -> Vec<f64> {
    let mut dx = vec![0.0; xg.len()];
    let sample = xg.sample_len();
    if sample == 0 {
        return dx;
    }
    dx.par_chunks_mut(sample).enumerate().for_each(|(n, out)| {
        for o in 0..taps.out_count {
            for &(f, p) in taps.at(o) {
                for k in 0..yg.channels {
                    let g = dy[yg.index(n, k, o)];
                    if g == 0.0 {
                        continue;
                    }
                    for c in 0..xg.channels {
                        out[xg.index(0, c, p)] += g * w[wg.index(k, c, f)];
                    }
                }
            }
        }
    });
    dx
}

/// Gradient with respect to the filter.
pub(crate) fn conv_backward_filter(
    x: &[f64],
    xg: &Geometry,
    dy: &[f64],
    yg: &Geometry,
    wg: &Geometry,
    taps: &Taps,
) -> Vec<f64> {
    let mut dw = vec![0.0; wg.len()];
    let per_k = wg.sample_len();
    if per_k == 0 {
        return dw;
    }
    dw.par_chunks_mut(per_k).enumerate().for_each(|(k, out)| {
        for n in 0..xg.batch {
            for o in 0..taps.out_count {
                let g = dy[yg.index(n, k, o)];
                if g == 0.0 {
                    continue;
                }
                for &(f, p) in taps.at(o) {
                    for c in 0..xg.channels {
                        out[wg.index(0, c, f)] += g * x[xg.index(n, c, p)];
                    }
                }
            }
        }
    });
    dw
}

/// Sum over everything but the channel axis.
pub(crate) fn channel_sums(v: &[f64], g: &Geometry) -> Vec<f64> {
    let mut sums = vec![0.0; g.channels];
    for (i, &x) in v.iter().enumerate() {
        sums[g.channel_of(i)] += x;
    }
    sums
}

//  Activation

pub(crate) fn activation_forward(mode: ActivationMode, x: &[f64]) -> Vec<f64> {
    x.iter()
        .map(|&v| match mode {
            ActivationMode::Relu => v.max(0.0),
            ActivationMode::LeakyRelu { slope } => {
                if v > 0.0 {
                    v
                } else {
                    slope * v
                }
            }
            ActivationMode::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            ActivationMode::Tanh => v.tanh(),
        })
        .collect()
}

pub(crate) fn activation_backward(
    mode: ActivationMode,
    x: &[f64],
    y: &[f64],
    dy: &[f64],
) -> Vec<f64> {
    x.iter()
        .zip(y)
        .zip(dy)
        .map(|((&xv, &yv), &g)| match mode {
            ActivationMode::Relu => {
                if xv > 0.0 {
                    g
                } else {
                    0.0
                }
            }
            ActivationMode::LeakyRelu { slope } => {
                if xv > 0.0 {
                    g
                } else {
                    slope * g
                }
            }
            ActivationMode::Sigmoid => g * yv * (1.0 - yv),
            ActivationMode::Tanh => g * (1.0 - yv * yv),
        })
        .collect()
}

//  Pooling

pub(crate) fn pool_taps(x: &Geometry, y: &Geometry, params: &PoolParams) -> Result<Taps> {
    let rank = x.spatial.len();
    if rank == 0 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: 2,
        });
    }
    check_params(rank, "window", params.window.len())?;
    check_params(rank, "padding", params.padding.len())?;
    check_params(rank, "stride", params.stride.len())?;
    if x.channels != y.channels || x.batch != y.batch {
        return Err(Error::DimensionMismatch {
            axis: x.format.channel_axis(rank + 2),
            expected: x.channels,
            got: y.channels,
        });
    }
    let dilation = vec![1; rank];
    for d in 0..rank {
        let expect = window_extent(
            x.spatial[d],
            params.window[d],
            params.padding[d],
            params.stride[d],
            1,
        );
        if expect != Some(y.spatial[d]) {
            return Err(Error::DimensionMismatch {
                axis: d,
                expected: expect.unwrap_or(0),
                got: y.spatial[d],
            });
        }
    }
    Ok(Taps::build(
        &x.spatial,
        &params.window,
        &y.spatial,
        &params.padding,
        &params.stride,
        &dilation,
    ))
}

pub(crate) fn pool_forward(
    mode: PoolMode,
    x: &[f64],
    xg: &Geometry,
    yg: &Geometry,
    taps: &Taps,
) -> Vec<f64> {
    let mut y = vec![0.0; yg.len()];
    for n in 0..yg.batch {
        for c in 0..yg.channels {
            for o in 0..taps.out_count {
                let window = taps.at(o);
                let v = match mode {
                    PoolMode::Max => window
                        .iter()
                        .map(|&(_, p)| x[xg.index(n, c, p)])
                        .fold(None, |m: Option<f64>, v| Some(m.map_or(v, |m| m.max(v))))
                        .unwrap_or(0.0),
                    PoolMode::Average => {
                        if window.is_empty() {
                            0.0
                        } else {
                            window.iter().map(|&(_, p)| x[xg.index(n, c, p)]).sum::<f64>()
                                / window.len() as f64
                        }
                    }
                };
                y[yg.index(n, c, o)] = v;
            }
        }
    }
    y
}

pub(crate) fn pool_backward(
    mode: PoolMode,
    x: &[f64],
    xg: &Geometry,
    dy: &[f64],
    yg: &Geometry,
    taps: &Taps,
) -> Vec<f64> {
    let mut dx = vec![0.0; xg.len()];
    for n in 0..yg.batch {
        for c in 0..yg.channels {
            for o in 0..taps.out_count {
                let window = taps.at(o);
                if window.is_empty() {
                    continue;
                }
                let g = dy[yg.index(n, c, o)];
                match mode {
                    PoolMode::Max => {
                        // first maximum takes the whole gradient
                        let mut best = window[0].1;
                        for &(_, p) in &window[1..] {
                            if x[xg.index(n, c, p)] > x[xg.index(n, c, best)] {
                                best = p;
                            }
                        }
                        dx[xg.index(n, c, best)] += g;
                    }
                    PoolMode::Average => {
                        let share = g / window.len() as f64;
                        for &(_, p) in window {
                            dx[xg.index(n, c, p)] += share;
                        }
                    }
                }
            }
        }
    }
    dx
}

//  Batch normalization

/// Per-channel mean and biased variance.
pub(crate) fn channel_moments(x: &[f64], g: &Geometry) -> (Vec<f64>, Vec<f64>) {
    let m = (g.batch * g.spatial_count()) as f64;
    let mean: Vec<f64> = channel_sums(x, g).into_iter().map(|s| s / m).collect();
    let mut var = vec![0.0; g.channels];
    for (i, &v) in x.iter().enumerate() {
        let c = g.channel_of(i);
        let d = v - mean[c];
        var[c] += d * d;
    }
    var.iter_mut().for_each(|v| *v /= m);
    (mean, var)
}

pub(crate) fn normalize(
    x: &[f64],
    g: &Geometry,
    mean: &[f64],
    inv_std: &[f64],
    scale: &[f64],
    bias: &[f64],
) -> Vec<f64> {
    x.iter()
        .enumerate()
        .map(|(i, &v)| {
            let c = g.channel_of(i);
            scale[c] * (v - mean[c]) * inv_std[c] + bias[c]
        })
        .collect()
}

/// Returns (dx, dscale, dbias).
pub(crate) fn batchnorm_backward(
    x: &[f64],
    dy: &[f64],
    g: &Geometry,
    scale: &[f64],
    mean: &[f64],
    inv_std: &[f64],
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let m = (g.batch * g.spatial_count()) as f64;
    let mut dbias = vec![0.0; g.channels];
    let mut dscale = vec![0.0; g.channels];
    for (i, (&xv, &gv)) in x.iter().zip(dy).enumerate() {
        let c = g.channel_of(i);
        dbias[c] += gv;
        dscale[c] += gv * (xv - mean[c]) * inv_std[c];
    }
    let dx = x
        .iter()
        .zip(dy)
        .enumerate()
        .map(|(i, (&xv, &gv))| {
            let c = g.channel_of(i);
            let xhat = (xv - mean[c]) * inv_std[c];
            scale[c] * inv_std[c] / m * (m * gv - dbias[c] - xhat * dscale[c])
        })
        .collect();
    (dx, dscale, dbias)
}

//  Softmax

pub(crate) fn softmax(x: &[f64], g: &Geometry) -> Vec<f64> {
    let mut y = vec![0.0; x.len()];
    for n in 0..g.batch {
        for s in 0..g.spatial_count() {
            let max = (0..g.channels)
                .map(|c| x[g.index(n, c, s)])
                .fold(f64::NEG_INFINITY, f64::max);
            let mut total = 0.0;
            for c in 0..g.channels {
                let e = (x[g.index(n, c, s)] - max).exp();
                y[g.index(n, c, s)] = e;
                total += e;
            }
            for c in 0..g.channels {
                y[g.index(n, c, s)] /= total;
            }
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Shape;

    fn geom(dims: (usize, usize, usize, usize), format: Format) -> Geometry {
        Geometry::of(&Layout::packed(Shape::from(dims), format)).unwrap()
    }

    #[test]
    fn test_geometry_index_both_formats() {
        let nchw = geom((2, 3, 2, 2), Format::ChannelFirst);
        assert_eq!(nchw.index(1, 2, 3), 23);
        assert_eq!(nchw.channel_of(23), 2);
        let nhwc = geom((2, 2, 2, 3), Format::ChannelLast);
        assert_eq!(nhwc.channels, 3);
        assert_eq!(nhwc.spatial, vec![2, 2]);
        assert_eq!(nhwc.index(1, 2, 3), 23);
        assert_eq!(nhwc.channel_of(23), 2);
    }

    #[test]
    fn test_window_extent() {
        assert_eq!(window_extent(4, 2, 0, 1, 1), Some(3));
        assert_eq!(window_extent(5, 3, 1, 2, 1), Some(3));
        assert_eq!(window_extent(5, 3, 0, 1, 2), Some(1));
        assert_eq!(window_extent(2, 3, 0, 1, 1), None);
    }

    #[test]
    fn test_taps_skip_padding() {
        // 1-D input of 3, filter 3, padding 1, stride 1 → 3 outputs
        let taps = Taps::build(&[3], &[3], &[3], &[1], &[1], &[1]);
        assert_eq!(taps.at(0), &[(1, 0), (2, 1)]);
        assert_eq!(taps.at(1), &[(0, 0), (1, 1), (2, 2)]);
        assert_eq!(taps.at(2), &[(0, 1), (1, 2)]);
    }

    #[test]
    fn test_conv_forward_ones() {
        let xg = geom((1, 1, 4, 4), Format::ChannelFirst);
        let wg = geom((1, 1, 2, 2), Format::ChannelFirst);
        let yg = geom((1, 1, 3, 3), Format::ChannelFirst);
        let params = ConvParams {
            padding: vec![0, 0],
            stride: vec![1, 1],
            dilation: vec![1, 1],
        };
        let taps = conv_taps(&xg, &wg, &yg, &params).unwrap();
        let y = conv_forward(&[1.0; 16], &xg, &[1.0; 4], &wg, &yg, &taps);
        assert_eq!(y, vec![4.0; 9]);
    }

    #[test]
    fn test_conv_taps_reject_wrong_output() {
        let xg = geom((1, 1, 4, 4), Format::ChannelFirst);
        let wg = geom((1, 1, 2, 2), Format::ChannelFirst);
        let yg = geom((1, 1, 4, 4), Format::ChannelFirst);
        let params = ConvParams {
            padding: vec![0, 0],
            stride: vec![1, 1],
            dilation: vec![1, 1],
        };
        assert!(conv_taps(&xg, &wg, &yg, &params).is_err());
    }

    #[test]
    fn test_max_pool_routes_gradient() {
        let xg = geom((1, 1, 2, 2), Format::ChannelFirst);
        let yg = geom((1, 1, 1, 1), Format::ChannelFirst);
        let params = PoolParams {
            mode: PoolMode::Max,
            window: vec![2, 2],
            padding: vec![0, 0],
            stride: vec![2, 2],
        };
        let taps = pool_taps(&xg, &yg, &params).unwrap();
        let x = [1.0, 5.0, 3.0, 2.0];
        assert_eq!(pool_forward(PoolMode::Max, &x, &xg, &yg, &taps), vec![5.0]);
        let dx = pool_backward(PoolMode::Max, &x, &xg, &[1.0], &yg, &taps);
        assert_eq!(dx, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let g = geom((2, 3, 1, 1), Format::ChannelFirst);
        let y = softmax(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &g);
        let first: f64 = y[..3].iter().sum();
        assert!((first - 1.0).abs() < 1e-12);
        assert!((y[3] - 1.0 / 3.0).abs() < 1e-12);
        assert!(y[2] > y[1] && y[1] > y[0]);
    }

    #[test]
    fn test_batchnorm_moments() {
        let g = geom((2, 1, 1, 2), Format::ChannelFirst);
        let (mean, var) = channel_moments(&[1.0, 2.0, 3.0, 4.0], &g);
        assert_eq!(mean, vec![2.5]);
        assert!((var[0] - 1.25).abs() < 1e-12);
    }
}
