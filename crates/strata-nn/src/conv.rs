// Convolution & TransposedConvolution — sliding-window layers
//
// Convolution applies K learnable filters to an input with C channels and
// any number of spatial dimensions, adding a per-channel bias.
// TransposedConvolution runs the same kernels with the roles of input and
// output exchanged, growing the spatial extents instead of shrinking them.
//
// WEIGHT INITIALIZATION:
//
//   Kaiming (He) uniform: U(-k, k) where k = sqrt(1 / (C_in * prod(filter))).
//
// PARAMETER SHAPES (channel-first; channel-last moves C to the end):
//
//   Convolution            filter: [K, C, f...]      bias: [1, K, 1...]
//   TransposedConvolution  filter: [C, K, f...]      bias: [1, K, 1...]
//
// OUTPUT SIZE FORMULA (per spatial axis, see window.rs):
//
//   forward:    1 + (i + 2p - ((f-1)d + 1)) / s      (division must be exact)
//   transposed: (i - 1)s - 2p + (f-1)d + 1
//
// Both layers own two trainer slots: filter first, bias second.

use strata_core::{
    Backend, Blend, ConvParams, DType, Error, Format, Result, Shape, Volume, Workspace,
};

use crate::module::{input_meta, io, LayerId, LayerKind, Module, Ports};
use crate::param::{fill_uniform, kaiming_bound, Params};
use crate::trainer::Trainer;
use crate::window::{output_dims, recommend_padding, reverse_output_dims};

const FILTER: usize = 0;
const BIAS: usize = 1;

/// Geometry of a convolution: filter count, extents and window parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvConfig {
    /// Output channels (K).
    pub filters: usize,
    /// Filter extent per spatial axis.
    pub filter: Vec<usize>,
    pub padding: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
}

impl ConvConfig {
    /// `filters` output channels with unit stride and dilation, no padding.
    pub fn new(filters: usize, filter: &[usize]) -> Self {
        let n = filter.len();
        ConvConfig {
            filters,
            filter: filter.to_vec(),
            padding: vec![0; n],
            stride: vec![1; n],
            dilation: vec![1; n],
        }
    }

    /// Padding and dilation picked by [`recommend_padding`] for layer
    /// `index` of a stack, on every axis.
    pub fn recommended(
        filters: usize,
        filter: &[usize],
        index: usize,
        stride: usize,
        offset: i64,
    ) -> Result<Self> {
        let mut config = Self::new(filters, filter).stride(&vec![stride; filter.len()]);
        for (d, &f) in filter.iter().enumerate() {
            let (dilation, padding) = recommend_padding(f, index, stride, offset)?;
            config.dilation[d] = dilation;
            config.padding[d] = padding;
        }
        Ok(config)
    }

    pub fn padding(mut self, padding: &[usize]) -> Self {
        self.padding = padding.to_vec();
        self
    }

    pub fn stride(mut self, stride: &[usize]) -> Self {
        self.stride = stride.to_vec();
        self
    }

    pub fn dilation(mut self, dilation: &[usize]) -> Self {
        self.dilation = dilation.to_vec();
        self
    }

    pub fn params(&self) -> ConvParams {
        ConvParams {
            padding: self.padding.clone(),
            stride: self.stride.clone(),
            dilation: self.dilation.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.filters == 0 {
            return Err(Error::invalid("filters", "at least one filter is required"));
        }
        if self.filter.is_empty() {
            return Err(Error::invalid("filter", "no spatial dimensions"));
        }
        Ok(())
    }

    fn check_rank(&self, input: &Shape) -> Result<()> {
        if input.rank() != self.filter.len() + 2 {
            return Err(Error::RankMismatch {
                expected: self.filter.len() + 2,
                got: input.rank(),
            });
        }
        Ok(())
    }

    fn fan_in(&self, channels: usize) -> usize {
        channels * self.filter.iter().product::<usize>()
    }
}

fn bias_shape(format: Format, filters: usize, rank: usize) -> Shape {
    format.compose(1, filters, &vec![1; rank])
}

#[allow(clippy::too_many_arguments)]
fn init_filter_and_bias<B: Backend>(
    params: &mut Params<B>,
    filter_shape: Shape,
    bias_shape: Shape,
    fan_in: usize,
    format: Format,
    dtype: DType,
    ws: &Workspace<B>,
    seed: u64,
) -> Result<()> {
    params.create(vec![filter_shape, bias_shape], format, dtype, ws.device())?;
    let bound = kaiming_bound(fan_in);
    fill_uniform(params.get_mut(FILTER)?, bound, seed)?;
    fill_uniform(params.get_mut(BIAS)?, bound, seed.wrapping_add(1))
}

/// Once weights exist the input channel count is fixed.
fn check_weight_channels<B: Backend>(
    params: &Params<B>,
    weight_axis: usize,
    input: &Shape,
    format: Format,
) -> Result<()> {
    let channels = format.channels(input)?;
    if params.is_initialized() {
        let expected = params.get(FILTER)?.shape().dim(weight_axis)?;
        if expected != channels {
            return Err(Error::DimensionMismatch {
                axis: format.channel_axis(input.rank()),
                expected,
                got: channels,
            });
        }
    }
    Ok(())
}

/// N-dimensional convolution with bias.
pub struct Convolution<B: Backend> {
    id: LayerId,
    ports: Ports,
    config: ConvConfig,
    params: Params<B>,
}

impl<B: Backend> Convolution<B> {
    pub fn new(config: ConvConfig) -> Result<Self> {
        config.validate()?;
        Ok(Convolution {
            id: LayerId::new(),
            ports: Ports::default(),
            config,
            params: Params::new(2),
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }
}

impl<B: Backend> Module<B> for Convolution<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Convolution
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        self.config.check_rank(input)?;
        // filter is [K, C, ..] or [K, .., C]
        check_weight_channels(&self.params, format.channel_axis(input.rank()), input, format)?;
        let spatial = output_dims(
            format.spatial_dims(input),
            &self.config.filter,
            &self.config.params(),
        )?;
        Ok(format.compose(input.dims()[0], self.config.filters, &spatial))
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let params = self.config.params();
        let (xv, yv) = ws.pair_mut(x, y)?;
        let w = self.params.get(FILTER)?;
        let b = self.params.get(BIAS)?;
        B::conv_forward(xv.src()?, w.src()?, yv.dst()?, &params, Blend::OVERWRITE)?;
        B::bias_forward(b.src()?, yv.dst()?)
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        let params = self.config.params();
        {
            let (xv, yv) = (ws.get(x)?, ws.get(y)?);
            let (w, b) = self.params.pair_mut(FILTER, BIAS)?;
            B::conv_backward_filter(
                xv.src()?,
                yv.grad_src()?,
                w.grad_dst()?,
                &params,
                Blend::ACCUMULATE,
            )?;
            B::bias_backward(yv.grad_src()?, b.grad_dst()?, Blend::ACCUMULATE)?;
        }
        if has_dx {
            let (yv, xv) = ws.pair_mut(y, x)?;
            let w = self.params.get(FILTER)?;
            B::conv_backward_data(w.src()?, yv.grad_src()?, xv.grad_dst()?, &params, blend)?;
        }
        Ok(())
    }

    fn init_weights(&mut self, ws: &Workspace<B>, seed: u64) -> Result<()> {
        let (shape, format, dtype) = input_meta(&self.ports, ws)?;
        let channels = format.channels(&shape)?;
        let filter_shape = format.compose(self.config.filters, channels, &self.config.filter);
        let bias_shape = bias_shape(format, self.config.filters, self.config.filter.len());
        init_filter_and_bias(
            &mut self.params,
            filter_shape,
            bias_shape,
            self.config.fan_in(channels),
            format,
            dtype,
            ws,
            seed,
        )
    }

    fn trainer_slots_needed(&self) -> usize {
        self.params.slots()
    }

    fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        self.params.bind_trainers(trainers)
    }

    fn update(&mut self, counter: usize) -> Result<()> {
        self.params.update(counter)
    }

    fn l1l2_loss(&self) -> (f64, f64) {
        self.params.l1l2_loss()
    }

    fn weights(&self) -> Vec<&Volume<B>> {
        self.params.volumes()
    }

    fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.params.volumes_mut()
    }

    fn release_weights(&mut self) {
        self.params.release();
    }
}

/// Transposed (fractionally strided) convolution with bias.
///
/// Forward is the data gradient of a convolution whose input has this
/// layer's output shape.
pub struct TransposedConvolution<B: Backend> {
    id: LayerId,
    ports: Ports,
    config: ConvConfig,
    params: Params<B>,
}

impl<B: Backend> TransposedConvolution<B> {
    pub fn new(config: ConvConfig) -> Result<Self> {
        config.validate()?;
        Ok(TransposedConvolution {
            id: LayerId::new(),
            ports: Ports::default(),
            config,
            params: Params::new(2),
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }
}

impl<B: Backend> Module<B> for TransposedConvolution<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::TransposedConvolution
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        self.config.check_rank(input)?;
        // filter is [C, K, ..] or [C, .., K]
        check_weight_channels(&self.params, 0, input, format)?;
        let spatial = reverse_output_dims(
            format.spatial_dims(input),
            &self.config.filter,
            &self.config.params(),
        )?;
        Ok(format.compose(input.dims()[0], self.config.filters, &spatial))
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let params = self.config.params();
        let (xv, yv) = ws.pair_mut(x, y)?;
        let w = self.params.get(FILTER)?;
        let b = self.params.get(BIAS)?;
        B::conv_backward_data(w.src()?, xv.src()?, yv.dst()?, &params, Blend::OVERWRITE)?;
        B::bias_forward(b.src()?, yv.dst()?)
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        let params = self.config.params();
        {
            let (xv, yv) = (ws.get(x)?, ws.get(y)?);
            let (w, b) = self.params.pair_mut(FILTER, BIAS)?;
            // the output gradient plays the convolution input here
            B::conv_backward_filter(
                yv.grad_src()?,
                xv.src()?,
                w.grad_dst()?,
                &params,
                Blend::ACCUMULATE,
            )?;
            B::bias_backward(yv.grad_src()?, b.grad_dst()?, Blend::ACCUMULATE)?;
        }
        if has_dx {
            let (yv, xv) = ws.pair_mut(y, x)?;
            let w = self.params.get(FILTER)?;
            B::conv_forward(yv.grad_src()?, w.src()?, xv.grad_dst()?, &params, blend)?;
        }
        Ok(())
    }

    fn init_weights(&mut self, ws: &Workspace<B>, seed: u64) -> Result<()> {
        let (shape, format, dtype) = input_meta(&self.ports, ws)?;
        let channels = format.channels(&shape)?;
        let filter_shape = format.compose(channels, self.config.filters, &self.config.filter);
        let bias_shape = bias_shape(format, self.config.filters, self.config.filter.len());
        init_filter_and_bias(
            &mut self.params,
            filter_shape,
            bias_shape,
            self.config.fan_in(channels),
            format,
            dtype,
            ws,
            seed,
        )
    }

    fn trainer_slots_needed(&self) -> usize {
        self.params.slots()
    }

    fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        self.params.bind_trainers(trainers)
    }

    fn update(&mut self, counter: usize) -> Result<()> {
        self.params.update(counter)
    }

    fn l1l2_loss(&self) -> (f64, f64) {
        self.params.l1l2_loss()
    }

    fn weights(&self) -> Vec<&Volume<B>> {
        self.params.volumes()
    }

    fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.params.volumes_mut()
    }

    fn release_weights(&mut self) {
        self.params.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Ledger;
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn wired<M: Module<CpuBackend>>(
        layer: &mut M,
        dims: (usize, usize, usize, usize),
    ) -> (CpuWorkspace, strata_core::VolumeId, strata_core::VolumeId) {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from(dims), Format::ChannelFirst, DType::F64)
            .unwrap();
        layer.bind(x);
        let mut ledger = Ledger::new();
        let y = layer.allocate_outputs(&mut ws, &mut ledger).unwrap();
        layer.init_weights(&ws, 7).unwrap();
        (ws, x, y)
    }

    #[test]
    fn test_output_shape() {
        let conv = Convolution::<CpuBackend>::new(ConvConfig::new(8, &[3, 3])).unwrap();
        let out = conv
            .infer_output_shape(&Shape::from((2, 3, 5, 5)), Format::ChannelFirst)
            .unwrap();
        assert_eq!(out.dims(), &[2, 8, 3, 3]);
        let out = conv
            .infer_output_shape(&Shape::from((2, 5, 5, 3)), Format::ChannelLast)
            .unwrap();
        assert_eq!(out.dims(), &[2, 3, 3, 8]);
    }

    #[test]
    fn test_rank_mismatch() {
        let conv = Convolution::<CpuBackend>::new(ConvConfig::new(1, &[2, 2])).unwrap();
        assert!(matches!(
            conv.infer_output_shape(&Shape::from((1, 1, 4)), Format::ChannelFirst),
            Err(Error::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_inexact_stride_rejected() {
        let conv =
            Convolution::<CpuBackend>::new(ConvConfig::new(1, &[2, 2]).stride(&[2, 2])).unwrap();
        assert!(matches!(
            conv.infer_output_shape(&Shape::from((1, 1, 5, 5)), Format::ChannelFirst),
            Err(Error::IncompatibleShape { .. })
        ));
    }

    #[test]
    fn test_recommended_config() {
        let c = ConvConfig::recommended(4, &[3, 3], 1, 1, 0).unwrap();
        assert_eq!(c.dilation, vec![2, 2]);
        assert_eq!(c.padding, vec![2, 2]);
        // odd filters with recommended padding keep the extent
        let conv = Convolution::<CpuBackend>::new(c).unwrap();
        let out = conv
            .infer_output_shape(&Shape::from((1, 2, 9, 9)), Format::ChannelFirst)
            .unwrap();
        assert_eq!(out.dims(), &[1, 4, 9, 9]);
    }

    #[test]
    fn test_weight_shapes() {
        let mut conv = Convolution::<CpuBackend>::new(ConvConfig::new(4, &[2, 3])).unwrap();
        let (_ws, _, _) = wired(&mut conv, (1, 3, 4, 5));
        let w = conv.weights();
        assert_eq!(w[0].dims(), &[4, 3, 2, 3]);
        assert_eq!(w[1].dims(), &[1, 4, 1, 1]);
        assert_eq!(conv.trainer_slots_needed(), 2);
        let bound = kaiming_bound(18);
        assert!(w[0].values().unwrap().iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_forward_backward_4x4() {
        let mut conv = Convolution::<CpuBackend>::new(ConvConfig::new(1, &[2, 2])).unwrap();
        let (mut ws, x, y) = wired(&mut conv, (1, 1, 4, 4));
        assert_eq!(ws.get(y).unwrap().dims(), &[1, 1, 3, 3]);
        {
            let mut w = conv.weights_mut();
            w[0].fill(1.0).unwrap();
            w[1].fill(0.0).unwrap();
        }
        let input: Vec<f64> = (1..=16).map(|v| v as f64).collect();
        ws.get_mut(x).unwrap().write_values(&input).unwrap();
        conv.forward(&mut ws).unwrap();
        assert_eq!(
            ws.get(y).unwrap().values().unwrap(),
            vec![14.0, 18.0, 22.0, 30.0, 34.0, 38.0, 46.0, 50.0, 54.0]
        );

        ws.get_mut(y).unwrap().write_gradient(&[1.0; 9]).unwrap();
        conv.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(
            ws.get(x).unwrap().gradient_values().unwrap(),
            vec![
                1.0, 2.0, 2.0, 1.0, 2.0, 4.0, 4.0, 2.0, 2.0, 4.0, 4.0, 2.0, 1.0, 2.0, 2.0, 1.0
            ]
        );
        let w = conv.weights();
        assert_eq!(w[0].gradient_values().unwrap(), vec![54.0, 63.0, 90.0, 99.0]);
        assert_eq!(w[1].gradient_values().unwrap(), vec![9.0]);

        // weight gradients accumulate across backward calls
        conv.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(conv.weights()[1].gradient_values().unwrap(), vec![18.0]);
    }

    #[test]
    fn test_transposed_restores_extent() {
        let mut up =
            TransposedConvolution::<CpuBackend>::new(ConvConfig::new(2, &[2, 2])).unwrap();
        let (mut ws, x, y) = wired(&mut up, (1, 1, 3, 3));
        assert_eq!(ws.get(y).unwrap().dims(), &[1, 2, 4, 4]);
        assert_eq!(up.weights()[0].dims(), &[1, 2, 2, 2]);
        {
            let mut w = up.weights_mut();
            w[0].fill(1.0).unwrap();
            w[1].fill(0.0).unwrap();
        }
        ws.get_mut(x).unwrap().fill(1.0).unwrap();
        up.forward(&mut ws).unwrap();
        let out = ws.get(y).unwrap().values().unwrap();
        // each output counts the input taps covering it
        assert_eq!(&out[..4], &[1.0, 2.0, 2.0, 1.0]);
        assert_eq!(&out[4..8], &[2.0, 4.0, 4.0, 2.0]);

        ws.get_mut(y).unwrap().write_gradient(&[1.0; 32]).unwrap();
        up.backward(&mut ws, Blend::OVERWRITE).unwrap();
        // every input feeds 2 channels x 4 taps
        assert_eq!(ws.get(x).unwrap().gradient_values().unwrap(), vec![8.0; 9]);
        assert_eq!(up.weights()[1].gradient_values().unwrap(), vec![16.0, 16.0]);
    }

    #[test]
    fn test_channel_mismatch_after_init() {
        let mut conv = Convolution::<CpuBackend>::new(ConvConfig::new(1, &[2, 2])).unwrap();
        let (_ws, _, _) = wired(&mut conv, (1, 2, 4, 4));
        assert!(matches!(
            conv.infer_output_shape(&Shape::from((1, 3, 4, 4)), Format::ChannelFirst),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
