// Pooling — windowed max or average reduction
//
// Shares the window arithmetic of convolution with a dilation of 1. Max
// pooling routes the gradient to the first maximum of each window; average
// pooling divides by the number of in-bounds taps, so padding never dilutes
// the mean.

use strata_core::{
    Backend, Blend, ConvParams, Error, Format, PoolMode, PoolParams, Result, Shape, Workspace,
};

use crate::module::{io, LayerId, LayerKind, Module, Ports};
use crate::window::output_dims;

/// Window, stride and padding of a pooling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub mode: PoolMode,
    pub window: Vec<usize>,
    pub padding: Vec<usize>,
    pub stride: Vec<usize>,
}

impl PoolConfig {
    /// Non-overlapping windows: stride equals the window, no padding.
    pub fn new(mode: PoolMode, window: &[usize]) -> Self {
        PoolConfig {
            mode,
            window: window.to_vec(),
            padding: vec![0; window.len()],
            stride: window.to_vec(),
        }
    }

    pub fn max(window: &[usize]) -> Self {
        Self::new(PoolMode::Max, window)
    }

    pub fn average(window: &[usize]) -> Self {
        Self::new(PoolMode::Average, window)
    }

    pub fn padding(mut self, padding: &[usize]) -> Self {
        self.padding = padding.to_vec();
        self
    }

    pub fn stride(mut self, stride: &[usize]) -> Self {
        self.stride = stride.to_vec();
        self
    }

    fn params(&self) -> PoolParams {
        PoolParams {
            mode: self.mode,
            window: self.window.clone(),
            padding: self.padding.clone(),
            stride: self.stride.clone(),
        }
    }

    fn window_params(&self) -> ConvParams {
        ConvParams {
            padding: self.padding.clone(),
            stride: self.stride.clone(),
            dilation: vec![1; self.window.len()],
        }
    }
}

pub struct Pooling {
    id: LayerId,
    ports: Ports,
    config: PoolConfig,
}

impl Pooling {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.window.is_empty() {
            return Err(Error::invalid("window", "no spatial dimensions"));
        }
        Ok(Pooling {
            id: LayerId::new(),
            ports: Ports::default(),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<B: Backend> Module<B> for Pooling {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Pooling
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        if input.rank() != self.config.window.len() + 2 {
            return Err(Error::RankMismatch {
                expected: self.config.window.len() + 2,
                got: input.rank(),
            });
        }
        let channels = format.channels(input)?;
        let spatial = output_dims(
            format.spatial_dims(input),
            &self.config.window,
            &self.config.window_params(),
        )?;
        Ok(format.compose(input.dims()[0], channels, &spatial))
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        B::pool_forward(&self.config.params(), xv.src()?, yv.dst()?)
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        if !has_dx {
            return Ok(());
        }
        let (yv, xv) = ws.pair_mut(y, x)?;
        let (x_src, dx) = xv.split_grad()?;
        B::pool_backward(
            &self.config.params(),
            x_src,
            yv.src()?,
            yv.grad_src()?,
            dx,
            blend,
        )
    }
}
