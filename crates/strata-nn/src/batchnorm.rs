// BatchNorm — spatial batch normalization
//
// Statistics are taken per channel over the batch and every spatial
// position:
//
//   x_hat = (x - mean_batch) / sqrt(var_batch + eps)
//   y     = scale * x_hat + bias
//
// RUNNING STATISTICS (updated by every training forward):
//
//   running_mean = (1 - momentum) * running_mean + momentum * mean_batch
//   running_var  = (1 - momentum) * running_var  + momentum * var_unbiased
//
// Inference normalizes with the running statistics instead of the batch.
// The batch mean and inverse standard deviation of the last training
// forward are saved for backward.
//
// SHAPES (channel-first; channel-last moves C to the end):
//   scale, bias:            [1, C, 1, ..]   (two trainer slots)
//   running and saved stats: [C]

use strata_core::{
    Backend, Blend, DType, Error, Format, NormState, Result, Shape, Volume, Workspace,
};

use crate::module::{input_meta, io, LayerId, LayerKind, Module, Ports};
use crate::param::Params;
use crate::trainer::Trainer;

const SCALE: usize = 0;
const BIAS: usize = 1;

struct Statistics<B: Backend> {
    running_mean: Volume<B>,
    running_var: Volume<B>,
    saved_mean: Volume<B>,
    saved_inv_std: Volume<B>,
}

impl<B: Backend> Statistics<B> {
    fn create(channels: usize, format: Format, dtype: DType, device: &B::Device) -> Result<Self> {
        let stat = || Volume::create(Shape::from(channels), format, dtype, false, device);
        let mut running_var = stat()?;
        running_var.fill(1.0)?;
        Ok(Statistics {
            running_mean: stat()?,
            running_var,
            saved_mean: stat()?,
            saved_inv_std: stat()?,
        })
    }
}

/// Spatial batch normalization with learnable scale and bias.
pub struct BatchNorm<B: Backend> {
    id: LayerId,
    ports: Ports,
    momentum: f64,
    eps: f64,
    training: bool,
    params: Params<B>,
    stats: Option<Statistics<B>>,
}

impl<B: Backend> BatchNorm<B> {
    /// Momentum 0.1, eps 1e-5.
    pub fn new() -> Self {
        BatchNorm {
            id: LayerId::new(),
            ports: Ports::default(),
            momentum: 0.1,
            eps: 1e-5,
            training: true,
            params: Params::new(2),
            stats: None,
        }
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Running mean and variance, once weights exist.
    pub fn running_stats(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let stats = self.statistics()?;
        Ok((stats.running_mean.values()?, stats.running_var.values()?))
    }

    fn statistics(&self) -> Result<&Statistics<B>> {
        self.stats
            .as_ref()
            .ok_or_else(|| Error::invariant(format!("{} has no statistics", self.id)))
    }
}

impl<B: Backend> Default for BatchNorm<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Module<B> for BatchNorm<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Normalization
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        let channels = format.channels(input)?;
        if self.params.is_initialized() {
            let expected = self.params.get(SCALE)?.elem_count();
            if expected != channels {
                return Err(Error::DimensionMismatch {
                    axis: format.channel_axis(input.rank()),
                    expected,
                    got: channels,
                });
            }
        }
        Ok(input.clone())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        let scale = self.params.get(SCALE)?;
        let bias = self.params.get(BIAS)?;
        let stats = self
            .stats
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{} has no statistics", self.id)))?;
        if self.training {
            let state = NormState {
                running_mean: stats.running_mean.value_mut()?,
                running_var: stats.running_var.value_mut()?,
                saved_mean: stats.saved_mean.value_mut()?,
                saved_inv_std: stats.saved_inv_std.value_mut()?,
            };
            B::batchnorm_forward_training(
                xv.src()?,
                scale.src()?,
                bias.src()?,
                yv.dst()?,
                state,
                self.momentum,
                self.eps,
            )
        } else {
            B::batchnorm_forward_inference(
                xv.src()?,
                scale.src()?,
                bias.src()?,
                stats.running_mean.value()?,
                stats.running_var.value()?,
                yv.dst()?,
                self.eps,
            )
        }
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        let stats = self
            .stats
            .as_ref()
            .ok_or_else(|| Error::invariant(format!("{} has no statistics", self.id)))?;
        let (yv, xv) = ws.pair_mut(y, x)?;
        let (scale, bias) = self.params.pair_mut(SCALE, BIAS)?;
        let (scale_src, dscale) = scale.split_grad()?;
        let dbias = bias.grad_dst()?;
        let (mean, inv_std) = (stats.saved_mean.value()?, stats.saved_inv_std.value()?);
        if has_dx {
            let (x_src, dx) = xv.split_grad()?;
            B::batchnorm_backward(
                x_src,
                yv.grad_src()?,
                scale_src,
                mean,
                inv_std,
                Some(dx),
                dscale,
                dbias,
                blend,
            )
        } else {
            B::batchnorm_backward(
                xv.src()?,
                yv.grad_src()?,
                scale_src,
                mean,
                inv_std,
                None,
                dscale,
                dbias,
                blend,
            )
        }
    }

    fn init_weights(&mut self, ws: &Workspace<B>, _seed: u64) -> Result<()> {
        let (shape, format, dtype) = input_meta(&self.ports, ws)?;
        let channels = format.channels(&shape)?;
        let spatial = vec![1; format.spatial_dims(&shape).len()];
        let per_channel = format.compose(1, channels, &spatial);
        self.params
            .create(vec![per_channel.clone(), per_channel], format, dtype, ws.device())?;
        match Statistics::create(channels, format, dtype, ws.device()) {
            Ok(stats) => {
                self.params.get_mut(SCALE)?.fill(1.0)?;
                self.stats = Some(stats);
                Ok(())
            }
            Err(e) => {
                self.params.release();
                Err(e)
            }
        }
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
        self.stats = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Ledger;
    use strata_core::{DType, VolumeId};
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn wired() -> (BatchNorm<CpuBackend>, CpuWorkspace, VolumeId, VolumeId) {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((2, 1, 1, 2)), Format::ChannelFirst, DType::F64)
            .unwrap();
        ws.get_mut(x)
            .unwrap()
            .write_values(&[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let mut bn = BatchNorm::<CpuBackend>::new();
        bn.bind(x);
        let y = bn.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        bn.init_weights(&ws, 0).unwrap();
        (bn, ws, x, y)
    }

    #[test]
    fn test_training_forward_normalizes() {
        let (mut bn, mut ws, _, y) = wired();
        assert_eq!(bn.weights()[0].dims(), &[1, 1, 1, 1]);
        bn.forward(&mut ws).unwrap();
        let out = ws.get(y).unwrap().values().unwrap();
        let inv = 1.0 / (1.25f64 + 1e-5).sqrt();
        assert!(approx_eq(out[0], -1.5 * inv));
        assert!(approx_eq(out[3], 1.5 * inv));
        assert!(approx_eq(out.iter().sum::<f64>(), 0.0));

        let (mean, var) = bn.running_stats().unwrap();
        assert!(approx_eq(mean[0], 0.25));
        assert!(approx_eq(var[0], 0.9 + 0.1 * 1.25 * 4.0 / 3.0));
    }

    #[test]
    fn test_inference_uses_running_stats() {
        let (mut bn, mut ws, _, y) = wired();
        bn.forward(&mut ws).unwrap();
        Module::<CpuBackend>::set_training(&mut bn, false);
        bn.forward(&mut ws).unwrap();
        let out = ws.get(y).unwrap().values().unwrap();
        let var = 0.9 + 0.1 * 1.25 * 4.0 / 3.0;
        assert!(approx_eq(out[0], (1.0 - 0.25) / (var + 1e-5f64).sqrt()));
    }

    #[test]
    fn test_backward_constant_gradient() {
        let (mut bn, mut ws, x, y) = wired();
        bn.forward(&mut ws).unwrap();
        ws.get_mut(y).unwrap().write_gradient(&[1.0; 4]).unwrap();
        bn.backward(&mut ws, Blend::OVERWRITE).unwrap();
        let dx = ws.get(x).unwrap().gradient_values().unwrap();
        assert!(dx.iter().all(|&g| approx_eq(g, 0.0)));
        let w = bn.weights();
        assert!(approx_eq(w[0].gradient_values().unwrap()[0], 0.0));
        assert!(approx_eq(w[1].gradient_values().unwrap()[0], 4.0));
    }

    #[test]
    fn test_channel_count_fixed_after_init() {
        let (bn, _ws, _, _) = wired();
        assert!(matches!(
            bn.infer_output_shape(&Shape::from((2, 3, 1, 2)), Format::ChannelFirst),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
