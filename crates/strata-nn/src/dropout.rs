// Dropout — Regularization via random zeroing
//
// During training, Dropout zeroes each element with probability p and
// scales the survivors by 1/(1-p) so the expected value is unchanged. The
// keep-mask lands in a reserve Volume owned by the layer so backward can
// apply exactly the mask forward drew.
//
// During inference, Dropout is the identity: the input is copied through.
//
// Masks are deterministic: the n-th training sweep draws from
// seed + n, where the seed arrives with init_weights.

use strata_core::{Backend, Blend, Error, Format, Result, Shape, Volume, VolumeId, Workspace};

use crate::module::{allocate_output, input_meta, io, LayerId, LayerKind, Ledger, Module, Ports};

/// Applies dropout regularization.
pub struct Dropout<B: Backend> {
    id: LayerId,
    ports: Ports,
    /// Probability of an element being zeroed.
    p: f64,
    training: bool,
    seed: u64,
    draws: u64,
    reserve: Option<Volume<B>>,
    /// Whether the last forward drew a mask.
    masked: bool,
}

impl<B: Backend> Dropout<B> {
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::invalid("p", format!("{p} is outside [0, 1)")));
        }
        Ok(Dropout {
            id: LayerId::new(),
            ports: Ports::default(),
            p,
            training: true,
            seed: 0,
            draws: 0,
            reserve: None,
            masked: false,
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl<B: Backend> Module<B> for Dropout<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, _format: Format) -> Result<Shape> {
        Ok(input.clone())
    }

    fn allocate_outputs(&mut self, ws: &mut Workspace<B>, ledger: &mut Ledger) -> Result<VolumeId> {
        let (shape, format, dtype) = input_meta(&self.ports, ws)?;
        let id = allocate_output(&mut self.ports, ws, ledger, shape.clone())?;
        self.reserve = Some(Volume::create(shape, format, dtype, false, ws.device())?);
        Ok(id)
    }

    fn unwire(&mut self) {
        self.ports.output.clear();
        self.reserve = None;
        self.masked = false;
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn init_weights(&mut self, _ws: &Workspace<B>, seed: u64) -> Result<()> {
        self.seed = seed;
        self.draws = 0;
        Ok(())
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        if !self.training {
            self.masked = false;
            return B::transform(xv.strided_src()?, yv.strided_dst()?, Blend::OVERWRITE);
        }
        let reserve = self
            .reserve
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{} has no reserve buffer", self.id)))?;
        let seed = self.seed.wrapping_add(self.draws);
        self.draws += 1;
        B::dropout_forward(self.p, seed, xv.src()?, yv.dst()?, reserve.value_mut()?)?;
        self.masked = true;
        Ok(())
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        if !has_dx {
            return Ok(());
        }
        let (yv, xv) = ws.pair_mut(y, x)?;
        if !self.masked {
            return B::transform(yv.strided_grad_src()?, xv.strided_grad_dst()?, blend);
        }
        let reserve = self
            .reserve
            .as_ref()
            .ok_or_else(|| Error::invariant(format!("{} has no reserve buffer", self.id)))?;
        B::dropout_backward(self.p, yv.grad_src()?, reserve.value()?, xv.grad_dst()?, blend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::DType;
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn wired(p: f64) -> (Dropout<CpuBackend>, CpuWorkspace, VolumeId, VolumeId) {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((2, 50)), Format::ChannelFirst, DType::F32)
            .unwrap();
        ws.get_mut(x).unwrap().fill(1.0).unwrap();
        let mut layer = Dropout::<CpuBackend>::new(p).unwrap();
        layer.bind(x);
        let y = layer.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        layer.init_weights(&ws, 42).unwrap();
        (layer, ws, x, y)
    }

    #[test]
    fn test_rejects_bad_probability() {
        assert!(Dropout::<CpuBackend>::new(1.0).is_err());
        assert!(Dropout::<CpuBackend>::new(-0.1).is_err());
    }

    #[test]
    fn test_training_mask_matches_gradient() {
        let (mut layer, mut ws, x, y) = wired(0.5);
        layer.forward(&mut ws).unwrap();
        let out = ws.get(y).unwrap().values().unwrap();
        assert!(out.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(out.iter().any(|&v| v == 0.0));

        ws.get_mut(y).unwrap().write_gradient(&[1.0; 100]).unwrap();
        layer.backward(&mut ws, Blend::OVERWRITE).unwrap();
        let grad = ws.get(x).unwrap().gradient_values().unwrap();
        assert_eq!(out, grad);
    }

    #[test]
    fn test_inference_is_identity() {
        let (mut layer, mut ws, _, y) = wired(0.9);
        Module::<CpuBackend>::set_training(&mut layer, false);
        layer.forward(&mut ws).unwrap();
        assert_eq!(ws.get(y).unwrap().values().unwrap(), vec![1.0; 100]);
    }

    #[test]
    fn test_masks_are_reproducible() {
        let (mut a, mut wa, _, ya) = wired(0.3);
        let (mut b, mut wb, _, yb) = wired(0.3);
        a.forward(&mut wa).unwrap();
        b.forward(&mut wb).unwrap();
        assert_eq!(
            wa.get(ya).unwrap().values().unwrap(),
            wb.get(yb).unwrap().values().unwrap()
        );
    }

    #[test]
    fn test_unwire_drops_reserve() {
        let dev = CpuDevice::new();
        let mut ws = CpuWorkspace::new(dev.clone());
        let x = ws
            .create(Shape::from((1, 4)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let before = dev.allocated_bytes();
        let mut layer = Dropout::<CpuBackend>::new(0.5).unwrap();
        layer.bind(x);
        let mut ledger = Ledger::new();
        layer.allocate_outputs(&mut ws, &mut ledger).unwrap();
        assert!(dev.allocated_bytes() > before);
        layer.unwire();
        ledger.release_all(&mut ws);
        assert_eq!(dev.allocated_bytes(), before);
    }
}
