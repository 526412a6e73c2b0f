// Activation — element-wise non-linearities
//
// Fixed activations (ReLU, LeakyReLU, Sigmoid, Tanh) have no state and keep
// the input shape. PReLU learns one coefficient per element of a single
// sample, so its coefficient tensor is the input shape with batch 1 and it
// asks for one trainer slot.
//
// Once PReLU coefficients exist, the per-sample shape is fixed: rebuilding
// the layer over an input with a different sample shape fails instead of
// reinterpreting the coefficients.

use strata_core::{
    ActivationMode, Backend, Blend, Error, Format, Result, Shape, Volume, Workspace,
};

use crate::module::{input_meta, io, LayerId, LayerKind, Module, Ports};
use crate::param::Params;
use crate::trainer::Trainer;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Fixed(ActivationMode),
    Parametric { init: f64 },
}

/// Element-wise activation layer.
pub struct Activation<B: Backend> {
    id: LayerId,
    ports: Ports,
    function: Function,
    coefficients: Params<B>,
}

impl<B: Backend> Activation<B> {
    fn with(function: Function) -> Self {
        let slots = match function {
            Function::Fixed(_) => 0,
            Function::Parametric { .. } => 1,
        };
        Activation {
            id: LayerId::new(),
            ports: Ports::default(),
            function,
            coefficients: Params::new(slots),
        }
    }

    pub fn new(mode: ActivationMode) -> Self {
        Self::with(Function::Fixed(mode))
    }

    pub fn relu() -> Self {
        Self::new(ActivationMode::Relu)
    }

    pub fn leaky_relu(slope: f64) -> Self {
        Self::new(ActivationMode::LeakyRelu { slope })
    }

    pub fn sigmoid() -> Self {
        Self::new(ActivationMode::Sigmoid)
    }

    pub fn tanh() -> Self {
        Self::new(ActivationMode::Tanh)
    }

    /// PReLU with every coefficient starting at `init`.
    pub fn prelu(init: f64) -> Self {
        Self::with(Function::Parametric { init })
    }

    /// The fixed mode, or `None` for PReLU.
    pub fn mode(&self) -> Option<ActivationMode> {
        match self.function {
            Function::Fixed(mode) => Some(mode),
            Function::Parametric { .. } => None,
        }
    }
}

impl<B: Backend> Module<B> for Activation<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, _format: Format) -> Result<Shape> {
        if self.coefficients.is_initialized() {
            let sample = input.with_dim(0, 1);
            let built = self.coefficients.get(0)?.shape();
            if &sample != built {
                return Err(Error::incompatible(
                    input,
                    format!("coefficients were built for samples of {built}"),
                ));
            }
        }
        Ok(input.clone())
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        match self.function {
            Function::Fixed(mode) => {
                B::activation_forward(mode, xv.src()?, yv.dst()?, Blend::OVERWRITE)
            }
            Function::Parametric { .. } => {
                let alpha = self.coefficients.get(0)?;
                B::prelu_forward(xv.src()?, alpha.src()?, yv.dst()?)
            }
        }
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        match self.function {
            Function::Fixed(mode) => {
                if !has_dx {
                    return Ok(());
                }
                let (yv, xv) = ws.pair_mut(y, x)?;
                let (x_src, dx) = xv.split_grad()?;
                B::activation_backward(mode, x_src, yv.src()?, yv.grad_src()?, dx, blend)
            }
            Function::Parametric { .. } => {
                let (yv, xv) = ws.pair_mut(y, x)?;
                let (alpha, dalpha) = self.coefficients.get_mut(0)?.split_grad()?;
                if has_dx {
                    let (x_src, dx) = xv.split_grad()?;
                    B::prelu_backward(x_src, alpha, yv.grad_src()?, Some(dx), dalpha, blend)
                } else {
                    B::prelu_backward(xv.src()?, alpha, yv.grad_src()?, None, dalpha, blend)
                }
            }
        }
    }

    fn init_weights(&mut self, ws: &Workspace<B>, _seed: u64) -> Result<()> {
        let Function::Parametric { init } = self.function else {
            return Ok(());
        };
        let (shape, format, dtype) = input_meta(&self.ports, ws)?;
        self.coefficients
            .create(vec![shape.with_dim(0, 1)], format, dtype, ws.device())?;
        self.coefficients.get_mut(0)?.fill(init)
    }

    fn trainer_slots_needed(&self) -> usize {
        self.coefficients.slots()
    }

    fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        self.coefficients.bind_trainers(trainers)
    }

    fn update(&mut self, counter: usize) -> Result<()> {
        self.coefficients.update(counter)
    }

    fn l1l2_loss(&self) -> (f64, f64) {
        self.coefficients.l1l2_loss()
    }

    fn weights(&self) -> Vec<&Volume<B>> {
        self.coefficients.volumes()
    }

    fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.coefficients.volumes_mut()
    }

    fn release_weights(&mut self) {
        self.coefficients.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Ledger;
    use strata_core::{DType, VolumeId};
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn wire(
        layer: &mut Activation<CpuBackend>,
        values: &[f64],
    ) -> (CpuWorkspace, VolumeId, VolumeId) {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((1, values.len())), Format::ChannelFirst, DType::F64)
            .unwrap();
        ws.get_mut(x).unwrap().write_values(values).unwrap();
        layer.bind(x);
        let y = layer.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        layer.init_weights(&ws, 0).unwrap();
        (ws, x, y)
    }

    #[test]
    fn test_relu_round_trip() {
        let mut relu = Activation::<CpuBackend>::relu();
        let (mut ws, x, y) = wire(&mut relu, &[-1.0, 2.0, -3.0, 4.0]);
        relu.forward(&mut ws).unwrap();
        assert_eq!(ws.get(y).unwrap().values().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
        ws.get_mut(y).unwrap().write_gradient(&[1.0; 4]).unwrap();
        relu.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(
            ws.get(x).unwrap().gradient_values().unwrap(),
            vec![0.0, 1.0, 0.0, 1.0]
        );
        assert_eq!(Module::<CpuBackend>::trainer_slots_needed(&relu), 0);
    }

    #[test]
    fn test_backward_accumulates_when_asked() {
        let mut relu = Activation::<CpuBackend>::relu();
        let (mut ws, x, y) = wire(&mut relu, &[1.0, 1.0]);
        relu.forward(&mut ws).unwrap();
        ws.get_mut(y).unwrap().write_gradient(&[1.0, 1.0]).unwrap();
        relu.backward(&mut ws, Blend::ACCUMULATE).unwrap();
        relu.backward(&mut ws, Blend::ACCUMULATE).unwrap();
        assert_eq!(ws.get(x).unwrap().gradient_values().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_prelu() {
        let mut prelu = Activation::<CpuBackend>::prelu(0.5);
        let (mut ws, x, y) = wire(&mut prelu, &[-2.0, 3.0]);
        assert_eq!(prelu.trainer_slots_needed(), 1);
        assert_eq!(prelu.weights()[0].dims(), &[1, 2]);
        prelu.forward(&mut ws).unwrap();
        assert_eq!(ws.get(y).unwrap().values().unwrap(), vec![-1.0, 3.0]);
        ws.get_mut(y).unwrap().write_gradient(&[1.0, 1.0]).unwrap();
        prelu.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(ws.get(x).unwrap().gradient_values().unwrap(), vec![0.5, 1.0]);
        assert_eq!(
            prelu.weights()[0].gradient_values().unwrap(),
            vec![-2.0, 0.0]
        );
    }

    #[test]
    fn test_prelu_refuses_new_sample_shape() {
        let mut prelu = Activation::<CpuBackend>::prelu(0.25);
        let (_ws, _, _) = wire(&mut prelu, &[1.0, 2.0, 3.0]);
        assert!(prelu
            .infer_output_shape(&Shape::from((4, 3)), Format::ChannelFirst)
            .is_ok());
        assert!(matches!(
            prelu.infer_output_shape(&Shape::from((1, 4)), Format::ChannelFirst),
            Err(Error::IncompatibleShape { .. })
        ));
    }
}
