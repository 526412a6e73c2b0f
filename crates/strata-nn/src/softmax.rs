// SoftmaxClassifier — softmax output with cross-entropy loss
//
// Forward turns the logits into per-position class probabilities over the
// channel axis. Targets live in the output Volume's gradient buffer: the
// caller writes them there before backward, and backward writes
//
//   dx = y - target
//
// into the input gradient. Forward also reports the mean cross-entropy of
// the current targets over the batch.
//
// Loss observers receive (step, loss) after every sweep that produced a
// loss, for plotting or early stopping.

use std::sync::{Arc, Mutex};

use strata_core::{Backend, Blend, Error, Format, Result, Shape, VolumeId, Workspace};

use crate::module::{io, LayerId, LayerKind, Module, Ports};

const LOG_FLOOR: f64 = 1e-12;

/// Softmax over channels followed by cross-entropy against stored targets.
pub struct SoftmaxClassifier {
    id: LayerId,
    ports: Ports,
    loss: Option<f64>,
}

impl SoftmaxClassifier {
    pub fn new() -> Self {
        SoftmaxClassifier {
            id: LayerId::new(),
            ports: Ports::default(),
            loss: None,
        }
    }

    /// Loss measured by the most recent forward.
    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    /// Store one-hot (or soft) targets in the output's gradient region.
    pub fn set_targets<B: Backend>(&self, ws: &mut Workspace<B>, targets: &[f64]) -> Result<()> {
        let y = self.output()?;
        ws.get_mut(y)?.write_gradient(targets)
    }

    fn output(&self) -> Result<VolumeId> {
        self.ports.output()
    }
}

impl Default for SoftmaxClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn cross_entropy(probabilities: &[f64], targets: &[f64], batch: usize) -> f64 {
    let total: f64 = probabilities
        .iter()
        .zip(targets)
        .filter(|(_, t)| **t != 0.0)
        .map(|(&p, &t)| -t * p.max(LOG_FLOOR).ln())
        .sum();
    total / batch.max(1) as f64
}

impl<B: Backend> Module<B> for SoftmaxClassifier {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::SoftmaxClassifier
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        format.channels(input)?;
        Ok(input.clone())
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        B::softmax_forward(xv.src()?, yv.dst()?)?;
        let batch = yv.shape().dim(0)?;
        self.loss = Some(cross_entropy(
            &yv.values()?,
            &yv.gradient_values()?,
            batch,
        ));
        Ok(())
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        if !has_dx {
            return Err(Error::invariant(format!(
                "{} input has no gradient to receive y - target",
                self.id
            )));
        }
        let (yv, xv) = ws.pair_mut(y, x)?;
        B::op_add(yv.src()?, 1.0, yv.grad_src()?, -1.0, xv.grad_dst()?, blend)
    }

    fn unwire(&mut self) {
        self.ports.output.clear();
        self.loss = None;
    }
}

/// Receives the loss of each sweep.
pub trait LossObserver: Send {
    fn observe(&mut self, step: usize, loss: f64);
}

/// Every observed `(step, loss)` pair, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossHistory {
    points: Vec<(usize, f64)>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that can be given to a network while the caller keeps
    /// reading it.
    pub fn shared() -> Arc<Mutex<LossHistory>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn points(&self) -> &[(usize, f64)] {
        &self.points
    }

    pub fn last(&self) -> Option<f64> {
        self.points.last().map(|&(_, l)| l)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Mean of the last `window` losses.
    pub fn moving_average(&self, window: usize) -> Option<f64> {
        if window == 0 || self.points.is_empty() {
            return None;
        }
        let tail = &self.points[self.points.len().saturating_sub(window)..];
        Some(tail.iter().map(|&(_, l)| l).sum::<f64>() / tail.len() as f64)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl LossObserver for LossHistory {
    fn observe(&mut self, step: usize, loss: f64) {
        self.points.push((step, loss));
    }
}

impl<T: LossObserver> LossObserver for Arc<Mutex<T>> {
    fn observe(&mut self, step: usize, loss: f64) {
        match self.lock() {
            Ok(mut inner) => inner.observe(step, loss),
            Err(poisoned) => poisoned.into_inner().observe(step, loss),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Ledger;
    use strata_core::DType;
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    #[test]
    fn test_forward_loss_and_backward() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((2, 2)), Format::ChannelFirst, DType::F64)
            .unwrap();
        ws.get_mut(x).unwrap().write_values(&[0.0, 0.0, 0.0, 0.0]).unwrap();
        let mut sm = SoftmaxClassifier::new();
        Module::<CpuBackend>::bind(&mut sm, x);
        let y = sm.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        sm.set_targets(&mut ws, &[1.0, 0.0, 0.0, 1.0]).unwrap();
        sm.forward(&mut ws).unwrap();

        assert_eq!(ws.get(y).unwrap().values().unwrap(), vec![0.5; 4]);
        let loss = sm.loss().unwrap();
        assert!((loss - 2f64.ln()).abs() < 1e-12);

        sm.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(
            ws.get(x).unwrap().gradient_values().unwrap(),
            vec![-0.5, 0.5, 0.5, -0.5]
        );
    }

    #[test]
    fn test_cross_entropy_ignores_zero_targets() {
        let l = cross_entropy(&[0.0, 1.0], &[0.0, 1.0], 1);
        assert_eq!(l, 0.0);
    }

    #[test]
    fn test_history() {
        let shared = LossHistory::shared();
        let mut handle = shared.clone();
        handle.observe(1, 2.0);
        handle.observe(2, 1.0);
        let h = shared.lock().unwrap();
        assert_eq!(h.points(), &[(1, 2.0), (2, 1.0)]);
        assert_eq!(h.last(), Some(1.0));
        assert_eq!(h.moving_average(2), Some(1.5));
        assert_eq!(h.moving_average(0), None);
    }
}
