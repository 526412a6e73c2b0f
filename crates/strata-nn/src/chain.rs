// Chain — layers applied one after another
//
// The output Volume of layer i is the input Volume of layer i+1. Building a
// chain wires each layer in order, allocating outputs only for layers that
// are not wired yet. Backward runs in reverse; only the first layer writes
// the chain's input gradient through the caller's blend, every other
// gradient hand-off is an overwrite.
//
// Trainers are handed out in layer order, each layer taking as many as it
// asks for.

use strata_core::{Backend, Blend, Error, Format, Result, Shape, Volume, VolumeId, Workspace};

use crate::module::{check_trainer_count, Ledger, Module};
use crate::trainer::Trainer;

/// Seed for the layer at `index`, derived from one network seed.
pub(crate) fn layer_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Min, max and mean of a buffer, for trace lines.
pub(crate) fn summarize(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let (min, max, sum) = values.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(lo, hi, s), &v| (lo.min(v), hi.max(v), s + v),
    );
    (min, max, sum / values.len() as f64)
}

/// Log a summary of `layer`'s output values.
pub(crate) fn trace_forward<B: Backend>(
    index: usize,
    layer: &dyn Module<B>,
    ws: &Workspace<B>,
) -> Result<()> {
    let out = ws.get(layer.ports().output()?)?;
    let (min, max, mean) = summarize(&out.values()?);
    log::debug!(
        "forward {index} {} {}: {} min={min:.6} max={max:.6} mean={mean:.6}",
        layer.kind(),
        layer.id(),
        out.shape()
    );
    Ok(())
}

/// Log a summary of the gradient `layer` wrote for its input.
pub(crate) fn trace_backward<B: Backend>(
    index: usize,
    layer: &dyn Module<B>,
    ws: &Workspace<B>,
) -> Result<()> {
    let input = ws.get(layer.ports().input()?)?;
    if !input.has_gradient() {
        return Ok(());
    }
    let (min, max, mean) = summarize(&input.gradient_values()?);
    log::debug!(
        "backward {index} {} {}: {} min={min:.6} max={max:.6} mean={mean:.6}",
        layer.kind(),
        layer.id(),
        input.shape()
    );
    Ok(())
}

/// Bind `layer` to `input` and make sure it has an output of the right shape.
pub(crate) fn wire<B: Backend>(
    layer: &mut dyn Module<B>,
    ws: &mut Workspace<B>,
    input: VolumeId,
    ledger: &mut Ledger,
) -> Result<VolumeId> {
    layer.bind(input);
    let (shape, format) = {
        let v = ws.get(input)?;
        (v.shape().clone(), v.format())
    };
    let expected = layer.infer_output_shape(&shape, format)?;
    if !layer.is_wired() {
        return layer.allocate_outputs(ws, ledger);
    }
    let out = layer.ports().output()?;
    let got = ws.get(out)?.shape();
    if got != &expected {
        return Err(Error::invariant(format!(
            "{} is wired to an output of {got}, expected {expected}",
            layer.id()
        )));
    }
    Ok(out)
}

/// An ordered list of layers.
pub struct Chain<B: Backend> {
    layers: Vec<Box<dyn Module<B>>>,
}

impl<B: Backend> Chain<B> {
    pub fn new() -> Self {
        Chain { layers: Vec::new() }
    }

    /// Append a layer. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module<B> + 'static>(mut self, module: M) -> Self {
        self.layers.push(Box::new(module));
        self
    }

    pub fn push(&mut self, module: Box<dyn Module<B>>) {
        self.layers.push(module);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Module<B>>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Module<B>>] {
        &mut self.layers
    }

    /// Output extents after every layer, without touching any Volume.
    pub fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        self.layers
            .iter()
            .try_fold(input.clone(), |shape, layer| {
                layer.infer_output_shape(&shape, format)
            })
    }

    /// Wire every layer starting from `input`; returns the last output, or
    /// `input` itself for an empty chain.
    pub fn build(
        &mut self,
        ws: &mut Workspace<B>,
        input: VolumeId,
        ledger: &mut Ledger,
    ) -> Result<VolumeId> {
        let mut current = input;
        for layer in &mut self.layers {
            current = wire(layer.as_mut(), ws, current, ledger)?;
        }
        Ok(current)
    }

    /// Output of the last layer, if wired.
    pub fn output(&self) -> Option<VolumeId> {
        self.layers.last().and_then(|l| l.ports().output.get())
    }

    pub fn forward(&mut self, ws: &mut Workspace<B>, trace: bool) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.forward(ws)?;
            if trace {
                trace_forward(i, &**layer, ws)?;
            }
        }
        Ok(())
    }

    /// Reverse sweep. The first layer writes the chain input's gradient
    /// through `input_blend`.
    pub fn backward(
        &mut self,
        ws: &mut Workspace<B>,
        input_blend: Blend,
        trace: bool,
    ) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            let blend = if i == 0 { input_blend } else { Blend::OVERWRITE };
            layer.backward(ws, blend)?;
            if trace {
                trace_backward(i, &**layer, ws)?;
            }
        }
        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    pub fn set_trace(&mut self, forward: bool, backward: bool) {
        for layer in &mut self.layers {
            layer.set_trace(forward, backward);
        }
    }

    pub fn set_concat_trace(&mut self, on: bool) {
        for layer in &mut self.layers {
            layer.set_concat_trace(on);
        }
    }

    /// Create every layer's weights. On failure the weights this call
    /// created are released again.
    pub fn init_weights(&mut self, ws: &Workspace<B>, seed: u64) -> Result<()> {
        for i in 0..self.layers.len() {
            if let Err(e) = self.layers[i].init_weights(ws, layer_seed(seed, i)) {
                for layer in &mut self.layers[..i] {
                    layer.release_weights();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn trainer_slots_needed(&self) -> usize {
        self.layers.iter().map(|l| l.trainer_slots_needed()).sum()
    }

    pub fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        check_trainer_count(self.trainer_slots_needed(), trainers.len())?;
        let mut rest = trainers.into_iter();
        for layer in &mut self.layers {
            let n = layer.trainer_slots_needed();
            layer.bind_trainers(rest.by_ref().take(n).collect())?;
        }
        Ok(())
    }

    pub fn update(&mut self, counter: usize) -> Result<()> {
        for layer in &mut self.layers {
            layer.update(counter)?;
        }
        Ok(())
    }

    pub fn l1l2_loss(&self) -> (f64, f64) {
        self.layers
            .iter()
            .map(|l| l.l1l2_loss())
            .fold((0.0, 0.0), |(a, b), (l1, l2)| (a + l1, b + l2))
    }

    pub fn weights(&self) -> Vec<&Volume<B>> {
        self.layers.iter().flat_map(|l| l.weights()).collect()
    }

    pub fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.layers.iter_mut().flat_map(|l| l.weights_mut()).collect()
    }

    pub fn release_weights(&mut self) {
        for layer in &mut self.layers {
            layer.release_weights();
        }
    }

    /// Forget every layer's output wiring.
    pub fn unwire(&mut self) {
        for layer in &mut self.layers {
            layer.unwire();
        }
    }

    /// Forget the output wiring of layers whose output is one of `created`.
    pub fn unwire_created(&mut self, created: &[VolumeId]) {
        for layer in &mut self.layers {
            layer.unwire_created(created);
        }
    }
}

impl<B: Backend> Default for Chain<B> {
    fn default() -> Self {
        Self::new()
    }
}
