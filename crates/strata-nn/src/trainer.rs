// Trainers — per-weight optimizer state
//
// A trainer is paired with exactly one weight Volume for the life of
// training. Its accumulator state (Adam's first and second moments) is
// created the first time it is bound to that weight and reused by every
// later step.
//
// Weight gradients accumulate across Backward calls (several Backward
// sweeps may feed one Update). Each step consumes the accumulated gradient
// and clears it.
//
// Callers supply trainers in layer order; the network hands each layer as
// many as it asks for.

use strata_core::{AdamParams, Backend, Error, Result, Volume};

/// Adaptive update state for one weight tensor.
pub trait Trainer<B: Backend>: Send {
    /// Create accumulator state shaped like `weight`. Calling it again on an
    /// already allocated trainer is a no-op.
    fn allocate(&mut self, weight: &Volume<B>) -> Result<()>;

    /// Apply one update using the gradient held by `weight`, then clear it.
    /// `counter` is the 1-based update count.
    fn step(&mut self, weight: &mut Volume<B>, counter: usize) -> Result<()>;

    /// (L1, L2) regularisation loss measured at the last step.
    fn l1l2_loss(&self) -> (f64, f64);

    /// Whether `allocate` has run.
    fn is_allocated(&self) -> bool;
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L1 regularisation coefficient.
    pub decay1: f64,
    /// L2 regularisation coefficient.
    pub decay2: f64,
    /// Batch size; gradients are divided by it.
    pub batch: usize,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            decay1: 0.0,
            decay2: 0.0,
            batch: 1,
        }
    }
}

impl AdamConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn beta1(mut self, beta1: f64) -> Self {
        self.beta1 = beta1;
        self
    }

    pub fn beta2(mut self, beta2: f64) -> Self {
        self.beta2 = beta2;
        self
    }

    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set both regularisation coefficients.
    pub fn decay(mut self, decay1: f64, decay2: f64) -> Self {
        self.decay1 = decay1;
        self.decay2 = decay2;
        self
    }

    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    fn params(&self, step: usize) -> AdamParams {
        AdamParams {
            rate: self.rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            decay1: self.decay1,
            decay2: self.decay2,
            batch: self.batch as f64,
            step,
        }
    }
}

struct Moments<B: Backend> {
    first: B::Storage,
    second: B::Storage,
    device: B::Device,
}

/// Bias-corrected Adam with L1/L2 regularisation.
pub struct Adam<B: Backend> {
    config: AdamConfig,
    moments: Option<Moments<B>>,
    loss: (f64, f64),
}

impl<B: Backend> Adam<B> {
    pub fn new(config: AdamConfig) -> Self {
        Adam {
            config,
            moments: None,
            loss: (0.0, 0.0),
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// `count` boxed trainers sharing one configuration, ready to hand to
    /// `Network::bind_trainers`.
    pub fn slots(count: usize, config: AdamConfig) -> Vec<Box<dyn Trainer<B>>> {
        (0..count)
            .map(|_| Box::new(Adam::<B>::new(config)) as Box<dyn Trainer<B>>)
            .collect()
    }
}

impl<B: Backend> Trainer<B> for Adam<B> {
    fn allocate(&mut self, weight: &Volume<B>) -> Result<()> {
        if self.moments.is_some() {
            return Ok(());
        }
        let device = weight.device().clone();
        let first = B::alloc_zeroed(weight.shape(), weight.dtype(), &device)?;
        let second = match B::alloc_zeroed(weight.shape(), weight.dtype(), &device) {
            Ok(s) => s,
            Err(e) => {
                B::release(first, &device);
                return Err(e);
            }
        };
        self.moments = Some(Moments {
            first,
            second,
            device,
        });
        Ok(())
    }

    fn step(&mut self, weight: &mut Volume<B>, counter: usize) -> Result<()> {
        let moments = self
            .moments
            .as_mut()
            .ok_or_else(|| Error::invariant("Adam stepped before allocate"))?;
        let params = self.config.params(counter);
        let (value, gradient) = weight.value_and_gradient_mut()?;
        self.loss = B::adam_step(
            value,
            gradient,
            &mut moments.first,
            &mut moments.second,
            &params,
        )?;
        Ok(())
    }

    fn l1l2_loss(&self) -> (f64, f64) {
        self.loss
    }

    fn is_allocated(&self) -> bool {
        self.moments.is_some()
    }
}

impl<B: Backend> Drop for Adam<B> {
    fn drop(&mut self) {
        if let Some(m) = self.moments.take() {
            B::release(m.first, &m.device);
            B::release(m.second, &m.device);
        }
    }
}
