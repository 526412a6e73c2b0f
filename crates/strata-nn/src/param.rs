// Params — a layer's weight Volumes and the trainers paired with them
//
// Weighted layers keep their learnable tensors here, one entry per trainer
// slot. Entries are created by init_weights; trainers arrive later through
// bind_trainers and are allocated against their weight immediately.

use strata_core::{Backend, DType, Error, Format, Result, Shape, Volume};

use crate::module::check_trainer_count;
use crate::trainer::Trainer;

struct Param<B: Backend> {
    volume: Volume<B>,
    trainer: Option<Box<dyn Trainer<B>>>,
}

/// Weight Volumes with their optional trainers, in a fixed order.
pub(crate) struct Params<B: Backend> {
    slots: usize,
    entries: Vec<Param<B>>,
}

impl<B: Backend> Params<B> {
    /// Holder for `slots` weight tensors.
    pub fn new(slots: usize) -> Self {
        Params {
            slots,
            entries: Vec::with_capacity(slots),
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn is_initialized(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Create every weight at once. Nothing is kept unless all allocations
    /// succeed.
    pub fn create(
        &mut self,
        shapes: Vec<Shape>,
        format: Format,
        dtype: DType,
        device: &B::Device,
    ) -> Result<()> {
        if self.is_initialized() {
            return Err(Error::InvalidState {
                op: "init_weights",
                state: "weights already initialised".into(),
            });
        }
        if shapes.len() != self.slots {
            return Err(Error::invariant(format!(
                "{} weight shapes for {} slots",
                shapes.len(),
                self.slots
            )));
        }
        let mut made = Vec::with_capacity(shapes.len());
        for shape in shapes {
            // on error `made` drops and every Volume releases itself
            made.push(Volume::create(shape, format, dtype, true, device)?);
        }
        self.entries = made
            .into_iter()
            .map(|volume| Param {
                volume,
                trainer: None,
            })
            .collect();
        Ok(())
    }

    pub fn get(&self, i: usize) -> Result<&Volume<B>> {
        self.entries
            .get(i)
            .map(|p| &p.volume)
            .ok_or_else(|| Error::invariant(format!("weight {i} is not initialised")))
    }

    pub fn get_mut(&mut self, i: usize) -> Result<&mut Volume<B>> {
        self.entries
            .get_mut(i)
            .map(|p| &mut p.volume)
            .ok_or_else(|| Error::invariant(format!("weight {i} is not initialised")))
    }

    /// Two distinct weights, the second mutably.
    pub fn pair_mut(&mut self, a: usize, b: usize) -> Result<(&mut Volume<B>, &mut Volume<B>)> {
        if a == b || a.max(b) >= self.entries.len() {
            return Err(Error::invariant(format!("weights {a} and {b} cannot be split")));
        }
        let (lo, hi) = self.entries.split_at_mut(a.max(b));
        let (x, y) = (&mut lo[a.min(b)].volume, &mut hi[0].volume);
        Ok(if a < b { (x, y) } else { (y, x) })
    }

    /// Pair trainers with weights in order and allocate their state.
    /// Nothing is installed unless every trainer allocates.
    pub fn bind_trainers(&mut self, mut trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        check_trainer_count(self.slots, trainers.len())?;
        if !self.is_initialized() {
            return Err(Error::InvalidState {
                op: "bind_trainers",
                state: "weights not initialised".into(),
            });
        }
        for (param, trainer) in self.entries.iter().zip(trainers.iter_mut()) {
            trainer.allocate(&param.volume)?;
        }
        for (param, trainer) in self.entries.iter_mut().zip(trainers) {
            param.trainer = Some(trainer);
        }
        Ok(())
    }

    pub fn update(&mut self, counter: usize) -> Result<()> {
        for (i, param) in self.entries.iter_mut().enumerate() {
            let trainer = param.trainer.as_mut().ok_or_else(|| Error::InvalidState {
                op: "update",
                state: format!("weight {i} has no trainer"),
            })?;
            trainer.step(&mut param.volume, counter)?;
        }
        Ok(())
    }

    pub fn l1l2_loss(&self) -> (f64, f64) {
        self.entries
            .iter()
            .filter_map(|p| p.trainer.as_ref())
            .map(|t| t.l1l2_loss())
            .fold((0.0, 0.0), |(a, b), (l1, l2)| (a + l1, b + l2))
    }

    pub fn volumes(&self) -> Vec<&Volume<B>> {
        self.entries.iter().map(|p| &p.volume).collect()
    }

    pub fn volumes_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.entries.iter_mut().map(|p| &mut p.volume).collect()
    }

    /// Drop every weight and trainer.
    pub fn release(&mut self) {
        self.entries.clear();
    }
}

/// Kaiming-uniform bound for a fan-in.
pub(crate) fn kaiming_bound(fan_in: usize) -> f64 {
    (1.0 / fan_in.max(1) as f64).sqrt()
}

/// Fill `volume` uniformly in `[-bound, bound)`.
pub(crate) fn fill_uniform<B: Backend>(volume: &mut Volume<B>, bound: f64, seed: u64) -> Result<()> {
    B::fill_uniform(volume.value_mut()?, -bound, bound, seed)
}
