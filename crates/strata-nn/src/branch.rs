// Branch — split channels, run parallel chains, concat the results
//
//              ┌─ chain 0 ─┐
//   x ─ Split ─┼─ chain 1 ─┼─ Concat ─ y
//              └─ chain 2 ─┘
//
// Each chain sees its share of x's channels. The chains' outputs must agree
// on every non-channel extent; their channel counts add up to y's.
//
// A branch asks for the trainers of all its chains, in chain order, and
// hands each chain its own contiguous run of them.

use strata_core::{Backend, Blend, Format, Result, Shape, Volume, VolumeId, Workspace};

use crate::chain::{layer_seed, Chain};
use crate::concat::{Concat, Split};
use crate::module::{check_trainer_count, LayerId, LayerKind, Ledger, Module, Ports};
use crate::trainer::Trainer;

/// Parallel chains over channel partitions of one input.
pub struct Branch<B: Backend> {
    id: LayerId,
    ports: Ports,
    split: Split,
    chains: Vec<Chain<B>>,
    concat: Concat,
    forward_trace: bool,
    backward_trace: bool,
}

impl<B: Backend> Branch<B> {
    /// One chain per partition. Fails for an empty list.
    pub fn new(chains: Vec<Chain<B>>) -> Result<Self> {
        Ok(Branch {
            id: LayerId::new(),
            ports: Ports::default(),
            split: Split::new(chains.len())?,
            chains,
            concat: Concat::new(),
            forward_trace: false,
            backward_trace: false,
        })
    }

    pub fn chains(&self) -> &[Chain<B>] {
        &self.chains
    }

    pub fn split(&self) -> &Split {
        &self.split
    }

    pub fn concat(&self) -> &Concat {
        &self.concat
    }

    fn wire_inner(&mut self, ws: &mut Workspace<B>, ledger: &mut Ledger) -> Result<VolumeId> {
        self.split.bind(self.ports.input()?);
        let parts = self.split.allocate_outputs(ws, ledger)?;
        let mut ends = Vec::with_capacity(parts.len());
        for (chain, part) in self.chains.iter_mut().zip(parts) {
            ends.push(chain.build(ws, part, ledger)?);
        }
        self.concat.bind_sources(ends);
        let y = self.concat.allocate_output(ws, ledger)?;
        self.ports.output.bind(y);
        Ok(y)
    }
}

impl<B: Backend> Module<B> for Branch<B> {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Branch
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape> {
        let parts = self.split.output_shapes(input, format)?;
        let ends = self
            .chains
            .iter()
            .zip(&parts)
            .map(|(chain, part)| chain.infer_output_shape(part, format))
            .collect::<Result<Vec<_>>>()?;
        Concat::output_shape(&ends, format)
    }

    fn allocate_outputs(&mut self, ws: &mut Workspace<B>, ledger: &mut Ledger) -> Result<VolumeId> {
        match self.wire_inner(ws, ledger) {
            Ok(y) => Ok(y),
            Err(e) => {
                Module::<B>::unwire_created(self, ledger.ids());
                Err(e)
            }
        }
    }

    fn unwire(&mut self) {
        self.ports.output.clear();
        self.split.unwire();
        for chain in &mut self.chains {
            chain.unwire();
        }
        self.concat.unwire();
    }

    fn unwire_created(&mut self, created: &[VolumeId]) {
        let own = self
            .ports
            .output
            .get()
            .map_or(true, |id| created.contains(&id));
        if own {
            self.ports.output.clear();
            self.split.unwire();
            self.concat.unwire();
        }
        for chain in &mut self.chains {
            chain.unwire_created(created);
        }
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        self.split.forward(ws)?;
        for chain in &mut self.chains {
            chain.forward(ws, self.forward_trace)?;
        }
        self.concat.forward(ws)
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        self.concat.backward(ws, Blend::OVERWRITE)?;
        for chain in &mut self.chains {
            chain.backward(ws, Blend::OVERWRITE, self.backward_trace)?;
        }
        self.split.backward(ws, blend)
    }

    fn set_training(&mut self, training: bool) {
        for chain in &mut self.chains {
            chain.set_training(training);
        }
    }

    fn set_trace(&mut self, forward: bool, backward: bool) {
        self.forward_trace = forward;
        self.backward_trace = backward;
        for chain in &mut self.chains {
            chain.set_trace(forward, backward);
        }
    }

    fn set_concat_trace(&mut self, on: bool) {
        self.split.set_trace(on);
        self.concat.set_trace(on);
        for chain in &mut self.chains {
            chain.set_concat_trace(on);
        }
    }

    fn init_weights(&mut self, ws: &Workspace<B>, seed: u64) -> Result<()> {
        for i in 0..self.chains.len() {
            if let Err(e) = self.chains[i].init_weights(ws, layer_seed(seed, i)) {
                for chain in &mut self.chains[..i] {
                    chain.release_weights();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn trainer_slots_needed(&self) -> usize {
        self.chains.iter().map(|c| c.trainer_slots_needed()).sum()
    }

    fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        check_trainer_count(Module::<B>::trainer_slots_needed(self), trainers.len())?;
        let mut rest = trainers.into_iter();
        for chain in &mut self.chains {
            let n = chain.trainer_slots_needed();
            chain.bind_trainers(rest.by_ref().take(n).collect())?;
        }
        Ok(())
    }

    fn update(&mut self, counter: usize) -> Result<()> {
        for chain in &mut self.chains {
            chain.update(counter)?;
        }
        Ok(())
    }

    fn l1l2_loss(&self) -> (f64, f64) {
        self.chains
            .iter()
            .map(|c| c.l1l2_loss())
            .fold((0.0, 0.0), |(a, b), (l1, l2)| (a + l1, b + l2))
    }

    fn weights(&self) -> Vec<&Volume<B>> {
        self.chains.iter().flat_map(|c| c.weights()).collect()
    }

    fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        self.chains.iter_mut().flat_map(|c| c.weights_mut()).collect()
    }

    fn release_weights(&mut self) {
        for chain in &mut self.chains {
            chain.release_weights();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;
    use crate::conv::{ConvConfig, Convolution};
    use crate::trainer::{Adam, AdamConfig};
    use strata_core::DType;
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn branch() -> Branch<CpuBackend> {
        Branch::new(vec![
            Chain::new().add(Convolution::new(ConvConfig::new(2, &[1, 1])).unwrap()),
            Chain::new().add(Activation::relu()),
            Chain::new()
                .add(Convolution::new(ConvConfig::new(3, &[1, 1])).unwrap())
                .add(Convolution::new(ConvConfig::new(1, &[1, 1])).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn test_rejects_no_chains() {
        assert!(Branch::<CpuBackend>::new(Vec::new()).is_err());
    }

    #[test]
    fn test_output_shape_sums_chain_channels() {
        let b = branch();
        let shape = b
            .infer_output_shape(&Shape::from((2, 10, 3, 3)), Format::ChannelFirst)
            .unwrap();
        // shares 3, 3, 4 become 2, 3, 1 channels
        assert_eq!(shape.dims(), &[2, 6, 3, 3]);
    }

    #[test]
    fn test_trainer_slots_sum_over_chains() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((2, 10, 3, 3)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mut b = branch();
        b.bind(x);
        let mut ledger = Ledger::new();
        let y = b.allocate_outputs(&mut ws, &mut ledger).unwrap();
        assert_eq!(ws.get(y).unwrap().dims(), &[2, 6, 3, 3]);
        // 3 split parts, 4 layer outputs, 1 concat output
        assert_eq!(ledger.len(), 8);

        b.init_weights(&ws, 3).unwrap();
        assert_eq!(b.trainer_slots_needed(), 6);
        assert_eq!(b.weights().len(), 6);
        assert!(matches!(
            b.bind_trainers(Adam::slots(5, AdamConfig::default())),
            Err(strata_core::Error::TrainerCountMismatch {
                expected: 6,
                got: 5
            })
        ));
        b.bind_trainers(Adam::slots(6, AdamConfig::default()))
            .unwrap();

        b.forward(&mut ws).unwrap();
        ws.get_mut(y).unwrap().write_gradient(&[1.0; 108]).unwrap();
        b.backward(&mut ws, Blend::OVERWRITE).unwrap();
        b.update(1).unwrap();
    }

    #[test]
    fn test_identity_chains_pass_values_and_gradients() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((1, 5, 1, 1)), Format::ChannelFirst, DType::F64)
            .unwrap();
        ws.get_mut(x)
            .unwrap()
            .write_values(&[1.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap();
        let mut b = Branch::<CpuBackend>::new(vec![Chain::new(), Chain::new()]).unwrap();
        b.bind(x);
        let y = b.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        b.forward(&mut ws).unwrap();
        assert_eq!(
            ws.get(y).unwrap().values().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        );
        ws.get_mut(y)
            .unwrap()
            .write_gradient(&[0.5, 1.0, 1.5, 2.0, 2.5])
            .unwrap();
        b.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(
            ws.get(x).unwrap().gradient_values().unwrap(),
            vec![0.5, 1.0, 1.5, 2.0, 2.5]
        );
    }

    #[test]
    fn test_failed_wiring_leaves_nothing_bound() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        // two channels cannot feed three chains
        let x = ws
            .create(Shape::from((1, 2, 2, 2)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mut b = branch();
        b.bind(x);
        let mut ledger = Ledger::new();
        assert!(b.allocate_outputs(&mut ws, &mut ledger).is_err());
        assert!(!b.is_wired());
        assert!(!b.split().is_wired());
        ledger.release_all(&mut ws);
        assert_eq!(ws.live_count(), 1);
    }

    #[test]
    fn test_failed_wiring_keeps_caller_outputs() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((1, 3, 4, 4)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mine = ws
            .create(Shape::from((1, 1, 4, 4)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let strided = ConvConfig::new(1, &[1, 1]).stride(&[2, 2]);
        let mut b = Branch::<CpuBackend>::new(vec![
            Chain::new().add(Activation::relu()),
            Chain::new().add(Activation::relu()),
            Chain::new().add(Convolution::new(strided).unwrap()),
        ])
        .unwrap();
        b.chains[0].layers_mut()[0].ports_mut().output.bind(mine);
        b.bind(x);
        let mut ledger = Ledger::new();
        assert!(b.allocate_outputs(&mut ws, &mut ledger).is_err());
        assert_eq!(b.chains[0].layers()[0].ports().output.get(), Some(mine));
        assert!(!b.chains[1].layers()[0].is_wired());
        ledger.release_all(&mut ws);
        assert_eq!(ws.live_count(), 2);
    }

    #[test]
    fn test_trace_flags_reach_chains() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((2, 10, 3, 3)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mut b = branch();
        Module::<CpuBackend>::set_trace(&mut b, true, false);
        assert!(b.forward_trace);
        assert!(!b.backward_trace);

        b.bind(x);
        let y = b.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        b.init_weights(&ws, 5).unwrap();
        b.forward(&mut ws).unwrap();
        ws.get_mut(y).unwrap().write_gradient(&[1.0; 108]).unwrap();
        b.backward(&mut ws, Blend::OVERWRITE).unwrap();
    }
}
