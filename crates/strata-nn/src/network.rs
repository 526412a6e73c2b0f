// Network — the orchestrator that wires and drives a layer sequence
//
// A network owns an ordered Chain of layers, an optional terminal Output
// stage and an optional SoftmaxClassifier. Every Volume it allocates while
// wiring is recorded, so build failures and teardown release exactly those.
//
// STATE MACHINE:
//
//   Unbuilt ──build──▶ Wired ──init_weights──▶ Ready ──forward──▶ Training
//                                                │                  ▲  │
//                                                └──inference──▶ Inference
//
// rebuild() goes back to Wired (or Ready, when weights exist) with a fresh
// input; teardown() returns to Unbuilt and releases everything.
//
// SWEEP ORDER:
//
//   forward   chain → output stage → classifier
//   backward  classifier → output stage → chain (reverse)
//   update    output stage → chain
//
// Only the first layer writes the network input's gradient, through the
// blend given to the sweep. backward() overwrites it; backward_shared_input()
// zeroes it once and lets several networks accumulate into it.

use std::fmt;

use strata_core::{Backend, Blend, Error, Result, Slot, VolumeId, Workspace};

use crate::chain::{layer_seed, trace_backward, trace_forward, wire, Chain};
use crate::config::NetworkConfig;
use crate::module::{check_trainer_count, Ledger, Module};
use crate::record::{LayerRecord, TensorRecord};
use crate::softmax::{LossObserver, SoftmaxClassifier};
use crate::trainer::Trainer;

/// Where a network is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    Unbuilt,
    Wired,
    Ready,
    Training,
    Inference,
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkState::Unbuilt => "unbuilt",
            NetworkState::Wired => "wired",
            NetworkState::Ready => "ready",
            NetworkState::Training => "training",
            NetworkState::Inference => "inference",
        };
        f.write_str(name)
    }
}

/// An ordered sequence of layers wired over one Workspace.
pub struct Network<B: Backend> {
    config: NetworkConfig,
    state: NetworkState,
    chain: Chain<B>,
    output_stage: Option<Box<dyn Module<B>>>,
    classifier: Option<SoftmaxClassifier>,
    input: Slot,
    owned: Vec<VolumeId>,
    weights_ready: bool,
    trainers_bound: bool,
    updates: usize,
    steps: usize,
    observers: Vec<Box<dyn LossObserver>>,
}

impl<B: Backend> Network<B> {
    pub fn new(config: NetworkConfig) -> Self {
        Network {
            config,
            state: NetworkState::Unbuilt,
            chain: Chain::new(),
            output_stage: None,
            classifier: None,
            input: Slot::empty(),
            owned: Vec::new(),
            weights_ready: false,
            trainers_bound: false,
            updates: 0,
            steps: 0,
            observers: Vec::new(),
        }
    }

    /// A network over an existing chain.
    pub fn from_chain(config: NetworkConfig, chain: Chain<B>) -> Self {
        let mut net = Self::new(config);
        net.chain = chain;
        net
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Number of layers in the chain, not counting the terminal stages.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty() && self.output_stage.is_none() && self.classifier.is_none()
    }

    pub fn layers(&self) -> &[Box<dyn Module<B>>] {
        self.chain.layers()
    }

    pub fn output_stage(&self) -> Option<&dyn Module<B>> {
        self.output_stage.as_deref()
    }

    pub fn classifier(&self) -> Option<&SoftmaxClassifier> {
        self.classifier.as_ref()
    }

    /// Number of completed update steps.
    pub fn update_count(&self) -> usize {
        self.updates
    }

    /// Volumes this network allocated while wiring.
    pub fn owned_volumes(&self) -> &[VolumeId] {
        &self.owned
    }

    fn require(&self, op: &'static str, allowed: &[NetworkState]) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidState {
                op,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn require_weights(&self, op: &'static str) -> Result<()> {
        self.require(
            op,
            &[
                NetworkState::Ready,
                NetworkState::Training,
                NetworkState::Inference,
            ],
        )
    }

    /// Append a layer. Only allowed before the first build.
    pub fn push<M: Module<B> + 'static>(&mut self, module: M) -> Result<()> {
        self.require("push", &[NetworkState::Unbuilt])?;
        self.chain.push(Box::new(module));
        Ok(())
    }

    /// Set the terminal Output stage, wired after the chain.
    pub fn set_output<M: Module<B> + 'static>(&mut self, module: M) -> Result<()> {
        self.require("set_output", &[NetworkState::Unbuilt])?;
        self.output_stage = Some(Box::new(module));
        Ok(())
    }

    /// End the network in a softmax classifier with cross-entropy loss.
    pub fn set_softmax_classifier(&mut self) -> Result<()> {
        self.require("set_softmax_classifier", &[NetworkState::Unbuilt])?;
        self.classifier = Some(SoftmaxClassifier::new());
        Ok(())
    }

    pub fn add_observer<O: LossObserver + 'static>(&mut self, observer: O) {
        self.observers.push(Box::new(observer));
    }

    /// The network input, once built.
    pub fn input(&self) -> Result<VolumeId> {
        self.input.require("network input")
    }

    /// The final Volume: classifier output, else output stage, else the
    /// last chain layer.
    pub fn output(&self) -> Result<VolumeId> {
        if let Some(c) = &self.classifier {
            return Module::<B>::ports(c).output();
        }
        if let Some(o) = &self.output_stage {
            return o.ports().output();
        }
        match self.chain.output() {
            Some(id) => Ok(id),
            None => self.input(),
        }
    }

    fn wire_all(
        &mut self,
        ws: &mut Workspace<B>,
        input: VolumeId,
        ledger: &mut Ledger,
    ) -> Result<VolumeId> {
        let mut current = self.chain.build(ws, input, ledger)?;
        if let Some(stage) = self.output_stage.as_mut() {
            current = wire(stage.as_mut(), ws, current, ledger)?;
        }
        if let Some(c) = self.classifier.as_mut() {
            current = wire::<B>(c, ws, current, ledger)?;
        }
        Ok(current)
    }

    /// Forget the wiring of every layer whose output is one of `created`.
    /// Outputs bound by the caller stay in place for the next build.
    fn unwire_created(&mut self, created: &[VolumeId]) {
        self.chain.unwire_created(created);
        if let Some(stage) = self.output_stage.as_mut() {
            stage.unwire_created(created);
        }
        if let Some(c) = self.classifier.as_mut() {
            Module::<B>::unwire_created(c, created);
        }
    }

    fn set_training(&mut self, training: bool) {
        self.chain.set_training(training);
        if let Some(stage) = self.output_stage.as_mut() {
            stage.set_training(training);
        }
    }

    /// Wire every layer front to back starting at `input` and return the
    /// final output Volume.
    ///
    /// Layers that already have an output bound keep it, provided its shape
    /// is the one shape inference expects. On failure every Volume this
    /// attempt allocated is released and the network stays unbuilt.
    pub fn build(&mut self, ws: &mut Workspace<B>, input: VolumeId) -> Result<VolumeId> {
        self.require("build", &[NetworkState::Unbuilt])?;
        ws.get(input)?;
        let NetworkConfig {
            forward_trace,
            backward_trace,
            concat_trace,
            ..
        } = self.config;
        self.chain.set_trace(forward_trace, backward_trace);
        self.chain.set_concat_trace(concat_trace);
        if let Some(stage) = self.output_stage.as_mut() {
            stage.set_trace(forward_trace, backward_trace);
            stage.set_concat_trace(concat_trace);
        }
        let mut ledger = Ledger::new();
        match self.wire_all(ws, input, &mut ledger) {
            Ok(y) => {
                log::debug!(
                    "network wired {} layers over {input}, {} volumes allocated",
                    self.chain.len(),
                    ledger.len()
                );
                ledger.append_to(&mut self.owned);
                if y != input {
                    ws.mark_output(y)?;
                }
                self.input.bind(input);
                self.state = if self.weights_ready {
                    NetworkState::Ready
                } else {
                    NetworkState::Wired
                };
                Ok(y)
            }
            Err(e) => {
                log::debug!("build failed, releasing {} volumes: {e}", ledger.len());
                self.unwire_created(ledger.ids());
                ledger.release_all(ws);
                Err(e)
            }
        }
    }

    /// Release every wired Volume and wire again from `input`. Weights and
    /// trainers survive, so the new input must be compatible with them.
    pub fn rebuild(&mut self, ws: &mut Workspace<B>, input: VolumeId) -> Result<VolumeId> {
        self.unwire_owned();
        self.release_owned(ws);
        self.input.clear();
        self.state = NetworkState::Unbuilt;
        self.build(ws, input)
    }

    fn unwire_owned(&mut self) {
        let owned = std::mem::take(&mut self.owned);
        self.unwire_created(&owned);
        self.owned = owned;
    }

    fn release_owned(&mut self, ws: &mut Workspace<B>) {
        for id in self.owned.drain(..).rev() {
            ws.release(id);
        }
    }

    /// Create every layer's weights now that shapes are known.
    pub fn init_weights(&mut self, ws: &Workspace<B>) -> Result<()> {
        self.require("init_weights", &[NetworkState::Wired])?;
        let seed = self.config.seed;
        self.chain.init_weights(ws, seed)?;
        if let Some(stage) = self.output_stage.as_mut() {
            if let Err(e) = stage.init_weights(ws, layer_seed(seed, self.chain.len())) {
                self.chain.release_weights();
                return Err(e);
            }
        }
        self.weights_ready = true;
        self.state = NetworkState::Ready;
        Ok(())
    }

    /// Total trainers the caller must supply, in layer order.
    pub fn trainer_slots_needed(&self) -> usize {
        self.chain.trainer_slots_needed()
            + self
                .output_stage
                .as_ref()
                .map_or(0, |s| s.trainer_slots_needed())
    }

    /// Hand each layer its trainers in order. The count must match
    /// [`trainer_slots_needed`](Self::trainer_slots_needed) exactly.
    pub fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        self.require_weights("bind_trainers")?;
        check_trainer_count(self.trainer_slots_needed(), trainers.len())?;
        let mut rest = trainers;
        let tail = rest.split_off(self.chain.trainer_slots_needed());
        self.chain.bind_trainers(rest)?;
        if let Some(stage) = self.output_stage.as_mut() {
            stage.bind_trainers(tail)?;
        }
        self.trainers_bound = true;
        Ok(())
    }

    fn sweep_forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let trace = self.config.forward_trace;
        self.chain.forward(ws, trace)?;
        if let Some(stage) = self.output_stage.as_mut() {
            stage.forward(ws)?;
            if trace {
                trace_forward(self.chain.len(), &**stage, ws)?;
            }
        }
        if let Some(c) = self.classifier.as_mut() {
            Module::<B>::forward(c, ws)?;
        }
        Ok(())
    }

    /// Training forward sweep. Reports the classifier loss to every observer.
    pub fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        self.require_weights("forward")?;
        if self.state != NetworkState::Training {
            self.set_training(true);
            self.state = NetworkState::Training;
        }
        self.sweep_forward(ws)?;
        if let Some(loss) = self.loss() {
            self.steps += 1;
            for observer in &mut self.observers {
                observer.observe(self.steps, loss);
            }
        }
        Ok(())
    }

    /// Forward sweep with dropout off and normalization on running
    /// statistics.
    pub fn inference(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        self.require_weights("inference")?;
        if self.state != NetworkState::Inference {
            self.set_training(false);
            self.state = NetworkState::Inference;
        }
        self.sweep_forward(ws)
    }

    /// Backward sweep; overwrites the network input's gradient.
    pub fn backward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        self.backward_with(ws, Blend::OVERWRITE)
    }

    fn backward_with(&mut self, ws: &mut Workspace<B>, input_blend: Blend) -> Result<()> {
        self.require("backward", &[NetworkState::Training])?;
        let trace = self.config.backward_trace;
        let chain_empty = self.chain.is_empty();
        let stage_first = chain_empty;
        let classifier_first = chain_empty && self.output_stage.is_none();
        if let Some(c) = self.classifier.as_mut() {
            let blend = if classifier_first {
                input_blend
            } else {
                Blend::OVERWRITE
            };
            Module::<B>::backward(c, ws, blend)?;
        }
        if let Some(stage) = self.output_stage.as_mut() {
            let blend = if stage_first {
                input_blend
            } else {
                Blend::OVERWRITE
            };
            stage.backward(ws, blend)?;
            if trace {
                trace_backward(self.chain.len(), &**stage, ws)?;
            }
        }
        self.chain.backward(ws, input_blend, trace)
    }

    /// Step every trainer against its weight.
    pub fn update(&mut self) -> Result<()> {
        self.require("update", &[NetworkState::Training])?;
        if !self.trainers_bound && self.trainer_slots_needed() > 0 {
            return Err(Error::InvalidState {
                op: "update",
                state: "no trainers bound".into(),
            });
        }
        let counter = self.updates + 1;
        if let Some(stage) = self.output_stage.as_mut() {
            stage.update(counter)?;
        }
        self.chain.update(counter)?;
        self.updates = counter;
        Ok(())
    }

    /// Cross-entropy measured by the last forward, if there is a classifier.
    pub fn loss(&self) -> Option<f64> {
        self.classifier.as_ref().and_then(|c| c.loss())
    }

    /// Load targets for the classifier.
    pub fn set_targets(&self, ws: &mut Workspace<B>, targets: &[f64]) -> Result<()> {
        match &self.classifier {
            Some(c) => c.set_targets(ws, targets),
            None => Err(Error::InvalidState {
                op: "set_targets",
                state: "no classifier".into(),
            }),
        }
    }

    /// Summed (L1, L2) regularisation loss over every trainer.
    pub fn l1l2_loss(&self) -> (f64, f64) {
        let (a1, a2) = self.chain.l1l2_loss();
        let (b1, b2) = self
            .output_stage
            .as_ref()
            .map_or((0.0, 0.0), |s| s.l1l2_loss());
        (a1 + b1, a2 + b2)
    }

    fn weighted(&self) -> impl Iterator<Item = (usize, &dyn Module<B>)> + '_ {
        self.chain
            .layers()
            .iter()
            .map(|l| &**l)
            .chain(self.output_stage.as_deref())
            .enumerate()
            .filter(|(_, l)| l.has_weights())
    }

    /// Host copies of every weight, one record per weight-bearing layer in
    /// layer order.
    pub fn weight_records(&self) -> Result<Vec<LayerRecord>> {
        self.weighted()
            .map(|(index, layer)| {
                Ok(LayerRecord {
                    index,
                    kind: layer.kind(),
                    tensors: layer
                        .weights()
                        .into_iter()
                        .map(TensorRecord::of)
                        .collect::<Result<Vec<_>>>()?,
                })
            })
            .collect()
    }

    /// Write saved records back into the weights. Records must line up with
    /// the weight-bearing layers one for one.
    ///
    /// Every record is checked before any weight is written, so a rejected
    /// load leaves the network's weights as they were.
    pub fn load_weight_records(&mut self, records: &[LayerRecord]) -> Result<()> {
        self.require_weights("load_weight_records")?;
        let expected = self.weighted().count();
        if expected != records.len() {
            return Err(Error::invalid(
                "records",
                format!(
                    "{} records for {expected} weight-bearing layers",
                    records.len()
                ),
            ));
        }
        for (record, (index, layer)) in records.iter().zip(self.weighted()) {
            if record.index != index || record.kind != layer.kind() {
                return Err(Error::invalid(
                    "records",
                    format!(
                        "record for {} #{} does not match {} #{index}",
                        record.kind,
                        record.index,
                        layer.kind()
                    ),
                ));
            }
            let weights = layer.weights();
            if weights.len() != record.tensors.len() {
                return Err(Error::invalid(
                    "records",
                    format!(
                        "{} #{index} has {} weights, record has {}",
                        record.kind,
                        weights.len(),
                        record.tensors.len()
                    ),
                ));
            }
            for (tensor, weight) in record.tensors.iter().zip(weights) {
                tensor.check(weight)?;
            }
        }

        let stage_index = self.chain.len();
        for record in records {
            let layer: &mut (dyn Module<B> + 'static) = if record.index == stage_index {
                match self.output_stage.as_deref_mut() {
                    Some(stage) => stage,
                    None => return Err(Error::invariant("output stage vanished")),
                }
            } else {
                self.chain.layers_mut()[record.index].as_mut()
            };
            for (tensor, weight) in record.tensors.iter().zip(layer.weights_mut()) {
                tensor.load_into(weight)?;
            }
        }
        Ok(())
    }

    /// Release every Volume and weight this network created and go back to
    /// Unbuilt. The layer list is kept.
    pub fn teardown(&mut self, ws: &mut Workspace<B>) {
        self.unwire_owned();
        self.release_owned(ws);
        self.chain.release_weights();
        if let Some(stage) = self.output_stage.as_mut() {
            stage.release_weights();
        }
        self.input.clear();
        self.weights_ready = false;
        self.trainers_bound = false;
        self.updates = 0;
        self.state = NetworkState::Unbuilt;
        log::debug!("network torn down");
    }
}

impl<B: Backend> Default for Network<B> {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

/// Backward for several networks that read one shared input.
///
/// The shared input's gradient is zeroed once, then every network
/// accumulates its contribution into it.
pub fn backward_shared_input<B: Backend>(
    networks: &mut [&mut Network<B>],
    ws: &mut Workspace<B>,
) -> Result<()> {
    let Some(first) = networks.first() else {
        return Ok(());
    };
    let shared = first.input()?;
    for net in networks.iter() {
        let input = net.input()?;
        if input != shared {
            return Err(Error::invariant(format!(
                "networks read different inputs: {shared} and {input}"
            )));
        }
    }
    ws.get_mut(shared)?.clear_gradient()?;
    for net in networks.iter_mut() {
        net.backward_with(ws, Blend::ACCUMULATE)?;
    }
    Ok(())
}
