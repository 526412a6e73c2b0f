// Module trait — The contract every layer honours
//
// A layer does not own the Volumes that flow through it. It holds two
// Slots (input and output) that point into a Workspace, and it may own
// weight Volumes of its own. Adjacent layers share one Volume: the output
// slot of layer i and the input slot of layer i+1 name the same id.
//
// LIFECYCLE (driven by the Network):
//
//   bind(input)                 record where the input lives
//   allocate_outputs(ws, ..)    infer the output shape, create the output
//   init_weights(ws, seed)      create weights now that shapes are known
//   bind_trainers(trainers)     pair each weight with its optimizer state
//   forward / backward / update repeated per training step
//
// allocate_outputs records every Volume it creates in a Ledger so that a
// failed build can release exactly what that attempt allocated and nothing
// else.
//
// BLEND ON THE INPUT GRADIENT:
//
// backward() writes the input gradient through the Blend it is given.
// Normally that is an overwrite. When several networks read one shared
// input, the caller zeroes the shared gradient once and every network
// accumulates into it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use strata_core::{
    Backend, Blend, DType, Error, Format, Result, Shape, Slot, Volume, VolumeId, Workspace,
};

use crate::trainer::Trainer;

static LAYER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stable identity of one layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    pub fn new() -> Self {
        LayerId(LAYER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for LayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer#{}", self.0)
    }
}

/// Which variant a layer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Convolution,
    TransposedConvolution,
    Activation,
    Pooling,
    Dropout,
    Normalization,
    Reshape,
    SoftmaxClassifier,
    Concat,
    Split,
    Branch,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Convolution => "convolution",
            LayerKind::TransposedConvolution => "transposed-convolution",
            LayerKind::Activation => "activation",
            LayerKind::Pooling => "pooling",
            LayerKind::Dropout => "dropout",
            LayerKind::Normalization => "normalization",
            LayerKind::Reshape => "reshape",
            LayerKind::SoftmaxClassifier => "softmax-classifier",
            LayerKind::Concat => "concat",
            LayerKind::Split => "split",
            LayerKind::Branch => "branch",
        };
        f.write_str(name)
    }
}

impl FromStr for LayerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "convolution" => LayerKind::Convolution,
            "transposed-convolution" => LayerKind::TransposedConvolution,
            "activation" => LayerKind::Activation,
            "pooling" => LayerKind::Pooling,
            "dropout" => LayerKind::Dropout,
            "normalization" => LayerKind::Normalization,
            "reshape" => LayerKind::Reshape,
            "softmax-classifier" => LayerKind::SoftmaxClassifier,
            "concat" => LayerKind::Concat,
            "split" => LayerKind::Split,
            "branch" => LayerKind::Branch,
            other => return Err(Error::msg(format!("unknown layer kind `{other}`"))),
        })
    }
}

/// A layer's input and output ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ports {
    pub input: Slot,
    pub output: Slot,
}

impl Ports {
    pub fn input(&self) -> Result<VolumeId> {
        self.input.require("layer input")
    }

    pub fn output(&self) -> Result<VolumeId> {
        self.output.require("layer output")
    }
}

/// Volumes created during one build attempt, in creation order.
#[derive(Debug, Default)]
pub struct Ledger {
    ids: Vec<VolumeId>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: VolumeId) {
        self.ids.push(id);
    }

    pub fn ids(&self) -> &[VolumeId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: VolumeId) -> bool {
        self.ids.contains(&id)
    }

    /// Move every recorded id into `other`.
    pub fn append_to(self, other: &mut Vec<VolumeId>) {
        other.extend(self.ids);
    }

    /// Release every recorded Volume, newest first.
    pub fn release_all<B: Backend>(self, ws: &mut Workspace<B>) {
        for id in self.ids.into_iter().rev() {
            ws.release(id);
        }
    }
}

/// Fails with [`Error::TrainerCountMismatch`] unless `got == expected`.
pub fn check_trainer_count(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::TrainerCountMismatch { expected, got });
    }
    Ok(())
}

/// The interface every layer implements.
///
/// Only `forward`, `backward` and shape inference are required; stateless
/// layers get the weight and trainer methods for free.
pub trait Module<B: Backend>: Send {
    fn id(&self) -> LayerId;

    fn kind(&self) -> LayerKind;

    fn ports(&self) -> &Ports;

    fn ports_mut(&mut self) -> &mut Ports;

    /// Output extents for an input of `input` extents in `format`.
    fn infer_output_shape(&self, input: &Shape, format: Format) -> Result<Shape>;

    /// Record where the input lives. Does not copy.
    fn bind(&mut self, input: VolumeId) {
        self.ports_mut().input.bind(input);
    }

    /// Whether an output Volume is already bound.
    fn is_wired(&self) -> bool {
        self.ports().output.is_bound()
    }

    /// Create the output Volume. Shape-preserving layers get a zero clone of
    /// their input, the rest a freshly shaped Volume.
    fn allocate_outputs(&mut self, ws: &mut Workspace<B>, ledger: &mut Ledger) -> Result<VolumeId> {
        let (shape, format, _) = input_meta(self.ports(), ws)?;
        let out_shape = self.infer_output_shape(&shape, format)?;
        allocate_output(self.ports_mut(), ws, ledger, out_shape)
    }

    /// Forget output wiring. Releases nothing; the Volumes belong to
    /// whoever recorded them.
    fn unwire(&mut self) {
        self.ports_mut().output.clear();
    }

    /// Forget output wiring that points at one of `created`. An output the
    /// caller bound before building stays bound.
    fn unwire_created(&mut self, created: &[VolumeId]) {
        if self
            .ports()
            .output
            .get()
            .is_some_and(|id| created.contains(&id))
        {
            self.unwire();
        }
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()>;

    /// Compute the input gradient (when the input owns one) through
    /// `blend`, and accumulate weight gradients.
    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()>;

    /// Switch between training and inference behaviour.
    fn set_training(&mut self, _training: bool) {}

    /// Turn per-layer sweep logging on or off for layers that run nested
    /// chains.
    fn set_trace(&mut self, _forward: bool, _backward: bool) {}

    /// Turn channel-partition logging on or off.
    fn set_concat_trace(&mut self, _on: bool) {}

    /// Create weight Volumes. Runs once, after the layer is wired.
    fn init_weights(&mut self, _ws: &Workspace<B>, _seed: u64) -> Result<()> {
        Ok(())
    }

    fn trainer_slots_needed(&self) -> usize {
        0
    }

    fn bind_trainers(&mut self, trainers: Vec<Box<dyn Trainer<B>>>) -> Result<()> {
        check_trainer_count(self.trainer_slots_needed(), trainers.len())
    }

    /// Step every bound trainer against its weight.
    fn update(&mut self, _counter: usize) -> Result<()> {
        Ok(())
    }

    /// Summed (L1, L2) regularisation loss of this layer's trainers.
    fn l1l2_loss(&self) -> (f64, f64) {
        (0.0, 0.0)
    }

    /// Weight Volumes in a stable order.
    fn weights(&self) -> Vec<&Volume<B>> {
        Vec::new()
    }

    fn weights_mut(&mut self) -> Vec<&mut Volume<B>> {
        Vec::new()
    }

    fn has_weights(&self) -> bool {
        !self.weights().is_empty()
    }

    /// Release weight Volumes and trainer state.
    fn release_weights(&mut self) {}
}

/// Shape, format and dtype of the Volume bound to the input port.
pub(crate) fn input_meta<B: Backend>(
    ports: &Ports,
    ws: &Workspace<B>,
) -> Result<(Shape, Format, DType)> {
    let v = ws.get(ports.input()?)?;
    Ok((v.shape().clone(), v.format(), v.dtype()))
}

/// Create an output Volume of `out_shape`, record it and bind it.
pub(crate) fn allocate_output<B: Backend>(
    ports: &mut Ports,
    ws: &mut Workspace<B>,
    ledger: &mut Ledger,
    out_shape: Shape,
) -> Result<VolumeId> {
    let (shape, format, dtype) = input_meta(ports, ws)?;
    let id = if out_shape == shape {
        ws.zero_clone(ports.input()?)?
    } else {
        ws.create(out_shape, format, dtype)?
    };
    ledger.record(id);
    ports.output.bind(id);
    Ok(id)
}

/// Input, output and whether the input owns a gradient.
pub(crate) fn io<B: Backend>(ports: &Ports, ws: &Workspace<B>) -> Result<(VolumeId, VolumeId, bool)> {
    let x = ports.input()?;
    let y = ports.output()?;
    let has_dx = ws.get(x)?.has_gradient();
    Ok((x, y, has_dx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_layer_ids_are_unique() {
        let a = LayerId::new();
        let b = LayerId::new();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn test_ledger_release_all() {
        let dev = CpuDevice::new();
        let mut ws = strata_core::Workspace::<CpuBackend>::new(dev.clone());
        let kept = ws
            .create(Shape::from((1, 2)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mut ledger = Ledger::new();
        for _ in 0..3 {
            let id = ws
                .create(Shape::from((1, 2)), Format::ChannelFirst, DType::F32)
                .unwrap();
            ledger.record(id);
        }
        assert_eq!(ledger.len(), 3);
        ledger.release_all(&mut ws);
        assert_eq!(ws.live_count(), 1);
        assert!(ws.contains(kept));
    }

    #[test]
    fn test_trainer_count() {
        assert!(check_trainer_count(2, 2).is_ok());
        assert!(matches!(
            check_trainer_count(2, 3),
            Err(Error::TrainerCountMismatch {
                expected: 2,
                got: 3
            })
        ));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(LayerKind::TransposedConvolution.to_string(), "transposed-convolution");
        assert_eq!(
            "normalization".parse::<LayerKind>().unwrap(),
            LayerKind::Normalization
        );
        assert!("dense".parse::<LayerKind>().is_err());
    }
}
