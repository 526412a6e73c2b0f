// Concat & Split — channel-axis fan-in and fan-out
//
// Concat copies N source Volumes side by side along the channel axis into
// one destination. Split (the reverse concat) carves one source into N
// destinations. The two are mirror images:
//
//   Concat.forward   values     parts → whole
//   Concat.backward  gradients  whole → parts
//   Split.forward    values     whole → parts
//   Split.backward   gradients  parts → whole
//
// Every copy goes through a strided window of the whole Volume, narrowed to
// the part's channel range. All non-channel extents must agree.
//
// Split divides C channels as evenly as it can: each destination gets
// C / N channels and the last one also takes the remainder.

use strata_core::{
    Backend, Blend, DType, Dst, Error, Format, Result, Shape, Slot, Src, VolumeId, Workspace,
};

use crate::module::{LayerId, Ledger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buffer {
    Value,
    Gradient,
}

/// Copy every part into its channel window of `whole`.
fn gather<B: Backend>(
    ws: &mut Workspace<B>,
    whole: VolumeId,
    parts: &[VolumeId],
    buffer: Buffer,
    blend: Blend,
    trace: Option<LayerId>,
) -> Result<()> {
    let mut offset = 0;
    for &part in parts {
        let (pv, wv) = ws.pair_mut(part, whole)?;
        let format = wv.format();
        let axis = format.channel_axis(wv.shape().rank());
        let c = format.channels(pv.shape())?;
        let region = wv.strided_view().narrow(axis, offset, c)?;
        if let Some(id) = trace {
            log::debug!("{id} {buffer:?} {part} -> {whole}[{offset}..{}]", offset + c);
        }
        match buffer {
            Buffer::Value => {
                let dst = Dst {
                    storage: wv.value_mut()?,
                    layout: &region,
                };
                B::transform(pv.strided_src()?, dst, blend)?;
            }
            Buffer::Gradient => {
                let dst = Dst {
                    storage: wv.gradient_mut()?,
                    layout: &region,
                };
                B::transform(pv.strided_grad_src()?, dst, blend)?;
            }
        }
        offset += c;
    }
    Ok(())
}

/// Copy every channel window of `whole` out into its part.
fn scatter<B: Backend>(
    ws: &mut Workspace<B>,
    whole: VolumeId,
    parts: &[VolumeId],
    buffer: Buffer,
    blend: Blend,
    trace: Option<LayerId>,
) -> Result<()> {
    let mut offset = 0;
    for &part in parts {
        let (wv, pv) = ws.pair_mut(whole, part)?;
        let format = wv.format();
        let axis = format.channel_axis(wv.shape().rank());
        let c = format.channels(pv.shape())?;
        let region = wv.strided_view().narrow(axis, offset, c)?;
        if let Some(id) = trace {
            log::debug!("{id} {buffer:?} {whole}[{offset}..{}] -> {part}", offset + c);
        }
        match buffer {
            Buffer::Value => {
                let src = Src {
                    storage: wv.value()?,
                    layout: &region,
                };
                B::transform(src, pv.strided_dst()?, blend)?;
            }
            Buffer::Gradient => {
                if !pv.has_gradient() {
                    offset += c;
                    continue;
                }
                let src = Src {
                    storage: wv.gradient()?,
                    layout: &region,
                };
                B::transform(src, pv.strided_grad_dst()?, blend)?;
            }
        }
        offset += c;
    }
    Ok(())
}

/// Shape, format and dtype of a Volume.
fn meta<B: Backend>(ws: &Workspace<B>, id: VolumeId) -> Result<(Shape, Format, DType)> {
    let v = ws.get(id)?;
    Ok((v.shape().clone(), v.format(), v.dtype()))
}

/// Joins several Volumes along the channel axis.
#[derive(Debug)]
pub struct Concat {
    id: LayerId,
    sources: Vec<VolumeId>,
    output: Slot,
    trace: bool,
}

impl Concat {
    pub fn new() -> Self {
        Concat {
            id: LayerId::new(),
            sources: Vec::new(),
            output: Slot::empty(),
            trace: false,
        }
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Log every channel window as it is copied.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// The combined extents of `shapes`. Every axis but the channel axis
    /// must agree.
    pub fn output_shape(shapes: &[Shape], format: Format) -> Result<Shape> {
        let first = shapes
            .first()
            .ok_or_else(|| Error::invalid("sources", "nothing to concatenate"))?;
        let rank = first.rank();
        let axis = format.channel_axis(rank);
        let mut channels = 0;
        for shape in shapes {
            if shape.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: shape.rank(),
                });
            }
            for (d, (&want, &got)) in first.dims().iter().zip(shape.dims()).enumerate() {
                if d != axis && want != got {
                    return Err(Error::DimensionMismatch {
                        axis: d,
                        expected: want,
                        got,
                    });
                }
            }
            channels += format.channels(shape)?;
        }
        Ok(first.with_dim(axis, channels))
    }

    pub fn bind_sources(&mut self, sources: Vec<VolumeId>) {
        self.sources = sources;
    }

    pub fn sources(&self) -> &[VolumeId] {
        &self.sources
    }

    pub fn output(&self) -> Result<VolumeId> {
        self.output.require("concat output")
    }

    pub fn is_wired(&self) -> bool {
        self.output.is_bound()
    }

    /// Create the destination sized for the bound sources.
    pub fn allocate_output<B: Backend>(
        &mut self,
        ws: &mut Workspace<B>,
        ledger: &mut Ledger,
    ) -> Result<VolumeId> {
        let mut shapes = Vec::with_capacity(self.sources.len());
        let mut kind: Option<(Format, DType)> = None;
        for &id in &self.sources {
            let (shape, format, dtype) = meta(ws, id)?;
            match kind {
                None => kind = Some((format, dtype)),
                Some((f, d)) => {
                    if d != dtype {
                        return Err(Error::DTypeMismatch {
                            expected: d,
                            got: dtype,
                        });
                    }
                    if f != format {
                        return Err(Error::invalid(
                            "sources",
                            format!("mixed formats {f} and {format}"),
                        ));
                    }
                }
            }
            shapes.push(shape);
        }
        let (format, dtype) =
            kind.ok_or_else(|| Error::invalid("sources", "nothing to concatenate"))?;
        let shape = Self::output_shape(&shapes, format)?;
        let id = ws.create(shape, format, dtype)?;
        ledger.record(id);
        self.output.bind(id);
        Ok(id)
    }

    pub fn forward<B: Backend>(&self, ws: &mut Workspace<B>) -> Result<()> {
        let trace = self.trace.then_some(self.id);
        gather(ws, self.output()?, &self.sources, Buffer::Value, Blend::OVERWRITE, trace)
    }

    /// Hand each source its window of the output gradient through `blend`.
    pub fn backward<B: Backend>(&self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let trace = self.trace.then_some(self.id);
        scatter(ws, self.output()?, &self.sources, Buffer::Gradient, blend, trace)
    }

    pub fn unwire(&mut self) {
        self.sources.clear();
        self.output.clear();
    }
}

impl Default for Concat {
    fn default() -> Self {
        Self::new()
    }
}

/// Carves one Volume into several along the channel axis.
#[derive(Debug)]
pub struct Split {
    id: LayerId,
    count: usize,
    input: Slot,
    outputs: Vec<VolumeId>,
    trace: bool,
}

impl Split {
    pub fn new(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(Error::invalid("count", "must split into at least one part"));
        }
        Ok(Split {
            id: LayerId::new(),
            count,
            input: Slot::empty(),
            outputs: Vec::new(),
            trace: false,
        })
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
    }

    /// Channels per destination: `channels / count` each, the last one
    /// also taking the remainder.
    pub fn shares(channels: usize, count: usize) -> Result<Vec<usize>> {
        if count == 0 || count > channels {
            return Err(Error::invalid(
                "count",
                format!("cannot split {channels} channels into {count} parts"),
            ));
        }
        let base = channels / count;
        let mut shares = vec![base; count];
        shares[count - 1] += channels % count;
        Ok(shares)
    }

    /// Destination extents for an input of `shape`.
    pub fn output_shapes(&self, shape: &Shape, format: Format) -> Result<Vec<Shape>> {
        let axis = format.channel_axis(shape.rank());
        Ok(Self::shares(format.channels(shape)?, self.count)?
            .into_iter()
            .map(|c| shape.with_dim(axis, c))
            .collect())
    }

    pub fn bind(&mut self, input: VolumeId) {
        self.input.bind(input);
    }

    pub fn input(&self) -> Result<VolumeId> {
        self.input.require("split input")
    }

    pub fn outputs(&self) -> &[VolumeId] {
        &self.outputs
    }

    pub fn is_wired(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Create one destination per share. Each id is recorded as soon as it
    /// exists, so a failure part way leaves the ledger complete.
    pub fn allocate_outputs<B: Backend>(
        &mut self,
        ws: &mut Workspace<B>,
        ledger: &mut Ledger,
    ) -> Result<Vec<VolumeId>> {
        let (shape, format, dtype) = meta(ws, self.input()?)?;
        let shapes = self.output_shapes(&shape, format)?;
        let mut outputs = Vec::with_capacity(shapes.len());
        for shape in shapes {
            let id = ws.create(shape, format, dtype)?;
            ledger.record(id);
            outputs.push(id);
        }
        self.outputs = outputs;
        Ok(self.outputs.clone())
    }

    pub fn forward<B: Backend>(&self, ws: &mut Workspace<B>) -> Result<()> {
        let trace = self.trace.then_some(self.id);
        scatter(ws, self.input()?, &self.outputs, Buffer::Value, Blend::OVERWRITE, trace)
    }

    /// Gather the destinations' gradients into the input gradient through
    /// `blend`. A no-op when the input owns no gradient.
    pub fn backward<B: Backend>(&self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let input = self.input()?;
        if !ws.get(input)?.has_gradient() {
            return Ok(());
        }
        let trace = self.trace.then_some(self.id);
        gather(ws, input, &self.outputs, Buffer::Gradient, blend, trace)
    }

    pub fn unwire(&mut self) {
        self.outputs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cpu::{CpuBackend, CpuDevice, CpuWorkspace};

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|v| v as f64).collect()
    }

    #[test]
    fn test_shares() {
        assert_eq!(Split::shares(10, 3).unwrap(), vec![3, 3, 4]);
        assert_eq!(Split::shares(4, 4).unwrap(), vec![1, 1, 1, 1]);
        assert!(Split::shares(2, 3).is_err());
        assert!(Split::shares(2, 0).is_err());
    }

    #[test]
    fn test_output_shape_mismatch() {
        let shapes = [Shape::from((1, 2, 4, 4)), Shape::from((1, 3, 4, 5))];
        assert!(matches!(
            Concat::output_shape(&shapes, Format::ChannelFirst),
            Err(Error::DimensionMismatch { axis: 3, .. })
        ));
        let shapes = [Shape::from((1, 4, 4, 2)), Shape::from((1, 4, 4, 3))];
        assert_eq!(
            Concat::output_shape(&shapes, Format::ChannelLast)
                .unwrap()
                .dims(),
            &[1, 4, 4, 5]
        );
    }

    fn split_then_concat(format: Format, dims: (usize, usize, usize, usize)) {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws.create(Shape::from(dims), format, DType::F64).unwrap();
        let n = ws.get(x).unwrap().elem_count();
        ws.get_mut(x).unwrap().write_values(&ramp(n)).unwrap();
        let mut ledger = Ledger::new();

        let mut split = Split::new(3).unwrap();
        split.bind(x);
        let parts = split.allocate_outputs(&mut ws, &mut ledger).unwrap();
        let channels: Vec<usize> = parts
            .iter()
            .map(|&p| format.channels(ws.get(p).unwrap().shape()).unwrap())
            .collect();
        assert_eq!(channels, vec![3, 3, 4]);

        let mut concat = Concat::new();
        concat.bind_sources(parts.clone());
        let y = concat.allocate_output(&mut ws, &mut ledger).unwrap();
        assert_eq!(ws.get(y).unwrap().shape(), ws.get(x).unwrap().shape());

        split.forward(&mut ws).unwrap();
        concat.forward(&mut ws).unwrap();
        assert_eq!(ws.get(y).unwrap().values().unwrap(), ramp(n));

        ws.get_mut(y).unwrap().write_gradient(&ramp(n)).unwrap();
        concat.backward(&mut ws, Blend::OVERWRITE).unwrap();
        split.backward(&mut ws, Blend::OVERWRITE).unwrap();
        assert_eq!(ws.get(x).unwrap().gradient_values().unwrap(), ramp(n));
    }

    #[test]
    fn test_split_concat_identity_channel_first() {
        split_then_concat(Format::ChannelFirst, (2, 10, 2, 2));
    }

    #[test]
    fn test_split_concat_identity_channel_last() {
        split_then_concat(Format::ChannelLast, (2, 2, 2, 10));
    }

    #[test]
    fn test_split_partitions_channels() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((1, 5, 1)), Format::ChannelFirst, DType::F32)
            .unwrap();
        ws.get_mut(x).unwrap().write_values(&ramp(5)).unwrap();
        let mut split = Split::new(2).unwrap();
        split.bind(x);
        let parts = split.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        split.forward::<CpuBackend>(&mut ws).unwrap();
        assert_eq!(ws.get(parts[0]).unwrap().values().unwrap(), vec![0.0, 1.0]);
        assert_eq!(
            ws.get(parts[1]).unwrap().values().unwrap(),
            vec![2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_backward_accumulates_into_shared_input() {
        let mut ws = CpuWorkspace::new(CpuDevice::new());
        let x = ws
            .create(Shape::from((1, 2)), Format::ChannelFirst, DType::F32)
            .unwrap();
        let mut split = Split::new(2).unwrap();
        split.bind(x);
        let parts = split.allocate_outputs(&mut ws, &mut Ledger::new()).unwrap();
        for &p in &parts {
            ws.get_mut(p).unwrap().write_gradient(&[1.0]).unwrap();
        }
        split.backward(&mut ws, Blend::ACCUMULATE).unwrap();
        split.backward(&mut ws, Blend::ACCUMULATE).unwrap();
        assert_eq!(ws.get(x).unwrap().gradient_values().unwrap(), vec![2.0, 2.0]);
    }
}
