// Reshape — reinterpret each sample under a new shape
//
// The batch dimension is kept; everything after it is replaced by the
// target per-sample shape. Both Volumes are contiguous, so forward copies
// the input's memory described with the output's extents and backward does
// the reverse for the gradient.

use strata_core::{Backend, Blend, Error, Format, Layout, Result, Shape, Src, Workspace};

use crate::module::{io, LayerId, LayerKind, Module, Ports};

pub struct Reshape {
    id: LayerId,
    ports: Ports,
    sample: Vec<usize>,
}

impl Reshape {
    /// Reshape every sample to `sample` (batch dimension excluded).
    pub fn new(sample: &[usize]) -> Result<Self> {
        if sample.is_empty() || sample.contains(&0) {
            return Err(Error::invalid(
                "sample",
                format!("{sample:?} is not a valid per-sample shape"),
            ));
        }
        Ok(Reshape {
            id: LayerId::new(),
            ports: Ports::default(),
            sample: sample.to_vec(),
        })
    }

    pub fn sample(&self) -> &[usize] {
        &self.sample
    }
}

impl<B: Backend> Module<B> for Reshape {
    fn id(&self) -> LayerId {
        self.id
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Reshape
    }

    fn ports(&self) -> &Ports {
        &self.ports
    }

    fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    fn infer_output_shape(&self, input: &Shape, _format: Format) -> Result<Shape> {
        let batch = input.dim(0)?;
        let per_sample = input.elem_count() / batch.max(1);
        let wanted: usize = self.sample.iter().product();
        if per_sample != wanted {
            return Err(Error::incompatible(
                input,
                format!(
                    "{per_sample} elements per sample cannot become {:?} ({wanted})",
                    self.sample
                ),
            ));
        }
        let mut dims = Vec::with_capacity(self.sample.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.sample);
        Ok(Shape::new(dims))
    }

    fn forward(&mut self, ws: &mut Workspace<B>) -> Result<()> {
        let (x, y, _) = io(&self.ports, ws)?;
        let (xv, yv) = ws.pair_mut(x, y)?;
        let view = Layout::strided(yv.shape().clone(), yv.format());
        let src = Src {
            storage: xv.value()?,
            layout: &view,
        };
        B::transform(src, yv.strided_dst()?, Blend::OVERWRITE)
    }

    fn backward(&mut self, ws: &mut Workspace<B>, blend: Blend) -> Result<()> {
        let (x, y, has_dx) = io(&self.ports, ws)?;
        if !has_dx {
            return Ok(());
        }
        let (yv, xv) = ws.pair_mut(y, x)?;
        let view = Layout::strided(xv.shape().clone(), xv.format());
        let src = Src {
            storage: yv.gradient()?,
            layout: &view,
        };
        B::transform(src, xv.strided_grad_dst()?, blend)
    }
}
