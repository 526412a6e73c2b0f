//! Host-side copies of weight tensors for persistence collaborators.

use strata_core::{Backend, DType, Error, Format, Result, Volume};

use crate::module::LayerKind;

/// One weight tensor, flattened to f64 in packed order.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    pub format: Format,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl TensorRecord {
    /// Copy `volume`'s values to the host.
    pub fn of<B: Backend>(volume: &Volume<B>) -> Result<Self> {
        Ok(TensorRecord {
            format: volume.format(),
            dtype: volume.dtype(),
            shape: volume.dims().to_vec(),
            values: volume.values()?,
        })
    }

    /// Fails unless this record describes a tensor of `volume`'s dtype,
    /// format, shape and element count.
    pub fn check<B: Backend>(&self, volume: &Volume<B>) -> Result<()> {
        if self.dtype != volume.dtype() {
            return Err(Error::DTypeMismatch {
                expected: volume.dtype(),
                got: self.dtype,
            });
        }
        if self.format != volume.format() {
            return Err(Error::invalid(
                "format",
                format!("record is {}, weight is {}", self.format, volume.format()),
            ));
        }
        if self.shape != volume.dims() {
            return Err(Error::incompatible(
                volume.shape(),
                format!("record has shape {:?}", self.shape),
            ));
        }
        if self.values.len() != volume.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: volume.shape().clone(),
                expected: volume.elem_count(),
                got: self.values.len(),
            });
        }
        Ok(())
    }

    /// Write this record into `volume` after [`check`](Self::check).
    pub fn load_into<B: Backend>(&self, volume: &mut Volume<B>) -> Result<()> {
        self.check(volume)?;
        volume.write_values(&self.values)
    }
}

/// Every weight tensor of one weight-bearing layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRecord {
    /// Position of the layer in the network; the output stage comes last.
    pub index: usize,
    pub kind: LayerKind,
    pub tensors: Vec<TensorRecord>,
}
