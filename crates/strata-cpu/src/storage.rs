// CpuStorage — Host memory for each supported dtype
//
// Kernels never compute in the storage dtype directly. They gather the
// region a descriptor describes into an f64 buffer in logical order, do the
// arithmetic there, and scatter the result back through the destination
// descriptor, applying the Blend on the way in. Half-precision storage is
// therefore promoted on read and rounded on write.

use std::fmt;

use half::{bf16, f16};
use strata_core::{BackendStorage, Blend, DType, Dst, Error, Layout, Result, Src, WithDType};

/// Host-side storage, one variant per element type.
#[derive(Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! each_variant {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            CpuStorage::F16($v) => $body,
            CpuStorage::BF16($v) => $body,
            CpuStorage::F32($v) => $body,
            CpuStorage::F64($v) => $body,
        }
    };
}

fn load<T: WithDType>(v: &[T], i: usize) -> f64 {
    WithDType::to_f64(v[i])
}

fn store<T: WithDType>(v: &mut [T], i: usize, x: f64) {
    v[i] = T::from_f64(x);
}

fn dtype_of<T: WithDType>(_: &[T]) -> DType {
    T::DTYPE
}

impl CpuStorage {
    /// Zero-filled storage of `len` elements.
    pub fn zeros(len: usize, dtype: DType) -> Self {
        match dtype {
            DType::F16 => CpuStorage::F16(vec![f16::ZERO; len]),
            DType::BF16 => CpuStorage::BF16(vec![bf16::ZERO; len]),
            DType::F32 => CpuStorage::F32(vec![0.0; len]),
            DType::F64 => CpuStorage::F64(vec![0.0; len]),
        }
    }

    pub fn get(&self, i: usize) -> f64 {
        each_variant!(self, v => load(v, i))
    }

    pub fn set(&mut self, i: usize, x: f64) {
        each_variant!(self, v => store(v, i, x))
    }

    /// Every element, promoted to f64, in storage order.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_variant!(self, v => v.iter().map(|&x| WithDType::to_f64(x)).collect())
    }

    /// Overwrite every element from `values` (same length).
    pub fn copy_from_f64(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::msg(format!(
                "host buffer has {} elements, storage has {}",
                values.len(),
                self.len()
            )));
        }
        for (i, &x) in values.iter().enumerate() {
            self.set(i, x);
        }
        Ok(())
    }

    pub fn fill(&mut self, x: f64) {
        each_variant!(self, v => {
            let t = WithDType::from_f64(x);
            v.iter_mut().for_each(|e| *e = t);
        })
    }

    /// The region `layout` describes, promoted to f64, in logical order.
    pub fn gather(&self, layout: &Layout) -> Result<Vec<f64>> {
        check_fits(layout, self.len())?;
        Ok(layout.strided_indices().map(|i| self.get(i)).collect())
    }

    /// Write `values` (logical order) into the region `layout` describes:
    /// `dst = alpha * value + beta * dst`. With beta = 0 the old contents
    /// are never read.
    pub fn scatter(&mut self, layout: &Layout, values: &[f64], blend: Blend) -> Result<()> {
        check_fits(layout, self.len())?;
        if values.len() != layout.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: layout.shape().clone(),
                expected: layout.elem_count(),
                got: values.len(),
            });
        }
        for (flat, &x) in layout.strided_indices().zip(values) {
            let out = if blend.beta == 0.0 {
                blend.alpha * x
            } else {
                blend.alpha * x + blend.beta * self.get(flat)
            };
            self.set(flat, out);
        }
        Ok(())
    }
}

/// Every flat index `layout` can produce must land inside the storage.
fn check_fits(layout: &Layout, len: usize) -> Result<()> {
    if layout.elem_count() == 0 {
        return Ok(());
    }
    let last = layout.offset()
        + layout
            .dims()
            .iter()
            .zip(layout.strides())
            .map(|(&d, &s)| (d - 1) * s)
            .sum::<usize>();
    if last >= len {
        return Err(Error::invariant(format!(
            "descriptor {:?} reaches element {last} of a {len}-element buffer",
            layout.dims()
        )));
    }
    Ok(())
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        each_variant!(self, v => dtype_of(v))
    }

    fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }
}

//  Operand helpers used by the backend glue

pub(crate) fn read(src: &Src<'_, CpuStorage>) -> Result<Vec<f64>> {
    src.storage.gather(src.layout)
}

pub(crate) fn write(dst: Dst<'_, CpuStorage>, values: &[f64], blend: Blend) -> Result<()> {
    dst.storage.scatter(dst.layout, values, blend)
}

/// All operands of one kernel must share a dtype.
pub(crate) fn same_dtype(expected: DType, others: &[DType]) -> Result<()> {
    for &got in others {
        if got != expected {
            return Err(Error::DTypeMismatch { expected, got });
        }
    }
    Ok(())
}
