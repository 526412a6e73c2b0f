// Volume — A device buffer plus its gradient counterpart
//
// A Volume owns up to two device allocations of identical shape:
//
//   value    — the data flowing forward
//   gradient — the data flowing backward (absent for network inputs,
//              gradients do not propagate past the network boundary)
//
// It also keeps the two descriptors the backend may ask for: a packed one
// (implied strides) and a strided one (explicit strides). Both describe the
// same memory.
//
// LIFECYCLE:
//
//   create → zero-filled → mutated in place by kernels → destroy
//
// destroy() releases device memory exactly once. Calling it again is a
// no-op, and Drop calls it too, so a Volume can never leak or double free.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{Backend, Dst, Src};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::{Format, Shape};

static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of one device allocation, unique for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Where a Volume sits in a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    NetworkInput,
    Intermediate,
    NetworkOutput,
}

/// Device-resident tensor with an optional gradient buffer.
pub struct Volume<B: Backend> {
    id: BufferId,
    device: B::Device,
    dtype: DType,
    packed: Layout,
    strided: Layout,
    role: Role,
    value: Option<B::Storage>,
    gradient: Option<B::Storage>,
    released: bool,
}

impl<B: Backend> Volume<B> {
    /// Allocate a zero-filled Volume.
    ///
    /// If the gradient allocation fails after the value allocation succeeded,
    /// the value buffer is released before the error is returned.
    pub fn create(
        shape: Shape,
        format: Format,
        dtype: DType,
        gradient_needed: bool,
        device: &B::Device,
    ) -> Result<Self> {
        shape.validate()?;
        let value = B::alloc_zeroed(&shape, dtype, device)?;
        let gradient = if gradient_needed {
            match B::alloc_zeroed(&shape, dtype, device) {
                Ok(g) => Some(g),
                Err(e) => {
                    B::release(value, device);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let id = BufferId::next();
        log::trace!("create {id} {shape} {format} {dtype} gradient={gradient_needed}");
        Ok(Volume {
            id,
            device: device.clone(),
            dtype,
            packed: Layout::packed(shape.clone(), format),
            strided: Layout::strided(shape, format),
            role: if gradient_needed {
                Role::Intermediate
            } else {
                Role::NetworkInput
            },
            value: Some(value),
            gradient,
            released: false,
        })
    }

    /// A Volume for feeding data into a network. It never owns a gradient.
    pub fn network_input(
        shape: Shape,
        format: Format,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Self::create(shape, format, dtype, false, device)
    }

    /// Fresh zero-filled Volume with the same shape, format and dtype.
    /// The clone is always an intermediate and owns a gradient.
    pub fn zero_clone(&self) -> Result<Self> {
        Self::create(
            self.shape().clone(),
            self.format(),
            self.dtype,
            true,
            &self.device,
        )
    }

    /// Release device memory. Safe to call any number of times.
    pub fn destroy(&mut self) {
        if self.released {
            return;
        }
        if let Some(g) = self.gradient.take() {
            B::release(g, &self.device);
        }
        if let Some(v) = self.value.take() {
            B::release(v, &self.device);
        }
        self.released = true;
        log::trace!("release {}", self.id);
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn shape(&self) -> &Shape {
        self.packed.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.packed.dims()
    }

    pub fn format(&self) -> Format {
        self.packed.format()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.packed.elem_count()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Change the role tag. A Volume holding a gradient cannot become a
    /// network input.
    pub fn set_role(&mut self, role: Role) -> Result<()> {
        if role == Role::NetworkInput && self.gradient.is_some() {
            return Err(Error::invariant(format!(
                "{} owns a gradient and cannot be a network input",
                self.id
            )));
        }
        self.role = role;
        Ok(())
    }

    pub fn has_gradient(&self) -> bool {
        self.gradient.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Device bytes held by this Volume (value plus gradient).
    pub fn size_in_bytes(&self) -> usize {
        let one = self.elem_count() * self.dtype.size_in_bytes();
        match (&self.value, &self.gradient) {
            (Some(_), Some(_)) => 2 * one,
            (Some(_), None) | (None, Some(_)) => one,
            (None, None) => 0,
        }
    }

    /// Descriptor with implied packed strides.
    pub fn packed_view(&self) -> &Layout {
        &self.packed
    }

    /// Descriptor with explicit strides over the same memory.
    pub fn strided_view(&self) -> &Layout {
        &self.strided
    }

    //  Storage access

    fn released_err(&self) -> Error {
        Error::invariant(format!("{} used after release", self.id))
    }

    fn missing_gradient(&self) -> Error {
        Error::invariant(format!("{} has no gradient buffer", self.id))
    }

    pub fn value(&self) -> Result<&B::Storage> {
        self.value.as_ref().ok_or_else(|| self.released_err())
    }

    pub fn value_mut(&mut self) -> Result<&mut B::Storage> {
        let id = self.id;
        self.value
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} used after release")))
    }

    pub fn gradient(&self) -> Result<&B::Storage> {
        self.gradient.as_ref().ok_or_else(|| self.missing_gradient())
    }

    pub fn gradient_mut(&mut self) -> Result<&mut B::Storage> {
        let id = self.id;
        self.gradient
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} has no gradient buffer")))
    }

    /// Both buffers at once, for kernels that update a weight from its
    /// gradient in place.
    pub fn value_and_gradient_mut(&mut self) -> Result<(&mut B::Storage, &mut B::Storage)> {
        let id = self.id;
        match (self.value.as_mut(), self.gradient.as_mut()) {
            (Some(v), Some(g)) => Ok((v, g)),
            (None, _) => Err(Error::invariant(format!("{id} used after release"))),
            (Some(_), None) => Err(Error::invariant(format!("{id} has no gradient buffer"))),
        }
    }

    /// Value through the packed descriptor.
    pub fn src(&self) -> Result<Src<'_, B::Storage>> {
        Ok(Src {
            storage: self.value()?,
            layout: &self.packed,
        })
    }

    pub fn dst(&mut self) -> Result<Dst<'_, B::Storage>> {
        let layout = &self.packed;
        let id = self.id;
        let storage = self
            .value
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} used after release")))?;
        Ok(Dst { storage, layout })
    }

    /// Gradient through the packed descriptor.
    pub fn grad_src(&self) -> Result<Src<'_, B::Storage>> {
        Ok(Src {
            storage: self.gradient()?,
            layout: &self.packed,
        })
    }

    pub fn grad_dst(&mut self) -> Result<Dst<'_, B::Storage>> {
        let layout = &self.packed;
        let id = self.id;
        let storage = self
            .gradient
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} has no gradient buffer")))?;
        Ok(Dst { storage, layout })
    }

    /// Read the value while writing the gradient.
    pub fn split_grad(&mut self) -> Result<(Src<'_, B::Storage>, Dst<'_, B::Storage>)> {
        let id = self.id;
        let layout = &self.packed;
        let value = self
            .value
            .as_ref()
            .ok_or_else(|| Error::invariant(format!("{id} used after release")))?;
        let gradient = self
            .gradient
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} has no gradient buffer")))?;
        Ok((
            Src {
                storage: value,
                layout,
            },
            Dst {
                storage: gradient,
                layout,
            },
        ))
    }

    /// Value through the strided descriptor.
    pub fn strided_src(&self) -> Result<Src<'_, B::Storage>> {
        Ok(Src {
            storage: self.value()?,
            layout: &self.strided,
        })
    }

    pub fn strided_dst(&mut self) -> Result<Dst<'_, B::Storage>> {
        let layout = &self.strided;
        let id = self.id;
        let storage = self
            .value
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} used after release")))?;
        Ok(Dst { storage, layout })
    }

    /// Gradient through the strided descriptor.
    pub fn strided_grad_src(&self) -> Result<Src<'_, B::Storage>> {
        Ok(Src {
            storage: self.gradient()?,
            layout: &self.strided,
        })
    }

    pub fn strided_grad_dst(&mut self) -> Result<Dst<'_, B::Storage>> {
        let layout = &self.strided;
        let id = self.id;
        let storage = self
            .gradient
            .as_mut()
            .ok_or_else(|| Error::invariant(format!("{id} has no gradient buffer")))?;
        Ok(Dst { storage, layout })
    }

    /// Gradient destination when one exists; `None` for network inputs.
    pub fn opt_grad_dst(&mut self) -> Option<Dst<'_, B::Storage>> {
        let layout = &self.packed;
        self.gradient
            .as_mut()
            .map(|storage| Dst { storage, layout })
    }

    //  Host transfers

    pub fn write_values(&mut self, values: &[f64]) -> Result<()> {
        self.check_len(values.len())?;
        B::write_f64(self.value_mut()?, values)
    }

    pub fn values(&self) -> Result<Vec<f64>> {
        B::read_f64(self.value()?)
    }

    pub fn write_gradient(&mut self, values: &[f64]) -> Result<()> {
        self.check_len(values.len())?;
        B::write_f64(self.gradient_mut()?, values)
    }

    pub fn gradient_values(&self) -> Result<Vec<f64>> {
        B::read_f64(self.gradient()?)
    }

    pub fn fill(&mut self, value: f64) -> Result<()> {
        B::fill(self.value_mut()?, value)
    }

    /// Zero the gradient buffer. No-op for Volumes without one.
    pub fn clear_gradient(&mut self) -> Result<()> {
        match self.gradient.as_mut() {
            Some(g) => B::fill(g, 0.0),
            None => Ok(()),
        }
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got,
            });
        }
        Ok(())
    }
}

impl<B: Backend> Drop for Volume<B> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<B: Backend> fmt::Debug for Volume<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("shape", self.shape())
            .field("format", &self.format())
            .field("dtype", &self.dtype)
            .field("role", &self.role)
            .field("gradient", &self.gradient.is_some())
            .field("released", &self.released)
            .finish()
    }
}
