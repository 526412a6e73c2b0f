// Workspace — The arena that owns every flowing Volume
//
// Layers never own the Volumes they read from or write to; they hold
// VolumeIds into a Workspace. One layer's output id is the next layer's
// input id, so adjacent layers share a buffer without copying and without
// shared-ownership pointers.
//
// Kernels that read one Volume and write another borrow both through
// `pair_mut`. Kernels that touch several Volumes (concat, split) take the
// written one out of its slot, work, and put it back.
//
// Released indices are reused. Every id carries the generation of its
// index, so an id kept past its Volume's release never reaches the Volume
// that takes the index next.
//
// A Slot is a layer's port. `Slot::place` is the exclusive-owner swap: it
// releases whatever the slot pointed at before pointing at the new Volume,
// and placing the current occupant again does nothing.

use std::fmt;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::{Format, Shape};
use crate::volume::{Role, Volume};

/// Handle to a Volume living in a Workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId {
    index: usize,
    generation: u32,
}

impl VolumeId {
    pub fn index(&self) -> usize {
        self.index
    }

    /// How many times the index was released before this id was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "vol#{}", self.index)
        } else {
            write!(f, "vol#{}.{}", self.index, self.generation)
        }
    }
}

struct Entry<B: Backend> {
    generation: u32,
    volume: Option<Volume<B>>,
}

/// Arena of Volumes on one device.
pub struct Workspace<B: Backend> {
    device: B::Device,
    entries: Vec<Entry<B>>,
    free: Vec<usize>,
}

impl<B: Backend> Workspace<B> {
    pub fn new(device: B::Device) -> Self {
        Workspace {
            device,
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Move an existing Volume into the arena, reusing a released index
    /// when one is free.
    pub fn insert(&mut self, volume: Volume<B>) -> VolumeId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index];
            entry.volume = Some(volume);
            return VolumeId {
                index,
                generation: entry.generation,
            };
        }
        self.entries.push(Entry {
            generation: 0,
            volume: Some(volume),
        });
        VolumeId {
            index: self.entries.len() - 1,
            generation: 0,
        }
    }

    fn entry(&self, id: VolumeId) -> Option<&Entry<B>> {
        self.entries
            .get(id.index)
            .filter(|e| e.generation == id.generation)
    }

    fn entry_mut(&mut self, id: VolumeId) -> Option<&mut Entry<B>> {
        self.entries
            .get_mut(id.index)
            .filter(|e| e.generation == id.generation)
    }

    /// Allocate an intermediate Volume (value + gradient).
    pub fn create(&mut self, shape: Shape, format: Format, dtype: DType) -> Result<VolumeId> {
        let v = Volume::create(shape, format, dtype, true, &self.device)?;
        Ok(self.insert(v))
    }

    /// Allocate a network input Volume (value only).
    pub fn network_input(
        &mut self,
        shape: Shape,
        format: Format,
        dtype: DType,
    ) -> Result<VolumeId> {
        let v = Volume::network_input(shape, format, dtype, &self.device)?;
        Ok(self.insert(v))
    }

    /// Allocate a zero-filled Volume shaped like `id`.
    pub fn zero_clone(&mut self, id: VolumeId) -> Result<VolumeId> {
        let v = self.get(id)?.zero_clone()?;
        Ok(self.insert(v))
    }

    pub fn contains(&self, id: VolumeId) -> bool {
        self.entry(id).is_some_and(|e| e.volume.is_some())
    }

    pub fn get(&self, id: VolumeId) -> Result<&Volume<B>> {
        self.entry(id)
            .and_then(|e| e.volume.as_ref())
            .ok_or_else(|| Error::invariant(format!("{id} is not live")))
    }

    pub fn get_mut(&mut self, id: VolumeId) -> Result<&mut Volume<B>> {
        self.entry_mut(id)
            .and_then(|e| e.volume.as_mut())
            .ok_or_else(|| Error::invariant(format!("{id} is not live")))
    }

    /// Put `volume` in slot `id`, releasing the previous occupant first.
    /// Replacing a Volume with itself (same buffer identity) is a no-op.
    pub fn replace(&mut self, id: VolumeId, volume: Volume<B>) -> Result<()> {
        let slot = &mut self
            .entry_mut(id)
            .ok_or_else(|| Error::invariant(format!("{id} was never allocated")))?
            .volume;
        if let Some(current) = slot.as_ref() {
            if current.id() == volume.id() {
                return Ok(());
            }
        }
        if let Some(mut old) = slot.take() {
            old.destroy();
        }
        *slot = Some(volume);
        Ok(())
    }

    /// Release the Volume in slot `id` and free its index. Releasing an
    /// empty slot or a stale id is a no-op.
    pub fn release(&mut self, id: VolumeId) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        if let Some(mut v) = entry.volume.take() {
            v.destroy();
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(id.index);
        }
    }

    /// Borrow one Volume for reading and another for writing.
    pub fn pair_mut(
        &mut self,
        read: VolumeId,
        write: VolumeId,
    ) -> Result<(&Volume<B>, &mut Volume<B>)> {
        if read == write {
            return Err(Error::invariant(format!(
                "{read} is both input and output of one kernel"
            )));
        }
        self.get(read)?;
        self.get(write)?;
        let (r, w) = if read.index < write.index {
            let (lo, hi) = self.entries.split_at_mut(write.index);
            (lo[read.index].volume.as_ref(), hi[0].volume.as_mut())
        } else {
            let (lo, hi) = self.entries.split_at_mut(read.index);
            (hi[0].volume.as_ref(), lo[write.index].volume.as_mut())
        };
        match (r, w) {
            (Some(r), Some(w)) => Ok((r, w)),
            _ => Err(Error::invariant("volume vanished during borrow")),
        }
    }

    /// Run `f` with the Volume at `id` moved out of the arena, so `f` may
    /// read any other Volume while writing this one. The Volume is put back
    /// whether or not `f` succeeds.
    pub fn with_taken<R>(
        &mut self,
        id: VolumeId,
        f: impl FnOnce(&Self, &mut Volume<B>) -> Result<R>,
    ) -> Result<R> {
        let mut taken = self.take(id)?;
        let out = f(self, &mut taken);
        self.entries[id.index].volume = Some(taken);
        out
    }

    fn take(&mut self, id: VolumeId) -> Result<Volume<B>> {
        self.entry_mut(id)
            .and_then(|e| e.volume.take())
            .ok_or_else(|| Error::invariant(format!("{id} is not live")))
    }

    /// Number of live Volumes.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| e.volume.is_some()).count()
    }

    /// Mark `id` as a network output.
    pub fn mark_output(&mut self, id: VolumeId) -> Result<()> {
        self.get_mut(id)?.set_role(Role::NetworkOutput)
    }
}

impl<B: Backend> fmt::Debug for Workspace<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("device", &self.device)
            .field("live", &self.live_count())
            .field("slots", &self.entries.len())
            .field("free", &self.free.len())
            .finish()
    }
}

/// A layer port: which Volume, if any, it is wired to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot(Option<VolumeId>);

impl Slot {
    pub fn empty() -> Self {
        Slot(None)
    }

    pub fn get(&self) -> Option<VolumeId> {
        self.0
    }

    pub fn is_bound(&self) -> bool {
        self.0.is_some()
    }

    /// The bound id, or an invariant error naming what was expected.
    pub fn require(&self, what: &str) -> Result<VolumeId> {
        self.0
            .ok_or_else(|| Error::invariant(format!("{what} is not wired")))
    }

    /// Point at `id` without touching any previous occupant.
    pub fn bind(&mut self, id: VolumeId) {
        self.0 = Some(id);
    }

    /// Point at `id`, releasing the previous occupant from `ws`.
    /// Placing the current occupant again is a no-op.
    pub fn place<B: Backend>(&mut self, ws: &mut Workspace<B>, id: VolumeId) {
        if self.0 == Some(id) {
            return;
        }
        if let Some(old) = self.0.take() {
            ws.release(old);
        }
        self.0 = Some(id);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}
