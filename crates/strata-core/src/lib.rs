//! # strata-core
//!
//! Device buffers and the metadata that describes them.
//!
//! This crate provides:
//! - [`Volume`] — a value buffer plus its gradient, released exactly once
//! - [`Workspace`] — the arena that owns flowing Volumes, addressed by [`VolumeId`]
//! - [`Shape`] / [`Format`] / [`Layout`] — extents, channel placement, packed and strided descriptors
//! - [`DType`] — element types (F16, BF16, F32, F64)
//! - [`Backend`] trait — the compute-backend contract every device implements

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod volume;
pub mod workspace;

pub use backend::{
    ActivationMode, AdamParams, Backend, BackendDevice, BackendStorage, Blend, ConvParams, Dst,
    NormState, PoolMode, PoolParams, Src,
};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::{Format, Shape};
pub use volume::{BufferId, Role, Volume};
pub use workspace::{Slot, VolumeId, Workspace};
