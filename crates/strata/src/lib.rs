//! # Strata
//!
//! A layer engine for convolutional networks wired as a directed graph over
//! a workspace of device Volumes.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use strata::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `strata-core` | Volume, Workspace, Shape, Format, Layout, DType, Backend trait |
//! | `strata-cpu` | Host-memory backend with allocation accounting and rayon convolution |
//! | `strata-nn` | Layers, Concat/Split/Branch, Adam, the Network orchestrator |
//!
//! ## Modules
//!
//! - [`checkpoint`] — Save/load network weights as JSON

/// Re-export core types.
pub use strata_core::{
    backend::{ActivationMode, Backend, BackendDevice, BackendStorage, Blend, PoolMode},
    DType, Error, Format, Layout, Result, Role, Shape, Slot, Volume, VolumeId, WithDType,
    Workspace,
};

/// Re-export CPU backend.
pub use strata_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuVolume, CpuWorkspace};

/// Re-export layers and the orchestrator.
pub mod nn {
    pub use strata_nn::*;
}

/// Checkpoint — save and load network weights.
pub mod checkpoint;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::Checkpoint;
    pub use crate::nn::{
        backward_shared_input, Activation, Adam, AdamConfig, BatchNorm, Branch, Chain, ConvConfig,
        Convolution, Dropout, LayerKind, LossHistory, LossObserver, Module, Network,
        NetworkConfig, NetworkState, PoolConfig, Pooling, Reshape, Trainer,
        TransposedConvolution,
    };
    pub use crate::{
        CpuBackend, CpuDevice, CpuWorkspace, DType, Format, Shape, Volume, VolumeId, Workspace,
    };
}
