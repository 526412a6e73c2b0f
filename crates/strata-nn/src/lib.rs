//! # strata-nn
//!
//! Layers and the orchestrator that wires them into a trainable network.
//!
//! Layers do not own the Volumes flowing through them; they hold ports into
//! a [`Workspace`](strata_core::Workspace) and own only their weights:
//!
//! 1. **Module trait**: shape inference, wiring, forward and backward
//! 2. **Convolution / TransposedConvolution**: sliding-window layers sized
//!    by [`window`] arithmetic
//! 3. **Activation, Pooling, Dropout, BatchNorm, Reshape**
//! 4. **SoftmaxClassifier**: softmax with cross-entropy loss
//! 5. **Concat / Split / Branch**: channel-axis fan-in and fan-out
//! 6. **Trainers**: per-weight Adam state
//! 7. **Network**: build, init, trainer negotiation and the three sweeps
//!
//! Modules are generic over `Backend`, so one network definition runs on
//! any device that implements the kernel contract.

pub mod activation;
pub mod batchnorm;
pub mod branch;
pub mod chain;
pub mod concat;
pub mod config;
pub mod conv;
pub mod dropout;
pub mod module;
pub mod network;
pub mod param;
pub mod pool;
pub mod record;
pub mod reshape;
pub mod softmax;
pub mod trainer;
pub mod window;

pub use activation::Activation;
pub use batchnorm::BatchNorm;
pub use branch::Branch;
pub use chain::Chain;
pub use concat::{Concat, Split};
pub use config::NetworkConfig;
pub use conv::{ConvConfig, Convolution, TransposedConvolution};
pub use dropout::Dropout;
pub use module::{check_trainer_count, LayerId, LayerKind, Ledger, Module, Ports};
pub use network::{backward_shared_input, Network, NetworkState};
pub use pool::{PoolConfig, Pooling};
pub use record::{LayerRecord, TensorRecord};
pub use reshape::Reshape;
pub use softmax::{LossHistory, LossObserver, SoftmaxClassifier};
pub use trainer::{Adam, AdamConfig, Trainer};
pub use window::{
    output_dims, output_extent, recommend_padding, reverse_output_dims, reverse_output_extent,
};
