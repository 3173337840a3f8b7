//! # marten-nn
//!
//! Layer-level building blocks on top of `marten-core`:
//!
//! 1. **LayerContext** — per-layer arena of weight and scratch-tensor slots,
//!    resolved through stable [`SlotId`] handles
//! 2. **Initializers** — declarative parameter initialization recorded on
//!    each slot
//! 3. **Activations** — in-place gate activations with derivative-from-output
//! 4. **GruCell** — single-timestep GRU driven by the three-call
//!    backpropagation-through-time protocol
//!
//! Layers are generic over [`Backend`](marten_core::backend::Backend), so
//! the same cell definition runs on any backend that implements the kernel
//! contract.

pub mod activation;
pub mod context;
pub mod grucell;
pub mod init;

pub use activation::Activation;
pub use context::{LayerContext, Lifespan, SlotId, WeightRegularizer};
pub use grucell::{
    BiasMode, GatingOrder, GradPhase, GruCell, GruCellConfig, DROPOUT_EPSILON,
};
pub use init::Initializer;
