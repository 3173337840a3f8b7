//! # marten-core
//!
//! Core tensor primitives for marten: shapes, strided layouts, the backend
//! trait, and the dense [`Tensor`] type with zero-copy views.
//!
//! This crate provides:
//! - [`Shape`] / [`Layout`] — shape, strides, offset, and contiguity
//! - [`DType`] — element types (F32, F64)
//! - [`Backend`] trait — abstraction over compute kernels (CPU today)
//! - [`Tensor`] — n-dimensional array with aliasing views, strided
//!   in-place ops, and GEMM with transpose/accumulate, the substrate the
//!   recurrent-cell layers are written against
//!
//! There is no autodiff graph here: layer gradients are computed by
//! hand-written layer code in `marten-nn`, which is why the tensor surface
//! leans on in-place accumulation rather than op recording.

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, UnaryOp};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::Tensor;
