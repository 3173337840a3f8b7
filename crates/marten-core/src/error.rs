use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within marten.
///
/// One enum covers every failure mode: shape mismatches, out-of-bounds
/// views, bad slot handles, and lifecycle violations of the layer context.
/// A single error type across the workspace keeps `?` propagation simple.
///
/// Every variant is a programming or configuration error. Nothing here is
/// transient: the library performs no I/O and never retries internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow operation out of bounds along one dimension.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// A flat slice view would reach past the end of the owning storage.
    #[error("slice out of bounds: offset {offset} with extent {extent} exceeds storage of {storage} elements")]
    SliceOutOfBounds {
        offset: usize,
        extent: usize,
        storage: usize,
    },

    /// Element count mismatch when creating a tensor from a flat slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// A matmul operand or destination is not dense (contiguous strides).
    /// Strided views must be materialized with `contiguous()` first.
    #[error("matmul operand `{what}` is not dense; materialize the view first")]
    NotDense { what: &'static str },

    /// Access through a slot handle that was never requested, or that does
    /// not belong to this context. Indicates a finalize/runtime ordering bug.
    #[error("invalid slot handle: index {index}, context holds {count} slots")]
    InvalidHandle { index: usize, count: usize },

    /// A context operation was called in the wrong lifecycle phase
    /// (e.g., requesting a slot after finalize completed).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Rejected layer or slot configuration (zero units, duplicate slot
    /// name, bad input shape at finalize).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for a lifecycle violation.
    pub fn invalid_state(s: impl Into<String>) -> Self {
        Error::InvalidState(s.into())
    }

    /// Shorthand for a rejected configuration.
    pub fn invalid_config(s: impl Into<String>) -> Self {
        Error::InvalidConfig(s.into())
    }
}

/// Convenience Result type used throughout marten.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
