use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices
//
// Each backend (CPU today, possibly accelerators later) implements this
// trait, providing its own storage type and kernels. The tensor layer never
// touches raw buffers; it prepares layouts (including strided gate views
// and broadcast bias rows) and hands them to the backend.
//
// Unlike a pure-functional tensor library, this trait exposes in-place
// variants (`*_assign`, `copy_strided`, `gemm` with beta) because the
// recurrent-cell protocol accumulates gradients into long-lived arena
// buffers and writes through aliased views of fused gate blocks.

/// Identifies a compute device (e.g., "cpu").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device.
    fn name(&self) -> String;
}

/// A storage buffer that holds tensor data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

/// Element-wise unary operations (the activation set the cell consumes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Sigmoid,
    Tanh,
}

/// The main Backend trait. Implementing this for a struct (e.g. CpuBackend)
/// makes that struct a complete compute backend for marten.
///
/// All operations take storage + layout (which encodes shape, strides, and
/// offset). Allocating ops return fresh contiguous storage; `*_assign` ops
/// mutate the destination through its layout, which may be strided.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    // Creation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Element-wise ops

    /// Apply a binary op element-wise into fresh contiguous storage:
    /// out[i] = op(lhs[i], rhs[i]). The layouts carry striding/broadcast.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    /// Apply a binary op in place: dst[i] = op(dst[i], src[i]).
    /// The destination layout may be a strided gate view.
    fn binary_assign(
        op: BinaryOp,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
    ) -> Result<()>;

    /// Apply a unary op in place: dst[i] = op(dst[i]).
    fn unary_assign(op: UnaryOp, dst: &mut Self::Storage, dst_layout: &Layout) -> Result<()>;

    /// Affine transform into fresh contiguous storage: out = src * mul + add.
    fn affine(src: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    /// Affine transform in place: dst = dst * mul + add.
    fn affine_assign(dst: &mut Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<()>;

    // Data movement

    /// Copy src into dst element-wise; either side may be strided.
    fn copy_strided(
        src: &Self::Storage,
        src_layout: &Layout,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
    ) -> Result<()>;

    /// Copy data to a Vec<f64> on the host, in logical order.
    fn to_f64_vec(src: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    // Matrix multiplication

    /// General matrix multiply with accumulation:
    /// dst = op_a(A) @ op_b(B) + beta * dst, where op applies an optional
    /// transpose. All three layouts must be dense 2-D; the tensor layer
    /// validates shapes and materializes strided views beforehand.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        trans_lhs: bool,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        trans_rhs: bool,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        beta: f64,
    ) -> Result<()>;

    // Reductions

    /// Accumulate the column sums of a 2-D source into a 1-D destination:
    /// dst[j] += sum_i src[i][j]. Used for bias gradients; the destination
    /// may be a view into a fused bias-gradient vector.
    fn sum_axis0_acc(
        src: &Self::Storage,
        src_layout: &Layout,
        dst: &mut Self::Storage,
        dst_layout: &Layout,
    ) -> Result<()>;

    // Randomized fills

    /// Fill dst in place with an inverted-scaling dropout mask: each element
    /// becomes 1/(1-rate) with probability 1-rate, else 0.
    fn dropout_mask(dst: &mut Self::Storage, layout: &Layout, rate: f64) -> Result<()>;
}
