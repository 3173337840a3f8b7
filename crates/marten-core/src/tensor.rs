use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BinaryOp, UnaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor — A dense numeric array with shareable storage
//
// A Tensor is a cheap handle (Arc) over storage plus a Layout describing
// how the logical shape maps onto that storage. Several tensors may view
// the same storage block: gate views of a fused [batch, G*unit] buffer,
// timestep rows of a rolling hidden-state buffer, and so on.
//
// MEMORY MODEL:
//
//   Storage sits behind Arc<RwLock<Storage>> so that
//   - cloning a Tensor is O(1) (bump the refcount),
//   - views created by narrow/slice_flat alias the parent's buffer,
//   - in-place ops (gradient accumulation, activation application) write
//     through a view without copying the surrounding block.
//
//   The creating tensor owns the storage for as long as any view exists;
//   views are created inside a computation step and dropped when the
//   enclosing function returns. Nothing long-lived stores a view.
//
// ALIASED OPERANDS:
//
//   When an in-place op's source and destination share one storage block
//   (e.g. composing the new hidden state while reading the previous one
//   from the same rolling buffer), the source is materialized into a
//   private copy first. That preserves the read-before-write ordering the
//   cell algebra requires without taking two locks on one buffer.

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    /// The raw data stored on the backend's device.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset.
    layout: Layout,
    /// Data type of the elements.
    dtype: DType,
    /// The device this tensor lives on.
    device: B::Device,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Type Parameter
/// - `B: Backend` — the compute backend (e.g., `CpuBackend`)
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc::clone is cheap (just increment refcount).
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    fn from_storage(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
            }),
        }
    }

    /// Create a view sharing the same storage with a different layout.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
            }),
        }
    }

    // Accessors

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimensions as a slice (shortcut for shape().dims()).
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device this tensor is on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether this tensor is contiguous in memory.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor is dense (row-major strides, any offset).
    pub fn is_dense(&self) -> bool {
        self.inner.layout.is_dense()
    }

    /// Whether this tensor views the same storage block as `other`.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn storage_len(&self) -> Result<usize> {
        use crate::backend::BackendStorage;
        Ok(self.read_storage()?.len())
    }

    // Creation methods

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor from a flat slice of f64 values.
    /// The data is converted to the specified dtype.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor with random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(storage, layout, dtype, device.clone()))
    }

    /// Create a tensor of zeros with the same shape, dtype, and device.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    // Views — zero-copy aliases over the same storage

    /// Narrow (slice) along one dimension. The result shares storage.
    ///
    /// Timestep `t` of a rolling `[T*batch, unit]` hidden-state buffer is
    /// `narrow(0, t*batch, batch)`: dense rows at an offset.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let layout = self.inner.layout.narrow(dim, start, len)?;
        Ok(self.view_with_layout(layout))
    }

    /// A view with a new shape at an element offset, keeping this tensor's
    /// strides. This splits a fused gate block into per-gate views without
    /// copying: `zrg.slice_flat((batch, unit), 2*unit)` is the candidate
    /// gate of a `[batch, 3*unit]` buffer.
    ///
    /// Fails with `SliceOutOfBounds` if the view would reach past the end
    /// of the owning storage.
    pub fn slice_flat(&self, shape: impl Into<Shape>, elem_offset: usize) -> Result<Self> {
        let layout = self.inner.layout.slice_flat(shape.into(), elem_offset)?;
        let storage = self.storage_len()?;
        let extent = layout.extent();
        if layout.offset() + extent > storage {
            return Err(Error::SliceOutOfBounds {
                offset: layout.offset(),
                extent,
                storage,
            });
        }
        Ok(self.view_with_layout(layout))
    }

    /// Reinterpret a contiguous tensor with a new shape of the same element
    /// count (no data movement). Used to flatten singleton middle axes of
    /// an external input before a matrix product.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        if new_shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: new_shape.clone(),
                expected: self.elem_count(),
                got: new_shape.elem_count(),
            });
        }
        if !self.is_contiguous() {
            return Err(Error::msg(
                "reshape requires a contiguous tensor; call contiguous() first",
            ));
        }
        Ok(self.view_with_layout(Layout::contiguous(new_shape)))
    }

    // Materialization

    /// Copy this (possibly strided) view into a freshly allocated
    /// contiguous tensor with private storage.
    pub fn materialize(&self) -> Result<Self> {
        let shape = self.shape().clone();
        let out_layout = Layout::contiguous(shape.clone());
        let mut out = B::zeros(&shape, self.dtype(), self.device())?;
        {
            let src = self.read_storage()?;
            B::copy_strided(&src, self.layout(), &mut out, &out_layout)?;
        }
        Ok(Self::from_storage(
            out,
            out_layout,
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// Return a contiguous tensor: `self` unchanged if already contiguous,
    /// otherwise a materialized copy. Required before matrix products on
    /// strided gate views.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            Ok(self.clone())
        } else {
            self.materialize()
        }
    }

    // Element-wise operations (allocating)

    /// Element-wise addition into a new tensor. `rhs` may broadcast over
    /// trailing dimensions (e.g. a bias row over a gate block).
    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs)
    }

    /// Element-wise subtraction into a new tensor.
    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs)
    }

    /// Element-wise multiplication into a new tensor.
    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs)
    }

    /// Affine transform into a new tensor: out = self * mul + add.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let storage = {
            let src = self.read_storage()?;
            B::affine(&src, self.layout(), mul, add)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    fn binary(&self, op: BinaryOp, rhs: &Self) -> Result<Self> {
        let rhs_layout = self.operand_layout(rhs)?;
        let storage = if self.shares_storage(rhs) {
            // One read guard serves both sides of the aliased pair.
            let guard = self.read_storage()?;
            B::binary_op(op, &guard, self.layout(), &guard, &rhs_layout)?
        } else {
            let lhs = self.read_storage()?;
            let r = rhs.read_storage()?;
            B::binary_op(op, &lhs, self.layout(), &r, &rhs_layout)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            self.device().clone(),
        ))
    }

    /// The layout that reads `rhs` element-for-element against `self`,
    /// broadcasting a smaller trailing shape when needed.
    fn operand_layout(&self, rhs: &Self) -> Result<Layout> {
        if rhs.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        if rhs.shape() == self.shape() {
            Ok(rhs.layout().clone())
        } else if rhs.shape().broadcasts_to(self.shape()) {
            rhs.layout().broadcast_as(self.shape())
        } else {
            Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: rhs.shape().clone(),
            })
        }
    }

    // Element-wise operations (in place, strided destination supported)

    /// In-place addition: self += rhs. Works through strided views;
    /// broadcasts a trailing-shape rhs (bias row).
    pub fn add_assign(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Add, rhs)
    }

    /// In-place subtraction: self -= rhs.
    pub fn sub_assign(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Sub, rhs)
    }

    /// In-place multiplication: self *= rhs.
    pub fn mul_assign(&self, rhs: &Self) -> Result<()> {
        self.binary_inplace(BinaryOp::Mul, rhs)
    }

    fn binary_inplace(&self, op: BinaryOp, rhs: &Self) -> Result<()> {
        // Aliased source: snapshot it before writing through the view.
        let detached;
        let rhs = if self.shares_storage(rhs) {
            detached = rhs.materialize()?;
            &detached
        } else {
            rhs
        };
        let rhs_layout = self.operand_layout(rhs)?;
        let src = rhs.read_storage()?;
        let mut dst = self.write_storage()?;
        B::binary_assign(op, &mut dst, self.layout(), &src, &rhs_layout)
    }

    /// In-place affine transform: self = self * mul + add.
    pub fn affine_inplace(&self, mul: f64, add: f64) -> Result<()> {
        let mut dst = self.write_storage()?;
        B::affine_assign(&mut dst, self.layout(), mul, add)
    }

    /// In-place unary op (activation application through a gate view).
    pub fn unary_inplace(&self, op: UnaryOp) -> Result<()> {
        let mut dst = self.write_storage()?;
        B::unary_assign(op, &mut dst, self.layout())
    }

    /// Overwrite this tensor's elements with `src`'s (shapes must match).
    /// Either side may be strided; aliased sources are snapshotted first.
    pub fn copy_from(&self, src: &Self) -> Result<()> {
        if src.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        if src.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: src.dtype(),
            });
        }
        let detached;
        let src = if self.shares_storage(src) {
            detached = src.materialize()?;
            &detached
        } else {
            src
        };
        let s = src.read_storage()?;
        let mut dst = self.write_storage()?;
        B::copy_strided(&s, src.layout(), &mut dst, self.layout())
    }

    /// Set every element to zero (gradient-accumulator reset).
    pub fn zero_fill(&self) -> Result<()> {
        self.affine_inplace(0.0, 0.0)
    }

    // Matrix multiplication

    fn dims2(&self) -> Result<(usize, usize)> {
        let d = self.dims();
        if d.len() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: d.len(),
            });
        }
        Ok((d[0], d[1]))
    }

    /// Matrix product into a new tensor: op_a(self) @ op_b(rhs), where the
    /// flags apply an optional transpose.
    pub fn dot(&self, rhs: &Self, trans_lhs: bool, trans_rhs: bool) -> Result<Self> {
        let (ra, ca) = self.dims2()?;
        let (m, _) = if trans_lhs { (ca, ra) } else { (ra, ca) };
        let (rb, cb) = rhs.dims2()?;
        let (_, n) = if trans_rhs { (cb, rb) } else { (rb, cb) };
        let dst = Self::zeros((m, n), self.dtype(), self.device())?;
        self.dot_into(rhs, &dst, trans_lhs, trans_rhs, 0.0)?;
        Ok(dst)
    }

    /// Matrix product with accumulation into an existing tensor:
    /// dst = op_a(self) @ op_b(rhs) + beta * dst.
    ///
    /// All three tensors must be dense (strided gate views must be
    /// materialized first); `dst` may be a dense slice of a larger buffer,
    /// such as one timestep of the hidden-state gradient.
    pub fn dot_into(
        &self,
        rhs: &Self,
        dst: &Self,
        trans_lhs: bool,
        trans_rhs: bool,
        beta: f64,
    ) -> Result<()> {
        if rhs.dtype() != self.dtype() || dst.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: if rhs.dtype() != self.dtype() {
                    rhs.dtype()
                } else {
                    dst.dtype()
                },
            });
        }
        if !self.is_dense() {
            return Err(Error::NotDense { what: "lhs" });
        }
        if !rhs.is_dense() {
            return Err(Error::NotDense { what: "rhs" });
        }
        if !dst.is_dense() {
            return Err(Error::NotDense { what: "dst" });
        }
        let (ra, ca) = self.dims2()?;
        let (m, k) = if trans_lhs { (ca, ra) } else { (ra, ca) };
        let (rb, cb) = rhs.dims2()?;
        let (k2, n) = if trans_rhs { (cb, rb) } else { (rb, cb) };
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        let (dr, dc) = dst.dims2()?;
        if (dr, dc) != (m, n) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((m, n)),
                got: dst.shape().clone(),
            });
        }

        // Snapshot an operand that aliases the destination buffer.
        let lhs_snap;
        let lhs = if dst.shares_storage(self) {
            lhs_snap = self.materialize()?;
            &lhs_snap
        } else {
            self
        };
        let rhs_snap;
        let rhs = if dst.shares_storage(rhs) {
            rhs_snap = rhs.materialize()?;
            &rhs_snap
        } else {
            rhs
        };

        let a = lhs.read_storage()?;
        let b = rhs.read_storage()?;
        let mut c = dst.write_storage()?;
        B::gemm(
            &a,
            lhs.layout(),
            trans_lhs,
            &b,
            rhs.layout(),
            trans_rhs,
            &mut c,
            dst.layout(),
            beta,
        )
    }

    // Reductions

    /// Accumulate column sums into a 1-D tensor: dst[j] += sum_i self[i][j].
    /// `dst` may be a view into a fused bias-gradient vector.
    pub fn sum_rows_into(&self, dst: &Self) -> Result<()> {
        let (_, c) = self.dims2()?;
        if dst.rank() != 1 || dst.dims()[0] != c {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(c),
                got: dst.shape().clone(),
            });
        }
        if dst.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: dst.dtype(),
            });
        }
        let snap;
        let src = if dst.shares_storage(self) {
            snap = self.materialize()?;
            &snap
        } else {
            self
        };
        let s = src.read_storage()?;
        let mut d = dst.write_storage()?;
        B::sum_axis0_acc(&s, src.layout(), &mut d, dst.layout())
    }

    // Randomized fills

    /// Refill this tensor in place with an inverted-scaling dropout mask:
    /// each element becomes 1/(1-rate) with probability 1-rate, else 0.
    pub fn dropout_mask(&self, rate: f64) -> Result<()> {
        if !(0.0..1.0).contains(&rate) {
            return Err(Error::invalid_config(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        let mut dst = self.write_storage()?;
        B::dropout_mask(&mut dst, self.layout(), rate)
    }

    // Host round-trip

    /// Copy the elements to a Vec<f64> in logical order (for inspection
    /// and tests). Strided views read correctly.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let src = self.read_storage()?;
        B::to_f64_vec(&src, self.layout())
    }
}
