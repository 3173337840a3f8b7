//! # marten-cpu
//!
//! CPU backend for marten. Storage is a plain `Vec` per dtype; kernels in
//! [`kernels`] walk it through strided layouts, so gate views and broadcast
//! bias rows work without copies. Matrix multiplies parallelize over output
//! rows with rayon.

use marten_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, UnaryOp};
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

mod kernels;

/// The single CPU device.
#[derive(Debug, Clone)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// CPU storage: one typed Vec per supported dtype.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
        }
    }
}

/// The CPU compute backend.
#[derive(Debug, Clone)]
pub struct CpuBackend;

/// Tensor specialized to the CPU backend.
pub type CpuTensor = Tensor<CpuBackend>;

fn alloc(val: f64, count: usize, dtype: DType) -> CpuStorage {
    match dtype {
        DType::F32 => CpuStorage::F32(vec![val as f32; count]),
        DType::F64 => CpuStorage::F64(vec![val; count]),
    }
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(alloc(0.0, shape.elem_count(), dtype))
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(alloc(val, shape.elem_count(), dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(match dtype {
            DType::F32 => CpuStorage::F32(data.iter().map(|&v| v as f32).collect()),
            DType::F64 => CpuStorage::F64(data.to_vec()),
        })
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F32 => CpuStorage::F32(kernels::rand_uniform::<f32>(n)),
            DType::F64 => CpuStorage::F64(kernels::rand_uniform::<f64>(n)),
        })
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        match (lhs, rhs) {
            (CpuStorage::F32(a), CpuStorage::F32(b)) => Ok(CpuStorage::F32(kernels::binary(
                op, a, lhs_layout, b, rhs_layout,
            )?)),
            (CpuStorage::F64(a), CpuStorage::F64(b)) => Ok(CpuStorage::F64(kernels::binary(
                op, a, lhs_layout, b, rhs_layout,
            )?)),
            (lhs, rhs) => Err(Error::DTypeMismatch {
                expected: lhs.dtype(),
                got: rhs.dtype(),
            }),
        }
    }

    fn binary_assign(
        op: BinaryOp,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
    ) -> Result<()> {
        match (dst, src) {
            (CpuStorage::F32(d), CpuStorage::F32(s)) => {
                kernels::binary_assign(op, d, dst_layout, s, src_layout)
            }
            (CpuStorage::F64(d), CpuStorage::F64(s)) => {
                kernels::binary_assign(op, d, dst_layout, s, src_layout)
            }
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn unary_assign(op: UnaryOp, dst: &mut CpuStorage, dst_layout: &Layout) -> Result<()> {
        match dst {
            CpuStorage::F32(d) => kernels::unary_assign(op, d, dst_layout),
            CpuStorage::F64(d) => kernels::unary_assign(op, d, dst_layout),
        }
    }

    fn affine(src: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(match src {
            CpuStorage::F32(s) => CpuStorage::F32(kernels::affine(s, layout, mul, add)?),
            CpuStorage::F64(s) => CpuStorage::F64(kernels::affine(s, layout, mul, add)?),
        })
    }

    fn affine_assign(dst: &mut CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<()> {
        match dst {
            CpuStorage::F32(d) => kernels::affine_assign(d, layout, mul, add),
            CpuStorage::F64(d) => kernels::affine_assign(d, layout, mul, add),
        }
    }

    fn copy_strided(
        src: &CpuStorage,
        src_layout: &Layout,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
    ) -> Result<()> {
        match (dst, src) {
            (CpuStorage::F32(d), CpuStorage::F32(s)) => {
                kernels::copy_strided(s, src_layout, d, dst_layout)
            }
            (CpuStorage::F64(d), CpuStorage::F64(s)) => {
                kernels::copy_strided(s, src_layout, d, dst_layout)
            }
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn to_f64_vec(src: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        match src {
            CpuStorage::F32(s) => kernels::to_f64_vec(s, layout),
            CpuStorage::F64(s) => kernels::to_f64_vec(s, layout),
        }
    }

    fn gemm(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        trans_lhs: bool,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        trans_rhs: bool,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        beta: f64,
    ) -> Result<()> {
        match (dst, lhs, rhs) {
            (CpuStorage::F32(c), CpuStorage::F32(a), CpuStorage::F32(b)) => kernels::gemm(
                a, lhs_layout, trans_lhs, b, rhs_layout, trans_rhs, c, dst_layout, beta,
            ),
            (CpuStorage::F64(c), CpuStorage::F64(a), CpuStorage::F64(b)) => kernels::gemm(
                a, lhs_layout, trans_lhs, b, rhs_layout, trans_rhs, c, dst_layout, beta,
            ),
            (d, l, _) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: l.dtype(),
            }),
        }
    }

    fn sum_axis0_acc(
        src: &CpuStorage,
        src_layout: &Layout,
        dst: &mut CpuStorage,
        dst_layout: &Layout,
    ) -> Result<()> {
        match (dst, src) {
            (CpuStorage::F32(d), CpuStorage::F32(s)) => {
                kernels::sum_axis0_acc(s, src_layout, d, dst_layout)
            }
            (CpuStorage::F64(d), CpuStorage::F64(s)) => {
                kernels::sum_axis0_acc(s, src_layout, d, dst_layout)
            }
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn dropout_mask(dst: &mut CpuStorage, layout: &Layout, rate: f64) -> Result<()> {
        match dst {
            CpuStorage::F32(d) => kernels::dropout_mask(d, layout, rate),
            CpuStorage::F64(d) => kernels::dropout_mask(d, layout, rate),
        }
    }
}
