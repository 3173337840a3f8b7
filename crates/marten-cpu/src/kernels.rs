use marten_core::backend::{BinaryOp, UnaryOp};
use marten_core::dtype::WithDType;
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use rayon::prelude::*;

// Strided CPU kernels, generic over the element type.
//
// Every kernel walks storage through Layout::strided_indices, so gate
// views (non-unit row stride), timestep slices (dense with offset), and
// broadcast bias rows (stride 0) all read/write correctly. Arithmetic goes
// through f64: exact for F64 tensors (which the gradient checks use) and
// well within tolerance for F32.

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
    }
}

fn apply_unary(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Tanh => x.tanh(),
    }
}

fn check_same_len(lhs: &Layout, rhs: &Layout) -> Result<()> {
    if lhs.elem_count() != rhs.elem_count() {
        return Err(Error::msg(format!(
            "kernel element count mismatch: {} vs {}",
            lhs.elem_count(),
            rhs.elem_count()
        )));
    }
    Ok(())
}

pub fn binary<T: WithDType>(
    op: BinaryOp,
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
) -> Result<Vec<T>> {
    check_same_len(lhs_layout, rhs_layout)?;
    let mut out = Vec::with_capacity(lhs_layout.elem_count());
    for (li, ri) in lhs_layout.strided_indices().zip(rhs_layout.strided_indices()) {
        out.push(T::from_f64(apply_binary(
            op,
            lhs[li].to_f64(),
            rhs[ri].to_f64(),
        )));
    }
    Ok(out)
}

pub fn binary_assign<T: WithDType>(
    op: BinaryOp,
    dst: &mut [T],
    dst_layout: &Layout,
    src: &[T],
    src_layout: &Layout,
) -> Result<()> {
    check_same_len(dst_layout, src_layout)?;
    for (di, si) in dst_layout.strided_indices().zip(src_layout.strided_indices()) {
        dst[di] = T::from_f64(apply_binary(op, dst[di].to_f64(), src[si].to_f64()));
    }
    Ok(())
}

pub fn unary_assign<T: WithDType>(op: UnaryOp, dst: &mut [T], layout: &Layout) -> Result<()> {
    for i in layout.strided_indices() {
        dst[i] = T::from_f64(apply_unary(op, dst[i].to_f64()));
    }
    Ok(())
}

pub fn affine<T: WithDType>(src: &[T], layout: &Layout, mul: f64, add: f64) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(layout.elem_count());
    for i in layout.strided_indices() {
        out.push(T::from_f64(src[i].to_f64() * mul + add));
    }
    Ok(out)
}

pub fn affine_assign<T: WithDType>(dst: &mut [T], layout: &Layout, mul: f64, add: f64) -> Result<()> {
    for i in layout.strided_indices() {
        dst[i] = T::from_f64(dst[i].to_f64() * mul + add);
    }
    Ok(())
}

pub fn copy_strided<T: WithDType>(
    src: &[T],
    src_layout: &Layout,
    dst: &mut [T],
    dst_layout: &Layout,
) -> Result<()> {
    check_same_len(dst_layout, src_layout)?;
    for (si, di) in src_layout.strided_indices().zip(dst_layout.strided_indices()) {
        dst[di] = src[si];
    }
    Ok(())
}

pub fn to_f64_vec<T: WithDType>(src: &[T], layout: &Layout) -> Result<Vec<f64>> {
    Ok(layout.strided_indices().map(|i| src[i].to_f64()).collect())
}

/// dst = op_a(A) @ op_b(B) + beta * dst over dense 2-D layouts.
///
/// Offsets locate each operand inside a larger arena buffer (e.g. one
/// timestep slice of a hidden-state gradient). Accumulation runs in f64;
/// output rows are computed in parallel.
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: WithDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    trans_lhs: bool,
    rhs: &[T],
    rhs_layout: &Layout,
    trans_rhs: bool,
    dst: &mut [T],
    dst_layout: &Layout,
    beta: f64,
) -> Result<()> {
    let (ra, ca) = dims2(lhs_layout)?;
    let (rb, cb) = dims2(rhs_layout)?;
    let (m, k) = if trans_lhs { (ca, ra) } else { (ra, ca) };
    let (k2, n) = if trans_rhs { (cb, rb) } else { (rb, cb) };
    if k != k2 {
        return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
    }
    let (dr, dc) = dims2(dst_layout)?;
    if (dr, dc) != (m, n) {
        return Err(Error::msg(format!(
            "gemm destination is [{dr}x{dc}], expected [{m}x{n}]"
        )));
    }

    let a = &lhs[lhs_layout.offset()..lhs_layout.offset() + lhs_layout.elem_count()];
    let b = &rhs[rhs_layout.offset()..rhs_layout.offset() + rhs_layout.elem_count()];
    let off = dst_layout.offset();
    let c = &mut dst[off..off + dst_layout.elem_count()];

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, out) in row.iter_mut().enumerate() {
            let mut acc = beta * out.to_f64();
            for p in 0..k {
                let av = if trans_lhs { a[p * ca + i] } else { a[i * ca + p] };
                let bv = if trans_rhs { b[j * cb + p] } else { b[p * cb + j] };
                acc += av.to_f64() * bv.to_f64();
            }
            *out = T::from_f64(acc);
        }
    });
    Ok(())
}

fn dims2(layout: &Layout) -> Result<(usize, usize)> {
    let d = layout.dims();
    if d.len() != 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: d.len(),
        });
    }
    Ok((d[0], d[1]))
}

/// dst[j] += sum over rows i of src[i][j]; dst may be a strided view into
/// a fused bias-gradient vector.
pub fn sum_axis0_acc<T: WithDType>(
    src: &[T],
    src_layout: &Layout,
    dst: &mut [T],
    dst_layout: &Layout,
) -> Result<()> {
    let (_, c) = dims2(src_layout)?;
    if dst_layout.elem_count() != c {
        return Err(Error::msg(format!(
            "sum_axis0_acc destination has {} elements, expected {}",
            dst_layout.elem_count(),
            c
        )));
    }
    let dst_idx: Vec<usize> = dst_layout.strided_indices().collect();
    for (flat, si) in src_layout.strided_indices().enumerate() {
        let di = dst_idx[flat % c];
        dst[di] = T::from_f64(dst[di].to_f64() + src[si].to_f64());
    }
    Ok(())
}

/// Fill with an inverted-scaling Bernoulli keep mask: 1/(1-rate) with
/// probability 1-rate, else 0.
pub fn dropout_mask<T: WithDType>(dst: &mut [T], layout: &Layout, rate: f64) -> Result<()> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let scale = 1.0 / (1.0 - rate);
    for i in layout.strided_indices() {
        let keep = rng.gen::<f64>() >= rate;
        dst[i] = T::from_f64(if keep { scale } else { 0.0 });
    }
    Ok(())
}

pub fn rand_uniform<T: WithDType>(count: usize) -> Vec<T> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..count).map(|_| T::from_f64(rng.gen::<f64>())).collect()
}
