// Integration tests for the GRU cell's three-call protocol
//
// The driver contract mirrored here: forward over increasing timesteps;
// then, per timestep in strictly decreasing order, re-run forward(t) to
// repopulate the per-call gate buffer, call calc_gradient(t), and read the
// input gradient with calc_derivative. Gradient correctness is pinned by a
// closed-form single-unit oracle and by finite differences over a
// 3-timestep sequence for every bias-mode / gating-order combination.

use marten_core::dtype::DType;
use marten_core::error::Error;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_nn::{
    BiasMode, GatingOrder, GradPhase, GruCell, GruCellConfig, LayerContext,
};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn tensor(data: &[f64], shape: impl Into<Shape>) -> CpuTensor {
    Tensor::<CpuBackend>::from_f64_slice(data, shape, DType::F64, &CpuDevice).unwrap()
}

/// Build a sealed context for the cell over a `[batch, feature]` input.
fn build(
    cfg: GruCellConfig,
    batch: usize,
    feature: usize,
) -> (GruCell, LayerContext<CpuBackend>) {
    let mut ctx = LayerContext::<CpuBackend>::new(DType::F64, CpuDevice);
    let mut cell = GruCell::new(cfg).unwrap();
    let out = cell
        .finalize(&mut ctx, &Shape::from((batch, feature)))
        .unwrap();
    assert_eq!(out.dims(), &[batch, cfg.unit]);
    ctx.seal().unwrap();
    (cell, ctx)
}

/// Overwrite a named weight with a constant.
fn fill_weight(ctx: &LayerContext<CpuBackend>, name: &str, val: f64) {
    for (n, _, _, w, _) in ctx.weights() {
        if n == name {
            w.affine_inplace(0.0, val).unwrap();
            return;
        }
    }
    panic!("no weight named {name}");
}

/// Overwrite a named weight with explicit values.
fn set_weight(ctx: &LayerContext<CpuBackend>, name: &str, data: &[f64]) {
    for (n, _, _, w, _) in ctx.weights() {
        if n == name {
            w.copy_from(&tensor(data, w.shape().clone())).unwrap();
            return;
        }
    }
    panic!("no weight named {name}");
}

/// Deterministic nonzero weight fill for gradient checks.
fn seed_weights(ctx: &LayerContext<CpuBackend>) {
    for (seed, (_, _, _, w, _)) in ctx.weights().enumerate() {
        let n = w.elem_count();
        let vals: Vec<f64> = (0..n)
            .map(|k| 0.4 * ((seed * 31 + k) as f64 * 0.7).sin())
            .collect();
        w.copy_from(&tensor(&vals, w.shape().clone())).unwrap();
    }
}

/// Run the forward pass over the whole sequence and return the summed
/// outputs (the scalar loss used by the finite-difference check).
fn run_forward(
    cell: &GruCell,
    ctx: &LayerContext<CpuBackend>,
    inputs: &[CpuTensor],
    batch: usize,
) -> f64 {
    let unit = cell.config().unit;
    let mut loss = 0.0;
    for (t, x) in inputs.iter().enumerate() {
        let out = Tensor::<CpuBackend>::zeros((batch, unit), DType::F64, &CpuDevice).unwrap();
        cell.forward(ctx, x, &out, t, true).unwrap();
        loss += out.to_f64_vec().unwrap().iter().sum::<f64>();
    }
    loss
}

/// Full reverse pass with an all-ones incoming gradient at every timestep.
fn run_backward(cell: &GruCell, ctx: &LayerContext<CpuBackend>, inputs: &[CpuTensor], batch: usize) {
    let unit = cell.config().unit;
    let ones = Tensor::<CpuBackend>::ones((batch, unit), DType::F64, &CpuDevice).unwrap();
    for t in (0..inputs.len()).rev() {
        // Repopulate the per-call gate buffer for this timestep.
        let out = Tensor::<CpuBackend>::zeros((batch, unit), DType::F64, &CpuDevice).unwrap();
        cell.forward(ctx, &inputs[t], &out, t, true).unwrap();
        let phase = if t + 1 == inputs.len() {
            GradPhase::SequenceStart
        } else {
            GradPhase::Accumulate
        };
        cell.calc_gradient(ctx, &inputs[t], &ones, t, phase).unwrap();
    }
}

// Forward oracle

#[test]
fn test_forward_matches_hand_computation() -> marten_core::Result<()> {
    // unit=2, batch=1, feature=2, T=2, all weights 0.1, biases zero,
    // input [1, 1] at both timesteps. Every unit behaves identically, so
    // the whole cell reduces to scalar algebra.
    let cfg = GruCellConfig::new(2, 2);
    let (cell, ctx) = build(cfg, 1, 2);
    fill_weight(&ctx, "weight_ih", 0.1);
    fill_weight(&ctx, "weight_hh", 0.1);

    let x = tensor(&[1.0, 1.0], (1, 2));
    let out0 = Tensor::<CpuBackend>::zeros((1, 2), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &out0, 0, false)?;

    // t=0: pre-activations are all x·W = 0.2; previous hidden is zero.
    let z0 = sigmoid(0.2);
    let g0 = (0.2f64).tanh();
    let h0 = (1.0 - z0) * g0;
    assert_vec_approx(&out0.to_f64_vec()?, &[h0, h0], 1e-12);

    let out1 = Tensor::<CpuBackend>::zeros((1, 2), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &out1, 1, false)?;

    // t=1: recurrent contribution 0.2*h0 on each gate column block.
    let z1 = sigmoid(0.2 + 0.2 * h0);
    let r1 = z1;
    let g1 = (0.2 + r1 * 0.2 * h0).tanh();
    let h1 = z1 * h0 + (1.0 - z1) * g1;
    assert_vec_approx(&out1.to_f64_vec()?, &[h1, h1], 1e-12);
    Ok(())
}

// Closed-form gradient oracle

#[test]
fn test_zero_weight_gradients_closed_form() -> marten_core::Result<()> {
    // unit=1, feature=2, T=1, all weights and biases zero, input [1, 1],
    // incoming gradient 1. With W = 0: z = r = 1/2, g = 0, h = 0, and
    //   dL/dg_pre = (1 - z) * tanh'(0) = 1/2
    //   dL/dz_pre = dL/dr_pre = 0
    // so d_weight_ih = [[0, 0, 1/2], [0, 0, 1/2]], d_weight_hh = 0,
    // d_bias_ih = [0, 0, 1/2], d_bias_hh = [0, 0, 1/4] (candidate share
    // times the reset gate), and d_input = 0.
    let mut cfg = GruCellConfig::new(1, 1);
    cfg.bias_mode = BiasMode::Split;
    cfg.gating_order = GatingOrder::ResetAfter;
    let (cell, ctx) = build(cfg, 1, 2);
    fill_weight(&ctx, "weight_ih", 0.0);
    fill_weight(&ctx, "weight_hh", 0.0);

    let x = tensor(&[1.0, 1.0], (1, 2));
    let out = Tensor::<CpuBackend>::zeros((1, 1), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &out, 0, false)?;
    assert_vec_approx(&out.to_f64_vec()?, &[0.0], 1e-12);

    let ones = Tensor::<CpuBackend>::ones((1, 1), DType::F64, &CpuDevice)?;
    cell.calc_gradient(&ctx, &x, &ones, 0, GradPhase::SequenceStart)?;

    let grads: Vec<(String, Vec<f64>)> = ctx
        .weights()
        .map(|(n, _, _, _, g)| (n.to_string(), g.to_f64_vec().unwrap()))
        .collect();
    for (name, g) in &grads {
        match name.as_str() {
            "weight_ih" => assert_vec_approx(g, &[0.0, 0.0, 0.5, 0.0, 0.0, 0.5], 1e-12),
            "weight_hh" => assert_vec_approx(g, &[0.0, 0.0, 0.0], 1e-12),
            "bias_ih" => assert_vec_approx(g, &[0.0, 0.0, 0.5], 1e-12),
            "bias_hh" => assert_vec_approx(g, &[0.0, 0.0, 0.25], 1e-12),
            other => panic!("unexpected weight {other}"),
        }
    }

    let d_input = Tensor::<CpuBackend>::zeros((1, 2), DType::F64, &CpuDevice)?;
    cell.calc_derivative(&ctx, &d_input)?;
    assert_vec_approx(&d_input.to_f64_vec()?, &[0.0, 0.0], 1e-12);
    Ok(())
}

// Finite-difference gradient check

fn finite_difference_check(bias_mode: BiasMode, gating_order: GatingOrder) {
    let (batch, feature, unit, steps) = (2usize, 3usize, 2usize, 3usize);
    let mut cfg = GruCellConfig::new(unit, steps);
    cfg.bias_mode = bias_mode;
    cfg.gating_order = gating_order;
    let (cell, ctx) = build(cfg, batch, feature);
    seed_weights(&ctx);

    let inputs: Vec<CpuTensor> = (0..steps)
        .map(|t| {
            let vals: Vec<f64> = (0..batch * feature)
                .map(|k| 0.8 * ((t * 17 + k) as f64 * 0.45).cos())
                .collect();
            tensor(&vals, (batch, feature))
        })
        .collect();

    run_forward(&cell, &ctx, &inputs, batch);
    run_backward(&cell, &ctx, &inputs, batch);

    let analytic: Vec<(String, Vec<f64>)> = ctx
        .weights()
        .map(|(n, _, _, _, g)| (n.to_string(), g.to_f64_vec().unwrap()))
        .collect();

    let eps = 1e-6;
    for (name, grad) in &analytic {
        let weight = ctx
            .weights()
            .find(|(n, ..)| *n == name.as_str())
            .map(|(_, _, _, w, _)| w.clone())
            .unwrap();
        let base = weight.to_f64_vec().unwrap();
        for (k, analytic_gk) in grad.iter().enumerate() {
            let mut bumped = base.clone();
            bumped[k] = base[k] + eps;
            weight
                .copy_from(&tensor(&bumped, weight.shape().clone()))
                .unwrap();
            let plus = run_forward(&cell, &ctx, &inputs, batch);
            bumped[k] = base[k] - eps;
            weight
                .copy_from(&tensor(&bumped, weight.shape().clone()))
                .unwrap();
            let minus = run_forward(&cell, &ctx, &inputs, batch);
            weight
                .copy_from(&tensor(&base, weight.shape().clone()))
                .unwrap();
            let numeric = (plus - minus) / (2.0 * eps);
            assert!(
                approx_eq(*analytic_gk, numeric, 1e-3 * numeric.abs().max(1.0)),
                "{name}[{k}] ({bias_mode:?}/{gating_order:?}): analytic {analytic_gk}, numeric {numeric}"
            );
        }
    }
}

#[test]
fn test_bptt_gradients_none_reset_after() {
    finite_difference_check(BiasMode::None, GatingOrder::ResetAfter);
}

#[test]
fn test_bptt_gradients_none_reset_before() {
    finite_difference_check(BiasMode::None, GatingOrder::ResetBefore);
}

#[test]
fn test_bptt_gradients_fused_reset_after() {
    finite_difference_check(BiasMode::Fused, GatingOrder::ResetAfter);
}

#[test]
fn test_bptt_gradients_fused_reset_before() {
    finite_difference_check(BiasMode::Fused, GatingOrder::ResetBefore);
}

#[test]
fn test_bptt_gradients_split_reset_after() {
    finite_difference_check(BiasMode::Split, GatingOrder::ResetAfter);
}

#[test]
fn test_bptt_gradients_split_reset_before() {
    finite_difference_check(BiasMode::Split, GatingOrder::ResetBefore);
}

// Mode equivalences

#[test]
fn test_split_bias_matches_fused() -> marten_core::Result<()> {
    // Under reset-before gating both split halves are added after the
    // candidate matmul, so split(b_ih, b_hh) == fused(b_ih + b_hh) exactly.
    let (batch, feature, unit, steps) = (2usize, 2usize, 3usize, 2usize);
    let half: Vec<f64> = (0..3 * unit).map(|k| 0.05 * (k as f64 + 1.0)).collect();
    let full: Vec<f64> = half.iter().map(|v| 2.0 * v).collect();

    let mut split_cfg = GruCellConfig::new(unit, steps);
    split_cfg.bias_mode = BiasMode::Split;
    split_cfg.gating_order = GatingOrder::ResetBefore;
    let (split_cell, split_ctx) = build(split_cfg, batch, feature);
    seed_weights(&split_ctx);
    set_weight(&split_ctx, "bias_ih", &half);
    set_weight(&split_ctx, "bias_hh", &half);

    let mut fused_cfg = GruCellConfig::new(unit, steps);
    fused_cfg.bias_mode = BiasMode::Fused;
    fused_cfg.gating_order = GatingOrder::ResetBefore;
    let (fused_cell, fused_ctx) = build(fused_cfg, batch, feature);
    // Same weight matrices as the split cell (same deterministic seeding
    // by request order), then the summed bias.
    seed_weights(&fused_ctx);
    set_weight(&fused_ctx, "bias_h", &full);

    let x = tensor(&[0.3, -0.2, 0.5, 0.1], (batch, feature));
    for t in 0..steps {
        let a = Tensor::<CpuBackend>::zeros((batch, unit), DType::F64, &CpuDevice)?;
        let b = Tensor::<CpuBackend>::zeros((batch, unit), DType::F64, &CpuDevice)?;
        split_cell.forward(&split_ctx, &x, &a, t, false)?;
        fused_cell.forward(&fused_ctx, &x, &b, t, false)?;
        assert_vec_approx(&a.to_f64_vec()?, &b.to_f64_vec()?, 1e-12);
    }
    Ok(())
}

#[test]
fn test_gating_orders_agree_when_reset_is_one() -> marten_core::Result<()> {
    // A large reset-gate bias saturates sigmoid to 1, which collapses the
    // two gating orders onto the same candidate formula.
    let (batch, feature, unit, steps) = (1usize, 2usize, 2usize, 3usize);
    let mut bias = vec![0.0; 3 * unit];
    for b in bias.iter_mut().take(2 * unit).skip(unit) {
        *b = 40.0;
    }

    let mut outputs = Vec::new();
    for order in [GatingOrder::ResetAfter, GatingOrder::ResetBefore] {
        let mut cfg = GruCellConfig::new(unit, steps);
        cfg.bias_mode = BiasMode::Fused;
        cfg.gating_order = order;
        let (cell, ctx) = build(cfg, batch, feature);
        seed_weights(&ctx);
        set_weight(&ctx, "bias_h", &bias);

        let x = tensor(&[0.4, -0.3], (batch, feature));
        let mut run = Vec::new();
        for t in 0..steps {
            let out = Tensor::<CpuBackend>::zeros((batch, unit), DType::F64, &CpuDevice)?;
            cell.forward(&ctx, &x, &out, t, false)?;
            run.extend(out.to_f64_vec()?);
        }
        outputs.push(run);
    }
    assert_vec_approx(&outputs[0], &outputs[1], 1e-9);
    Ok(())
}

// Dropout

#[test]
fn test_dropout_disabled_training_matches_eval() -> marten_core::Result<()> {
    let (cell, ctx) = build(GruCellConfig::new(3, 1), 2, 2);
    seed_weights(&ctx);
    let x = tensor(&[0.1, 0.2, 0.3, 0.4], (2, 2));
    let train = Tensor::<CpuBackend>::zeros((2, 3), DType::F64, &CpuDevice)?;
    let eval = Tensor::<CpuBackend>::zeros((2, 3), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &train, 0, true)?;
    cell.forward(&ctx, &x, &eval, 0, false)?;
    assert_vec_approx(&train.to_f64_vec()?, &eval.to_f64_vec()?, 1e-12);
    Ok(())
}

#[test]
fn test_dropout_scales_or_zeroes_each_element() -> marten_core::Result<()> {
    let mut cfg = GruCellConfig::new(4, 1);
    cfg.dropout_rate = 0.5;
    let (cell, ctx) = build(cfg, 8, 3);
    seed_weights(&ctx);
    let vals: Vec<f64> = (0..24).map(|k| 0.3 * (k as f64 * 0.9).sin()).collect();
    let x = tensor(&vals, (8, 3));

    let eval = Tensor::<CpuBackend>::zeros((8, 4), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &eval, 0, false)?;
    let train = Tensor::<CpuBackend>::zeros((8, 4), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &train, 0, true)?;

    let e = eval.to_f64_vec()?;
    let t = train.to_f64_vec()?;
    for (i, (tv, ev)) in t.iter().zip(e.iter()).enumerate() {
        assert!(
            approx_eq(*tv, 0.0, 1e-12) || approx_eq(*tv, 2.0 * ev, 1e-9),
            "element {i}: train {tv}, eval {ev}"
        );
    }
    Ok(())
}

// Batch resizing and bounds

#[test]
fn test_set_batch_resizes_and_is_idempotent() -> marten_core::Result<()> {
    let (cell, mut ctx) = build(GruCellConfig::new(2, 2), 2, 2);
    seed_weights(&ctx);

    // Larger batch after finalize.
    cell.set_batch(&mut ctx, 4)?;
    let x0 = tensor(&(0..8).map(|k| 0.1 * k as f64).collect::<Vec<_>>(), (4, 2));
    let out0 = Tensor::<CpuBackend>::zeros((4, 2), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x0, &out0, 0, false)?;

    // Redundant set_batch must not wipe the timestep-0 hidden state.
    cell.set_batch(&mut ctx, 4)?;
    let out1 = Tensor::<CpuBackend>::zeros((4, 2), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x0, &out1, 1, false)?;

    // Reference: the same two steps without the redundant resize.
    let (ref_cell, mut ref_ctx) = build(GruCellConfig::new(2, 2), 2, 2);
    for ((_, _, _, w, _), (_, _, _, rw, _)) in ctx.weights().zip(ref_ctx.weights()) {
        rw.copy_from(w)?;
    }
    ref_cell.set_batch(&mut ref_ctx, 4)?;
    let r0 = Tensor::<CpuBackend>::zeros((4, 2), DType::F64, &CpuDevice)?;
    let r1 = Tensor::<CpuBackend>::zeros((4, 2), DType::F64, &CpuDevice)?;
    ref_cell.forward(&ref_ctx, &x0, &r0, 0, false)?;
    ref_cell.forward(&ref_ctx, &x0, &r1, 1, false)?;

    assert_vec_approx(&out0.to_f64_vec()?, &r0.to_f64_vec()?, 1e-12);
    assert_vec_approx(&out1.to_f64_vec()?, &r1.to_f64_vec()?, 1e-12);
    Ok(())
}

#[test]
fn test_batch_mismatch_without_set_batch() {
    let (cell, ctx) = build(GruCellConfig::new(2, 2), 2, 2);
    let x = tensor(&[0.0; 6], (3, 2));
    let out = Tensor::<CpuBackend>::zeros((3, 2), DType::F64, &CpuDevice).unwrap();
    match cell.forward(&ctx, &x, &out, 0, false) {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[test]
fn test_timestep_out_of_range() {
    let (cell, ctx) = build(GruCellConfig::new(2, 2), 1, 2);
    let x = tensor(&[0.0, 0.0], (1, 2));
    let out = Tensor::<CpuBackend>::zeros((1, 2), DType::F64, &CpuDevice).unwrap();
    match cell.forward(&ctx, &x, &out, 2, false) {
        Err(Error::InvalidConfig(_)) => {}
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_config_validation() {
    assert!(GruCell::new(GruCellConfig::new(0, 2)).is_err());
    assert!(GruCell::new(GruCellConfig::new(2, 0)).is_err());
    let mut cfg = GruCellConfig::new(2, 2);
    cfg.dropout_rate = 1.0;
    assert!(GruCell::new(cfg).is_err());
}

#[test]
fn test_singleton_middle_axes_accepted() -> marten_core::Result<()> {
    let mut ctx = LayerContext::<CpuBackend>::new(DType::F64, CpuDevice);
    let mut cell = GruCell::new(GruCellConfig::new(3, 1)).unwrap();
    let out = cell.finalize(&mut ctx, &Shape::from((2, 1, 1, 4)))?;
    assert_eq!(out.dims(), &[2, 1, 1, 3]);
    ctx.seal()?;

    let x = tensor(&[0.1; 8], (2, 1, 1, 4));
    let y = Tensor::<CpuBackend>::zeros((2, 1, 1, 3), DType::F64, &CpuDevice)?;
    cell.forward(&ctx, &x, &y, 0, false)?;
    Ok(())
}

#[test]
fn test_non_singleton_middle_axis_rejected() {
    let mut ctx = LayerContext::<CpuBackend>::new(DType::F64, CpuDevice);
    let mut cell = GruCell::new(GruCellConfig::new(3, 1)).unwrap();
    match cell.finalize(&mut ctx, &Shape::from((2, 5, 4))) {
        Err(Error::InvalidConfig(_)) => {}
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}
