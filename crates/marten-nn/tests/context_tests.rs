// Integration tests for the layer execution context
//
// Cover the two-phase lifecycle (request during finalize, resolve after
// seal), handle validation, batch resizing, and the weight-iteration
// contract.

use marten_core::dtype::DType;
use marten_core::error::Error;
use marten_cpu::{CpuBackend, CpuDevice};
use marten_nn::{Initializer, LayerContext, Lifespan, SlotId, WeightRegularizer};

fn new_ctx() -> LayerContext<CpuBackend> {
    LayerContext::<CpuBackend>::new(DType::F64, CpuDevice)
}

#[test]
fn test_weight_available_after_seal() -> marten_core::Result<()> {
    let mut ctx = new_ctx();
    let w = ctx.request_weight(
        (2, 3),
        Initializer::Ones,
        WeightRegularizer::None,
        0.0,
        "w",
        true,
    )?;
    ctx.seal()?;
    let t = ctx.weight(w)?;
    assert_eq!(t.dims(), &[2, 3]);
    assert_eq!(t.to_f64_vec()?, vec![1.0; 6]);
    // Gradient buffer starts zeroed.
    assert_eq!(ctx.weight_grad(w)?.to_f64_vec()?, vec![0.0; 6]);
    Ok(())
}

#[test]
fn test_resolve_before_seal_fails() {
    let mut ctx = new_ctx();
    let w = ctx
        .request_weight(
            (1, 1),
            Initializer::Zeros,
            WeightRegularizer::None,
            0.0,
            "w",
            true,
        )
        .unwrap();
    match ctx.weight(w) {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[test]
fn test_request_after_seal_fails() {
    let mut ctx = new_ctx();
    ctx.seal().unwrap();
    let err = ctx.request_tensor(
        (2, 2),
        "scratch",
        Initializer::Zeros,
        false,
        Lifespan::Iteration,
        false,
    );
    match err {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
    assert!(ctx.seal().is_err());
}

#[test]
fn test_unset_handle_rejected() {
    let mut ctx = new_ctx();
    ctx.seal().unwrap();
    match ctx.weight(SlotId::UNSET) {
        Err(Error::InvalidHandle { .. }) => {}
        other => panic!("expected InvalidHandle, got {other:?}"),
    }
}

#[test]
fn test_duplicate_name_rejected() {
    let mut ctx = new_ctx();
    ctx.request_tensor(
        (2, 2),
        "buf",
        Initializer::Zeros,
        false,
        Lifespan::Iteration,
        false,
    )
    .unwrap();
    let err = ctx.request_weight(
        (2, 2),
        Initializer::Zeros,
        WeightRegularizer::None,
        0.0,
        "buf",
        true,
    );
    match err {
        Err(Error::InvalidConfig(_)) => {}
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_scratch_allocation_deferred_to_seal() -> marten_core::Result<()> {
    let mut ctx = new_ctx();
    let s = ctx.request_tensor(
        (4, 3),
        "scratch",
        Initializer::Ones,
        true,
        Lifespan::Iteration,
        false,
    )?;
    // Leading-dim change before seal must not be lost.
    ctx.update_tensor(s, 8)?;
    ctx.seal()?;
    let t = ctx.tensor(s)?;
    assert_eq!(t.dims(), &[8, 3]);
    assert_eq!(t.to_f64_vec()?, vec![1.0; 24]);
    assert_eq!(ctx.tensor_grad(s)?.dims(), &[8, 3]);
    Ok(())
}

#[test]
fn test_update_tensor_resizes_and_is_idempotent() -> marten_core::Result<()> {
    let mut ctx = new_ctx();
    let s = ctx.request_tensor(
        (2, 3),
        "scratch",
        Initializer::Zeros,
        false,
        Lifespan::Iteration,
        false,
    )?;
    ctx.seal()?;
    ctx.update_tensor(s, 5)?;
    assert_eq!(ctx.tensor(s)?.dims(), &[5, 3]);

    // Same leading dim again: the storage must not be reallocated.
    let before = ctx.tensor(s)?;
    before.affine_inplace(0.0, 7.0)?;
    ctx.update_tensor(s, 5)?;
    assert!(ctx.tensor(s)?.shares_storage(&before));
    assert_eq!(ctx.tensor(s)?.to_f64_vec()?, vec![7.0; 15]);
    Ok(())
}

#[test]
fn test_update_tensor_rejects_weight_slot() {
    let mut ctx = new_ctx();
    let w = ctx
        .request_weight(
            (2, 3),
            Initializer::Zeros,
            WeightRegularizer::None,
            0.0,
            "w",
            true,
        )
        .unwrap();
    ctx.seal().unwrap();
    match ctx.update_tensor(w, 4) {
        Err(Error::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
}

#[test]
fn test_weights_iterate_in_request_order() -> marten_core::Result<()> {
    let mut ctx = new_ctx();
    ctx.request_weight(
        (1, 2),
        Initializer::Zeros,
        WeightRegularizer::L2,
        0.01,
        "first",
        true,
    )?;
    ctx.request_tensor(
        (1, 2),
        "scratch",
        Initializer::Zeros,
        false,
        Lifespan::Iteration,
        false,
    )?;
    ctx.request_weight(
        (1, 2),
        Initializer::Zeros,
        WeightRegularizer::None,
        0.0,
        "second",
        true,
    )?;
    // Non-trainable weights are skipped by the optimizer view.
    ctx.request_weight(
        (1, 2),
        Initializer::Zeros,
        WeightRegularizer::None,
        0.0,
        "frozen",
        false,
    )?;
    ctx.seal()?;
    let names: Vec<&str> = ctx.weights().map(|(name, ..)| name).collect();
    assert_eq!(names, vec!["first", "second"]);
    let (_, reg, strength, _, _) = ctx.weights().next().unwrap();
    assert_eq!(reg, WeightRegularizer::L2);
    assert!((strength - 0.01).abs() < 1e-12);
    Ok(())
}

#[test]
fn test_tensor_accessor_rejects_weight_and_vice_versa() {
    let mut ctx = new_ctx();
    let w = ctx
        .request_weight(
            (1, 1),
            Initializer::Zeros,
            WeightRegularizer::None,
            0.0,
            "w",
            true,
        )
        .unwrap();
    let s = ctx
        .request_tensor(
            (1, 1),
            "s",
            Initializer::Zeros,
            false,
            Lifespan::Iteration,
            false,
        )
        .unwrap();
    ctx.seal().unwrap();
    assert!(ctx.tensor(w).is_err());
    assert!(ctx.weight(s).is_err());
}
