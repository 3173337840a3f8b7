// GRU Sequence Prediction — Sine Wave Forecasting
//
// Trains a single-unit GRU cell to predict the next value of a sine wave
// from a window of past values, driving the cell directly through its
// three-call protocol instead of a graph container:
//
//   forward(t)       for t = 0 .. SEQ_LEN-1   (increasing)
//   calc_gradient(t) for t = SEQ_LEN-1 .. 0   (decreasing, SequenceStart
//                                              on the first reverse call)
//
// The per-call gate buffer holds one timestep, so each reverse step re-runs
// forward(t) first to repopulate it; the rolling hidden-state buffer keeps
// every h_t from the forward sweep.
//
// The loss is the mean squared error between the final hidden state and the
// next sine value; the incoming hidden-state gradient is 2(h - y)/N at the
// last timestep and zero elsewhere. Weights update by plain SGD through the
// context's gradient buffers.

use marten_core::dtype::DType;
use marten_core::shape::Shape;
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_nn::{GradPhase, GruCell, GruCellConfig, LayerContext};

const SEQ_LEN: usize = 16; // Input window length
const NUM_SAMPLES: usize = 128; // Training windows per batch
const EPOCHS: usize = 300; // Training epochs
const LR: f64 = 0.05; // Learning rate

fn main() -> marten_core::Result<()> {
    let dev = CpuDevice;
    let dtype = DType::F64;

    println!("=== marten — GRU Sine Wave Prediction ===");
    println!();
    println!("Cell: GRU(feature=1, unit=1), window {SEQ_LEN}, batch {NUM_SAMPLES}");
    println!();

    // =========================================================================
    // 1. Synthetic sine-wave windows
    // =========================================================================
    //
    // Each sample is SEQ_LEN consecutive sine values; the target is the value
    // that follows the window.

    let total_points = NUM_SAMPLES + SEQ_LEN;
    let sine: Vec<f64> = (0..total_points).map(|i| (i as f64 * 0.2).sin()).collect();

    // One input tensor per timestep, shaped [NUM_SAMPLES, 1].
    let inputs: Vec<CpuTensor> = (0..SEQ_LEN)
        .map(|t| {
            let col: Vec<f64> = (0..NUM_SAMPLES).map(|i| sine[i + t]).collect();
            CpuTensor::from_f64_slice(&col, (NUM_SAMPLES, 1), dtype, &dev)
        })
        .collect::<marten_core::Result<_>>()?;
    let targets: Vec<f64> = (0..NUM_SAMPLES).map(|i| sine[i + SEQ_LEN]).collect();

    // =========================================================================
    // 2. Cell + execution context
    // =========================================================================

    let cfg = GruCellConfig::new(1, SEQ_LEN);
    let mut cell = GruCell::new(cfg)?;
    let mut ctx = LayerContext::<CpuBackend>::new(dtype, dev.clone());
    let out_shape = cell.finalize(&mut ctx, &Shape::from((NUM_SAMPLES, 1)))?;
    ctx.seal()?;
    println!("Output shape per call: {out_shape}");
    let total_params: usize = ctx.weights().map(|(.., w, _)| w.elem_count()).sum();
    println!("Trainable parameters: {total_params}");
    println!();

    // =========================================================================
    // 3. Training loop: forward sweep, MSE loss, reverse sweep, SGD
    // =========================================================================

    let output = CpuTensor::zeros((NUM_SAMPLES, 1), dtype, &dev)?;
    let zero_grad = CpuTensor::zeros((NUM_SAMPLES, 1), dtype, &dev)?;

    for epoch in 0..EPOCHS {
        for (t, x) in inputs.iter().enumerate() {
            cell.forward(&ctx, x, &output, t, true)?;
        }

        let pred = output.to_f64_vec()?;
        let loss: f64 = pred
            .iter()
            .zip(&targets)
            .map(|(p, y)| (p - y) * (p - y))
            .sum::<f64>()
            / NUM_SAMPLES as f64;

        // dL/dh at the last timestep; earlier timesteps feed the chain only
        // through the hidden-state gradient the cell accumulates itself.
        let d_last: Vec<f64> = pred
            .iter()
            .zip(&targets)
            .map(|(p, y)| 2.0 * (p - y) / NUM_SAMPLES as f64)
            .collect();
        let d_last = CpuTensor::from_f64_slice(&d_last, (NUM_SAMPLES, 1), dtype, &dev)?;

        for t in (0..SEQ_LEN).rev() {
            cell.forward(&ctx, &inputs[t], &output, t, true)?;
            let incoming = if t + 1 == SEQ_LEN { &d_last } else { &zero_grad };
            let phase = if t + 1 == SEQ_LEN {
                GradPhase::SequenceStart
            } else {
                GradPhase::Accumulate
            };
            cell.calc_gradient(&ctx, &inputs[t], incoming, t, phase)?;
        }

        for (_, _, _, w, g) in ctx.weights() {
            w.sub_assign(&g.affine(LR, 0.0)?)?;
        }

        if epoch % 30 == 0 || epoch == EPOCHS - 1 {
            println!("epoch {epoch:>4}  mse {loss:.6}");
        }
    }

    // =========================================================================
    // 4. A few predictions vs. targets
    // =========================================================================

    for (t, x) in inputs.iter().enumerate() {
        cell.forward(&ctx, x, &output, t, false)?;
    }
    let pred = output.to_f64_vec()?;
    println!();
    println!("sample   target   predicted");
    for i in (0..NUM_SAMPLES).step_by(NUM_SAMPLES / 8) {
        println!("{i:>6}  {:>7.4}  {:>9.4}", targets[i], pred[i]);
    }

    Ok(())
}
