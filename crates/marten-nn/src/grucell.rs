// nn::grucell — Single-timestep GRU cell with manual BPTT
//
// The cell owns no storage. At finalize it declares its layout into a
// LayerContext — weights, a rolling hidden-state buffer covering the whole
// sequence, and a fused gate buffer — and afterwards runs a three-call
// protocol per timestep:
//
//   forward(t)          h_t from x_t and h_{t-1}, saved into the rolling buffer
//   calc_derivative     dL/dx_t from the saved gate gradients
//   calc_gradient(t)    weight-gradient accumulation + chain into dL/dh_{t-1}
//
// The reverse pass visits timesteps in strictly decreasing order. The first
// reverse call of a sequence passes `GradPhase::SequenceStart`, which
// zero-fills every gradient accumulator; later calls pass
// `GradPhase::Accumulate` and only add.
//
// GATE LAYOUT: the fused pre-activation buffer `zrg` is [batch, 3*unit] with
// gates in fixed order — update `z`, reset `r`, candidate `g`. Both weight
// matrices use the same column order, so gate views are strided column
// slices of one block.
//
// ALGEBRA (reset_after, the GRU v3 variant; h' = prev hidden state):
//
//   z = sigmoid(x W_ih[:,0:u]  + h' W_hh[:,0:u]  + b_z)
//   r = sigmoid(x W_ih[:,u:2u] + h' W_hh[:,u:2u] + b_r)
//   g = tanh(x W_ih[:,2u:3u] + r * (h' W_hh[:,2u:3u] + b_hh_g) + b_g)
//   h = z * h' + (1 - z) * g
//
// reset_before applies the reset gate to h' before the candidate matmul:
//   g = tanh(x W_ih[:,2u:3u] + (r * h') W_hh[:,2u:3u] + b_g)
// The two orders agree whenever r == 1.

use marten_core::backend::Backend;
use marten_core::error::{Error, Result};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

use crate::activation::Activation;
use crate::context::{LayerContext, Lifespan, SlotId, WeightRegularizer};
use crate::init::Initializer;

/// Dropout rates at or below this threshold are treated as disabled.
pub const DROPOUT_EPSILON: f64 = 1e-3;

/// How the cell's bias terms are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasMode {
    /// No bias terms at all.
    None,
    /// One fused bias `bias_h [3*unit]` added once per gate.
    Fused,
    /// Separate `bias_ih [3*unit]` and `bias_hh [3*unit]`. The candidate's
    /// `bias_hh` share participates in the reset product under `ResetAfter`.
    Split,
}

/// Where the reset gate multiplies into the candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatingOrder {
    /// r * (h' @ W_hh_g + b_hh_g) — the cuDNN / GRU v3 formulation.
    ResetAfter,
    /// (r * h') @ W_hh_g — the original formulation.
    ResetBefore,
}

/// Position of a `calc_gradient` call within the reverse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradPhase {
    /// First reverse call of the sequence: zero every gradient accumulator
    /// before accumulating.
    SequenceStart,
    /// Any later reverse call: accumulate only.
    Accumulate,
}

/// Static configuration of a [`GruCell`].
#[derive(Debug, Clone, Copy)]
pub struct GruCellConfig {
    /// Hidden-state width.
    pub unit: usize,
    /// Activation for the update and reset gates.
    pub gate_activation: Activation,
    /// Activation for the candidate state.
    pub state_activation: Activation,
    /// Inverted-scaling dropout on the new hidden state, in [0, 1).
    pub dropout_rate: f64,
    pub bias_mode: BiasMode,
    pub gating_order: GatingOrder,
    /// Number of timesteps the rolling hidden-state buffer covers.
    pub max_timestep: usize,
    pub weight_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub weight_regularizer: WeightRegularizer,
    pub weight_regularizer_strength: f64,
}

impl GruCellConfig {
    pub fn new(unit: usize, max_timestep: usize) -> Self {
        Self {
            unit,
            gate_activation: Activation::Sigmoid,
            state_activation: Activation::Tanh,
            dropout_rate: 0.0,
            bias_mode: BiasMode::Split,
            gating_order: GatingOrder::ResetAfter,
            max_timestep,
            weight_initializer: Initializer::XavierUniform,
            bias_initializer: Initializer::Zeros,
            weight_regularizer: WeightRegularizer::None,
            weight_regularizer_strength: 0.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.unit == 0 {
            return Err(Error::invalid_config("unit must be positive"));
        }
        if self.max_timestep == 0 {
            return Err(Error::invalid_config("max_timestep must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(Error::invalid_config(format!(
                "dropout rate must be in [0, 1), got {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }

    fn dropout_enabled(&self) -> bool {
        self.dropout_rate > DROPOUT_EPSILON
    }
}

/// A single-timestep GRU cell driven through a [`LayerContext`].
///
/// # Shapes
/// - input x_t: `[batch, feature]`
/// - output h_t: `[batch, unit]`
/// - weight_ih: `[feature, 3*unit]`, weight_hh: `[unit, 3*unit]`
/// - rolling hidden buffer: `[max_timestep*batch, unit]`
pub struct GruCell {
    cfg: GruCellConfig,
    weight_ih: SlotId,
    weight_hh: SlotId,
    bias_h: SlotId,
    bias_ih: SlotId,
    bias_hh: SlotId,
    hidden_state: SlotId,
    zrg: SlotId,
    dropout_mask: SlotId,
}

/// Flatten singleton middle axes into a 2-D `[batch, last]` view sharing
/// the same storage. External tensors may arrive as `[batch, 1, 1, last]`.
fn as_matrix<B: Backend>(t: &Tensor<B>) -> Result<Tensor<B>> {
    if t.rank() == 2 {
        Ok(t.clone())
    } else {
        let dims = t.dims();
        t.reshape((dims[0], dims[dims.len() - 1]))
    }
}

impl GruCell {
    pub fn new(cfg: GruCellConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            weight_ih: SlotId::UNSET,
            weight_hh: SlotId::UNSET,
            bias_h: SlotId::UNSET,
            bias_ih: SlotId::UNSET,
            bias_hh: SlotId::UNSET,
            hidden_state: SlotId::UNSET,
            zrg: SlotId::UNSET,
            dropout_mask: SlotId::UNSET,
        })
    }

    pub fn config(&self) -> &GruCellConfig {
        &self.cfg
    }

    /// Declare every slot into the context and return the output shape.
    ///
    /// The input shape must be `[batch, feature]`, optionally with singleton
    /// axes in between (e.g. `[batch, 1, 1, feature]`); the output shape is
    /// the input shape with the feature axis replaced by `unit`.
    pub fn finalize<B: Backend>(
        &mut self,
        ctx: &mut LayerContext<B>,
        input_shape: &Shape,
    ) -> Result<Shape> {
        let dims = input_shape.dims();
        if dims.len() < 2 {
            return Err(Error::invalid_config(format!(
                "GRU cell input must be at least 2-D [batch, feature], got {input_shape}"
            )));
        }
        if dims[1..dims.len() - 1].iter().any(|&d| d != 1) {
            return Err(Error::invalid_config(format!(
                "GRU cell input must have singleton middle axes, got {input_shape}"
            )));
        }
        let batch = dims[0];
        let feature = dims[dims.len() - 1];
        let unit = self.cfg.unit;

        self.weight_ih = ctx.request_weight(
            (feature, 3 * unit),
            self.cfg.weight_initializer,
            self.cfg.weight_regularizer,
            self.cfg.weight_regularizer_strength,
            "weight_ih",
            true,
        )?;
        self.weight_hh = ctx.request_weight(
            (unit, 3 * unit),
            self.cfg.weight_initializer,
            self.cfg.weight_regularizer,
            self.cfg.weight_regularizer_strength,
            "weight_hh",
            true,
        )?;
        match self.cfg.bias_mode {
            BiasMode::None => {}
            BiasMode::Fused => {
                self.bias_h = ctx.request_weight(
                    3 * unit,
                    self.cfg.bias_initializer,
                    WeightRegularizer::None,
                    0.0,
                    "bias_h",
                    true,
                )?;
            }
            BiasMode::Split => {
                self.bias_ih = ctx.request_weight(
                    3 * unit,
                    self.cfg.bias_initializer,
                    WeightRegularizer::None,
                    0.0,
                    "bias_ih",
                    true,
                )?;
                self.bias_hh = ctx.request_weight(
                    3 * unit,
                    self.cfg.bias_initializer,
                    WeightRegularizer::None,
                    0.0,
                    "bias_hh",
                    true,
                )?;
            }
        }

        self.hidden_state = ctx.request_tensor(
            (self.cfg.max_timestep * batch, unit),
            "hidden_state",
            Initializer::Zeros,
            true,
            Lifespan::Iteration,
            false,
        )?;
        self.zrg = ctx.request_tensor(
            (batch, 3 * unit),
            "zrg",
            Initializer::Zeros,
            true,
            Lifespan::Iteration,
            false,
        )?;
        if self.cfg.dropout_enabled() {
            self.dropout_mask = ctx.request_tensor(
                (batch, unit),
                "dropout_mask",
                Initializer::Zeros,
                false,
                Lifespan::Iteration,
                false,
            )?;
        }

        let mut out = dims.to_vec();
        let last = out.len() - 1;
        out[last] = unit;
        Ok(Shape::from(out))
    }

    fn check_timestep(&self, timestep: usize) -> Result<()> {
        if timestep >= self.cfg.max_timestep {
            return Err(Error::invalid_config(format!(
                "timestep {timestep} out of range (max_timestep {})",
                self.cfg.max_timestep
            )));
        }
        Ok(())
    }

    /// Batch size of the current call, cross-checked against the rolling
    /// buffer (a mismatch means `set_batch` was not called).
    fn batch_of<B: Backend>(
        &self,
        ctx: &LayerContext<B>,
        input: &Tensor<B>,
    ) -> Result<usize> {
        let batch = input.dims()[0];
        let hidden = ctx.tensor(self.hidden_state)?;
        if hidden.dims()[0] != self.cfg.max_timestep * batch {
            return Err(Error::invalid_state(format!(
                "hidden buffer covers batch {}, input has batch {batch}; call set_batch first",
                hidden.dims()[0] / self.cfg.max_timestep
            )));
        }
        Ok(batch)
    }

    /// One forward timestep.
    ///
    /// Writes h_t twice: into the rolling hidden-state buffer (read back as
    /// h_{t-1} by the next step and by the reverse pass) and into `output`.
    ///
    /// # Shapes
    /// - input: `[batch, feature]`, output: `[batch, unit]`
    pub fn forward<B: Backend>(
        &self,
        ctx: &LayerContext<B>,
        input: &Tensor<B>,
        output: &Tensor<B>,
        timestep: usize,
        training: bool,
    ) -> Result<()> {
        self.check_timestep(timestep)?;
        let unit = self.cfg.unit;
        let input = as_matrix(input)?;
        let output = as_matrix(output)?;
        let batch = self.batch_of(ctx, &input)?;

        let weight_ih = ctx.weight(self.weight_ih)?;
        let weight_hh = ctx.weight(self.weight_hh)?;
        let hidden_states = ctx.tensor(self.hidden_state)?;
        let zrg = ctx.tensor(self.zrg)?;

        let hidden_state = hidden_states.slice_flat((batch, unit), timestep * batch * unit)?;
        let prev_hidden = if timestep > 0 {
            hidden_states.slice_flat((batch, unit), (timestep - 1) * batch * unit)?
        } else {
            Tensor::zeros_like(&hidden_state)?
        };

        // Gate column blocks of the recurrent weight, materialized because
        // GEMM operands must be dense.
        let weight_hh_zr = weight_hh.slice_flat((unit, 2 * unit), 0)?.materialize()?;
        let weight_hh_g = weight_hh
            .slice_flat((unit, unit), 2 * unit)?
            .materialize()?;

        // zrg = x @ W_ih, then the recurrent term on the z|r block.
        input.dot_into(&weight_ih, &zrg, false, false, 0.0)?;
        let update_reset = zrg.slice_flat((batch, 2 * unit), 0)?;
        update_reset.add_assign(&prev_hidden.dot(&weight_hh_zr, false, false)?)?;
        match self.cfg.bias_mode {
            BiasMode::None => {}
            BiasMode::Fused => {
                let bias_h = ctx.weight(self.bias_h)?;
                update_reset.add_assign(&bias_h.slice_flat(2 * unit, 0)?)?;
            }
            BiasMode::Split => {
                let bias_ih = ctx.weight(self.bias_ih)?;
                let bias_hh = ctx.weight(self.bias_hh)?;
                update_reset.add_assign(&bias_ih.slice_flat(2 * unit, 0)?)?;
                update_reset.add_assign(&bias_hh.slice_flat(2 * unit, 0)?)?;
            }
        }
        self.cfg.gate_activation.apply_inplace(&update_reset)?;

        let update_gate = zrg.slice_flat((batch, unit), 0)?;
        let reset_gate = zrg.slice_flat((batch, unit), unit)?;
        let memory_cell = zrg.slice_flat((batch, unit), 2 * unit)?;

        match self.cfg.gating_order {
            GatingOrder::ResetAfter => {
                let temp = prev_hidden.dot(&weight_hh_g, false, false)?;
                if self.cfg.bias_mode == BiasMode::Split {
                    let bias_hh = ctx.weight(self.bias_hh)?;
                    temp.add_assign(&bias_hh.slice_flat(unit, 2 * unit)?)?;
                }
                temp.mul_assign(&reset_gate)?;
                memory_cell.add_assign(&temp)?;
            }
            GatingOrder::ResetBefore => {
                let gated_prev = reset_gate.mul(&prev_hidden)?;
                memory_cell.add_assign(&gated_prev.dot(&weight_hh_g, false, false)?)?;
                if self.cfg.bias_mode == BiasMode::Split {
                    let bias_hh = ctx.weight(self.bias_hh)?;
                    memory_cell.add_assign(&bias_hh.slice_flat(unit, 2 * unit)?)?;
                }
            }
        }
        match self.cfg.bias_mode {
            BiasMode::None => {}
            BiasMode::Fused => {
                let bias_h = ctx.weight(self.bias_h)?;
                memory_cell.add_assign(&bias_h.slice_flat(unit, 2 * unit)?)?;
            }
            BiasMode::Split => {
                let bias_ih = ctx.weight(self.bias_ih)?;
                memory_cell.add_assign(&bias_ih.slice_flat(unit, 2 * unit)?)?;
            }
        }
        self.cfg.state_activation.apply_inplace(&memory_cell)?;

        // h = z * h' + (1 - z) * g
        hidden_state.copy_from(&update_gate.mul(&prev_hidden)?)?;
        let one_minus_z = update_gate.affine(-1.0, 1.0)?;
        hidden_state.add_assign(&memory_cell.mul(&one_minus_z)?)?;

        if self.cfg.dropout_enabled() && training {
            let mask = ctx.tensor(self.dropout_mask)?;
            mask.dropout_mask(self.cfg.dropout_rate)?;
            hidden_state.mul_assign(&mask)?;
        }

        output.copy_from(&hidden_state)
    }

    /// Input gradient of the last `calc_gradient` call's timestep:
    /// `input_grad = d_zrg @ W_ih^T`.
    ///
    /// # Shapes
    /// - input_grad: `[batch, feature]`
    pub fn calc_derivative<B: Backend>(
        &self,
        ctx: &LayerContext<B>,
        input_grad: &Tensor<B>,
    ) -> Result<()> {
        let weight_ih = ctx.weight(self.weight_ih)?;
        let d_zrg = ctx.tensor_grad(self.zrg)?;
        d_zrg.dot_into(&weight_ih, &as_matrix(input_grad)?, false, true, 0.0)
    }

    /// One reverse timestep: accumulate weight/bias gradients and chain the
    /// hidden-state gradient into timestep `t-1`'s slice.
    ///
    /// Must be called in strictly decreasing timestep order, with
    /// `GradPhase::SequenceStart` on the first call of the sequence.
    ///
    /// # Shapes
    /// - input: `[batch, feature]`, incoming_grad: `[batch, unit]`
    pub fn calc_gradient<B: Backend>(
        &self,
        ctx: &LayerContext<B>,
        input: &Tensor<B>,
        incoming_grad: &Tensor<B>,
        timestep: usize,
        phase: GradPhase,
    ) -> Result<()> {
        self.check_timestep(timestep)?;
        let unit = self.cfg.unit;
        let input = as_matrix(input)?;
        let incoming_grad = as_matrix(incoming_grad)?;
        let batch = self.batch_of(ctx, &input)?;

        let weight_hh = ctx.weight(self.weight_hh)?;
        let d_weight_ih = ctx.weight_grad(self.weight_ih)?;
        let d_weight_hh = ctx.weight_grad(self.weight_hh)?;
        let hidden_states = ctx.tensor(self.hidden_state)?;
        let d_hidden_states = ctx.tensor_grad(self.hidden_state)?;
        let zrg = ctx.tensor(self.zrg)?;
        let d_zrg = ctx.tensor_grad(self.zrg)?;

        if phase == GradPhase::SequenceStart {
            d_weight_ih.zero_fill()?;
            d_weight_hh.zero_fill()?;
            match self.cfg.bias_mode {
                BiasMode::None => {}
                BiasMode::Fused => ctx.weight_grad(self.bias_h)?.zero_fill()?,
                BiasMode::Split => {
                    ctx.weight_grad(self.bias_ih)?.zero_fill()?;
                    ctx.weight_grad(self.bias_hh)?.zero_fill()?;
                }
            }
            d_hidden_states.zero_fill()?;
        }

        let d_hidden_state =
            d_hidden_states.slice_flat((batch, unit), timestep * batch * unit)?;
        d_hidden_state.add_assign(&incoming_grad)?;
        if self.cfg.dropout_enabled() {
            d_hidden_state.mul_assign(&ctx.tensor(self.dropout_mask)?)?;
        }

        let (prev_hidden, d_prev_hidden) = if timestep > 0 {
            (
                hidden_states.slice_flat((batch, unit), (timestep - 1) * batch * unit)?,
                d_hidden_states.slice_flat((batch, unit), (timestep - 1) * batch * unit)?,
            )
        } else {
            // Timestep 0 chains into a throwaway zero gradient.
            (
                Tensor::zeros_like(&d_hidden_state)?,
                Tensor::zeros_like(&d_hidden_state)?,
            )
        };

        let update_gate = zrg.slice_flat((batch, unit), 0)?;
        let reset_gate = zrg.slice_flat((batch, unit), unit)?;
        let memory_cell = zrg.slice_flat((batch, unit), 2 * unit)?;
        let d_update_gate = d_zrg.slice_flat((batch, unit), 0)?;
        let d_reset_gate = d_zrg.slice_flat((batch, unit), unit)?;
        let d_memory_cell = d_zrg.slice_flat((batch, unit), 2 * unit)?;

        // dL/dh' gets the direct path z * dL/dh; the recurrent-matmul paths
        // accumulate below.
        d_prev_hidden.copy_from(&d_hidden_state.mul(&update_gate)?)?;
        // dL/dz = (h' - g) * dL/dh
        d_update_gate.copy_from(&d_hidden_state.mul(&prev_hidden)?)?;
        d_update_gate.sub_assign(&d_hidden_state.mul(&memory_cell)?)?;
        // dL/dg = (1 - z) * dL/dh
        d_memory_cell.copy_from(&update_gate)?;
        d_memory_cell.affine_inplace(-1.0, 1.0)?;
        d_memory_cell.mul_assign(&d_hidden_state)?;

        self.cfg
            .gate_activation
            .apply_derivative_into(&update_gate, &d_update_gate, &d_update_gate)?;
        self.cfg
            .state_activation
            .apply_derivative_into(&memory_cell, &d_memory_cell, &d_memory_cell)?;

        let weight_hh_zr = weight_hh.slice_flat((unit, 2 * unit), 0)?.materialize()?;
        let weight_hh_g = weight_hh
            .slice_flat((unit, unit), 2 * unit)?
            .materialize()?;
        let d_weight_hh_zr = d_weight_hh.slice_flat((unit, 2 * unit), 0)?;
        let d_weight_hh_g = d_weight_hh.slice_flat((unit, unit), 2 * unit)?;

        let d_memory_cell_c = d_memory_cell.materialize()?;

        match self.cfg.gating_order {
            GatingOrder::ResetAfter => {
                // Rebuild the pre-reset candidate input: h' @ W_hh_g (+ b_hh_g).
                let temp = prev_hidden.dot(&weight_hh_g, false, false)?;
                if self.cfg.bias_mode == BiasMode::Split {
                    let bias_hh = ctx.weight(self.bias_hh)?;
                    temp.add_assign(&bias_hh.slice_flat(unit, 2 * unit)?)?;
                }
                d_reset_gate.copy_from(&d_memory_cell_c.mul(&temp)?)?;

                let gated = d_memory_cell_c.mul(&reset_gate)?;
                if self.cfg.bias_mode == BiasMode::Split {
                    let d_bias_hh = ctx.weight_grad(self.bias_hh)?;
                    gated.sum_rows_into(&d_bias_hh.slice_flat(unit, 2 * unit)?)?;
                }
                gated.dot_into(&weight_hh_g, &d_prev_hidden, false, true, 1.0)?;
                d_weight_hh_g.add_assign(&prev_hidden.dot(&gated, true, false)?)?;
            }
            GatingOrder::ResetBefore => {
                if self.cfg.bias_mode == BiasMode::Split {
                    let d_bias_hh = ctx.weight_grad(self.bias_hh)?;
                    d_memory_cell.sum_rows_into(&d_bias_hh.slice_flat(unit, 2 * unit)?)?;
                }
                let temp = d_memory_cell_c.dot(&weight_hh_g, false, true)?;
                d_reset_gate.copy_from(&temp.mul(&prev_hidden)?)?;
                d_prev_hidden.add_assign(&temp.mul(&reset_gate)?)?;
                let gated_prev = reset_gate.mul(&prev_hidden)?;
                d_weight_hh_g.add_assign(&gated_prev.dot(&d_memory_cell_c, true, false)?)?;
            }
        }

        self.cfg
            .gate_activation
            .apply_derivative_into(&reset_gate, &d_reset_gate, &d_reset_gate)?;

        match self.cfg.bias_mode {
            BiasMode::None => {}
            BiasMode::Fused => {
                d_zrg.sum_rows_into(&ctx.weight_grad(self.bias_h)?.slice_flat(3 * unit, 0)?)?;
            }
            BiasMode::Split => {
                d_zrg.sum_rows_into(&ctx.weight_grad(self.bias_ih)?.slice_flat(3 * unit, 0)?)?;
                let d_bias_hh = ctx.weight_grad(self.bias_hh)?;
                let d_update_reset = d_zrg.slice_flat((batch, 2 * unit), 0)?;
                d_update_reset.sum_rows_into(&d_bias_hh.slice_flat(2 * unit, 0)?)?;
            }
        }

        let d_update_reset_c = d_zrg.slice_flat((batch, 2 * unit), 0)?.materialize()?;
        d_weight_hh_zr.add_assign(&prev_hidden.dot(&d_update_reset_c, true, false)?)?;
        input.dot_into(&d_zrg, &d_weight_ih, true, false, 1.0)?;
        d_update_reset_c.dot_into(&weight_hh_zr, &d_prev_hidden, false, true, 1.0)
    }

    /// Resize every batch-dependent slot. A no-op when the batch already
    /// matches.
    pub fn set_batch<B: Backend>(&self, ctx: &mut LayerContext<B>, batch: usize) -> Result<()> {
        ctx.update_tensor(self.hidden_state, self.cfg.max_timestep * batch)?;
        ctx.update_tensor(self.zrg, batch)?;
        if self.cfg.dropout_enabled() {
            ctx.update_tensor(self.dropout_mask, batch)?;
        }
        Ok(())
    }
}
