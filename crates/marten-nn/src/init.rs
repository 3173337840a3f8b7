// nn::init — Parameter Initialization
//
// Declarative initializers attached to context slots. A slot records *which*
// initializer it wants at request time; the context materializes the tensor
// when the slot's storage is allocated.
//
// AVAILABLE INITIALIZERS:
//
//   Zeros              — all elements = 0
//   Ones               — all elements = 1
//   XavierUniform      — Glorot uniform U(-limit, limit),
//                        limit = sqrt(6 / (fan_in + fan_out))
//   Uniform { lo, hi } — U(lo, hi)
//   None               — leave the buffer zeroed (caller fills it)

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::Result;
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

/// Declarative weight/tensor initializer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Initializer {
    /// No initialization: storage stays zeroed and the caller overwrites it.
    None,
    Zeros,
    Ones,
    /// Glorot uniform: U(-limit, limit) with limit = sqrt(6 / (fan_in + fan_out)).
    XavierUniform,
    Uniform { lo: f64, hi: f64 },
}

/// Compute (fan_in, fan_out) from a shape.
///
/// - For 1-D: fan_in = fan_out = dims[0]
/// - For 2-D `[in, out]`: fan_in = dims[0], fan_out = dims[1]
/// - For 3-D+: the trailing axis is fan_out, the product of the rest fan_in.
fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[0] as f64, dims[1] as f64),
        _ => {
            let fan_out = dims[dims.len() - 1] as f64;
            let fan_in: usize = dims[..dims.len() - 1].iter().product();
            (fan_in as f64, fan_out)
        }
    }
}

impl Initializer {
    /// Materialize a freshly initialized tensor of the given shape.
    pub fn materialize<B: Backend>(
        &self,
        shape: &Shape,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Tensor<B>> {
        match self {
            Initializer::None | Initializer::Zeros => {
                Tensor::<B>::zeros(shape.clone(), dtype, device)
            }
            Initializer::Ones => Tensor::<B>::ones(shape.clone(), dtype, device),
            Initializer::XavierUniform => {
                let (fan_in, fan_out) = compute_fans(shape);
                let limit = (6.0 / (fan_in + fan_out)).sqrt();
                Tensor::<B>::rand(shape.clone(), dtype, device)?.affine(2.0 * limit, -limit)
            }
            Initializer::Uniform { lo, hi } => {
                Tensor::<B>::rand(shape.clone(), dtype, device)?.affine(hi - lo, *lo)
            }
        }
    }
}
