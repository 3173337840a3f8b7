// nn::activation — Gate Activations
//
// Recurrent cells apply activations *in place* on gate views into a fused
// pre-activation buffer, and compute derivatives from the *saved output*
// rather than the pre-activation input:
//
//   sigmoid: f'(x) = y (1 - y)     where y = sigmoid(x)
//   tanh:    f'(x) = 1 - y^2       where y = tanh(x)
//
// Working from the output means the forward pass never has to keep the
// pre-activation values around.

use marten_core::backend::{Backend, UnaryOp};
use marten_core::error::Result;
use marten_core::tensor::Tensor;

/// Pointwise activation selector for recurrent gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
    Tanh,
}

impl Activation {
    /// Apply the activation in place, through a possibly strided view.
    pub fn apply_inplace<B: Backend>(&self, t: &Tensor<B>) -> Result<()> {
        match self {
            Activation::Sigmoid => t.unary_inplace(UnaryOp::Sigmoid),
            Activation::Tanh => t.unary_inplace(UnaryOp::Tanh),
        }
    }

    /// Chain-rule step from saved outputs: `dst = f'(output) * out_grad`,
    /// with f' expressed in terms of the activation output.
    ///
    /// # Shapes
    /// - output, out_grad, dst: all the same shape; any of them may be a
    ///   strided gate view.
    pub fn apply_derivative_into<B: Backend>(
        &self,
        output: &Tensor<B>,
        out_grad: &Tensor<B>,
        dst: &Tensor<B>,
    ) -> Result<()> {
        let prime = match self {
            // y * (1 - y)
            Activation::Sigmoid => output.mul(&output.affine(-1.0, 1.0)?)?,
            // 1 - y^2
            Activation::Tanh => output.mul(output)?.affine(-1.0, 1.0)?,
        };
        dst.copy_from(&prime.mul(out_grad)?)
    }
}
