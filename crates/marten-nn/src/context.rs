// nn::context — Per-Layer Execution Context
//
// A layer never allocates its own parameters or scratch buffers. During
// finalize it *requests* named slots from a LayerContext — weights with an
// initializer and regularizer, scratch tensors with a lifespan — and gets
// back stable SlotId handles. After `seal()` the registry is frozen: the
// layer resolves handles to tensors on every call, and the only permitted
// mutation is resizing the batch-dependent leading dimension of a scratch
// slot via `update_tensor`.
//
// LIFECYCLE:
//
//   let mut ctx = LayerContext::new(dtype, device);
//   layer.finalize(&mut ctx, input_shape)?;   // request_* calls happen here
//   ctx.seal()?;                              // scratch storage allocated now
//   layer.forward(&ctx, ...)?;                // handle -> tensor resolution
//
// Weight storage (and its gradient, when trainable) is allocated at request
// time; scratch storage is deferred to `seal()` so a batch-size change
// between finalize and first use does not force a reallocation.
//
// SLOT ORDER IS A CONTRACT: weights iterate in request order, which is the
// order a checkpointing component would persist them in.

use marten_core::backend::Backend;
use marten_core::dtype::DType;
use marten_core::error::{Error, Result};
use marten_core::shape::Shape;
use marten_core::tensor::Tensor;

use crate::init::Initializer;

/// Stable handle to a context slot.
///
/// `UNSET` is the value a layer holds before finalize has run; resolving it
/// fails with `InvalidHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    pub const UNSET: SlotId = SlotId(usize::MAX);

    pub fn is_unset(&self) -> bool {
        *self == Self::UNSET
    }
}

/// How long a scratch tensor's contents must survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// Valid only until the end of the forward pass.
    ForwardOnly,
    /// Valid across one full forward + backward iteration.
    Iteration,
    /// Lives as long as the model; weights use this implicitly.
    Model,
}

/// Weight-decay regularizer recorded on a weight slot. The context only
/// stores it; an optimizer reads it through [`LayerContext::weights`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightRegularizer {
    None,
    L2,
}

struct Slot<B: Backend> {
    name: String,
    shape: Shape,
    init: Initializer,
    trainable: bool,
    lifespan: Lifespan,
    #[allow(dead_code)]
    persist: bool,
    regularizer: WeightRegularizer,
    reg_strength: f64,
    // None until seal() for scratch slots; weights allocate at request.
    tensor: Option<Tensor<B>>,
    grad: Option<Tensor<B>>,
}

/// Per-layer registry of weight and scratch-tensor slots.
pub struct LayerContext<B: Backend> {
    device: B::Device,
    dtype: DType,
    slots: Vec<Slot<B>>,
    sealed: bool,
}

impl<B: Backend> LayerContext<B> {
    pub fn new(dtype: DType, device: B::Device) -> Self {
        Self {
            device,
            dtype,
            slots: Vec::new(),
            sealed: false,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn check_open(&self, what: &str) -> Result<()> {
        if self.sealed {
            return Err(Error::invalid_state(format!(
                "cannot {what}: context is sealed"
            )));
        }
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.slots.iter().any(|s| s.name == name) {
            return Err(Error::invalid_config(format!(
                "duplicate slot name {name:?}"
            )));
        }
        Ok(())
    }

    /// Request a model weight. Storage (and the gradient buffer, when
    /// trainable) is allocated immediately; the shape is frozen.
    pub fn request_weight(
        &mut self,
        shape: impl Into<Shape>,
        init: Initializer,
        regularizer: WeightRegularizer,
        reg_strength: f64,
        name: &str,
        trainable: bool,
    ) -> Result<SlotId> {
        self.check_open("request a weight")?;
        self.check_name(name)?;
        let shape = shape.into();
        let tensor = init.materialize::<B>(&shape, self.dtype, &self.device)?;
        let grad = if trainable {
            Some(Tensor::<B>::zeros(shape.clone(), self.dtype, &self.device)?)
        } else {
            None
        };
        self.slots.push(Slot {
            name: name.to_string(),
            shape,
            init,
            trainable,
            lifespan: Lifespan::Model,
            persist: true,
            regularizer,
            reg_strength,
            tensor: Some(tensor),
            grad,
        });
        Ok(SlotId(self.slots.len() - 1))
    }

    /// Request a scratch tensor. Storage allocation is deferred to `seal()`,
    /// so the batch-dependent leading dimension can still change first.
    pub fn request_tensor(
        &mut self,
        shape: impl Into<Shape>,
        name: &str,
        init: Initializer,
        trainable: bool,
        lifespan: Lifespan,
        persist: bool,
    ) -> Result<SlotId> {
        self.check_open("request a tensor")?;
        self.check_name(name)?;
        self.slots.push(Slot {
            name: name.to_string(),
            shape: shape.into(),
            init,
            trainable,
            lifespan,
            persist,
            regularizer: WeightRegularizer::None,
            reg_strength: 0.0,
            tensor: None,
            grad: None,
        });
        Ok(SlotId(self.slots.len() - 1))
    }

    /// End the finalize phase: allocate every pending scratch slot and
    /// freeze the registry against further requests.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::invalid_state("context is already sealed"));
        }
        for slot in &mut self.slots {
            if slot.tensor.is_none() {
                slot.tensor =
                    Some(slot.init.materialize::<B>(&slot.shape, self.dtype, &self.device)?);
                if slot.trainable {
                    slot.grad = Some(Tensor::<B>::zeros(
                        slot.shape.clone(),
                        self.dtype,
                        &self.device,
                    )?);
                }
            }
        }
        self.sealed = true;
        Ok(())
    }

    fn slot(&self, id: SlotId) -> Result<&Slot<B>> {
        if id.is_unset() || id.0 >= self.slots.len() {
            return Err(Error::InvalidHandle {
                index: id.0,
                count: self.slots.len(),
            });
        }
        Ok(&self.slots[id.0])
    }

    fn resolved(&self, id: SlotId) -> Result<(&Slot<B>, &Tensor<B>)> {
        if !self.sealed {
            return Err(Error::invalid_state(
                "context must be sealed before resolving handles",
            ));
        }
        let slot = self.slot(id)?;
        let tensor = slot
            .tensor
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("slot {:?} has no storage", slot.name)))?;
        Ok((slot, tensor))
    }

    /// Resolve a weight handle. Tensors share storage, so the returned clone
    /// aliases the slot's buffer.
    pub fn weight(&self, id: SlotId) -> Result<Tensor<B>> {
        let (slot, tensor) = self.resolved(id)?;
        if slot.lifespan != Lifespan::Model {
            return Err(Error::invalid_state(format!(
                "slot {:?} is not a weight",
                slot.name
            )));
        }
        Ok(tensor.clone())
    }

    /// Resolve the gradient buffer of a trainable weight.
    pub fn weight_grad(&self, id: SlotId) -> Result<Tensor<B>> {
        let (slot, _) = self.resolved(id)?;
        slot.grad.clone().ok_or_else(|| {
            Error::invalid_state(format!("slot {:?} is not trainable", slot.name))
        })
    }

    /// Resolve a scratch-tensor handle.
    pub fn tensor(&self, id: SlotId) -> Result<Tensor<B>> {
        let (slot, tensor) = self.resolved(id)?;
        if slot.lifespan == Lifespan::Model {
            return Err(Error::invalid_state(format!(
                "slot {:?} is a weight, not a scratch tensor",
                slot.name
            )));
        }
        Ok(tensor.clone())
    }

    /// Resolve the gradient buffer of a trainable scratch tensor.
    pub fn tensor_grad(&self, id: SlotId) -> Result<Tensor<B>> {
        let (slot, _) = self.resolved(id)?;
        slot.grad.clone().ok_or_else(|| {
            Error::invalid_state(format!("slot {:?} is not trainable", slot.name))
        })
    }

    /// Resize the leading (batch-dependent) dimension of a scratch slot,
    /// reallocating its storage while keeping the handle valid. A no-op when
    /// the dimension already matches.
    pub fn update_tensor(&mut self, id: SlotId, new_leading_dim: usize) -> Result<()> {
        if id.is_unset() || id.0 >= self.slots.len() {
            return Err(Error::InvalidHandle {
                index: id.0,
                count: self.slots.len(),
            });
        }
        let dtype = self.dtype;
        let device = self.device.clone();
        let slot = &mut self.slots[id.0];
        if slot.lifespan == Lifespan::Model {
            return Err(Error::invalid_state(format!(
                "cannot resize weight slot {:?}",
                slot.name
            )));
        }
        if slot.shape.rank() == 0 {
            return Err(Error::invalid_state(format!(
                "cannot resize scalar slot {:?}",
                slot.name
            )));
        }
        if slot.shape.dims()[0] == new_leading_dim {
            return Ok(());
        }
        let mut dims = slot.shape.dims().to_vec();
        dims[0] = new_leading_dim;
        slot.shape = Shape::from(dims);
        if slot.tensor.is_some() {
            slot.tensor = Some(slot.init.materialize::<B>(&slot.shape, dtype, &device)?);
            if slot.trainable {
                slot.grad = Some(Tensor::<B>::zeros(slot.shape.clone(), dtype, &device)?);
            }
        }
        Ok(())
    }

    /// Trainable weights in request order: `(name, regularizer, strength,
    /// weight, grad)`. This is the optimizer's and checkpointer's view.
    pub fn weights(
        &self,
    ) -> impl Iterator<Item = (&str, WeightRegularizer, f64, &Tensor<B>, &Tensor<B>)> {
        self.slots.iter().filter_map(|s| {
            if s.lifespan != Lifespan::Model || !s.trainable {
                return None;
            }
            match (&s.tensor, &s.grad) {
                (Some(t), Some(g)) => {
                    Some((s.name.as_str(), s.regularizer, s.reg_strength, t, g))
                }
                _ => None,
            }
        })
    }
}
