//! Gradient accumulation across sub-steps
//!
//! Emulates a larger batch by summing unscaled gradients over
//! `accumulation_steps` consecutive sub-steps before a single optimizer
//! update. The buffer persists across sub-steps and is zero at every
//! completed-cycle boundary; the overflow flag is sticky for the cycle, so
//! one bad sub-step poisons the whole update.

use std::collections::HashMap;

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, TypeConversionOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Accumulates gradients across the sub-steps of one cycle.
pub struct GradAccumulator<R: Runtime> {
    accumulation_steps: u64,
    local_step: u64,
    accu_loss: f64,
    accu_overflow: bool,
    buffer: HashMap<TensorId, Tensor<R>>,
}

impl<R: Runtime> GradAccumulator<R> {
    /// Allocate a zero F32 buffer per parameter.
    pub fn new(
        accumulation_steps: u64,
        params: &HashMap<TensorId, Tensor<R>>,
    ) -> Result<Self> {
        if accumulation_steps == 0 {
            return Err(Error::InvalidArgument {
                arg: "accumulation_steps",
                reason: "must be > 0".to_string(),
            });
        }
        let mut buffer = HashMap::with_capacity(params.len());
        for (&id, param) in params {
            buffer.insert(
                id,
                Tensor::<R>::zeros(param.shape(), DType::F32, param.device()),
            );
        }
        Ok(Self {
            accumulation_steps,
            local_step: 0,
            accu_loss: 0.0,
            accu_overflow: false,
            buffer,
        })
    }

    /// Advance the sub-step counter and the running loss.
    ///
    /// The pre-increment comparison against `accumulation_steps` decides
    /// whether the counter advances or wraps back to 1 (and whether the loss
    /// accumulates or restarts); the post-increment value decides whether
    /// this sub-step completes the cycle. Returns `(cycle_complete,
    /// mean_loss)`.
    pub fn begin_sub_step(&mut self, loss: f64) -> (bool, f64) {
        if self.local_step != self.accumulation_steps {
            self.local_step += 1;
            self.accu_loss += loss;
        } else {
            self.local_step = 1;
            self.accu_loss = loss;
        }
        let mean_loss = self.accu_loss / self.local_step as f64;
        (self.local_step == self.accumulation_steps, mean_loss)
    }

    /// Fold one sub-step's gradients into the buffer (cast to F32, add).
    ///
    /// The buffer is zero on the first sub-step of a cycle, so the add is an
    /// assignment there.
    pub fn merge<C>(&mut self, client: &C, grads: &GradStore<R>) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + TypeConversionOps<R>,
    {
        let ids: Vec<TensorId> = grads.keys().copied().collect();
        for id in ids {
            let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
                reason: format!("missing gradient for tensor {id:?}"),
            })?;
            let grad = if grad.dtype() == DType::F32 {
                grad.clone()
            } else {
                client.cast(grad, DType::F32)?
            };
            let merged = match self.buffer.get(&id) {
                Some(acc) => client.add(acc, &grad)?,
                None => grad,
            };
            self.buffer.insert(id, merged);
        }
        Ok(())
    }

    /// OR a sub-step's aggregated overflow flag into the cycle's sticky
    /// flag; returns the sticky flag.
    pub fn record_overflow(&mut self, overflow: bool) -> bool {
        self.accu_overflow = self.accu_overflow || overflow;
        self.accu_overflow
    }

    /// Snapshot the accumulated gradients for clipping and the optimizer.
    pub fn grads(&self) -> GradStore<R> {
        let mut store = GradStore::new();
        for (&id, tensor) in &self.buffer {
            store.insert(id, tensor.clone());
        }
        store
    }

    /// Zero the buffer and clear the sticky flag at cycle end.
    pub fn reset_cycle(&mut self) {
        for slot in self.buffer.values_mut() {
            let zero = Tensor::<R>::zeros(slot.shape(), DType::F32, slot.device());
            *slot = zero;
        }
        self.accu_overflow = false;
    }

    pub fn accumulation_steps(&self) -> u64 {
        self.accumulation_steps
    }

    /// Sub-step index, 1-based within the current cycle (0 before the first
    /// call).
    pub fn local_step(&self) -> u64 {
        self.local_step
    }

    pub fn overflow(&self) -> bool {
        self.accu_overflow
    }

    /// Buffer contents, keyed by parameter id.
    pub fn buffer(&self) -> &HashMap<TensorId, Tensor<R>> {
        &self.buffer
    }
}
