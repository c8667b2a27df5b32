//! External optimizer seam and a reference SGD
//!
//! The step controllers are optimizer-agnostic: anything implementing
//! [`StepOptimizer`] can consume the transformed gradients. The global-step
//! counter is advanced explicitly by the controller — never inside
//! `apply` — so learning-rate schedules keyed to the counter stay in sync
//! even on steps whose update was skipped for overflow.

use std::collections::HashMap;

use crate::error::Result;
use numr::autograd::GradStore;
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Trait for parameter optimizers driven by the step controllers.
pub trait StepOptimizer<R: Runtime> {
    /// Apply one in-place parameter update from `grads`.
    ///
    /// Parameters without gradients are skipped. Must not touch the
    /// global-step counter.
    fn apply<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>;

    /// Get the current learning rate.
    fn lr(&self) -> f64;

    /// Set the learning rate.
    fn set_lr(&mut self, lr: f64);

    /// Global step counter used by learning-rate schedules.
    fn global_step(&self) -> u64;

    /// Advance the counter by the optimizer's step increase.
    fn advance_global_step(&mut self);
}

/// SGD configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// How far `advance_global_step` moves the counter.
    pub step_increase: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.0,
            weight_decay: 0.0,
            step_increase: 1,
        }
    }
}

/// SGD with optional momentum and L2 weight decay.
///
/// Update rules:
/// - L2 weight decay: `grad = grad + weight_decay * param`
/// - Momentum: `buf = momentum * buf + grad`, update = `buf`
/// - Parameter: `param = param - lr * update`
pub struct Sgd<R: Runtime> {
    config: SgdConfig,
    velocity: HashMap<TensorId, Tensor<R>>,
    global_step: u64,
}

impl<R: Runtime> Sgd<R> {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
            global_step: 0,
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }
}

impl<R: Runtime> StepOptimizer<R> for Sgd<R> {
    fn apply<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        grads: &GradStore<R>,
    ) -> Result<()>
    where
        C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
    {
        let lr = self.config.lr;
        let momentum = self.config.momentum;
        let wd = self.config.weight_decay;

        let param_ids: Vec<TensorId> = params.keys().copied().collect();

        for id in param_ids {
            let grad = match grads.get(id) {
                Some(g) => g,
                None => continue,
            };
            let param = params.get(&id).expect("id collected from params.keys()");

            let mut update = grad.clone();
            if wd > 0.0 {
                let decay = client.mul_scalar(param, wd)?;
                update = client.add(&update, &decay)?;
            }
            if momentum > 0.0 {
                let buf = match self.velocity.get(&id) {
                    Some(prev) => {
                        let damped = client.mul_scalar(prev, momentum)?;
                        client.add(&damped, &update)?
                    }
                    None => update.clone(),
                };
                self.velocity.insert(id, buf.clone());
                update = buf;
            }

            let delta = client.mul_scalar(&update, lr)?;
            let new_param = client.sub(param, &delta)?;
            params.insert(id, new_param);
        }

        Ok(())
    }

    fn lr(&self) -> f64 {
        self.config.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn global_step(&self) -> u64 {
        self.global_step
    }

    fn advance_global_step(&mut self) {
        self.global_step += self.config.step_increase;
    }
}
