//! One-call training-step controllers
//!
//! [`TrainStep`] drives one forward/backward/update round with loss scaling:
//! forward, scaled backward inside an overflow window, gradient transform
//! pipeline, cross-worker overflow aggregation, scale-policy update, and a
//! gated optimizer invocation. [`AccumTrainStep`] layers gradient
//! accumulation on top, deferring the optimizer to the end of each cycle.
//!
//! Every worker runs the same step in lockstep; the only synchronization
//! points are the gradient and overflow all-reduces inside the step.

use std::collections::HashMap;
use std::sync::Arc;

use crate::accum::GradAccumulator;
use crate::config::StepConfig;
use crate::error::Result;
use crate::net::{loss_value, LossNetwork};
use crate::optim::StepOptimizer;
use crate::overflow::{aggregate_overflow, OverflowDetector};
use crate::pipeline::{
    apply_pipeline, clip_by_global_norm, clip_grads, reduce_grads, unscale_grads,
};
use crate::policy::{read_scalar, ScalePolicy, ScaleSense};
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, TypeConversionOps, UnaryOps, UtilityOps};
use numr::runtime::{Communicator, Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Result of one step (or sub-step) call.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    /// Loss for this step; the running cycle mean for the accumulating
    /// controller.
    pub loss: f64,
    /// Whether the update was skipped for overflow (cycle-sticky for the
    /// accumulating controller).
    pub overflow: bool,
    /// The loss scale this step ran under.
    pub scale: f64,
    /// Learning rate reported by the optimizer.
    pub lr: f64,
}

/// Non-accumulating training-step controller.
pub struct TrainStep<N, O> {
    network: N,
    optimizer: O,
    policy: ScalePolicy,
    config: StepConfig,
    comm: Arc<dyn Communicator>,
}

impl<N, O> TrainStep<N, O> {
    /// Build a controller from a scale source.
    ///
    /// Fails with `InvalidArgument` before any step runs if the scale source
    /// is a tensor that is not a float scalar of shape `()` or `(1,)`.
    pub fn new<R: Runtime>(
        network: N,
        optimizer: O,
        scale_sense: ScaleSense<R>,
        config: StepConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let policy = scale_sense.into_policy()?;
        Ok(Self {
            network,
            optimizer,
            policy,
            config,
            comm,
        })
    }

    /// Run one training step.
    ///
    /// The optimizer's global-step counter advances whether or not the
    /// update was applied, keeping step-keyed learning-rate schedules in
    /// sync across skipped steps.
    pub fn step<R, C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        inputs: &[Tensor<R>],
    ) -> Result<StepOutput>
    where
        R: Runtime,
        C: RuntimeClient<R>
            + BinaryOps<R>
            + UnaryOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + UtilityOps<R>,
        R::Client: BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
        N: LossNetwork<R, C>,
        O: StepOptimizer<R>,
    {
        let scale = self.policy.current();

        let loss = self.network.forward(client, params, inputs)?;
        let loss_val = loss_value(loss.tensor())?;

        let window = OverflowDetector::begin();
        let mut grads = self.network.backward_scaled(client, &loss, scale)?;

        apply_pipeline(self.comm.as_ref(), client, &mut grads, scale, self.config.clip)?;

        let raw_flag = OverflowDetector::end(window, client, &grads)?;
        let overflow = aggregate_overflow(self.comm.as_ref(), &grads, raw_flag)?;
        let overflow = self.policy.update(overflow);

        if !overflow {
            self.optimizer.apply(client, params, &grads)?;
        }
        let lr = self.optimizer.lr();
        self.optimizer.advance_global_step();

        Ok(StepOutput {
            loss: loss_val,
            overflow,
            scale,
            lr,
        })
    }

    /// Force the scale register from a float scalar tensor.
    ///
    /// Fails with `InvalidArgument` (and leaves the register untouched) for
    /// any other shape or dtype.
    pub fn set_scale<R: Runtime>(&mut self, value: &Tensor<R>) -> Result<()> {
        let v = read_scalar(value)?;
        self.policy.set_scale(v);
        Ok(())
    }

    /// The current loss scale.
    pub fn scale(&self) -> f64 {
        self.policy.current()
    }

    pub fn policy(&self) -> &ScalePolicy {
        &self.policy
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }
}

/// Accumulating training-step controller.
///
/// Gradients are unscaled, all-reduced, and folded into a persistent buffer
/// on every sub-step; the optimizer runs once per completed cycle, and only
/// if no sub-step in the cycle overflowed. `accumulation_steps == 1`
/// degenerates to [`TrainStep`] behavior.
pub struct AccumTrainStep<R: Runtime, N, O> {
    network: N,
    optimizer: O,
    policy: ScalePolicy,
    config: StepConfig,
    comm: Arc<dyn Communicator>,
    accumulator: GradAccumulator<R>,
}

impl<R: Runtime, N, O> AccumTrainStep<R, N, O> {
    /// Build an accumulating controller; the parameter map fixes the shapes
    /// of the accumulation buffer.
    pub fn new(
        network: N,
        optimizer: O,
        scale_sense: ScaleSense<R>,
        config: StepConfig,
        params: &HashMap<TensorId, Tensor<R>>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let policy = scale_sense.into_policy()?;
        let accumulator = GradAccumulator::new(config.accumulation_steps, params)?;
        Ok(Self {
            network,
            optimizer,
            policy,
            config,
            comm,
            accumulator,
        })
    }

    /// Run one sub-step.
    ///
    /// Mid-cycle sub-steps return the running mean loss and the sticky
    /// overflow flag without touching the optimizer. The cycle-completing
    /// sub-step updates the scale policy from the sticky flag, then either
    /// skips the optimizer (overflow) or clips the buffer and applies it;
    /// the buffer is re-zeroed either way.
    pub fn step<C>(
        &mut self,
        client: &C,
        params: &mut HashMap<TensorId, Tensor<R>>,
        inputs: &[Tensor<R>],
    ) -> Result<StepOutput>
    where
        C: RuntimeClient<R>
            + BinaryOps<R>
            + UnaryOps<R>
            + ScalarOps<R>
            + ReduceOps<R>
            + UtilityOps<R>
            + TypeConversionOps<R>,
        R::Client: BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
        N: LossNetwork<R, C>,
        O: StepOptimizer<R>,
    {
        let scale = self.policy.current();

        let loss = self.network.forward(client, params, inputs)?;
        let loss_val = loss_value(loss.tensor())?;
        let (cycle_complete, mean_loss) = self.accumulator.begin_sub_step(loss_val);

        let window = OverflowDetector::begin();
        let mut grads = self.network.backward_scaled(client, &loss, scale)?;

        // each sub-step contributes unscaled, worker-averaged gradients
        unscale_grads(client, &mut grads, scale)?;
        reduce_grads(self.comm.as_ref(), client, &mut grads)?;

        let raw_flag = OverflowDetector::end(window, client, &grads)?;
        let sub_overflow = aggregate_overflow(self.comm.as_ref(), &grads, raw_flag)?;
        let cycle_overflow = self.accumulator.record_overflow(sub_overflow);
        self.accumulator.merge(client, &grads)?;

        if !cycle_complete {
            return Ok(StepOutput {
                loss: mean_loss,
                overflow: cycle_overflow,
                scale,
                lr: self.optimizer.lr(),
            });
        }

        let overflow = self.policy.update(cycle_overflow);
        if !overflow {
            let mut accumulated = self.accumulator.grads();
            if self.config.global_norm_clip {
                let max_norm = self.config.clip.clip_value().unwrap_or(1.0);
                clip_by_global_norm(client, &mut accumulated, max_norm)?;
            } else {
                clip_grads(client, &mut accumulated, self.config.clip)?;
            }
            self.optimizer.apply(client, params, &accumulated)?;
            self.optimizer.advance_global_step();
        }
        self.accumulator.reset_cycle();

        Ok(StepOutput {
            loss: mean_loss,
            overflow,
            scale,
            lr: self.optimizer.lr(),
        })
    }

    /// Force the scale register from a float scalar tensor.
    pub fn set_scale(&mut self, value: &Tensor<R>) -> Result<()> {
        let v = read_scalar(value)?;
        self.policy.set_scale(v);
        Ok(())
    }

    /// The current loss scale.
    pub fn scale(&self) -> f64 {
        self.policy.current()
    }

    pub fn policy(&self) -> &ScalePolicy {
        &self.policy
    }

    pub fn accumulator(&self) -> &GradAccumulator<R> {
        &self.accumulator
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }
}
