//! Gradient transform pipeline: unscale, clip, reduce
//!
//! The order is load-bearing. Gradients come out of backward multiplied by
//! the loss scale, so unscaling must run before any clip threshold is
//! applied; the cross-worker reduction runs last and runs unconditionally —
//! whether the update is applied is decided afterwards from the overflow
//! flag, never by skipping the reduction itself.

use crate::config::ClipMode;
use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps, UtilityOps};
use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Divide every gradient by the current loss scale (reciprocal multiply in
/// the gradient's own dtype).
pub fn unscale_grads<R, C>(client: &C, grads: &mut GradStore<R>, scale: f64) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + ScalarOps<R>,
{
    let inv_scale = 1.0 / scale;
    let ids: Vec<TensorId> = grads.keys().copied().collect();
    for id in ids {
        let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
            reason: format!("missing gradient for tensor {id:?}"),
        })?;
        let unscaled = client.mul_scalar(grad, inv_scale)?;
        grads.insert(id, unscaled);
    }
    Ok(())
}

/// Clip every gradient tensor independently according to `clip`.
///
/// `ClipMode::None` passes gradients through unchanged.
pub fn clip_grads<R, C>(client: &C, grads: &mut GradStore<R>, clip: ClipMode) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R> + UtilityOps<R>,
{
    let ids: Vec<TensorId> = grads.keys().copied().collect();
    match clip {
        ClipMode::None => Ok(()),
        ClipMode::Value(v) => {
            for id in ids {
                let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
                    reason: format!("missing gradient for tensor {id:?}"),
                })?;
                let clipped = client.clamp(grad, -v, v)?;
                grads.insert(id, clipped);
            }
            Ok(())
        }
        ClipMode::Norm(v) => {
            for id in ids {
                let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
                    reason: format!("missing gradient for tensor {id:?}"),
                })?;
                let norm = tensor_norm(client, grad)?;
                if norm > v {
                    let scale = v / (norm + 1e-6);
                    let clipped = client.mul_scalar(grad, scale)?;
                    grads.insert(id, clipped);
                }
            }
            Ok(())
        }
    }
}

/// Clip gradients in-place by global L2 norm across the whole set.
///
/// Returns the original global norm (before clipping).
pub fn clip_by_global_norm<R, C>(
    client: &C,
    grads: &mut GradStore<R>,
    max_norm: f64,
) -> Result<f64>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + ScalarOps<R> + ReduceOps<R>,
{
    if max_norm <= 0.0 {
        return Err(Error::InvalidArgument {
            arg: "max_norm",
            reason: format!("must be positive, got {max_norm}"),
        });
    }

    let ids: Vec<TensorId> = grads.keys().copied().collect();

    let mut total_norm_sq = 0.0f64;
    for &id in &ids {
        if let Some(grad) = grads.get(id) {
            let norm = tensor_norm(client, grad)?;
            total_norm_sq += norm * norm;
        }
    }

    let total_norm = total_norm_sq.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for id in ids {
            if let Some(grad) = grads.get(id) {
                let clipped = client.mul_scalar(grad, scale)?;
                grads.insert(id, clipped);
            }
        }
    }

    Ok(total_norm)
}

/// Average gradients across the process group.
///
/// Each tensor is summed in place over all workers, then divided by the
/// worker count once the whole batch of reductions has been synced. No-op
/// when `world_size <= 1`. Every worker must reach this call in the same
/// step; a hung collective is unrecoverable here and surfaces as a
/// `DistributedError` from the communicator.
pub fn reduce_grads<R, C>(
    comm: &dyn Communicator,
    client: &C,
    grads: &mut GradStore<R>,
) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + ScalarOps<R>,
{
    let world_size = comm.world_size();
    if world_size <= 1 {
        return Ok(());
    }

    let ids: Vec<TensorId> = grads.keys().copied().collect();

    for &id in &ids {
        let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
            reason: format!("missing gradient for tensor {id:?}"),
        })?;
        if !grad.is_contiguous() {
            return Err(Error::DistributedError {
                reason: format!("gradient {id:?} must be contiguous for in-place all_reduce"),
            });
        }
        // Safety: `grad` is contiguous and owned by the store for the whole
        // call, so the pointer covers exactly `numel` elements of its dtype.
        unsafe { comm.all_reduce(grad.data_ptr(), grad.numel(), grad.dtype(), ReduceOp::Sum) }
            .map_err(|e| Error::DistributedError {
                reason: format!("gradient all_reduce: {e}"),
            })?;
    }

    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("communicator sync after gradient reduction: {e}"),
    })?;

    // every worker now holds the group sum; one scalar divide yields the mean
    let inv_world = 1.0 / world_size as f64;
    for id in ids {
        if let Some(summed) = grads.get(id) {
            let mean = client.mul_scalar(summed, inv_world)?;
            grads.insert(id, mean);
        }
    }

    Ok(())
}

/// Run the full pipeline in its fixed order: unscale, clip, reduce.
pub fn apply_pipeline<R, C>(
    comm: &dyn Communicator,
    client: &C,
    grads: &mut GradStore<R>,
    scale: f64,
    clip: ClipMode,
) -> Result<()>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R> + UtilityOps<R>,
{
    unscale_grads(client, grads, scale)?;
    clip_grads(client, grads, clip)?;
    reduce_grads(comm, client, grads)
}

/// L2 norm of one tensor, computed on-device.
fn tensor_norm<R, C>(client: &C, tensor: &Tensor<R>) -> Result<f64>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + ReduceOps<R>,
{
    let flat = tensor.reshape(&[tensor.numel()])?;
    let sq = client.mul(&flat, &flat)?;
    let sum = client.sum(&sq, &[0], false)?;
    Ok((sum.to_vec::<f32>()[0] as f64).sqrt())
}
