//! Floating-point overflow detection around the backward pass
//!
//! A detection window brackets the gradient computation: `begin` after the
//! forward pass has produced its value, `end` once the gradients exist. The
//! window token is move-only, so a window cannot be closed before it was
//! opened, nor closed twice. `end` returns a raw numeric flag (the number of
//! gradient tensors containing NaN/Inf); `aggregate_overflow` sums the raw
//! flags across all workers so that one worker's overflow forces every worker
//! to skip the same update.

use crate::error::{Error, Result};
use numr::autograd::GradStore;
use numr::ops::{ReduceOps, UnaryOps};
use numr::runtime::{Communicator, ReduceOp, Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// Token pairing a [`OverflowDetector::begin`] with its `end`.
#[must_use = "an overflow window must be closed with OverflowDetector::end"]
pub struct OverflowWindow {
    _opened: (),
}

/// Detects NaN/Inf in gradient tensors produced inside a begin/end window.
pub struct OverflowDetector;

impl OverflowDetector {
    /// Open a detection window.
    ///
    /// Call after the upstream computation (the forward pass) is complete and
    /// before the computation whose overflow is being measured starts.
    pub fn begin() -> OverflowWindow {
        OverflowWindow { _opened: () }
    }

    /// Close the window and return the raw overflow flag: the number of
    /// gradient tensors containing at least one NaN/Inf element. Zero means
    /// every gradient is clean.
    pub fn end<R, C>(window: OverflowWindow, client: &C, grads: &GradStore<R>) -> Result<f64>
    where
        R: Runtime,
        C: RuntimeClient<R> + UnaryOps<R> + ReduceOps<R>,
    {
        let _ = window;
        let ids: Vec<TensorId> = grads.keys().copied().collect();
        let mut flag_sum = 0.0f64;
        for id in ids {
            let grad = grads.get(id).ok_or_else(|| Error::TrainingError {
                reason: format!("missing gradient for tensor {id:?}"),
            })?;
            if grad_overflowed(client, grad)? {
                flag_sum += 1.0;
            }
        }
        Ok(flag_sum)
    }
}

/// A gradient trips the detector when any element is NaN or Inf. The two
/// masks are reduced separately so a NaN hit skips the Inf pass entirely.
fn grad_overflowed<R, C>(client: &C, grad: &Tensor<R>) -> Result<bool>
where
    R: Runtime,
    C: UnaryOps<R> + ReduceOps<R>,
{
    let any_nan = client.any(&client.isnan(grad)?, &[], false)?;
    if any_nan.item::<u8>()? != 0 {
        return Ok(true);
    }
    let any_inf = client.any(&client.isinf(grad)?, &[], false)?;
    Ok(any_inf.item::<u8>()? != 0)
}

/// Sum a raw overflow flag over all workers and threshold the total.
///
/// The all-reduce runs on a one-element tensor placed on the same device as
/// the gradients; with a single worker (or an empty gradient set) the local
/// flag is thresholded directly. Every worker receives the same total, so
/// the skip decision is identical everywhere.
pub fn aggregate_overflow<R: Runtime>(
    comm: &dyn Communicator,
    grads: &GradStore<R>,
    raw_flag: f64,
) -> Result<bool> {
    if comm.world_size() <= 1 {
        return Ok(overflow_from_flag(raw_flag));
    }
    let device = match grads.keys().next().copied().and_then(|id| grads.get(id)) {
        Some(tensor) => tensor.device(),
        None => return Ok(overflow_from_flag(raw_flag)),
    };

    let flag = Tensor::<R>::from_slice(&[raw_flag as f32], &[1], device);
    // Safety: `flag` was just built from a one-element slice, so it is
    // contiguous and the pointer covers a single element of its dtype.
    unsafe { comm.all_reduce(flag.data_ptr(), 1, flag.dtype(), ReduceOp::Sum) }.map_err(|e| {
        Error::DistributedError {
            reason: format!("overflow-flag all_reduce: {e}"),
        }
    })?;
    comm.sync().map_err(|e| Error::DistributedError {
        reason: format!("communicator sync after overflow exchange: {e}"),
    })?;

    Ok(overflow_from_flag(flag.to_vec::<f32>()[0] as f64))
}

/// Threshold rule shared by the local and distributed paths: any worker
/// contributing a nonzero flag makes the summed flag cross 1.0.
pub fn overflow_from_flag(reduced_flag: f64) -> bool {
    reduced_flag >= 1.0
}
