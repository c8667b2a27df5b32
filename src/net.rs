//! External network seam
//!
//! The step controllers drive an external model through this trait: an
//! autograd-tracked forward pass producing a scalar loss, and a backward
//! pass seeded with the current loss scale. Gradients come back keyed by the
//! parameter ids the implementation wrapped into `Var`s.

use std::collections::HashMap;

use crate::error::{Error, Result};
use numr::autograd::{GradStore, Var, backward, var_mul_scalar};
use numr::dtype::DType;
use numr::ops::{BinaryOps, ReduceOps, ScalarOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::{Tensor, TensorId};

/// A trainable network with a scalar loss output.
///
/// Implementations build `Var`s from the parameter map with
/// `Var::with_id(tensor, id, true)` so that gradients land under the same
/// ids the optimizer tracks.
pub trait LossNetwork<R, C>
where
    R: Runtime,
    C: RuntimeClient<R> + BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
    R::Client: BinaryOps<R> + UnaryOps<R> + ScalarOps<R> + ReduceOps<R>,
{
    /// Autograd-tracked forward pass returning the scalar loss.
    fn forward(
        &self,
        client: &C,
        params: &HashMap<TensorId, Tensor<R>>,
        inputs: &[Tensor<R>],
    ) -> Result<Var<R>>;

    /// Backward pass with a scaling seed: returns the gradients of
    /// `loss * seed`.
    ///
    /// Scaling the seed instead of the gradients keeps the backward
    /// arithmetic at high magnitude in reduced precision; the transform
    /// pipeline divides the scale back out.
    fn backward_scaled(&self, client: &C, loss: &Var<R>, seed: f64) -> Result<GradStore<R>> {
        let seeded = var_mul_scalar(loss, seed, client)?;
        Ok(backward(&seeded, client)?)
    }
}

/// Read a scalar loss value off its tensor.
pub(crate) fn loss_value<R: Runtime>(tensor: &Tensor<R>) -> Result<f64> {
    match tensor.dtype() {
        DType::F32 => Ok(tensor.item::<f32>()? as f64),
        DType::F64 => Ok(tensor.item::<f64>()?),
        dtype => Err(Error::TrainingError {
            reason: format!("loss must be float32/float64, got {dtype:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::autograd::{var_mean, var_mul, var_sub};
    use numr::runtime::cpu::{CpuClient, CpuRuntime};

    struct QuadNet {
        target: Tensor<CpuRuntime>,
        w_id: TensorId,
    }

    impl LossNetwork<CpuRuntime, CpuClient> for QuadNet {
        fn forward(
            &self,
            client: &CpuClient,
            params: &HashMap<TensorId, Tensor<CpuRuntime>>,
            _inputs: &[Tensor<CpuRuntime>],
        ) -> Result<Var<CpuRuntime>> {
            let w = Var::with_id(params[&self.w_id].clone(), self.w_id, true);
            let t = Var::new(self.target.clone(), false);
            let diff = var_sub(&w, &t, client)?;
            let sq = var_mul(&diff, &diff, client)?;
            Ok(var_mean(&sq, &[0], false, client)?)
        }
    }

    #[test]
    fn test_backward_scaled_multiplies_gradients() {
        let (client, device) = cpu_setup();

        let w = Tensor::<CpuRuntime>::from_slice(&[3.0f32, 4.0], &[2], &device);
        let w_id = w.id();
        let mut params = HashMap::new();
        params.insert(w_id, w);

        let net = QuadNet {
            target: Tensor::<CpuRuntime>::from_slice(&[1.0f32, 1.0], &[2], &device),
            w_id,
        };

        // loss = mean((w - t)^2), dL/dw = (w - t) for n = 2
        let loss = net.forward(&client, &params, &[]).unwrap();
        let grads = net.backward_scaled(&client, &loss, 100.0).unwrap();

        let g = grads.get(w_id).unwrap().to_vec::<f32>();
        assert!((g[0] - 200.0).abs() < 1e-3);
        assert!((g[1] - 300.0).abs() < 1e-3);
    }

    #[test]
    fn test_loss_value_reads_f32() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[2.5f32], &[1], &device);
        assert!((loss_value(&t).unwrap() - 2.5).abs() < 1e-12);
    }
}
