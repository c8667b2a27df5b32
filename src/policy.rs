//! Loss-scale policies for reduced-precision training
//!
//! FP16 has a narrower exponent range than FP32, so small gradients underflow
//! to zero. Scaling the loss before backward keeps gradient magnitudes in a
//! representable range; the pipeline divides the scale back out afterwards.
//! The policy decides how the scale evolves: `Fixed` never moves, `Dynamic`
//! backs off immediately on overflow and grows again only after a sustained
//! overflow-free window.

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Default multiplicative factor for dynamic scale moves.
pub const DEFAULT_SCALE_FACTOR: f64 = 2.0;
/// Default number of consecutive clean steps before the scale grows.
pub const DEFAULT_SCALE_WINDOW: u64 = 1000;
/// The scale never drops below this.
pub const DEFAULT_SCALE_FLOOR: f64 = 1.0;

/// Loss-scale update policy.
///
/// `update(overflow)` returns the overflow flag it was given; callers read
/// the new scale through `current()` afterwards.
#[derive(Debug, Clone)]
pub enum ScalePolicy {
    /// Constant scale; `update` is a no-op.
    Fixed { scale: f64 },
    /// Multiplicative backoff on overflow, growth after `scale_window`
    /// overflow-free steps.
    Dynamic {
        scale: f64,
        scale_factor: f64,
        scale_window: u64,
        floor: f64,
        cur_step: u64,
        last_overflow_step: u64,
    },
}

impl ScalePolicy {
    /// Constant loss scale.
    pub fn fixed(scale: f64) -> Result<Self> {
        if scale <= 0.0 {
            return Err(Error::InvalidArgument {
                arg: "scale",
                reason: format!("must be positive, got {scale}"),
            });
        }
        Ok(ScalePolicy::Fixed { scale })
    }

    /// Dynamic loss scale with the default floor of 1.0.
    pub fn dynamic(initial_scale: f64, scale_factor: f64, scale_window: u64) -> Result<Self> {
        if initial_scale <= 0.0 {
            return Err(Error::InvalidArgument {
                arg: "initial_scale",
                reason: format!("must be positive, got {initial_scale}"),
            });
        }
        if scale_factor <= 1.0 {
            return Err(Error::InvalidArgument {
                arg: "scale_factor",
                reason: format!("must be > 1.0, got {scale_factor}"),
            });
        }
        if scale_window == 0 {
            return Err(Error::InvalidArgument {
                arg: "scale_window",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(ScalePolicy::Dynamic {
            scale: initial_scale,
            scale_factor,
            scale_window,
            floor: DEFAULT_SCALE_FLOOR,
            cur_step: 1,
            last_overflow_step: 0,
        })
    }

    /// Dynamic scaling with sensible defaults: scale=65536, factor=2, window=1000.
    pub fn default_dynamic() -> Self {
        ScalePolicy::Dynamic {
            scale: 65536.0,
            scale_factor: DEFAULT_SCALE_FACTOR,
            scale_window: DEFAULT_SCALE_WINDOW,
            floor: DEFAULT_SCALE_FLOOR,
            cur_step: 1,
            last_overflow_step: 0,
        }
    }

    /// Override the minimum scale (dynamic variant only).
    pub fn with_floor(mut self, new_floor: f64) -> Result<Self> {
        if new_floor <= 0.0 {
            return Err(Error::InvalidArgument {
                arg: "floor",
                reason: format!("must be positive, got {new_floor}"),
            });
        }
        if let ScalePolicy::Dynamic { ref mut floor, .. } = self {
            *floor = new_floor;
        }
        Ok(self)
    }

    /// The current loss-scale multiplier.
    pub fn current(&self) -> f64 {
        match self {
            ScalePolicy::Fixed { scale } => *scale,
            ScalePolicy::Dynamic { scale, .. } => *scale,
        }
    }

    /// Advance the policy one step and return the overflow flag unchanged.
    ///
    /// Overflow shrinks the scale to `max(scale / factor, floor)` at once;
    /// growth by `factor` happens only when `scale_window` steps have passed
    /// since the last overflow (or the last growth), never cumulatively.
    pub fn update(&mut self, overflow: bool) -> bool {
        if let ScalePolicy::Dynamic {
            scale,
            scale_factor,
            scale_window,
            floor,
            cur_step,
            last_overflow_step,
        } = self
        {
            let mut next = if overflow {
                (*scale / *scale_factor).max(*floor)
            } else {
                *scale
            };
            let should_grow = *cur_step - *last_overflow_step >= *scale_window;
            if overflow || should_grow {
                *last_overflow_step = *cur_step;
            }
            if should_grow && !overflow {
                next *= *scale_factor;
            }
            *scale = next;
            *cur_step += 1;
        }
        overflow
    }

    /// Force the scale register to a new value.
    pub fn set_scale(&mut self, value: f64) {
        match self {
            ScalePolicy::Fixed { scale } => *scale = value,
            ScalePolicy::Dynamic { scale, .. } => *scale = value,
        }
    }
}

/// Scale source accepted by the step controllers: either a scalar tensor
/// (becomes a fixed policy) or a policy object.
pub enum ScaleSense<R: Runtime> {
    Value(Tensor<R>),
    Policy(ScalePolicy),
}

impl<R: Runtime> ScaleSense<R> {
    pub(crate) fn into_policy(self) -> Result<ScalePolicy> {
        match self {
            ScaleSense::Policy(policy) => Ok(policy),
            ScaleSense::Value(tensor) => ScalePolicy::fixed(read_scalar(&tensor)?),
        }
    }
}

/// Read a scale value out of a scalar tensor, rejecting anything that is not
/// a floating-point tensor of shape `()` or `(1,)`.
pub(crate) fn read_scalar<R: Runtime>(tensor: &Tensor<R>) -> Result<f64> {
    let shape = tensor.shape();
    if !matches!(shape, [] | [1]) {
        return Err(Error::InvalidArgument {
            arg: "scale_sense",
            reason: format!("expected shape () or (1,), got {shape:?}"),
        });
    }
    match tensor.dtype() {
        DType::F32 => Ok(tensor.item::<f32>()? as f64),
        DType::F64 => Ok(tensor.item::<f64>()?),
        dtype => Err(Error::InvalidArgument {
            arg: "scale_sense",
            reason: format!("expected a float32/float64 tensor, got {dtype:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    #[test]
    fn test_fixed_is_a_no_op() {
        let mut policy = ScalePolicy::fixed(128.0).unwrap();
        assert_eq!(policy.current(), 128.0);

        assert!(policy.update(true));
        assert_eq!(policy.current(), 128.0);
        assert!(!policy.update(false));
        assert_eq!(policy.current(), 128.0);
    }

    #[test]
    fn test_dynamic_backoff_is_exact() {
        let mut policy = ScalePolicy::dynamic(4096.0, 2.0, 1000).unwrap();
        policy.update(true);
        assert_eq!(policy.current(), 2048.0);
        policy.update(true);
        assert_eq!(policy.current(), 1024.0);
    }

    #[test]
    fn test_dynamic_backoff_stops_at_floor() {
        let mut policy = ScalePolicy::dynamic(1.0, 2.0, 1000).unwrap();
        policy.update(true);
        assert_eq!(policy.current(), 1.0);
    }

    #[test]
    fn test_dynamic_grows_once_per_window() {
        // window=3, factor=2, start=8: three clean steps -> 16, not 64
        let mut policy = ScalePolicy::dynamic(8.0, 2.0, 3).unwrap();
        policy.update(false);
        assert_eq!(policy.current(), 8.0);
        policy.update(false);
        assert_eq!(policy.current(), 8.0);
        policy.update(false);
        assert_eq!(policy.current(), 16.0);
    }

    #[test]
    fn test_dynamic_growth_repeats_each_window() {
        let mut policy = ScalePolicy::dynamic(8.0, 2.0, 2).unwrap();
        for _ in 0..4 {
            policy.update(false);
        }
        // two full windows -> two doublings
        assert_eq!(policy.current(), 32.0);
    }

    #[test]
    fn test_dynamic_overflow_restarts_window() {
        let mut policy = ScalePolicy::dynamic(8.0, 2.0, 3).unwrap();
        policy.update(false);
        policy.update(false);
        policy.update(true); // overflow two steps in: 8 -> 4, window restarts
        assert_eq!(policy.current(), 4.0);
        policy.update(false);
        policy.update(false);
        assert_eq!(policy.current(), 4.0);
        policy.update(false);
        assert_eq!(policy.current(), 8.0);
    }

    #[test]
    fn test_update_returns_the_flag() {
        let mut policy = ScalePolicy::default_dynamic();
        assert!(policy.update(true));
        assert!(!policy.update(false));
    }

    #[test]
    fn test_custom_floor() {
        let mut policy = ScalePolicy::dynamic(8.0, 2.0, 1000)
            .unwrap()
            .with_floor(4.0)
            .unwrap();
        policy.update(true);
        assert_eq!(policy.current(), 4.0);
        policy.update(true);
        assert_eq!(policy.current(), 4.0);
    }

    #[test]
    fn test_invalid_params() {
        assert!(ScalePolicy::fixed(0.0).is_err());
        assert!(ScalePolicy::dynamic(0.0, 2.0, 1000).is_err());
        assert!(ScalePolicy::dynamic(128.0, 1.0, 1000).is_err());
        assert!(ScalePolicy::dynamic(128.0, 2.0, 0).is_err());
        assert!(ScalePolicy::dynamic(128.0, 2.0, 10)
            .unwrap()
            .with_floor(0.0)
            .is_err());
    }

    #[test]
    fn test_scale_sense_from_tensor() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[256.0f32], &[1], &device);
        let policy = ScaleSense::Value(t).into_policy().unwrap();
        assert_eq!(policy.current(), 256.0);
    }

    #[test]
    fn test_scale_sense_rejects_bad_shape() {
        let (_client, device) = cpu_setup();
        let t = Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device);
        let err = ScaleSense::Value(t).into_policy().unwrap_err();
        assert!(err.to_string().contains("shape"));
    }
}
