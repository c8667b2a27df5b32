//! # scalr
//!
//! **Loss-scaled training-step control built on numr.**
//!
//! scalr implements the per-step controller for mixed-precision data-parallel
//! training: scale the loss before backward so reduced-precision gradients
//! stay representable, detect NaN/Inf in the result, decide whether the
//! optimizer runs this step, and retune the scale over time. It uses numr's
//! tensors, autograd, and communicator directly — no reimplementation, no
//! wrappers.
//!
//! ## One step
//!
//! ```text
//! forward ──▶ overflow window ──▶ backward (loss × scale)
//!                                     │
//!                   unscale ▶ clip ▶ all-reduce
//!                                     │
//!          overflow flag ── all-reduce ── threshold
//!                                     │
//!          policy.update(overflow) ── skip or apply optimizer
//! ```
//!
//! ## Design
//!
//! - **Fixed order**: unscaling precedes clipping precedes reduction; the
//!   reduction cost is unconditional and only the update is gated.
//! - **Global overflow**: per-worker flags are summed across the group, so
//!   one worker's overflow skips the update everywhere.
//! - **Tagged policy**: `ScalePolicy::Fixed` vs `ScalePolicy::Dynamic` as an
//!   enum, no virtual dispatch.
//! - **Accumulation**: `AccumTrainStep` sums unscaled gradients over N
//!   sub-steps into a persistent buffer with cycle-sticky overflow.

pub mod accum;
pub mod config;
pub mod error;
pub mod net;
pub mod optim;
pub mod overflow;
pub mod pipeline;
pub mod policy;
pub mod step;

pub use accum::GradAccumulator;
pub use config::{ClipMode, StepConfig};
pub use error::{Error, Result};
pub use net::LossNetwork;
pub use optim::{Sgd, SgdConfig, StepOptimizer};
pub use overflow::{OverflowDetector, OverflowWindow};
pub use policy::{ScalePolicy, ScaleSense};
pub use step::{AccumTrainStep, StepOutput, TrainStep};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::runtime::{Communicator, NoOpCommunicator, Runtime, RuntimeClient};
pub use numr::tensor::Tensor;

#[cfg(test)]
pub(crate) mod test_utils {
    use numr::runtime::cpu::{CpuClient, CpuDevice};

    /// Create a CPU client and device for use in unit tests.
    pub(crate) fn cpu_setup() -> (CpuClient, CpuDevice) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (client, device)
    }
}
