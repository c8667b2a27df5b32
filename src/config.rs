//! Step-controller configuration

/// How the transform pipeline clips gradients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipMode {
    /// Pass gradients through unchanged.
    None,
    /// Clamp every element to `[-v, v]`.
    Value(f64),
    /// Rescale each tensor whose L2 norm exceeds `v`.
    Norm(f64),
}

impl ClipMode {
    /// Map an integer clip code to a mode: 0 clips by value, 1 by norm.
    /// Unknown codes disable clipping rather than erroring.
    pub fn from_code(code: i64, value: f64) -> Self {
        match code {
            0 => ClipMode::Value(value),
            1 => ClipMode::Norm(value),
            _ => ClipMode::None,
        }
    }

    /// The clip threshold, if any.
    pub fn clip_value(&self) -> Option<f64> {
        match self {
            ClipMode::None => None,
            ClipMode::Value(v) | ClipMode::Norm(v) => Some(*v),
        }
    }
}

impl Default for ClipMode {
    fn default() -> Self {
        ClipMode::Norm(1.0)
    }
}

/// Training-step configuration
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub clip: ClipMode,
    pub accumulation_steps: u64,
    /// Clip the accumulation buffer by global norm instead of per-tensor
    /// at the end of a cycle (accumulating controller only).
    pub global_norm_clip: bool,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            clip: ClipMode::default(),
            accumulation_steps: 1,
            global_norm_clip: false,
        }
    }
}

impl StepConfig {
    pub fn with_clip(mut self, clip: ClipMode) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_accumulation_steps(mut self, steps: u64) -> Self {
        self.accumulation_steps = steps;
        self
    }

    pub fn with_global_norm_clip(mut self, enable: bool) -> Self {
        self.global_norm_clip = enable;
        self
    }
}
