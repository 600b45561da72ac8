//! Percentile-based gradient-norm clipping
//!
//! Keeps a ring buffer of the last 100 squared gradient norms. Each
//! call measures the current gradient, stores its squared norm at
//! `step % 100`, and reads the configured percentile of the sorted
//! history as the clip threshold. The returned scale is applied to the
//! gradient by the caller; it never exceeds 1.0.

use crate::error::{QfResult, QuantForgeError};
use crate::tensor::FloatElem;

/// Number of past gradient norms retained
pub const NORM_HISTORY_LEN: usize = 100;

/// Ring buffer of squared gradient norms
#[derive(Debug, Clone)]
pub struct GradNormHistory {
    norms_sq: [f32; NORM_HISTORY_LEN],
}

impl GradNormHistory {
    /// Empty history (all zeros)
    pub fn new() -> Self {
        Self {
            norms_sq: [0.0; NORM_HISTORY_LEN],
        }
    }

    /// The raw squared norms, indexed by `step % 100`
    pub fn norms_sq(&self) -> &[f32; NORM_HISTORY_LEN] {
        &self.norms_sq
    }
}

impl Default for GradNormHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one percentile-clip call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipResult {
    /// L2 norm of the current gradient
    pub current_norm: f32,
    /// Clip threshold: the percentile of the norm history
    pub clip_value: f32,
    /// Scale to apply to the gradient, `min(1, clip/current)`
    pub gnorm_scale: f32,
}

/// Measure the gradient norm, update the history, derive the clip scale
///
/// `step` is 1-based; the first step seeds the entire history with the
/// current squared norm so early percentiles are not dragged toward
/// zero by empty slots. `percentile` is a rank into the 100-entry
/// sorted history and must be < 100.
pub fn percentile_clip<T: FloatElem>(
    grad: &[T],
    history: &mut GradNormHistory,
    step: u32,
    percentile: usize,
) -> QfResult<ClipResult> {
    if percentile >= NORM_HISTORY_LEN {
        return Err(QuantForgeError::InvalidPercentile(percentile));
    }
    if step == 0 {
        return Err(QuantForgeError::StateMismatch(
            "step counter starts at 1".to_string(),
        ));
    }

    let norm_sq = grad
        .iter()
        .map(|v| {
            let x = v.to_f32() as f64;
            x * x
        })
        .sum::<f64>() as f32;

    if step == 1 {
        history.norms_sq.fill(norm_sq);
    } else {
        history.norms_sq[step as usize % NORM_HISTORY_LEN] = norm_sq;
    }

    let mut sorted = history.norms_sq;
    sorted.sort_by(f32::total_cmp);

    let current_norm = norm_sq.sqrt();
    let clip_value = sorted[percentile].sqrt();
    let gnorm_scale = if current_norm > clip_value && current_norm > 0.0 {
        clip_value / current_norm
    } else {
        1.0
    };

    Ok(ClipResult {
        current_norm,
        clip_value,
        gnorm_scale,
    })
}
