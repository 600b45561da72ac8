//! Per-element optimizer update rules
//!
//! The arithmetic shared by the 32-bit and blockwise-8-bit kernels.
//! Every function takes and returns f32 scalars; callers handle
//! storage width, gradient rescaling, weight decay placement and the
//! learning-rate application.

use crate::optim::OptimizerConfig;

/// Step-dependent scalars hoisted out of the element loops
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scalars {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    /// Adam first-moment bias correction: 1 - beta1^step
    pub corr1: f32,
    /// Adam second-moment bias correction: sqrt(1 - beta2^step)
    pub corr2: f32,
}

impl Scalars {
    pub fn new(config: &OptimizerConfig, step: u32) -> Self {
        Self {
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            corr1: 1.0 - config.beta1.powi(step as i32),
            corr2: (1.0 - config.beta2.powi(step as i32)).sqrt(),
        }
    }
}

/// Adam moment and update math
///
/// Returns `(m', v', update)`; the parameter delta is `-lr * update`,
/// with decoupled weight decay applied by the caller when configured.
#[inline]
pub(crate) fn adam_math(g: f32, m: f32, v: f32, s: &Scalars) -> (f32, f32, f32) {
    let m2 = s.beta1 * m + (1.0 - s.beta1) * g;
    let v2 = s.beta2 * v + (1.0 - s.beta2) * g * g;
    let update = (s.corr2 / s.corr1) * m2 / (v2.sqrt() + s.eps * s.corr2);
    (m2, v2, update)
}

/// Single-moment update rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OneStateRule {
    Momentum,
    RmsProp,
    Adagrad,
}

/// Single-moment math: returns `(state', update)`
///
/// `g` must already carry the gradient rescale and any L2 weight
/// decay. The parameter delta is `-lr * update`.
#[inline]
pub(crate) fn one_state_math(
    rule: OneStateRule,
    g: f32,
    state: f32,
    step: u32,
    s: &Scalars,
) -> (f32, f32) {
    match rule {
        OneStateRule::Momentum => {
            // The very first step seeds the buffer with the raw gradient.
            let m2 = if step == 1 { g } else { s.beta1 * state + g };
            (m2, m2)
        }
        OneStateRule::RmsProp => {
            let v2 = s.beta1 * state + (1.0 - s.beta1) * g * g;
            (v2, g / (v2.sqrt() + s.eps))
        }
        OneStateRule::Adagrad => {
            let v2 = state + g * g;
            (v2, g / (v2.sqrt() + s.eps))
        }
    }
}
