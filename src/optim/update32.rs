//! Full-precision (32-bit state) optimizer kernels
//!
//! Universal update for 32-bit moments and 32/16-bit gradients and
//! parameters. All six rules live here; LARS and LAMB are Momentum and
//! Adam with the trust-ratio update clamp engaged via `max_unorm`.
//!
//! When `max_unorm > 0` the kernel runs two phases: a read-only pass
//! recomputes the prospective updates to measure their norm, then the
//! apply pass scales the learning rate so the update norm never
//! exceeds `max_unorm * ||param||`.

use rayon::prelude::*;

use crate::error::{check_len, QfResult, QuantForgeError};
use crate::optim::rules::{adam_math, one_state_math, OneStateRule, Scalars};
use crate::optim::{OptimizerConfig, OptimizerKind};
use crate::tensor::FloatElem;

/// Chunk width for ordered norm reductions
const NORM_CHUNK: usize = 4096;

/// Perform an in-place optimizer update with 32-bit state
///
/// `state2` must be `Some` exactly for the two-moment rules
/// (Adam, LAMB) and `None` otherwise; the step counter starts at 1.
/// All validation happens before any buffer is mutated.
#[allow(clippy::too_many_arguments)]
pub fn optimizer_update_32bit<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &mut [T],
    state1: &mut [f32],
    mut state2: Option<&mut [f32]>,
    step: u32,
    config: &OptimizerConfig,
) -> QfResult<()> {
    check_len("param", grad.len(), param.len())?;
    check_len("state1", grad.len(), state1.len())?;
    if kind.uses_second_moment() {
        match &state2 {
            Some(s2) => check_len("state2", grad.len(), s2.len())?,
            None => {
                return Err(QuantForgeError::StateMismatch(format!(
                    "{} requires a second moment buffer",
                    kind
                )))
            }
        }
    } else if state2.is_some() {
        return Err(QuantForgeError::StateMismatch(format!(
            "{} takes a single moment buffer",
            kind
        )));
    }
    if step == 0 {
        return Err(QuantForgeError::StateMismatch(
            "step counter starts at 1".to_string(),
        ));
    }

    let s = Scalars::new(config, step);
    let lr = config.lr
        * trust_ratio_scale(kind, grad, param, state1, state2.as_deref(), step, config, &s);

    tracing::trace!("{} update: {} elements, step {}", kind, grad.len(), step);

    match kind {
        OptimizerKind::Adam | OptimizerKind::Lamb => {
            let state2 = state2.take().ok_or_else(|| {
                QuantForgeError::InternalError("second moment lost after validation".to_string())
            })?;
            apply_two_state(grad, param, state1, state2, lr, config, s);
        }
        OptimizerKind::Momentum | OptimizerKind::Lars => {
            apply_one_state(OneStateRule::Momentum, grad, param, state1, step, lr, config, s);
        }
        OptimizerKind::RmsProp => {
            apply_one_state(OneStateRule::RmsProp, grad, param, state1, step, lr, config, s);
        }
        OptimizerKind::Adagrad => {
            apply_one_state(OneStateRule::Adagrad, grad, param, state1, step, lr, config, s);
        }
    }
    Ok(())
}

fn apply_two_state<T: FloatElem>(
    grad: &[T],
    param: &mut [T],
    state1: &mut [f32],
    state2: &mut [f32],
    lr: f32,
    config: &OptimizerConfig,
    s: Scalars,
) {
    let wd = config.weight_decay;
    let gnorm_scale = config.gnorm_scale;
    let skip_zeros = config.skip_zeros;

    param
        .par_iter_mut()
        .zip(grad.par_iter())
        .zip(state1.par_iter_mut())
        .zip(state2.par_iter_mut())
        .for_each(|(((p, g), m), v)| {
            let g_raw = g.to_f32();
            if skip_zeros && g_raw == 0.0 {
                return;
            }
            let (m2, v2, update) = adam_math(gnorm_scale * g_raw, *m, *v, &s);
            *m = m2;
            *v = v2;

            let mut pv = p.to_f32();
            if wd > 0.0 {
                // Decoupled (AdamW-style) weight decay
                pv *= 1.0 - lr * wd;
            }
            pv -= lr * update;
            *p = T::from_f32(pv);
        });
}

#[allow(clippy::too_many_arguments)]
fn apply_one_state<T: FloatElem>(
    rule: OneStateRule,
    grad: &[T],
    param: &mut [T],
    state1: &mut [f32],
    step: u32,
    lr: f32,
    config: &OptimizerConfig,
    s: Scalars,
) {
    let wd = config.weight_decay;
    let gnorm_scale = config.gnorm_scale;
    let skip_zeros = config.skip_zeros;

    param
        .par_iter_mut()
        .zip(grad.par_iter())
        .zip(state1.par_iter_mut())
        .for_each(|((p, g), st)| {
            let g_raw = g.to_f32();
            if skip_zeros && g_raw == 0.0 {
                return;
            }
            let mut pv = p.to_f32();
            // L2 weight decay folds into the gradient for 1-state rules
            let gt = gnorm_scale * g_raw + wd * pv;
            let (st2, update) = one_state_math(rule, gt, *st, step, &s);
            *st = st2;
            pv -= lr * update;
            *p = T::from_f32(pv);
        });
}

/// Learning-rate factor implementing the LARS/LAMB trust-ratio clamp
///
/// Returns 1.0 when the clamp is disabled or not exceeded.
#[allow(clippy::too_many_arguments)]
fn trust_ratio_scale<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &[T],
    state1: &[f32],
    state2: Option<&[f32]>,
    step: u32,
    config: &OptimizerConfig,
    s: &Scalars,
) -> f32 {
    if config.max_unorm <= 0.0 {
        return 1.0;
    }
    let param_norm = l2_norm(param);
    let update_norm = prospective_update_norm(kind, grad, param, state1, state2, step, config, s);
    clamp_factor(config.max_unorm, param_norm, update_norm)
}

pub(crate) fn clamp_factor(max_unorm: f32, param_norm: f32, update_norm: f32) -> f32 {
    if update_norm > max_unorm * param_norm && update_norm > 0.0 {
        max_unorm * param_norm / update_norm
    } else {
        1.0
    }
}

/// L2 norm with a deterministic reduction order
///
/// Partial sums are produced per fixed-width chunk in parallel and then
/// combined in chunk order, so repeated calls are bit-identical
/// regardless of thread scheduling.
pub(crate) fn l2_norm<T: FloatElem>(xs: &[T]) -> f32 {
    let partials: Vec<f64> = xs
        .par_chunks(NORM_CHUNK)
        .map(|chunk| {
            chunk
                .iter()
                .map(|v| {
                    let x = v.to_f32() as f64;
                    x * x
                })
                .sum()
        })
        .collect();
    partials.into_iter().sum::<f64>().sqrt() as f32
}

/// Norm of the updates the apply pass would produce, without writing
#[allow(clippy::too_many_arguments)]
fn prospective_update_norm<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &[T],
    state1: &[f32],
    state2: Option<&[f32]>,
    step: u32,
    config: &OptimizerConfig,
    s: &Scalars,
) -> f32 {
    let partials: Vec<f64> = match kind {
        OptimizerKind::Adam | OptimizerKind::Lamb => {
            let state2 = state2.unwrap_or(&[]);
            grad.par_chunks(NORM_CHUNK)
                .zip(state1.par_chunks(NORM_CHUNK))
                .zip(state2.par_chunks(NORM_CHUNK))
                .map(|((g_c, m_c), v_c)| {
                    let mut acc = 0.0f64;
                    for i in 0..g_c.len() {
                        let g_raw = g_c[i].to_f32();
                        if config.skip_zeros && g_raw == 0.0 {
                            continue;
                        }
                        let (_, _, update) =
                            adam_math(config.gnorm_scale * g_raw, m_c[i], v_c[i], s);
                        acc += update as f64 * update as f64;
                    }
                    acc
                })
                .collect()
        }
        _ => {
            let rule = match kind {
                OptimizerKind::RmsProp => OneStateRule::RmsProp,
                OptimizerKind::Adagrad => OneStateRule::Adagrad,
                _ => OneStateRule::Momentum,
            };
            grad.par_chunks(NORM_CHUNK)
                .zip(param.par_chunks(NORM_CHUNK))
                .zip(state1.par_chunks(NORM_CHUNK))
                .map(|((g_c, p_c), st_c)| {
                    let mut acc = 0.0f64;
                    for i in 0..g_c.len() {
                        let g_raw = g_c[i].to_f32();
                        if config.skip_zeros && g_raw == 0.0 {
                            continue;
                        }
                        let gt = config.gnorm_scale * g_raw
                            + config.weight_decay * p_c[i].to_f32();
                        let (_, update) = one_state_math(rule, gt, st_c[i], step, s);
                        acc += update as f64 * update as f64;
                    }
                    acc
                })
                .collect()
        }
    };
    partials.into_iter().sum::<f64>().sqrt() as f32
}
