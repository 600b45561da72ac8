//! Blockwise 8-bit state optimizer kernels
//!
//! The moment estimates live compressed in the blockwise 8-bit format:
//! per element an 8-bit code, per block a float32 absmax, shared
//! codebooks (signed dynamic for the first moment, unsigned dynamic
//! for the squared second moment). Each step decompresses a block's
//! moments, applies the update rule, tracks the block's new absmax
//! while the updated values are produced, and requantizes against the
//! new scale. The full-precision moment tensor is never materialized.
//!
//! Adam uses the two-state kernel; momentum, rmsprop and adagrad use
//! the one-state kernel. LARS and LAMB have no 8-bit kernels.

use std::sync::Arc;

use rayon::prelude::*;

use crate::codebook::{Codebook, CodebookCache, CodebookScheme};
use crate::codec::{self, BlockSize};
use crate::error::{check_len, QfResult, QuantForgeError};
use crate::optim::rules::{adam_math, one_state_math, OneStateRule, Scalars};
use crate::optim::update32::{clamp_factor, l2_norm};
use crate::optim::{OptimizerConfig, OptimizerKind};
use crate::tensor::FloatElem;

/// One blockwise-compressed moment buffer
///
/// Codes and absmax together are the complete representation of the
/// moment tensor; the codebook is shared, not owned per tensor.
#[derive(Debug, Clone)]
pub struct QuantizedMoment {
    codes: Vec<u8>,
    absmax: Vec<f32>,
    codebook: Arc<Codebook>,
}

impl QuantizedMoment {
    /// A zeroed moment for `numel` elements
    ///
    /// Every block starts with absmax 0 and the zero code, which
    /// decodes to exactly 0.0.
    pub fn zeros(numel: usize, blocksize: BlockSize, codebook: Arc<Codebook>) -> Self {
        Self {
            codes: vec![codebook.zero_code(); numel],
            absmax: vec![0.0f32; blocksize.block_count(numel)],
            codebook,
        }
    }

    /// Number of compressed elements
    pub fn numel(&self) -> usize {
        self.codes.len()
    }

    /// The per-element codes
    pub fn codes(&self) -> &[u8] {
        &self.codes
    }

    /// The per-block scales
    pub fn absmax(&self) -> &[f32] {
        &self.absmax
    }

    /// The shared code table
    pub fn codebook(&self) -> &Arc<Codebook> {
        &self.codebook
    }

    /// Decompress to full precision (diagnostics and tests)
    pub fn dequantize(&self, blocksize: BlockSize) -> QfResult<Vec<f32>> {
        codec::dequantize(&self.codes, &self.absmax, &self.codebook, blocksize)
    }

    fn validate(&self, context: &'static str, numel: usize, blocksize: BlockSize) -> QfResult<()> {
        if self.codes.len() != numel {
            return Err(QuantForgeError::BufferSizeMismatch {
                context,
                expected: numel,
                actual: self.codes.len(),
            });
        }
        check_len(context, blocksize.block_count(numel), self.absmax.len())
    }
}

/// Perform an in-place optimizer update with blockwise 8-bit state
///
/// `state2` must be `Some` exactly for Adam; LARS/LAMB are rejected as
/// unsupported for 8-bit state. All validation happens before any
/// buffer is mutated.
#[allow(clippy::too_many_arguments)]
pub fn optimizer_update_8bit_blockwise<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &mut [T],
    state1: &mut QuantizedMoment,
    mut state2: Option<&mut QuantizedMoment>,
    step: u32,
    config: &OptimizerConfig,
    blocksize: BlockSize,
) -> QfResult<()> {
    if !kind.supports_blockwise_state() {
        return Err(QuantForgeError::UnsupportedEightBitOptimizer(
            kind.name().to_string(),
        ));
    }
    check_len("param", grad.len(), param.len())?;
    state1.validate("state1", grad.len(), blocksize)?;
    if kind.uses_second_moment() {
        match &state2 {
            Some(s2) => s2.validate("state2", grad.len(), blocksize)?,
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
        * if config.max_unorm > 0.0 {
            let param_norm = l2_norm(param);
            let update_norm = prospective_update_norm(
                kind,
                grad,
                param,
                state1,
                state2.as_deref(),
                step,
                config,
                &s,
                blocksize,
            );
            clamp_factor(config.max_unorm, param_norm, update_norm)
        } else {
            1.0
        };

    tracing::trace!(
        "{} 8-bit update: {} elements, {} blocks, step {}",
        kind,
        grad.len(),
        blocksize.block_count(grad.len()),
        step
    );

    match kind {
        OptimizerKind::Adam => {
            let state2 = state2.take().ok_or_else(|| {
                QuantForgeError::InternalError("second moment lost after validation".to_string())
            })?;
            two_state_kernel(grad, param, state1, state2, lr, config, s, blocksize);
        }
        OptimizerKind::Momentum => {
            one_state_kernel(
                OneStateRule::Momentum,
                grad,
                param,
                state1,
                step,
                lr,
                config,
                s,
                blocksize,
            );
        }
        OptimizerKind::RmsProp => {
            one_state_kernel(
                OneStateRule::RmsProp,
                grad,
                param,
                state1,
                step,
                lr,
                config,
                s,
                blocksize,
            );
        }
        OptimizerKind::Adagrad => {
            one_state_kernel(
                OneStateRule::Adagrad,
                grad,
                param,
                state1,
                step,
                lr,
                config,
                s,
                blocksize,
            );
        }
        OptimizerKind::Lars | OptimizerKind::Lamb => {
            return Err(QuantForgeError::UnsupportedEightBitOptimizer(
                kind.name().to_string(),
            ))
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn two_state_kernel<T: FloatElem>(
    grad: &[T],
    param: &mut [T],
    state1: &mut QuantizedMoment,
    state2: &mut QuantizedMoment,
    lr: f32,
    config: &OptimizerConfig,
    s: Scalars,
    blocksize: BlockSize,
) {
    let bs = blocksize.as_usize();
    let book1 = Arc::clone(&state1.codebook);
    let book2 = Arc::clone(&state2.codebook);
    let wd = config.weight_decay;
    let gnorm_scale = config.gnorm_scale;
    let skip_zeros = config.skip_zeros;

    param
        .par_chunks_mut(bs)
        .zip(grad.par_chunks(bs))
        .zip(state1.codes.par_chunks_mut(bs))
        .zip(state1.absmax.par_iter_mut())
        .zip(state2.codes.par_chunks_mut(bs))
        .zip(state2.absmax.par_iter_mut())
        .for_each(|(((((p_blk, g_blk), c1_blk), am1), c2_blk), am2)| {
            let n = p_blk.len();
            let old_am1 = *am1;
            let old_am2 = *am2;
            let mut m_new = vec![0.0f32; n];
            let mut v_new = vec![0.0f32; n];
            let mut block_am1 = 0.0f32;
            let mut block_am2 = 0.0f32;

            // Phase 1: decompress, update, apply the parameter delta,
            // and reduce the block's new absmax as values are produced.
            for i in 0..n {
                let g_raw = g_blk[i].to_f32();
                let m = book1.value(c1_blk[i]) * old_am1;
                let v = book2.value(c2_blk[i]) * old_am2;

                if skip_zeros && g_raw == 0.0 {
                    // Moment unchanged, parameter untouched; the value
                    // still joins the absmax reduction and is re-coded
                    // against the block's new scale.
                    m_new[i] = m;
                    v_new[i] = v;
                } else {
                    let (m2, v2, update) = adam_math(gnorm_scale * g_raw, m, v, &s);
                    m_new[i] = m2;
                    v_new[i] = v2;

                    let mut pv = p_blk[i].to_f32();
                    if wd > 0.0 {
                        pv *= 1.0 - lr * wd;
                    }
                    pv -= lr * update;
                    p_blk[i] = T::from_f32(pv);
                }
                block_am1 = block_am1.max(m_new[i].abs());
                block_am2 = block_am2.max(v_new[i].abs());
            }

            // Phase 2: the absmax is fully reduced; recompress.
            *am1 = block_am1;
            *am2 = block_am2;
            requantize_block(&book1, &m_new, block_am1, c1_blk);
            requantize_block(&book2, &v_new, block_am2, c2_blk);
        });
}

#[allow(clippy::too_many_arguments)]
fn one_state_kernel<T: FloatElem>(
    rule: OneStateRule,
    grad: &[T],
    param: &mut [T],
    state1: &mut QuantizedMoment,
    step: u32,
    lr: f32,
    config: &OptimizerConfig,
    s: Scalars,
    blocksize: BlockSize,
) {
    let bs = blocksize.as_usize();
    let book = Arc::clone(&state1.codebook);
    let wd = config.weight_decay;
    let gnorm_scale = config.gnorm_scale;
    let skip_zeros = config.skip_zeros;

    param
        .par_chunks_mut(bs)
        .zip(grad.par_chunks(bs))
        .zip(state1.codes.par_chunks_mut(bs))
        .zip(state1.absmax.par_iter_mut())
        .for_each(|(((p_blk, g_blk), c_blk), am)| {
            let n = p_blk.len();
            let old_am = *am;
            let mut st_new = vec![0.0f32; n];
            let mut block_am = 0.0f32;

            for i in 0..n {
                let g_raw = g_blk[i].to_f32();
                let st = book.value(c_blk[i]) * old_am;

                if skip_zeros && g_raw == 0.0 {
                    st_new[i] = st;
                } else {
                    let mut pv = p_blk[i].to_f32();
                    let gt = gnorm_scale * g_raw + wd * pv;
                    let (st2, update) = one_state_math(rule, gt, st, step, &s);
                    st_new[i] = st2;
                    pv -= lr * update;
                    p_blk[i] = T::from_f32(pv);
                }
                block_am = block_am.max(st_new[i].abs());
            }

            *am = block_am;
            requantize_block(&book, &st_new, block_am, c_blk);
        });
}

/// Requantize one block of fresh moment values against its new absmax
#[inline]
fn requantize_block(book: &Codebook, values: &[f32], absmax: f32, codes: &mut [u8]) {
    if absmax == 0.0 {
        codes.fill(book.zero_code());
        return;
    }
    let (dom_lo, dom_hi) = book.domain();
    let inv = 1.0 / absmax;
    for (code, &v) in codes.iter_mut().zip(values) {
        *code = book.nearest_code((v * inv).clamp(dom_lo, dom_hi));
    }
}

/// Norm of the updates the fused kernel would apply, without writing
#[allow(clippy::too_many_arguments)]
fn prospective_update_norm<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &[T],
    state1: &QuantizedMoment,
    state2: Option<&QuantizedMoment>,
    step: u32,
    config: &OptimizerConfig,
    s: &Scalars,
    blocksize: BlockSize,
) -> f32 {
    let bs = blocksize.as_usize();
    let book1 = &state1.codebook;

    let partials: Vec<f64> = match kind {
        OptimizerKind::Adam => {
            // Validated Some by the caller
            let Some(state2) = state2 else { return 0.0 };
            let book2 = &state2.codebook;
            grad.par_chunks(bs)
                .zip(state1.codes.par_chunks(bs))
                .zip(state1.absmax.par_iter())
                .zip(state2.codes.par_chunks(bs))
                .zip(state2.absmax.par_iter())
                .map(|((((g_blk, c1_blk), &am1), c2_blk), &am2)| {
                    let mut acc = 0.0f64;
                    for i in 0..g_blk.len() {
                        let g_raw = g_blk[i].to_f32();
                        if config.skip_zeros && g_raw == 0.0 {
                            continue;
                        }
                        let m = book1.value(c1_blk[i]) * am1;
                        let v = book2.value(c2_blk[i]) * am2;
                        let (_, _, update) = adam_math(config.gnorm_scale * g_raw, m, v, s);
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
            grad.par_chunks(bs)
                .zip(param.par_chunks(bs))
                .zip(state1.codes.par_chunks(bs))
                .zip(state1.absmax.par_iter())
                .map(|(((g_blk, p_blk), c_blk), &am)| {
                    let mut acc = 0.0f64;
                    for i in 0..g_blk.len() {
                        let g_raw = g_blk[i].to_f32();
                        if config.skip_zeros && g_raw == 0.0 {
                            continue;
                        }
                        let st = book1.value(c_blk[i]) * am;
                        let gt = config.gnorm_scale * g_raw
                            + config.weight_decay * p_blk[i].to_f32();
                        let (_, update) = one_state_math(rule, gt, st, step, s);
                        acc += update as f64 * update as f64;
                    }
                    acc
                })
                .collect()
        }
    };
    partials.into_iter().sum::<f64>().sqrt() as f32
}

/// Owned 8-bit optimizer state for one parameter tensor
///
/// Created once when the optimizer first sees a parameter, mutated in
/// place on every [`Optimizer8State::update`], dropped with the
/// parameter. The update takes `&mut self`: two concurrent steps on
/// the same state cannot compile.
#[derive(Debug)]
pub struct Optimizer8State {
    kind: OptimizerKind,
    blocksize: BlockSize,
    step: u32,
    state1: QuantizedMoment,
    state2: Option<QuantizedMoment>,
}

impl Optimizer8State {
    /// Allocate zeroed compressed state for `numel` parameters
    ///
    /// The first moment uses the signed dynamic codebook, the second
    /// (squared) moment the unsigned one, both fetched from `cache`.
    pub fn new(
        kind: OptimizerKind,
        numel: usize,
        blocksize: BlockSize,
        cache: &CodebookCache,
    ) -> QfResult<Self> {
        if !kind.supports_blockwise_state() {
            return Err(QuantForgeError::UnsupportedEightBitOptimizer(
                kind.name().to_string(),
            ));
        }
        let book1 = cache.get_or_build(CodebookScheme::Dynamic {
            signed: true,
            exponent_bits: 7,
        })?;
        let state2 = if kind.uses_second_moment() {
            let book2 = cache.get_or_build(CodebookScheme::Dynamic {
                signed: false,
                exponent_bits: 7,
            })?;
            Some(QuantizedMoment::zeros(numel, blocksize, book2))
        } else {
            None
        };
        Ok(Self {
            kind,
            blocksize,
            step: 0,
            state1: QuantizedMoment::zeros(numel, blocksize, book1),
            state2,
        })
    }

    /// Steps applied so far (0 = uninitialized)
    pub fn step_count(&self) -> u32 {
        self.step
    }

    /// The optimizer rule this state belongs to
    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// The compression block size
    pub fn blocksize(&self) -> BlockSize {
        self.blocksize
    }

    /// The first (or only) compressed moment
    pub fn state1(&self) -> &QuantizedMoment {
        &self.state1
    }

    /// The second compressed moment, for two-moment rules
    pub fn state2(&self) -> Option<&QuantizedMoment> {
        self.state2.as_ref()
    }

    /// Apply one fused update step in place
    ///
    /// The step counter only advances when the update succeeds.
    pub fn update<T: FloatElem>(
        &mut self,
        grad: &[T],
        param: &mut [T],
        config: &OptimizerConfig,
    ) -> QfResult<()> {
        let step = self.step + 1;
        optimizer_update_8bit_blockwise(
            self.kind,
            grad,
            param,
            &mut self.state1,
            self.state2.as_mut(),
            step,
            config,
            self.blocksize,
        )?;
        self.step = step;
        Ok(())
    }
}
