//! Blockwise quantization codec
//!
//! The core lossy compression primitive: a flattened tensor is split
//! into fixed-size blocks, each block is scaled by its absolute
//! maximum, and every element is mapped to the nearest entry of a
//! 256-entry codebook (or stochastically rounded between the two
//! bracketing entries). Dequantization is the inverse: table lookup
//! times the block's absmax.
//!
//! Blocks are processed in parallel with rayon; within a block the
//! absmax reduction completes before any element of that block is
//! coded. No ordering holds between blocks, and none is needed.

use rand::Rng;
use rayon::prelude::*;

use crate::codebook::Codebook;
use crate::error::{check_len, QfResult, QuantForgeError};
use crate::tensor::FloatElem;

/// Minimum number of uniform draws in a stochastic rounding source
pub const MIN_STOCHASTIC_SOURCE: usize = 1024;

/// Validated blockwise quantization block size
///
/// Only 2048 and 4096 are supported; anything else is a configuration
/// error, never silently clamped. Smaller blocks buy resolution at the
/// cost of absmax overhead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    /// 2048 elements per block
    B2048,
    /// 4096 elements per block
    B4096,
}

impl BlockSize {
    /// Validate a raw block size
    pub fn new(size: usize) -> QfResult<Self> {
        match size {
            2048 => Ok(BlockSize::B2048),
            4096 => Ok(BlockSize::B4096),
            other => Err(QuantForgeError::InvalidBlockSize(other)),
        }
    }

    /// Elements per block
    pub fn as_usize(&self) -> usize {
        match self {
            BlockSize::B2048 => 2048,
            BlockSize::B4096 => 4096,
        }
    }

    /// Number of blocks covering `numel` elements (last may be partial)
    pub fn block_count(&self, numel: usize) -> usize {
        numel.div_ceil(self.as_usize())
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        BlockSize::B4096
    }
}

/// Precomputed uniform randomness for stochastic rounding
///
/// Holds at least [`MIN_STOCHASTIC_SOURCE`] uniform draws in [0,1) and
/// a starting offset. Each quantized element consumes the draw at
/// `(offset + element_index) % len`, so no two elements of one call
/// share a draw until the buffer wraps. Use a fresh offset per call
/// (see [`StochasticSource::from_rng`]) to decorrelate repeated
/// quantizations of the same tensor.
#[derive(Debug, Clone)]
pub struct StochasticSource {
    values: Vec<f32>,
    offset: usize,
}

impl StochasticSource {
    /// Wrap a caller-provided buffer of uniform draws
    ///
    /// Fails if fewer than [`MIN_STOCHASTIC_SOURCE`] values are given.
    pub fn new(values: Vec<f32>, offset: usize) -> QfResult<Self> {
        if values.len() < MIN_STOCHASTIC_SOURCE {
            return Err(QuantForgeError::StochasticSourceTooSmall(values.len()));
        }
        let offset = offset % values.len();
        Ok(Self { values, offset })
    }

    /// Fill a minimum-size source and pick a random starting offset
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let values: Vec<f32> = (0..MIN_STOCHASTIC_SOURCE).map(|_| rng.gen::<f32>()).collect();
        let offset = rng.gen_range(0..MIN_STOCHASTIC_SOURCE);
        Self { values, offset }
    }

    /// Reposition the read offset without regenerating the draws
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset % self.values.len();
        self
    }

    #[inline]
    fn draw(&self, element_index: usize) -> f32 {
        self.values[(self.offset + element_index) % self.values.len()]
    }
}

/// Quantize a tensor blockwise against a codebook
///
/// Returns the per-element 8-bit codes and the per-block absmax array
/// (`absmax.len() == numel.div_ceil(blocksize)`). Supplying a
/// `precomputed_absmax` of that exact length skips the per-block
/// reduction and reuses the caller's scales, the fast path for
/// repeated quantization of slowly-drifting tensors. Supplying a
/// [`StochasticSource`] replaces nearest-code rounding with a
/// probabilistic choice between the two bracketing codes, weighted by
/// normalized distance, which de-biases repeated quantization of the
/// same value.
///
/// A block whose absmax is 0 produces the zero code for every element
/// and round-trips to exactly 0.0. An empty input yields empty output.
pub fn quantize<T: FloatElem>(
    values: &[T],
    codebook: &Codebook,
    blocksize: BlockSize,
    precomputed_absmax: Option<&[f32]>,
    stochastic: Option<&StochasticSource>,
) -> QfResult<(Vec<u8>, Vec<f32>)> {
    let bs = blocksize.as_usize();
    let num_blocks = blocksize.block_count(values.len());

    let mut absmax = match precomputed_absmax {
        Some(scales) => {
            check_len("precomputed absmax", num_blocks, scales.len())?;
            scales.to_vec()
        }
        None => vec![0.0f32; num_blocks],
    };
    let reduce_absmax = precomputed_absmax.is_none();
    let mut codes = vec![0u8; values.len()];
    if values.is_empty() {
        return Ok((codes, absmax));
    }

    tracing::trace!(
        "quantize {} elements, {} blocks of {}, stochastic={}",
        values.len(),
        num_blocks,
        bs,
        stochastic.is_some()
    );

    let (dom_lo, dom_hi) = codebook.domain();
    absmax
        .par_iter_mut()
        .zip(codes.par_chunks_mut(bs))
        .zip(values.par_chunks(bs))
        .enumerate()
        .for_each(|(block_idx, ((block_absmax, code_block), src_block))| {
            if reduce_absmax {
                // The reduction must complete before any element of the
                // block is coded.
                let mut m = 0.0f32;
                for v in src_block {
                    m = m.max(v.to_f32().abs());
                }
                *block_absmax = m;
            }

            let scale = *block_absmax;
            if scale == 0.0 {
                code_block.fill(codebook.zero_code());
                return;
            }

            let inv = 1.0 / scale;
            for (i, v) in src_block.iter().enumerate() {
                let x = (v.to_f32() * inv).clamp(dom_lo, dom_hi);
                code_block[i] = match stochastic {
                    None => codebook.nearest_code(x),
                    Some(source) => stochastic_code(codebook, x, source, block_idx * bs + i),
                };
            }
        });

    Ok((codes, absmax))
}

/// Dequantize blockwise codes back to floats
///
/// Inverse of [`quantize`]: each element is the codebook value of its
/// code times its block's absmax. The output element type selects
/// f32 or f16 reconstruction.
pub fn dequantize<T: FloatElem>(
    codes: &[u8],
    absmax: &[f32],
    codebook: &Codebook,
    blocksize: BlockSize,
) -> QfResult<Vec<T>> {
    let bs = blocksize.as_usize();
    check_len("absmax", blocksize.block_count(codes.len()), absmax.len())?;

    let mut out = vec![T::from_f32(0.0); codes.len()];
    out.par_chunks_mut(bs)
        .zip(codes.par_chunks(bs))
        .zip(absmax.par_iter())
        .for_each(|((dst_block, code_block), &scale)| {
            for (dst, &code) in dst_block.iter_mut().zip(code_block) {
                *dst = T::from_f32(codebook.value(code) * scale);
            }
        });

    Ok(out)
}

/// Pick between the two codes bracketing `x`, weighted by distance
///
/// An element exactly on a code keeps it; otherwise the probability of
/// rounding up equals the normalized distance already covered, so the
/// expected dequantized value equals `x`.
#[inline]
fn stochastic_code(
    codebook: &Codebook,
    x: f32,
    source: &StochasticSource,
    element_index: usize,
) -> u8 {
    let (lo, hi) = codebook.bracketing_codes(x);
    if lo == hi {
        return lo;
    }
    let v_lo = codebook.value(lo);
    let v_hi = codebook.value(hi);
    let p_up = (x - v_lo) / (v_hi - v_lo);
    if source.draw(element_index) < p_up {
        hi
    } else {
        lo
    }
}
