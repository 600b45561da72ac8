//! Quantization code tables
//!
//! A codebook maps each 8-bit code to a representative real value.
//! Three constructions are provided:
//! - Linear: 256 equally spaced points over [-1,1] (signed) or [0,1]
//! - Dynamic: a floating-point-like code with a dynamic exponent and
//!   a shrinking linear fraction region, after the 8-bit data type of
//!   "8-Bit Approximations for Parallelism in Deep Learning"
//! - Quantile: a data-driven table from the eCDF quantile estimator
//!
//! Tables are immutable once built and shared as `Arc<Codebook>`.
//! [`CodebookCache`] provides process-wide construct-or-fetch keyed by
//! scheme, with first-caller-wins semantics under concurrent first use.

pub mod quantiles;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{QfResult, QuantForgeError};
use crate::tensor::FloatElem;

pub use quantiles::{estimate_quantiles, DEFAULT_QUANTILE_OFFSET};

/// Number of entries in every codebook (one per 8-bit code)
pub const CODEBOOK_SIZE: usize = 256;

/// Analytic codebook construction schemes
///
/// Quantile tables are built from data via [`Codebook::from_quantiles`]
/// and are not cacheable by scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodebookScheme {
    /// Equally spaced points
    Linear {
        /// Cover [-1,1] instead of [0,1]
        signed: bool,
    },
    /// Dynamic exponent/fraction code
    Dynamic {
        /// Cover [-1,1] instead of [0,1]
        signed: bool,
        /// Maximum number of exponent bits, 1..=7
        exponent_bits: u32,
    },
}

impl CodebookScheme {
    /// Default dynamic scheme: signed, 7 exponent bits
    pub fn dynamic_default() -> Self {
        CodebookScheme::Dynamic {
            signed: true,
            exponent_bits: 7,
        }
    }

    /// Stable cache key for this scheme
    pub fn cache_key(&self) -> String {
        match self {
            CodebookScheme::Linear { signed: true } => "linear_signed".to_string(),
            CodebookScheme::Linear { signed: false } => "linear_unsigned".to_string(),
            CodebookScheme::Dynamic {
                signed,
                exponent_bits,
            } => format!(
                "dynamic_{}_e{}",
                if *signed { "signed" } else { "unsigned" },
                exponent_bits
            ),
        }
    }

    /// Construct the table for this scheme
    pub fn build(&self) -> QfResult<Codebook> {
        match *self {
            CodebookScheme::Linear { signed } => Ok(Codebook::linear(signed)),
            CodebookScheme::Dynamic {
                signed,
                exponent_bits,
            } => Codebook::dynamic(signed, exponent_bits),
        }
    }
}

/// An immutable 256-entry code table, sorted ascending
#[derive(Debug, Clone)]
pub struct Codebook {
    values: Vec<f32>,
    signed: bool,
    zero_code: u8,
}

impl Codebook {
    /// Linear map: 256 equally spaced points over [-1,1] or [0,1]
    pub fn linear(signed: bool) -> Self {
        let values: Vec<f32> = if signed {
            (0..CODEBOOK_SIZE)
                .map(|i| -1.0 + 2.0 * i as f32 / (CODEBOOK_SIZE - 1) as f32)
                .collect()
        } else {
            (0..CODEBOOK_SIZE)
                .map(|i| i as f32 / (CODEBOOK_SIZE - 1) as f32)
                .collect()
        };
        // Evenly spaced and already sorted; validation cannot fail here.
        Self::from_sorted(values, signed)
    }

    /// Dynamic exponent/fraction map
    ///
    /// For each decade exponent from 0 down to -(n-1), a linear fraction
    /// segment is laid over \[0.1, 1\): as the exponent consumes more
    /// bits, fewer fraction sub-levels remain. Codes left over when all
    /// exponent bits are zero ("subnormal" region) form one extra
    /// uniform segment at the last decade. Exact 0 and exact 1 are
    /// appended; the total is exactly 256 entries.
    ///
    /// `exponent_bits` must lie in 1..=7.
    pub fn dynamic(signed: bool, exponent_bits: u32) -> QfResult<Self> {
        if !(1..=7).contains(&exponent_bits) {
            return Err(QuantForgeError::InvalidExponentBits(exponent_bits));
        }
        let n = exponent_bits;

        let mut data: Vec<f32> = Vec::with_capacity(CODEBOOK_SIZE);

        // Codes from the all-exponent-bits-zero region, laid out as one
        // extra linear segment at the largest decade.
        let mut additional_items = 2usize.pow(7 - n) - 1;
        if !signed {
            additional_items *= 2;
        }

        for i in 0..n {
            let fraction_items = if signed {
                2usize.pow(i + 7 - n) + 1
            } else {
                2usize.pow(i + 8 - n) + 1
            };
            let boundaries = linspace(0.1, 1.0, fraction_items);
            let scale = 10f64.powi(i as i32 - (n as i32 - 1));
            push_segment_means(&mut data, &boundaries, scale, signed);
        }

        if additional_items > 0 {
            let boundaries = linspace(0.1, 1.0, additional_items + 1);
            push_segment_means(&mut data, &boundaries, 1.0, signed);
        }

        data.push(0.0);
        data.push(1.0);

        data.sort_by(f32::total_cmp);
        if data.len() != CODEBOOK_SIZE {
            return Err(QuantForgeError::InternalError(format!(
                "dynamic map produced {} codes instead of {}",
                data.len(),
                CODEBOOK_SIZE
            )));
        }
        Ok(Self::from_sorted(data, signed))
    }

    /// Data-driven map from the eCDF quantile estimator
    ///
    /// Estimates 256 quantiles of `values` (trimmed by `offset` at each
    /// tail) and normalizes them into [-1,1].
    pub fn from_quantiles<T: FloatElem>(values: &[T], offset: f32) -> QfResult<Self> {
        let mut q = estimate_quantiles(values, offset, true)?;
        q.sort_by(f32::total_cmp);
        let signed = q.first().is_some_and(|&v| v < 0.0);
        Ok(Self::from_sorted(q, signed))
    }

    fn from_sorted(values: Vec<f32>, signed: bool) -> Self {
        debug_assert_eq!(values.len(), CODEBOOK_SIZE);
        let mut book = Self {
            values,
            signed,
            zero_code: 0,
        };
        book.zero_code = book.nearest_code(0.0);
        book
    }

    /// All 256 values, sorted ascending
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// The real value a code maps to
    #[inline]
    pub fn value(&self, code: u8) -> f32 {
        self.values[code as usize]
    }

    /// Whether the table covers negative values
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// The code whose value is (nearest to) zero
    pub fn zero_code(&self) -> u8 {
        self.zero_code
    }

    /// Smallest and largest representable values
    pub fn domain(&self) -> (f32, f32) {
        (self.values[0], self.values[CODEBOOK_SIZE - 1])
    }

    /// Nearest code to `x` by value
    ///
    /// Exact midpoints tie-break toward the lower index.
    #[inline]
    pub fn nearest_code(&self, x: f32) -> u8 {
        // First index whose value is >= x.
        let idx = self.values.partition_point(|&v| v < x);
        if idx == 0 {
            return 0;
        }
        if idx >= CODEBOOK_SIZE {
            return (CODEBOOK_SIZE - 1) as u8;
        }
        let lo = idx - 1;
        let d_lo = x - self.values[lo];
        let d_hi = self.values[idx] - x;
        if d_lo <= d_hi {
            lo as u8
        } else {
            idx as u8
        }
    }

    /// The pair of codes whose values bracket `x`
    ///
    /// Returns `(lo, lo)` when `x` falls outside the table's domain,
    /// and `(c, c+1)` with `value(c) <= x < value(c+1)` otherwise.
    #[inline]
    pub fn bracketing_codes(&self, x: f32) -> (u8, u8) {
        // First index whose value is > x.
        let idx = self.values.partition_point(|&v| v <= x);
        if idx == 0 {
            (0, 0)
        } else if idx >= CODEBOOK_SIZE {
            let last = (CODEBOOK_SIZE - 1) as u8;
            (last, last)
        } else {
            ((idx - 1) as u8, idx as u8)
        }
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Push the midpoints of consecutive boundaries, scaled, into `data`
fn push_segment_means(data: &mut Vec<f32>, boundaries: &[f64], scale: f64, signed: bool) {
    for pair in boundaries.windows(2) {
        let mean = 0.5 * (pair[0] + pair[1]);
        data.push((scale * mean) as f32);
        if signed {
            data.push((-scale * mean) as f32);
        }
    }
}

/// Process-wide codebook cache
///
/// Construct-or-fetch keyed by scheme. First construction wins under
/// concurrency: the read path is lock-shared, and the write path
/// re-checks under the exclusive lock so all callers observe the same
/// `Arc` for a given scheme.
#[derive(Debug, Default)]
pub struct CodebookCache {
    tables: RwLock<HashMap<String, Arc<Codebook>>>,
}

impl CodebookCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the table for `scheme`, constructing it on first use
    pub fn get_or_build(&self, scheme: CodebookScheme) -> QfResult<Arc<Codebook>> {
        let key = scheme.cache_key();
        {
            let tables = self.tables.read()?;
            if let Some(table) = tables.get(&key) {
                return Ok(Arc::clone(table));
            }
        }

        let mut tables = self.tables.write()?;
        // Another caller may have built the table while we waited for
        // the write lock; the first insert wins.
        if let Some(table) = tables.get(&key) {
            return Ok(Arc::clone(table));
        }
        let built = Arc::new(scheme.build()?);
        tracing::debug!("constructed codebook {}", key);
        tables.insert(key, Arc::clone(&built));
        Ok(built)
    }

    /// Number of cached tables
    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
