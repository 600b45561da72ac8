//! Unified error handling for QuantForge
//!
//! This module provides a centralized error type for the quantization
//! codec, the quantile estimator, and the fused optimizer kernels. It
//! implements error categorization for:
//! - Configuration errors (bad blocksize, unknown optimizer, unsupported
//!   dtype combinations), rejected before any buffer is touched
//! - Precondition violations (mismatched buffer lengths, non-resident
//!   managed memory, undersized stochastic sources)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

use crate::memory::Location;
use crate::tensor::DType;

/// Unified error type for QuantForge
///
/// All fallible public APIs in this crate return `QfResult<T>` with this
/// error. Every operation validates its configuration up front: a
/// returned error guarantees no partial mutation of caller buffers.
#[derive(Debug, thiserror::Error)]
pub enum QuantForgeError {
    // ========== Configuration Errors ==========
    /// Blocksize outside the supported set
    #[error("unsupported blocksize: {0}. Supported values: 2048, 4096")]
    InvalidBlockSize(usize),

    /// Optimizer name not recognized
    #[error("unknown optimizer: {0}. Choices: adam, momentum, rmsprop, adagrad, lars, lamb")]
    UnknownOptimizer(String),

    /// Gradient/state dtype pairing without a kernel
    #[error("unsupported dtype combination: gradient {grad}, optimizer state {state}")]
    UnsupportedDtypeCombination { grad: DType, state: DType },

    /// Optimizer has no 8-bit blockwise kernel
    #[error("optimizer {0} does not support 8-bit blockwise state")]
    UnsupportedEightBitOptimizer(String),

    /// Quantile trim offset outside (0, 0.5)
    #[error("invalid quantile offset: {0}. Must lie in (0, 0.5)")]
    InvalidQuantileOffset(f32),

    /// Dynamic-map exponent bits outside 1..=7
    #[error("invalid exponent bits: {0}. Must lie in 1..=7")]
    InvalidExponentBits(u32),

    /// Percentile rank outside the history window
    #[error("invalid percentile: {0}. Must be < 100")]
    InvalidPercentile(usize),

    // ========== Precondition Violations ==========
    /// Stochastic rounding source below the minimum size
    #[error("stochastic source too small: {0} values, minimum is 1024")]
    StochasticSourceTooSmall(usize),

    /// Parallel buffers whose lengths must agree do not
    #[error("buffer length mismatch for {context}: expected {expected}, got {actual}")]
    BufferSizeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Managed buffer touched from the wrong location
    #[error("buffer not resident on {expected}, currently on {actual}. Prefetch it first")]
    NotResident { expected: Location, actual: Location },

    /// Scatter-add index outside the histogram
    #[error("histogram index out of bounds: ({0}, {1})")]
    HistogramIndexOutOfBounds(i32, i32),

    /// Optimizer state does not match the selected rule
    #[error("optimizer state mismatch: {0}")]
    StateMismatch(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (indicates a bug or concurrent panic)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl QuantForgeError {
    /// Categorize the error for handling decisions
    ///
    /// Configuration errors are actionable by the caller (fix the
    /// arguments); precondition violations indicate a contract breach in
    /// the calling code; internal errors should be reported as bugs.
    pub fn category(&self) -> ErrorCategory {
        match self {
            QuantForgeError::InvalidBlockSize(_)
            | QuantForgeError::UnknownOptimizer(_)
            | QuantForgeError::UnsupportedDtypeCombination { .. }
            | QuantForgeError::UnsupportedEightBitOptimizer(_)
            | QuantForgeError::InvalidQuantileOffset(_)
            | QuantForgeError::InvalidExponentBits(_)
            | QuantForgeError::InvalidPercentile(_) => ErrorCategory::Config,

            QuantForgeError::StochasticSourceTooSmall(_)
            | QuantForgeError::BufferSizeMismatch { .. }
            | QuantForgeError::NotResident { .. }
            | QuantForgeError::HistogramIndexOutOfBounds(_, _)
            | QuantForgeError::StateMismatch(_) => ErrorCategory::Precondition,

            QuantForgeError::InternalError(_) | QuantForgeError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this is a configuration error (fix the arguments)
    pub fn is_config_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Config)
    }

    /// Check if this is a precondition violation (contract breach)
    pub fn is_precondition_violation(&self) -> bool {
        matches!(self.category(), ErrorCategory::Precondition)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration error - invalid arguments or unsupported combination
    Config,
    /// Precondition violation - caller broke an API contract
    Precondition,
    /// Internal error - indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "Config"),
            ErrorCategory::Precondition => write!(f, "Precondition"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for QuantForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        QuantForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type QfResult<T> = std::result::Result<T, QuantForgeError>;

/// Check that two parallel buffers have matching lengths
pub(crate) fn check_len(context: &'static str, expected: usize, actual: usize) -> QfResult<()> {
    if expected != actual {
        return Err(QuantForgeError::BufferSizeMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}
