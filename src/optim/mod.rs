//! Fused optimizer update kernels
//!
//! One step of a named optimizer rule applied in place to a parameter
//! tensor, with the moment estimates held either in full precision
//! (32-bit state) or compressed in the blockwise 8-bit format
//! (decompressed on read, recompressed on write, never materialized in
//! full). Callers select the family via the state buffers they pass;
//! unsupported combinations fail before any buffer is touched.

mod rules;
pub mod update32;
pub mod update8;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::BlockSize;
use crate::error::{QfResult, QuantForgeError};
use crate::tensor::{DType, FloatElem};

pub use update32::optimizer_update_32bit;
pub use update8::{optimizer_update_8bit_blockwise, Optimizer8State, QuantizedMoment};

/// Supported optimizer update rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Adam / AdamW (decoupled weight decay when weight_decay > 0)
    Adam,
    /// SGD with momentum
    Momentum,
    /// RMSProp
    RmsProp,
    /// Adagrad
    Adagrad,
    /// LARS: momentum with a trust-ratio update clamp
    Lars,
    /// LAMB: Adam with a trust-ratio update clamp
    Lamb,
}

impl OptimizerKind {
    /// Whether the rule tracks a second (squared-gradient) moment
    pub fn uses_second_moment(&self) -> bool {
        matches!(self, OptimizerKind::Adam | OptimizerKind::Lamb)
    }

    /// Whether a blockwise 8-bit state kernel exists for this rule
    ///
    /// LARS and LAMB are 32-bit-state only.
    pub fn supports_blockwise_state(&self) -> bool {
        matches!(
            self,
            OptimizerKind::Adam
                | OptimizerKind::Momentum
                | OptimizerKind::RmsProp
                | OptimizerKind::Adagrad
        )
    }

    /// Canonical lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::Momentum => "momentum",
            OptimizerKind::RmsProp => "rmsprop",
            OptimizerKind::Adagrad => "adagrad",
            OptimizerKind::Lars => "lars",
            OptimizerKind::Lamb => "lamb",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for OptimizerKind {
    type Err = QuantForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "momentum" => Ok(OptimizerKind::Momentum),
            "rmsprop" => Ok(OptimizerKind::RmsProp),
            "adagrad" => Ok(OptimizerKind::Adagrad),
            "lars" => Ok(OptimizerKind::Lars),
            "lamb" => Ok(OptimizerKind::Lamb),
            other => Err(QuantForgeError::UnknownOptimizer(other.to_string())),
        }
    }
}

/// Optimizer hyperparameters and per-call flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Learning rate
    pub lr: f32,
    /// First-moment decay (also the single decay of 1-state rules)
    pub beta1: f32,
    /// Second-moment decay (Adam/LAMB only)
    pub beta2: f32,
    /// Denominator epsilon
    pub eps: f32,
    /// Weight decay; decoupled (AdamW) for Adam/LAMB, L2 otherwise
    pub weight_decay: f32,
    /// Global gradient rescale from upstream clipping
    pub gnorm_scale: f32,
    /// Trust-ratio clamp: max update norm relative to the weight norm.
    /// 0 disables the clamp.
    pub max_unorm: f32,
    /// Skip elements with exactly-zero gradients
    pub skip_zeros: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            gnorm_scale: 1.0,
            max_unorm: 0.0,
            skip_zeros: false,
        }
    }
}

impl OptimizerConfig {
    /// Create a config with default hyperparameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the learning rate
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set both moment decays
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Set the denominator epsilon
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set the weight decay
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Set the global gradient rescale factor
    pub fn with_gnorm_scale(mut self, gnorm_scale: f32) -> Self {
        self.gnorm_scale = gnorm_scale;
        self
    }

    /// Set the trust-ratio clamp
    pub fn with_max_unorm(mut self, max_unorm: f32) -> Self {
        self.max_unorm = max_unorm;
        self
    }

    /// Skip exactly-zero gradients
    pub fn with_skip_zeros(mut self, skip_zeros: bool) -> Self {
        self.skip_zeros = skip_zeros;
        self
    }
}

/// Optimizer state buffers, tagged by precision family
///
/// The runtime dtype dispatch of the update: one variant per supported
/// state representation, resolved once per call.
pub enum OptimizerStateBuffers<'a> {
    /// Full-precision moments
    Full32 {
        /// First (or only) moment
        state1: &'a mut [f32],
        /// Second moment, for rules that track one
        state2: Option<&'a mut [f32]>,
    },
    /// Blockwise 8-bit compressed moments
    Blockwise8 {
        /// First (or only) moment
        state1: &'a mut QuantizedMoment,
        /// Second moment, for rules that track one
        state2: Option<&'a mut QuantizedMoment>,
        /// Compression block size
        blocksize: BlockSize,
    },
}

/// Pre-check a (gradient, state) dtype pairing at the buffer boundary
///
/// The generic kernels enforce this statically; marshaling code that
/// holds only runtime dtype tags can reject an unsupported pairing
/// early, with the same error and before any buffer is prepared.
/// Gradients support f32/f16; optimizer state supports f32 (full
/// precision) and u8 (blockwise compressed).
pub fn validate_update_dtypes(grad: DType, state: DType) -> QfResult<()> {
    match (grad, state) {
        (DType::F32 | DType::F16, DType::F32 | DType::U8) => Ok(()),
        (grad, state) => Err(QuantForgeError::UnsupportedDtypeCombination { grad, state }),
    }
}

/// Run one optimizer step, dispatching on the state family
///
/// Thin tagged-dispatch wrapper over [`optimizer_update_32bit`] and
/// [`optimizer_update_8bit_blockwise`].
pub fn optimizer_step<T: FloatElem>(
    kind: OptimizerKind,
    grad: &[T],
    param: &mut [T],
    state: OptimizerStateBuffers<'_>,
    step: u32,
    config: &OptimizerConfig,
) -> QfResult<()> {
    match state {
        OptimizerStateBuffers::Full32 { state1, state2 } => {
            optimizer_update_32bit(kind, grad, param, state1, state2, step, config)
        }
        OptimizerStateBuffers::Blockwise8 {
            state1,
            state2,
            blocksize,
        } => optimizer_update_8bit_blockwise(
            kind, grad, param, state1, state2, step, config, blocksize,
        ),
    }
}
