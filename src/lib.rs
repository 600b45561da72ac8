//! QuantForge - Blockwise 8-bit Quantization Primitives
//!
//! Low-precision numeric primitives for deep-learning training and
//! inference: a blockwise dynamic-quantization codec with per-block
//! absmax scaling and stochastic rounding, an eCDF-based quantile
//! estimator for data-driven codebooks, and fused optimizer update
//! kernels (Adam, Momentum, RMSProp, Adagrad, LARS, LAMB) that keep
//! their moment state compressed in the 8-bit format.
//!
//! The kernels run data-parallel over blocks with rayon and model the
//! accelerator programming contract explicitly: validated block sizes,
//! residency-tagged managed buffers with explicit prefetch, and
//! fail-fast rejection of unsupported dtype combinations before any
//! buffer is touched.

#![allow(clippy::too_many_arguments)] // optimizer kernel launches carry many scalars
#![allow(clippy::needless_range_loop)] // clearer for block-indexed kernels

pub mod codebook;
pub mod codec;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod memory;
pub mod optim;
pub mod tensor;

pub use codebook::{
    estimate_quantiles, Codebook, CodebookCache, CodebookScheme, CODEBOOK_SIZE,
    DEFAULT_QUANTILE_OFFSET,
};
pub use codec::{dequantize, quantize, BlockSize, StochasticSource, MIN_STOCHASTIC_SOURCE};
pub use error::{ErrorCategory, QfResult, QuantForgeError};
pub use kernels::{
    arange, fill, histogram_scatter_add_2d, percentile_clip, ClipResult, GradNormHistory,
};
pub use logging::init_logging_default;
pub use memory::{ensure_co_resident, Location, ManagedBuffer};
pub use optim::{
    optimizer_step, optimizer_update_32bit, optimizer_update_8bit_blockwise,
    validate_update_dtypes, Optimizer8State, OptimizerConfig, OptimizerKind,
    OptimizerStateBuffers, QuantizedMoment,
};
pub use tensor::{DType, FloatElem};
