//! Auxiliary numeric kernels
//!
//! Diagnostics and normalization helpers that ride alongside the
//! codec: percentile-based gradient-norm clipping, a 2-D scatter-add
//! histogram, and elementwise fill/arange initializers for managed
//! buffers.

pub mod clip;
pub mod element;
pub mod histogram;

pub use clip::{percentile_clip, ClipResult, GradNormHistory, NORM_HISTORY_LEN};
pub use element::{arange, fill};
pub use histogram::histogram_scatter_add_2d;
