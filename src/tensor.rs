//! Element types shared by the codec and optimizer kernels
//!
//! The core consumes plain buffers described by an element type and a
//! count. Two float widths are supported as kernel inputs (f32, f16);
//! u8 is the code type produced by the blockwise codec.

use std::fmt;

use half::f16;

/// Element type tag for buffer descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float
    F32,
    /// 16-bit IEEE float (half precision)
    F16,
    /// 8-bit unsigned integer (quantization codes)
    U8,
}

impl DType {
    /// Size of one element in bytes
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::U8 => write!(f, "u8"),
        }
    }
}

/// Float element usable as kernel input
///
/// Kernels do their arithmetic in f32 regardless of storage width; this
/// trait is the conversion seam. Implemented for `f32` and `half::f16`
/// only, the supported gradient/parameter widths.
pub trait FloatElem: Copy + Send + Sync + 'static {
    /// The dtype tag for dispatch and error reporting
    const DTYPE: DType;

    /// Widen to f32 for arithmetic
    fn to_f32(self) -> f32;

    /// Narrow from f32 for storage
    fn from_f32(v: f32) -> Self;
}

impl FloatElem for f32 {
    const DTYPE: DType = DType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }
}

impl FloatElem for f16 {
    const DTYPE: DType = DType::F16;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        f16::from_f32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::F16.size_of(), 2);
        assert_eq!(DType::U8.size_of(), 1);
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(DType::F32.to_string(), "f32");
        assert_eq!(DType::F16.to_string(), "f16");
        assert_eq!(DType::U8.to_string(), "u8");
    }

    #[test]
    fn test_float_elem_roundtrip() {
        let x = 0.5f32;
        assert_eq!(f32::from_f32(x.to_f32()), 0.5);

        let h = f16::from_f32(0.25);
        assert_eq!(h.to_f32(), 0.25);
        assert_eq!(f16::DTYPE, DType::F16);
        assert_eq!(f32::DTYPE, DType::F32);
    }
}
