//! Elementwise initializers over managed buffers
//!
//! Trivial whole-buffer fill and arange. They share the codec's
//! managed-memory precondition: the buffer must be host resident, and
//! a non-resident buffer is a reported error, not an implicit
//! migration.

use crate::error::QfResult;
use crate::memory::ManagedBuffer;
use crate::tensor::FloatElem;

/// Fill every element of a managed buffer with `value`
pub fn fill<T: Copy>(buffer: &mut ManagedBuffer<T>, value: T) -> QfResult<()> {
    buffer.host_slice_mut()?.fill(value);
    Ok(())
}

/// Write 0, 1, 2, ... into a managed float buffer
pub fn arange<T: FloatElem>(buffer: &mut ManagedBuffer<T>) -> QfResult<()> {
    for (i, v) in buffer.host_slice_mut()?.iter_mut().enumerate() {
        *v = T::from_f32(i as f32);
    }
    Ok(())
}
