//! Managed buffers with explicit residency
//!
//! Models the unified-memory contract of the accelerator runtime:
//! a managed buffer is migratable between host and accelerator memory
//! spaces, and a kernel may only touch it after the caller has
//! prefetched it to the kernel's execution location. Residency is an
//! explicit tag carried by the buffer, and `prefetch` is the explicit
//! migration call; nothing migrates implicitly.

use std::fmt;

use crate::error::{QfResult, QuantForgeError};

/// Memory space a managed buffer is resident in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Host (CPU) memory
    Host,
    /// Accelerator device memory, by device index
    Accelerator(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(f, "host"),
            Location::Accelerator(id) => write!(f, "accelerator:{}", id),
        }
    }
}

/// A buffer carrying an explicit residency tag
///
/// The kernels in this crate execute on the host; they demand host
/// residency of every managed operand and refuse with a
/// [`QuantForgeError::NotResident`] error otherwise. This keeps the
/// caller obligation of the accelerator model (prefetch before
/// launch) visible and checkable instead of implicit.
#[derive(Debug, Clone)]
pub struct ManagedBuffer<T> {
    data: Vec<T>,
    location: Location,
}

impl<T: Copy + Default> ManagedBuffer<T> {
    /// Allocate a zero-initialized managed buffer, host resident
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
            location: Location::Host,
        }
    }
}

impl<T> ManagedBuffer<T> {
    /// Wrap an existing vector as a host-resident managed buffer
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            data,
            location: Location::Host,
        }
    }

    /// Current residency of the buffer
    pub fn location(&self) -> Location {
        self.location
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Migrate the buffer to `target`
    ///
    /// This is the explicit prefetch call of the managed-memory model.
    /// Migration of an already-resident buffer is a no-op.
    pub fn prefetch(&mut self, target: Location) {
        if self.location != target {
            tracing::debug!(
                "prefetch {} elements: {} -> {}",
                self.data.len(),
                self.location,
                target
            );
            self.location = target;
        }
    }

    /// Borrow the contents, requiring host residency
    pub fn host_slice(&self) -> QfResult<&[T]> {
        self.ensure_resident(Location::Host)?;
        Ok(&self.data)
    }

    /// Mutably borrow the contents, requiring host residency
    pub fn host_slice_mut(&mut self) -> QfResult<&mut [T]> {
        self.ensure_resident(Location::Host)?;
        Ok(&mut self.data)
    }

    /// Unwrap into the underlying vector, requiring host residency
    pub fn into_vec(self) -> QfResult<Vec<T>> {
        self.ensure_resident(Location::Host)?;
        Ok(self.data)
    }

    fn ensure_resident(&self, expected: Location) -> QfResult<()> {
        if self.location != expected {
            return Err(QuantForgeError::NotResident {
                expected,
                actual: self.location,
            });
        }
        Ok(())
    }
}

/// Check that a set of buffer locations co-reside
///
/// Kernels whose operands must live in the same memory space call this
/// before touching any of them.
pub fn ensure_co_resident(locations: &[Location]) -> QfResult<()> {
    if let Some((&first, rest)) = locations.split_first() {
        for &loc in rest {
            if loc != first {
                return Err(QuantForgeError::NotResident {
                    expected: first,
                    actual: loc,
                });
            }
        }
    }
    Ok(())
}
