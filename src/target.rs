//! Stage output allocations.

use log::debug;

use crate::backend::{ComputeBackend, Extent, TextureFormat, TextureHandle};
use crate::error::BackendResult;

/// The texture a stage writes its output into.
///
/// A target starts empty. [`ensure`](Self::ensure) allocates on first use and after
/// that only when the requested extent or format differs from the current allocation;
/// otherwise the existing texture is handed back and overwritten in place. The previous
/// allocation is released as soon as its replacement exists.
#[derive(Debug, Default)]
pub struct OutputTarget {
    handle: Option<TextureHandle>,
    allocations: u64,
}

impl OutputTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current allocation, if any.
    pub fn handle(&self) -> Option<TextureHandle> {
        self.handle
    }

    /// Number of allocations made over the target's lifetime.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Returns an allocation of `extent` and `format`, reallocating on mismatch.
    pub fn ensure(
        &mut self,
        backend: &dyn ComputeBackend,
        extent: Extent,
        format: TextureFormat,
        label: &str,
    ) -> BackendResult<TextureHandle> {
        match self.handle {
            Some(handle) if handle.extent == extent && handle.format == format => {
                return Ok(handle);
            }
            _ => {}
        }

        let handle = backend.allocate_texture(extent, format, label)?;
        self.allocations += 1;
        match self.handle.replace(handle) {
            Some(old) => {
                debug!("{label}: reallocated output {} -> {extent}", old.extent);
                backend.release_texture(old);
            }
            None => debug!("{label}: allocated output {extent}"),
        }
        Ok(handle)
    }

    /// Frees the allocation, leaving the target empty.
    pub fn release(&mut self, backend: &dyn ComputeBackend) {
        if let Some(handle) = self.handle.take() {
            backend.release_texture(handle);
        }
    }
}
