//! Memory acquisition seam for staging buffers
//!
//! Every acquisition, release and copy goes through a [`DeviceAllocator`] so a
//! failure surfaces as a `DeviceResource` error instead of aborting the process.
//! [`HostAllocator`] backs every memory class with aligned host memory.

use recserve_common::{RecServeError, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Where a buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Device-resident memory
    Device,

    /// Page-locked host memory visible to the device
    PinnedHost,

    /// Ordinary pageable host memory
    Host,
}

impl fmt::Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemoryClass::Device => "device",
            MemoryClass::PinnedHost => "pinned-host",
            MemoryClass::Host => "host",
        };
        f.write_str(name)
    }
}

/// Allocator for staging memory
///
/// Implementations must be usable from several instances at once.
pub trait DeviceAllocator: Send + Sync {
    /// Make `device_id` the current device for the calling thread
    fn select_device(&self, device_id: i32) -> Result<()>;

    /// Acquire `size` bytes (non-zero) aligned to `align`
    fn allocate(&self, size: usize, align: usize, class: MemoryClass) -> Result<NonNull<u8>>;

    /// Release memory obtained from [`DeviceAllocator::allocate`]
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `size`, `align` and `class`, and must not be used afterwards.
    unsafe fn deallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
        class: MemoryClass,
    ) -> Result<()>;

    /// Copy host bytes into a region
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `src.len()` bytes of writes.
    unsafe fn copy_in(&self, dst: NonNull<u8>, src: &[u8], class: MemoryClass) -> Result<()>;

    /// Copy a region out into host bytes
    ///
    /// # Safety
    ///
    /// `src` must be valid for `dst.len()` bytes of reads.
    unsafe fn copy_out(&self, dst: &mut [u8], src: NonNull<u8>, class: MemoryClass) -> Result<()>;
}

/// Host-memory allocator used for every memory class
#[derive(Debug, Default)]
pub struct HostAllocator {
    /// Number of addressable devices, `None` accepts any non-negative id
    device_count: Option<usize>,

    /// Upper bound on live bytes, `None` is unlimited
    limit_bytes: Option<usize>,

    /// Live bytes
    allocated: AtomicUsize,
}

impl HostAllocator {
    /// Create an unlimited allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the addressable device ids to `0..count`
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = Some(count);
        self
    }

    /// Fail any allocation that would push live bytes past `limit`
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit_bytes = Some(limit);
        self
    }

    /// Bytes currently allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl DeviceAllocator for HostAllocator {
    fn select_device(&self, device_id: i32) -> Result<()> {
        let valid = match (usize::try_from(device_id), self.device_count) {
            (Err(_), _) => false,
            (Ok(_), None) => true,
            (Ok(id), Some(count)) => id < count,
        };
        if !valid {
            return Err(RecServeError::device_resource(format!(
                "failed to select device {}: invalid device ordinal",
                device_id
            )));
        }
        Ok(())
    }

    fn allocate(&self, size: usize, align: usize, class: MemoryClass) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(RecServeError::device_resource("zero-sized allocation requested"));
        }

        if let Some(limit) = self.limit_bytes {
            let live = self.allocated.load(Ordering::Relaxed);
            if live.saturating_add(size) > limit {
                return Err(RecServeError::device_resource(format!(
                    "out of {} memory: requested {} bytes with {} of {} in use",
                    class, size, live, limit
                )));
            }
        }

        let layout = Layout::from_size_align(size, align).map_err(|e| {
            RecServeError::device_resource(format!(
                "invalid layout: size={}, align={}: {}",
                size, align, e
            ))
        })?;

        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            RecServeError::device_resource(format!(
                "failed to allocate {} bytes of {} memory",
                size, class
            ))
        })?;

        self.allocated.fetch_add(size, Ordering::Relaxed);
        trace!("Allocated {} bytes of {} memory", size, class);
        Ok(ptr)
    }

    unsafe fn deallocate(
        &self,
        ptr: NonNull<u8>,
        size: usize,
        align: usize,
        class: MemoryClass,
    ) -> Result<()> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| RecServeError::device_resource(format!("invalid layout: {}", e)))?;
        dealloc(ptr.as_ptr(), layout);
        self.allocated.fetch_sub(size, Ordering::Relaxed);
        trace!("Released {} bytes of {} memory", size, class);
        Ok(())
    }

    unsafe fn copy_in(&self, dst: NonNull<u8>, src: &[u8], _class: MemoryClass) -> Result<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), src.len());
        Ok(())
    }

    unsafe fn copy_out(&self, dst: &mut [u8], src: NonNull<u8>, _class: MemoryClass) -> Result<()> {
        std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_mut_ptr(), dst.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recserve_common::ErrorKind;

    #[test]
    fn test_allocation_accounting() {
        let allocator = HostAllocator::new();
        let ptr = allocator.allocate(128, 32, MemoryClass::Device).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 32, 0);
        assert_eq!(allocator.allocated_bytes(), 128);

        unsafe { allocator.deallocate(ptr, 128, 32, MemoryClass::Device).unwrap() };
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_limit_exceeded() {
        let allocator = HostAllocator::new().with_limit(64);
        let err = allocator.allocate(96, 32, MemoryClass::PinnedHost).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceResource);
        assert_eq!(allocator.allocated_bytes(), 0);
    }

    #[test]
    fn test_select_device() {
        let allocator = HostAllocator::new().with_device_count(2);
        assert!(allocator.select_device(1).is_ok());
        assert!(allocator.select_device(2).is_err());
        assert!(HostAllocator::new().select_device(-1).is_err());
    }
}
