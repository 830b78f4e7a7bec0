//! Fixed-capacity staging buffers
//!
//! A [`DeviceBuffer`] collects size reservations, then performs exactly one
//! memory acquisition covering all of them. Each reservation is rounded up to
//! a 32-byte stride. Once allocated, the capacity never changes.

use crate::memory::{DeviceAllocator, MemoryClass};
use recserve_common::{RecServeError, Result, METRICS};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Byte stride every reservation is rounded up to
pub const RESERVATION_STRIDE: usize = 32;

/// Round `bytes` up to the next multiple of [`RESERVATION_STRIDE`]
pub fn round_up_to_stride(bytes: usize) -> usize {
    bytes.div_ceil(RESERVATION_STRIDE) * RESERVATION_STRIDE
}

/// Number of elements described by `dimensions`; an empty list describes one element
///
/// Saturates at `usize::MAX`; see [`checked_num_elements`].
pub fn get_num_elements(dimensions: &[usize]) -> usize {
    checked_num_elements(dimensions).unwrap_or(usize::MAX)
}

/// Number of elements described by `dimensions`, `None` on overflow
pub fn checked_num_elements(dimensions: &[usize]) -> Option<usize> {
    dimensions
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Plain-old-data element types a buffer may hold
///
/// # Safety
///
/// Every bit pattern must be a valid value of the type.
pub unsafe trait Element: Copy + Send + Sync + 'static {}

unsafe impl Element for f32 {}
unsafe impl Element for i32 {}
unsafe impl Element for u32 {}
unsafe impl Element for i64 {}

/// Allocation state of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Accepting reservations
    Unallocated,

    /// Capacity fixed; no acquisition happened if the capacity is zero
    Allocated,
}

/// Single-allocation memory region for one tensor kind
pub struct DeviceBuffer<T: Element> {
    /// Pending reservations in bytes
    reservations: Vec<usize>,

    /// A reservation overflowed `usize`; allocation will fail
    oversized: bool,

    /// Capacity in bytes, fixed at allocation
    capacity_bytes: usize,

    /// Allocation state
    state: AllocationState,

    /// Memory class
    class: MemoryClass,

    /// Base address, `None` before allocation or when empty
    ptr: Option<NonNull<u8>>,

    /// Allocator owning the region
    allocator: Arc<dyn DeviceAllocator>,

    _marker: PhantomData<T>,
}

// SAFETY: the buffer exclusively owns its region; shared access only reads it
unsafe impl<T: Element> Send for DeviceBuffer<T> {}
unsafe impl<T: Element> Sync for DeviceBuffer<T> {}

impl<T: Element> DeviceBuffer<T> {
    /// Create an empty, unallocated buffer
    pub fn new(class: MemoryClass, allocator: Arc<dyn DeviceAllocator>) -> Self {
        Self {
            reservations: Vec::new(),
            oversized: false,
            capacity_bytes: 0,
            state: AllocationState::Unallocated,
            class,
            ptr: None,
            allocator,
            _marker: PhantomData,
        }
    }

    /// Declare room for a tensor of the given extents
    ///
    /// Ignored, with a warning, once the buffer is allocated.
    pub fn reserve(&mut self, dimensions: &[usize]) {
        if self.is_allocated() {
            warn!("Illegal call: reserve on a finalized {} buffer", self.class);
            return;
        }
        match checked_num_elements(dimensions).and_then(|n| n.checked_mul(size_of::<T>())) {
            Some(bytes) => self.reservations.push(bytes),
            None => {
                warn!(
                    "Reservation {:?} on {} buffer overflows the address space",
                    dimensions, self.class
                );
                self.oversized = true;
            }
        }
    }

    /// Finalize the buffer with one acquisition sized to all reservations
    ///
    /// A second call is a no-op that leaves the base address unchanged.
    pub fn allocate(&mut self) -> Result<()> {
        if self.is_allocated() {
            warn!("Wrong input: {} buffer has already been allocated", self.class);
            return Ok(());
        }

        let total = self
            .reservations
            .iter()
            .try_fold(0usize, |acc, &bytes| {
                acc.checked_add(bytes.checked_next_multiple_of(RESERVATION_STRIDE)?)
            })
            .filter(|_| !self.oversized)
            .ok_or_else(|| {
                RecServeError::device_resource(format!(
                    "{} buffer reservations exceed the addressable size",
                    self.class
                ))
            })?;

        if total != 0 {
            let align = RESERVATION_STRIDE.max(std::mem::align_of::<T>());
            let ptr = self.allocator.allocate(total, align, self.class)?;
            self.ptr = Some(ptr);
            METRICS
                .instance
                .device_bytes_allocated
                .add(total as i64);
        }

        self.reservations.clear();
        self.capacity_bytes = total;
        self.state = AllocationState::Allocated;

        debug!("Allocated {} buffer of {} bytes", self.class, total);
        Ok(())
    }

    /// Base address, null before allocation or for an empty buffer
    pub fn get_ptr(&self) -> *mut T {
        self.ptr
            .map(|p| p.as_ptr() as *mut T)
            .unwrap_or(std::ptr::null_mut())
    }

    /// Whether `allocate` has run
    pub fn is_allocated(&self) -> bool {
        self.state == AllocationState::Allocated
    }

    /// Allocation state
    pub fn state(&self) -> AllocationState {
        self.state
    }

    /// Memory class
    pub fn memory_class(&self) -> MemoryClass {
        self.class
    }

    /// Capacity in bytes
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Capacity in elements
    pub fn capacity(&self) -> usize {
        self.capacity_bytes / size_of::<T>()
    }

    /// Overwrite the leading bytes of the buffer with `src`
    pub fn copy_from_bytes(&mut self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let ptr = self.checked_region(src.len())?;
        // SAFETY: checked_region guarantees `src.len()` bytes are in bounds
        unsafe { self.allocator.copy_in(ptr, src, self.class) }
    }

    /// Overwrite the leading elements of the buffer with `src`
    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        // SAFETY: T is plain old data, so viewing it as bytes is sound
        let bytes = unsafe {
            std::slice::from_raw_parts(src.as_ptr() as *const u8, std::mem::size_of_val(src))
        };
        self.copy_from_bytes(bytes)
    }

    /// Copy the leading `dst.len()` elements out of the buffer
    pub fn copy_to_slice(&self, dst: &mut [T]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let len = std::mem::size_of_val(dst);
        let ptr = self.checked_region(len)?;
        // SAFETY: T is plain old data and the region holds `len` bytes
        unsafe {
            let bytes = std::slice::from_raw_parts_mut(dst.as_mut_ptr() as *mut u8, len);
            self.allocator.copy_out(bytes, ptr, self.class)
        }
    }

    /// View the leading `len` elements
    ///
    /// Only meaningful for memory the host can address directly; the
    /// scoring engine receives these views.
    pub fn as_slice(&self, len: usize) -> Result<&[T]> {
        if len == 0 {
            return Ok(&[]);
        }
        let ptr = self.checked_region(len * size_of::<T>())?;
        // SAFETY: bounds checked, region is initialized (zeroed at acquisition)
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const T, len) })
    }

    /// Mutable view of the leading `len` elements
    pub fn as_mut_slice(&mut self, len: usize) -> Result<&mut [T]> {
        if len == 0 {
            return Ok(&mut []);
        }
        let ptr = self.checked_region(len * size_of::<T>())?;
        // SAFETY: bounds checked and `&mut self` guarantees exclusivity
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr() as *mut T, len) })
    }

    fn checked_region(&self, len_bytes: usize) -> Result<NonNull<u8>> {
        if len_bytes > self.capacity_bytes {
            return Err(RecServeError::invalid_input(format!(
                "{} bytes exceed the {} byte capacity of the {} buffer",
                len_bytes, self.capacity_bytes, self.class
            )));
        }
        self.ptr.ok_or_else(|| {
            RecServeError::device_resource(format!("{} buffer is not allocated", self.class))
        })
    }
}

impl<T: Element> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            let align = RESERVATION_STRIDE.max(std::mem::align_of::<T>());
            // SAFETY: ptr came from allocate with the same size, align and class
            let released =
                unsafe { self.allocator.deallocate(ptr, self.capacity_bytes, align, self.class) };
            match released {
                Ok(()) => METRICS
                    .instance
                    .device_bytes_allocated
                    .sub(self.capacity_bytes as i64),
                Err(e) => error!("Failed to release {} buffer: {}", self.class, e),
            }
        }
    }
}

impl<T: Element> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("class", &self.class)
            .field("state", &self.state)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("pending", &self.reservations)
            .field("oversized", &self.oversized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostAllocator;
    use recserve_common::ErrorKind;

    fn allocator() -> Arc<HostAllocator> {
        Arc::new(HostAllocator::new())
    }

    #[test]
    fn test_capacity_is_sum_of_rounded_reservations() {
        let cases: &[&[&[usize]]] = &[
            &[&[1]],
            &[&[3], &[5, 2]],
            &[&[8], &[8], &[8]],
            &[&[64, 13], &[7], &[1, 1, 1]],
        ];

        for reservations in cases {
            let mut buffer = DeviceBuffer::<f32>::new(MemoryClass::Device, allocator());
            let mut expected = 0;
            for dims in reservations.iter() {
                buffer.reserve(dims);
                expected += round_up_to_stride(get_num_elements(dims) * 4);
            }
            buffer.allocate().unwrap();
            assert_eq!(buffer.capacity_bytes(), expected, "{:?}", reservations);
            assert_eq!(expected % RESERVATION_STRIDE, 0);
        }
    }

    #[test]
    fn test_second_allocate_is_noop() {
        let host = allocator();
        let mut buffer = DeviceBuffer::<i32>::new(MemoryClass::Device, host.clone());
        buffer.reserve(&[10]);
        buffer.allocate().unwrap();
        let ptr = buffer.get_ptr();

        buffer.allocate().unwrap();
        assert_eq!(buffer.get_ptr(), ptr);
        assert_eq!(buffer.capacity_bytes(), 64);
        assert_eq!(host.allocated_bytes(), 64);
    }

    #[test]
    fn test_reserve_after_allocate_is_ignored() {
        let mut buffer = DeviceBuffer::<f32>::new(MemoryClass::Host, allocator());
        buffer.reserve(&[4]);
        buffer.allocate().unwrap();
        buffer.reserve(&[1000]);
        buffer.allocate().unwrap();
        assert_eq!(buffer.capacity_bytes(), 32);
    }

    #[test]
    fn test_num_elements() {
        assert_eq!(get_num_elements(&[]), 1);
        assert_eq!(get_num_elements(&[64, 13]), 832);
        assert_eq!(get_num_elements(&[2, 3, 4]), 24);
    }

    #[test]
    fn test_overflowing_reservation_fails_allocation() {
        assert_eq!(checked_num_elements(&[usize::MAX, 2]), None);
        assert_eq!(get_num_elements(&[usize::MAX, 2]), usize::MAX);

        let host = allocator();
        let mut buffer = DeviceBuffer::<f32>::new(MemoryClass::Device, host.clone());
        buffer.reserve(&[4]);
        buffer.reserve(&[1 << 62, 13]);
        let err = buffer.allocate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceResource);
        assert!(!buffer.is_allocated());
        assert_eq!(host.allocated_bytes(), 0);

        // each reservation fits, their rounded sum does not
        let mut buffer = DeviceBuffer::<u32>::new(MemoryClass::Host, host.clone());
        buffer.reserve(&[usize::MAX / 8]);
        buffer.reserve(&[usize::MAX / 8]);
        let err = buffer.allocate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceResource);
        assert_eq!(host.allocated_bytes(), 0);
    }

    #[test]
    fn test_null_before_allocate_and_empty_buffer() {
        let mut buffer = DeviceBuffer::<f32>::new(MemoryClass::Device, allocator());
        assert!(buffer.get_ptr().is_null());
        assert_eq!(buffer.state(), AllocationState::Unallocated);

        buffer.allocate().unwrap();
        assert!(buffer.is_allocated());
        assert_eq!(buffer.capacity_bytes(), 0);
        assert!(buffer.get_ptr().is_null());
    }

    #[test]
    fn test_copy_round_trip_and_bounds() {
        let mut buffer = DeviceBuffer::<f32>::new(MemoryClass::Device, allocator());
        buffer.reserve(&[8]);
        buffer.allocate().unwrap();

        buffer.copy_from_slice(&[1.0, 2.0, 3.0]).unwrap();
        let mut out = [0.0f32; 3];
        buffer.copy_to_slice(&mut out).unwrap();
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert_eq!(buffer.as_slice(2).unwrap(), &[1.0, 2.0]);

        let err = buffer.copy_from_slice(&[0.0; 9]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_acquisition_failure_is_an_error() {
        let host = Arc::new(HostAllocator::new().with_limit(16));
        let mut buffer = DeviceBuffer::<i64>::new(MemoryClass::PinnedHost, host);
        buffer.reserve(&[4]);
        let err = buffer.allocate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceResource);
        assert!(!buffer.is_allocated());
    }

    #[test]
    fn test_drop_releases_memory() {
        let host = allocator();
        {
            let mut buffer = DeviceBuffer::<u32>::new(MemoryClass::PinnedHost, host.clone());
            buffer.reserve(&[100]);
            buffer.allocate().unwrap();
            assert_eq!(host.allocated_bytes(), 416);
        }
        assert_eq!(host.allocated_bytes(), 0);
    }
}
