use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    fmt::Display,
    ptr::{copy_nonoverlapping, NonNull},
    slice,
    sync::atomic::{AtomicU64, Ordering},
};

use derivative::Derivative;

use crate::error::{BenchError, Result};

const HOST_ALIGNMENT: usize = 4096;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Host,
    Device { ordinal: usize },
}

impl Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Host => write!(f, "host"),
            MemoryKind::Device { ordinal } => write!(f, "device {}", ordinal),
        }
    }
}

/// A contiguous buffer in host or device memory.
///
/// Dropping a region frees it; `release` does the same but reports device-side
/// failures. Either way the memory is freed exactly once.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MemoryRegion {
    id: u64,
    kind: MemoryKind,
    capacity: usize,
    #[derivative(Debug = "ignore")]
    backing: Backing,
}

enum Backing {
    Host(HostBuffer),
    #[cfg(feature = "cuda")]
    Device(device::DeviceBuffer),
}

impl MemoryRegion {
    pub fn allocate(kind: MemoryKind, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BenchError::Allocation {
                kind,
                capacity,
                reason: "capacity must be non-zero".to_owned(),
            });
        }

        let backing = match kind {
            MemoryKind::Host => Backing::Host(HostBuffer::allocate(capacity)?),
            #[cfg(feature = "cuda")]
            MemoryKind::Device { ordinal } => {
                Backing::Device(device::DeviceBuffer::allocate(ordinal, capacity)?)
            }
            #[cfg(not(feature = "cuda"))]
            MemoryKind::Device { .. } => {
                return Err(BenchError::Allocation {
                    kind,
                    capacity,
                    reason: "built without device memory support (enable the `cuda` feature)"
                        .to_owned(),
                })
            }
        };

        let region = MemoryRegion {
            id: NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            capacity,
            backing,
        };

        tracing::debug!(id = region.id, %kind, capacity, "allocated memory region");

        Ok(region)
    }

    pub fn release(self) -> Result<()> {
        tracing::debug!(id = self.id, kind = %self.kind, "releasing memory region");

        match self.backing {
            Backing::Host(buffer) => {
                drop(buffer);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Backing::Device(buffer) => buffer.free(self.kind, self.capacity),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start address, as seen by the owning allocator (host pointer or device pointer).
    pub fn addr(&self) -> u64 {
        match &self.backing {
            Backing::Host(buffer) => buffer.ptr.as_ptr() as u64,
            #[cfg(feature = "cuda")]
            Backing::Device(buffer) => buffer.addr(),
        }
    }

    /// The first `len` bytes, as a view for an outgoing transfer.
    pub fn slice(&self, len: usize) -> Result<RegionSlice> {
        self.check_len(len)?;
        Ok(self.view(len))
    }

    /// The first `len` bytes, as a view an incoming transfer may write into.
    pub fn slice_mut(&mut self, len: usize) -> Result<RegionSlice> {
        self.check_len(len)?;
        Ok(self.view(len))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(BenchError::InvalidArgument(format!(
                "length {} exceeds region capacity {}",
                len, self.capacity
            )));
        }
        Ok(())
    }

    fn view(&self, len: usize) -> RegionSlice {
        RegionSlice {
            region_id: self.id,
            kind: self.kind,
            addr: self.addr(),
            len,
        }
    }
}

/// Raw view over a prefix of a `MemoryRegion`, carried by in-flight operations.
///
/// The view does not keep the region alive; whoever posts an operation with it must keep
/// the region allocated until the operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSlice {
    region_id: u64,
    kind: MemoryKind,
    addr: u64,
    len: usize,
}

impl RegionSlice {
    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_host(&self) -> bool {
        self.kind == MemoryKind::Host
    }

    /// # Safety
    ///
    /// The view must be a host view of a live region, with no concurrent writer.
    pub unsafe fn host_bytes(&self) -> &[u8] {
        debug_assert!(self.is_host());
        slice::from_raw_parts(self.addr as *const u8, self.len)
    }

    /// # Safety
    ///
    /// The view must be a host view of a live region, with no other reference to the
    /// bytes while the returned slice is in use.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn host_bytes_mut(&self) -> &mut [u8] {
        debug_assert!(self.is_host());
        slice::from_raw_parts_mut(self.addr as *mut u8, self.len)
    }

    /// Copy the viewed bytes out to host memory, staging through the driver for device views.
    ///
    /// # Safety
    ///
    /// The underlying region must still be allocated.
    pub unsafe fn to_vec(&self) -> Result<Vec<u8>> {
        match self.kind {
            MemoryKind::Host => Ok(self.host_bytes().to_vec()),
            #[cfg(feature = "cuda")]
            MemoryKind::Device { ordinal } => device::copy_to_host(ordinal, self.addr, self.len),
            #[cfg(not(feature = "cuda"))]
            MemoryKind::Device { .. } => Err(BenchError::InvalidArgument(
                "device views require the `cuda` feature".to_owned(),
            )),
        }
    }

    /// Overwrite the start of the view with `data`.
    ///
    /// # Safety
    ///
    /// The underlying region must still be allocated and nothing else may access it.
    pub unsafe fn write_from(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(BenchError::InvalidArgument(format!(
                "{} bytes do not fit in a {} byte view",
                data.len(),
                self.len
            )));
        }

        match self.kind {
            MemoryKind::Host => {
                copy_nonoverlapping(data.as_ptr(), self.addr as *mut u8, data.len());
                Ok(())
            }
            #[cfg(feature = "cuda")]
            MemoryKind::Device { ordinal } => device::copy_from_host(ordinal, self.addr, data),
            #[cfg(not(feature = "cuda"))]
            MemoryKind::Device { .. } => Err(BenchError::InvalidArgument(
                "device views require the `cuda` feature".to_owned(),
            )),
        }
    }
}

struct HostBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HostBuffer {
    fn allocate(capacity: usize) -> Result<Self> {
        let failed = |reason: String| BenchError::Allocation {
            kind: MemoryKind::Host,
            capacity,
            reason,
        };

        let layout =
            Layout::from_size_align(capacity, HOST_ALIGNMENT).map_err(|e| failed(e.to_string()))?;

        // capacity is non-zero, checked by the caller
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr)
            .map(|ptr| HostBuffer { ptr, layout })
            .ok_or_else(|| failed("out of host memory".to_owned()))
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(feature = "cuda")]
mod device {
    use std::sync::Arc;

    use cudarc::driver::{result, sys::CUdeviceptr, CudaContext};

    use super::MemoryKind;
    use crate::error::{BenchError, Result};

    pub(super) struct DeviceBuffer {
        ctx: Arc<CudaContext>,
        ptr: Option<CUdeviceptr>,
    }

    fn context(ordinal: usize) -> std::result::Result<Arc<CudaContext>, String> {
        let ctx = CudaContext::new(ordinal)
            .map_err(|e| format!("failed to create CUDA context for GPU {ordinal}: {e}"))?;
        ctx.bind_to_thread()
            .map_err(|e| format!("CUDA bind_to_thread failed: {e}"))?;
        Ok(ctx)
    }

    impl DeviceBuffer {
        pub(super) fn allocate(ordinal: usize, capacity: usize) -> Result<Self> {
            let failed = |reason: String| BenchError::Allocation {
                kind: MemoryKind::Device { ordinal },
                capacity,
                reason,
            };

            let ctx = context(ordinal).map_err(failed)?;
            let ptr = unsafe { result::malloc_sync(capacity) }
                .map_err(|e| failed(format!("cuMemAlloc failed: {e}")))?;

            Ok(DeviceBuffer {
                ctx,
                ptr: Some(ptr),
            })
        }

        pub(super) fn addr(&self) -> u64 {
            self.ptr.unwrap_or_default()
        }

        pub(super) fn free(mut self, kind: MemoryKind, capacity: usize) -> Result<()> {
            let Some(ptr) = self.ptr.take() else {
                return Ok(());
            };

            self.ctx
                .bind_to_thread()
                .and_then(|()| unsafe { result::free_sync(ptr) })
                .map_err(|e| BenchError::Allocation {
                    kind,
                    capacity,
                    reason: format!("cuMemFree failed: {e}"),
                })
        }
    }

    impl Drop for DeviceBuffer {
        fn drop(&mut self) {
            if let Some(ptr) = self.ptr.take() {
                if self.ctx.bind_to_thread().is_ok() {
                    unsafe {
                        let _ = result::free_sync(ptr);
                    }
                }
            }
        }
    }

    pub(super) fn copy_to_host(ordinal: usize, addr: u64, len: usize) -> Result<Vec<u8>> {
        let failed = |reason: String| BenchError::Transfer { size: len, reason };

        context(ordinal).map_err(failed)?;
        let mut staging = vec![0u8; len];
        unsafe { result::memcpy_dtoh_sync(&mut staging, addr as CUdeviceptr) }
            .map_err(|e| failed(format!("cuMemcpyDtoH failed: {e}")))?;
        Ok(staging)
    }

    pub(super) fn copy_from_host(ordinal: usize, addr: u64, data: &[u8]) -> Result<()> {
        let failed = |reason: String| BenchError::Transfer {
            size: data.len(),
            reason,
        };

        context(ordinal).map_err(failed)?;
        unsafe { result::memcpy_htod_sync(addr as CUdeviceptr, data) }
            .map_err(|e| failed(format!("cuMemcpyHtoD failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_region_is_page_aligned_and_zeroed() {
        let region = MemoryRegion::allocate(MemoryKind::Host, 1 << 16).unwrap();

        assert_eq!(region.capacity(), 1 << 16);
        assert_eq!(region.addr() % HOST_ALIGNMENT as u64, 0);

        let view = region.slice(region.capacity()).unwrap();
        assert!(unsafe { view.host_bytes() }.iter().all(|b| *b == 0));

        region.release().unwrap();
    }

    #[test]
    fn zero_capacity_is_an_allocation_error() {
        let err = MemoryRegion::allocate(MemoryKind::Host, 0).unwrap_err();
        assert!(matches!(err, BenchError::Allocation { capacity: 0, .. }));
    }

    #[test]
    fn oversized_view_is_rejected() {
        let mut region = MemoryRegion::allocate(MemoryKind::Host, 1024).unwrap();

        assert!(region.slice(1024).is_ok());
        assert!(matches!(
            region.slice(1025),
            Err(BenchError::InvalidArgument(_))
        ));
        assert!(matches!(
            region.slice_mut(4096),
            Err(BenchError::InvalidArgument(_))
        ));
    }

    #[test]
    fn views_copy_in_and_out() {
        let mut region = MemoryRegion::allocate(MemoryKind::Host, 64).unwrap();
        let view = region.slice_mut(8).unwrap();

        unsafe {
            view.write_from(&[7, 7, 7]).unwrap();
            assert_eq!(view.to_vec().unwrap(), vec![7, 7, 7, 0, 0, 0, 0, 0]);
            assert!(view.write_from(&[0; 9]).is_err());
        }
    }

    #[test]
    fn region_ids_are_unique() {
        let a = MemoryRegion::allocate(MemoryKind::Host, 8).unwrap();
        let b = MemoryRegion::allocate(MemoryKind::Host, 8).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn device_memory_needs_cuda_support() {
        let err = MemoryRegion::allocate(MemoryKind::Device { ordinal: 0 }, 4096).unwrap_err();
        assert!(matches!(
            err,
            BenchError::Allocation {
                kind: MemoryKind::Device { ordinal: 0 },
                ..
            }
        ));
    }
}
