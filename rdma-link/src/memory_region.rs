use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use rdma_shim::{log, AccessFlags, MrInfo};

use crate::context::Context;
use crate::{ControlpathError, DatapathError};

/// A zeroed buffer registered with every access permission.
///
/// The buffer is owned by the region and freed only after it has been
/// deregistered, so the remote peer can never address freed memory.
///
/// # Examples
///
/// ``` text,ignore
///        let ctx = crate::UDriver::create()
///            .expect("failed to query device")
///            .get_dev(0)
///            .expect("no rdma device available")
///            .open_context()
///            .expect("failed to create RDMA context");
///
///        let mr = super::MemoryRegion::new(ctx.clone(), 256);
/// ```
pub struct MemoryRegion {
    ctx: Arc<Context>,

    data: *mut u8,
    capacity: usize,

    mr: MrInfo,
    registered: bool,
}

// the buffer is only reached through the region's methods and the provider
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalKey(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey(pub u32);

impl MemoryRegion {
    pub fn new(context: Arc<Context>, capacity: usize) -> Result<Self, ControlpathError> {
        if capacity == 0 {
            return Err(ControlpathError::InvalidArg("MR size"));
        }

        let data = Box::into_raw(alloc::vec![0u8; capacity].into_boxed_slice()) as *mut u8;

        let res = unsafe {
            context
                .verbs()
                .reg_mr(context.get_pd(), data, capacity, AccessFlags::all_remote())
        };
        let mr = match res {
            Ok(mr) => mr,
            Err(e) => {
                log::error!("failed to register a {}-byte region: {}", capacity, e);
                unsafe { free_buffer(data, capacity) };
                return Err(ControlpathError::CreationError("MR", e));
            }
        };

        Ok(Self {
            ctx: context,
            data,
            capacity,
            mr,
            registered: true,
        })
    }

    #[inline]
    pub fn get_virt_addr(&self) -> u64 {
        self.data as u64
    }

    #[inline]
    pub fn rkey(&self) -> RemoteKey {
        RemoteKey(self.mr.rkey)
    }

    #[inline]
    pub fn lkey(&self) -> LocalKey {
        LocalKey(self.mr.lkey)
    }

    /// Total size of the memory region
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn check_range(&self, range: &Range<u64>) -> Result<(), DatapathError> {
        if range.start > range.end || range.end > self.capacity as u64 {
            return Err(DatapathError::OutOfRange {
                start: range.start,
                end: range.end,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Copy `bytes` into the buffer at `offset`
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), DatapathError> {
        let range = offset as u64..(offset + bytes.len()) as u64;
        self.check_range(&range)?;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(offset), bytes.len())
        };
        Ok(())
    }

    /// Copy `range` of the buffer out
    pub fn read_bytes(&self, range: Range<usize>) -> Result<Vec<u8>, DatapathError> {
        self.check_range(&(range.start as u64..range.end as u64))?;
        let mut out = alloc::vec![0u8; range.end - range.start];
        unsafe {
            core::ptr::copy_nonoverlapping(self.data.add(range.start), out.as_mut_ptr(), out.len())
        };
        Ok(out)
    }

    /// The local address of `range`, after checking it lies in the region
    pub(crate) fn rdma_addr_of(&self, range: &Range<u64>) -> Result<u64, DatapathError> {
        self.check_range(range)?;
        Ok(self.get_virt_addr() + range.start)
    }

    /// Deregister the region, then free its buffer
    pub fn destroy(mut self) -> Result<(), ControlpathError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), ControlpathError> {
        if self.registered {
            self.ctx.verbs().dereg_mr(self.mr.handle).map_err(|e| {
                log::error!("failed to deregister the MR: {}", e);
                ControlpathError::DestroyError("MR", e)
            })?;
            self.registered = false;
        }
        if !self.data.is_null() {
            unsafe { free_buffer(self.data, self.capacity) };
            self.data = core::ptr::null_mut();
        }
        Ok(())
    }
}

unsafe fn free_buffer(data: *mut u8, capacity: usize) {
    drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(data, capacity)));
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // a buffer that is still registered is leaked rather than freed
        if let Err(e) = self.release() {
            log::warn!("MR leaked on drop: {}", e);
        }
    }
}
