//! An owned handle to one physical page frame.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::riscv::PGSIZE;

/// # Safety
///
/// - `ptr` is page-aligned and refers to PGSIZE bytes of otherwise unused
///   physical memory.
/// - There is at most one `Page` for a given frame.
///
/// A `Page` must be returned to the allocator (or converted back into a raw
/// address with `into_usize`) instead of being dropped; dropping one means
/// the frame leaks, which is always a bug here.
pub struct Page {
    ptr: NonNull<[u8; PGSIZE]>,
}

// A frame is plain memory, and ownership of it may move between harts.
unsafe impl Send for Page {}

impl Page {
    /// Recovers a `Page` from a raw physical address.
    ///
    /// # Safety
    ///
    /// `addr` must be the page-aligned address of a frame that no other
    /// `Page` refers to.
    pub unsafe fn from_usize(addr: usize) -> Self {
        debug_assert_eq!(addr % PGSIZE, 0, "Page::from_usize");
        Self {
            ptr: unsafe { NonNull::new_unchecked(addr as *mut _) },
        }
    }

    /// Consumes the handle, returning the raw frame address. The caller
    /// becomes responsible for the frame.
    pub fn into_usize(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        core::mem::forget(self);
        addr
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Fills the whole frame with `value`.
    pub fn write_bytes(&mut self, value: u8) {
        self.deref_mut().fill(value);
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        // SAFETY: the invariant guarantees exclusive ownership of the frame.
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the invariant guarantees exclusive ownership of the frame.
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        panic!("Page must never drop; free it through the allocator");
    }
}
