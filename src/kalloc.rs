//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages, and pipe buffers. Allocates whole 4096-byte pages.

use core::mem;
use core::ptr;

use crate::{
    memlayout::{kernel_end, PHYSTOP},
    page::Page,
    riscv::{pgrounddown, pgroundup, PGSIZE},
};

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - This singly linked list has no cycle.
/// - If head is null, the list is empty. Otherwise, head points to the
///   first node, and every node is a valid, free page frame.
pub struct Kmem {
    head: *mut Run,
}

// The free list consists of raw frame addresses; moving the references
// between harts is fine because a Spinlock serializes all access.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Creates pages between `end` and `PHYSTOP` and puts them on the free
    /// list.
    ///
    /// # Safety
    ///
    /// There must be no existing pages; this must be called exactly once.
    pub unsafe fn init(&mut self) {
        let pa_start = pgroundup(kernel_end());
        let pa_end = pgrounddown(PHYSTOP);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            // SAFETY: pa is page-aligned, lies between end and PHYSTOP, and
            // by the safety condition no other Page refers to it.
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    pub fn free(&mut self, mut page: Page) {
        let pa = page.addr();
        debug_assert!(
            pa % PGSIZE == 0 && (kernel_end()..PHYSTOP).contains(&pa),
            "Kmem::free"
        );

        // Fill with junk to catch dangling refs.
        page.write_bytes(1);

        let run = page.into_usize() as *mut Run;
        // SAFETY: the frame is exclusively owned and large enough for a Run.
        unsafe { (*run).next = self.head };
        self.head = run;
    }

    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is non-null, so by the invariant it points to a free
        // frame and its next field is a valid list tail.
        let next = unsafe { (*self.head).next };
        // SAFETY: the node being detached is a valid page by the invariant.
        let mut page = unsafe { Page::from_usize(mem::replace(&mut self.head, next) as usize) };
        // Fill with junk; callers that need zeroes clear it themselves.
        page.write_bytes(5);
        Some(page)
    }
}
