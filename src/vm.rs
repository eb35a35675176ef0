//! Page tables and address spaces.
//!
//! One set of walk/map/unmap routines serves both the kernel's direct-map
//! table and every per-process table; an address type parameter keeps
//! kernel and user virtual addresses from being mixed up.

use core::{cmp, marker::PhantomData, mem, ops::Add, slice};

use zerocopy::{AsBytes, FromBytes};

use crate::{
    fs::InodeGuard,
    kernel::kernel,
    memlayout::{
        kstack, text_end, trampoline_base, KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0,
        VIRTIO0,
    },
    page::Page,
    param::NPROC,
    riscv::{
        make_satp, pa2pte, pgrounddown, pgroundup, pte2pa, pxshift, sfence_vma, w_satp, PteFlags,
        MAXVA, PGSIZE, PXMASK,
    },
};

pub trait Addr: Copy + From<usize> + Add<usize, Output = Self> {
    fn into_usize(self) -> usize;
    fn is_null(self) -> bool;
    fn is_page_aligned(self) -> bool;
}

macro_rules! addr_type {
    ($(#[$attr:meta])* $typ:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, PartialOrd)]
        pub struct $typ(usize);

        impl From<usize> for $typ {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $typ {
            type Output = Self;

            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Addr for $typ {
            fn into_usize(self) -> usize {
                self.0
            }

            fn is_null(self) -> bool {
                self.0 == 0
            }

            fn is_page_aligned(self) -> bool {
                self.0 % PGSIZE == 0
            }
        }
    };
}

addr_type!(
    /// A physical address.
    PAddr
);
addr_type!(
    /// A kernel virtual address.
    KVAddr
);
addr_type!(
    /// A user virtual address.
    UVAddr
);

pub trait VAddr: Addr {
    /// The 9-bit index into the `level`th table on the walk to this
    /// address.
    #[inline]
    fn vpn(&self, level: usize) -> usize {
        (self.into_usize() >> pxshift(level)) & PXMASK
    }
}

impl VAddr for KVAddr {}

impl VAddr for UVAddr {}

/// One page-table entry.
///
/// # Safety
///
/// A branch entry (see `is_branch`) always names a live page-table node.
/// Zero-initialization is an invalid entry, which trivially satisfies
/// this.
#[derive(Default)]
struct Pte {
    bits: usize,
}

impl Pte {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.bits)
    }

    fn pa(&self) -> PAddr {
        pte2pa(self.bits).into()
    }

    fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// Valid and reachable from user mode.
    fn is_user_leaf(&self) -> bool {
        self.is_valid() && self.flags().contains(PteFlags::U)
    }

    /// A valid entry with none of R/W/X points at the next level down.
    fn is_branch(&self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    /// A valid entry with any of R/W/X maps a frame.
    fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    fn point_to_node(&mut self, node: *mut PtNode) {
        self.bits = pa2pte(node as usize) | PteFlags::V.bits();
    }

    /// Installs a leaf. The permission must carry at least one of R/W/X,
    /// or the entry would read as a branch.
    fn point_to_frame(&mut self, pa: PAddr, perm: PteFlags) {
        assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        self.bits = pa2pte(pa.into_usize()) | (perm | PteFlags::V).bits();
    }

    /// Hides the mapping from user mode; exec uses this for the stack
    /// guard page.
    fn strip_user(&mut self) {
        self.bits &= !PteFlags::U.bits();
    }

    fn clear(&mut self) {
        self.bits = 0;
    }

    /// The child node, when this is a branch entry.
    fn child_mut(&mut self) -> Option<&mut PtNode> {
        if self.is_branch() {
            // SAFETY: the invariant of Pte.
            Some(unsafe { &mut *(pte2pa(self.bits) as *mut _) })
        } else {
            None
        }
    }
}

/// Entries per node: a node fills one page.
const PT_ENTRIES: usize = PGSIZE / mem::size_of::<Pte>();

/// One radix-tree node.
///
/// # Safety
///
/// A node occupies exactly the frame it was allocated in, so
/// `Page::from_usize` on its address recovers that frame.
struct PtNode {
    entries: [Pte; PT_ENTRIES],
}

impl PtNode {
    /// Allocates and zeroes a fresh node; `None` when memory is exhausted.
    fn alloc() -> Option<*mut PtNode> {
        let mut page = kernel().alloc()?;
        page.write_bytes(0);
        // Every entry is zero, i.e. invalid, so the Pte invariant holds.
        Some(page.into_usize() as *mut PtNode)
    }

    /// Descends one level through the `index`th entry. An invalid entry
    /// grows a new child when `may_alloc` is set; a leaf entry, or a
    /// failed allocation, yields `None`.
    fn descend(&mut self, index: usize, may_alloc: bool) -> Option<&mut PtNode> {
        let pte = &mut self.entries[index];
        if !pte.is_valid() {
            if !may_alloc {
                return None;
            }
            pte.point_to_node(Self::alloc()?);
        }
        pte.child_mut()
    }

    /// The `index`th entry, which must not be a branch.
    fn slot(&mut self, index: usize) -> &mut Pte {
        let pte = &mut self.entries[index];
        assert!(!pte.is_branch());
        pte
    }

    /// Frees this node and every node below it. Leaf entries are skipped,
    /// not freed: any remaining ones (the trampoline, the trap frame)
    /// name frames this table does not own. Frames the address space does
    /// own must have been unmapped and freed beforehand.
    ///
    /// # Safety
    ///
    /// The node frees itself; nothing may touch it afterwards.
    unsafe fn release_subtree(&mut self) {
        for pte in &mut self.entries {
            if let Some(child) = pte.child_mut() {
                // SAFETY: the child is never used again.
                unsafe { child.release_subtree() };
                pte.clear();
            }
        }
        // SAFETY: sound by the invariant of PtNode.
        let page = unsafe { Page::from_usize(self.entries.as_ptr() as usize) };
        kernel().free(page);
    }
}

/// A three-level Sv39 page table.
///
/// # Safety
///
/// `root` uniquely refers to a valid root node.
pub struct PageTable<A: VAddr> {
    root: *mut PtNode,
    _marker: PhantomData<A>,
}

impl<A: VAddr> PageTable<A> {
    fn new() -> Option<Self> {
        Some(Self {
            root: PtNode::alloc()?,
            _marker: PhantomData,
        })
    }

    /// The physical address of the root, as satp wants it.
    fn root_addr(&self) -> usize {
        self.root as usize
    }

    /// Finds the leaf entry for `va`, building interior nodes on the way
    /// down when `may_alloc` is set.
    ///
    /// Sv39 splits a 64-bit virtual address into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    fn walk(&mut self, va: A, may_alloc: bool) -> Option<&mut Pte> {
        assert!(va.into_usize() < MAXVA, "PageTable::walk");
        // SAFETY: root is valid by the invariant of PageTable.
        let mut node = unsafe { &mut *self.root };
        for level in [2, 1] {
            node = node.descend(va.vpn(level), may_alloc)?;
        }
        Some(node.slot(va.vpn(0)))
    }

    /// Looks up a user-visible leaf; its frame address, or `None` when
    /// `va` is unmapped or supervisor-only.
    fn walk_addr(&mut self, va: A) -> Option<PAddr> {
        if va.into_usize() >= MAXVA {
            return None;
        }
        let pte = self.walk(va, false)?;
        if !pte.is_user_leaf() {
            return None;
        }
        Some(pte.pa())
    }

    fn map_one(&mut self, va: A, pa: PAddr, perm: PteFlags) -> Result<(), ()> {
        let aligned = pgrounddown(va.into_usize());
        let pte = self.walk(A::from(aligned), true).ok_or(())?;
        assert!(!pte.is_valid(), "remap");
        pte.point_to_frame(pa, perm);
        Ok(())
    }

    /// Maps the pages covering `[va, va + size)` onto the physical range
    /// starting at `pa`; neither end needs to be aligned. All-or-nothing:
    /// if an interior allocation fails part way, the already-installed
    /// prefix is taken down again.
    fn map_range(&mut self, va: A, size: usize, pa: PAddr, perm: PteFlags) -> Result<(), ()> {
        let first = pgrounddown(va.into_usize());
        let last = pgrounddown(va.into_usize() + size - 1);
        let mut off = 0;
        while first + off <= last {
            if self.map_one(va + off, pa + off, perm).is_err() {
                for undone in num_iter::range_step(0, off, PGSIZE) {
                    let _ = self.unmap_one(A::from(first + undone));
                }
                return Err(());
            }
            off += PGSIZE;
        }
        Ok(())
    }

    /// Clears the leaf for `va`, handing back the frame address it held.
    /// Panics if the entry exists but is not a leaf.
    fn unmap_one(&mut self, va: A) -> Option<PAddr> {
        let pte = self.walk(va, false)?;
        assert!(pte.is_leaf(), "PageTable::unmap_one");
        let pa = pte.pa();
        pte.clear();
        Some(pa)
    }
}

impl<A: VAddr> Drop for PageTable<A> {
    fn drop(&mut self) {
        // SAFETY: the table is going away for good.
        unsafe { (*self.root).release_subtree() };
    }
}

/// The address space of one process: its page table plus the frames
/// backing `[0, size)`.
///
/// # Safety
///
/// Viewing the table as a partial map pt from va to pa:
/// - Mapped addresses and their frames are page-aligned.
/// - pt(TRAMPOLINE) is the trampoline and TRAPFRAME ∈ dom(pt).
/// - Every other mapped va names a frame this image owns and got from the
///   frame allocator, so `Page::from_usize(pt(va))` is sound.
/// - The image is a prefix: mapped vas other than TRAMPOLINE/TRAPFRAME
///   are exactly the pages below pgroundup(size).
pub struct UserMemory {
    page_table: PageTable<UVAddr>,
    /// Image size in bytes.
    size: usize,
}

impl UserMemory {
    /// Builds an address space holding only the trampoline and the given
    /// trap frame. When `src_opt` carries bytes (at most one page), they
    /// become the first page of the image, for the initcode. `None` when
    /// out of memory.
    pub fn new(trap_frame: PAddr, src_opt: Option<&[u8]>) -> Option<Self> {
        let mut page_table = PageTable::new()?;

        // The trampoline, at the top of every address space; it carries
        // no U bit, since only trap entry/exit runs there.
        page_table
            .map_one(
                TRAMPOLINE.into(),
                trampoline_base().into(),
                PteFlags::R | PteFlags::X,
            )
            .ok()?;

        // The trap frame sits on the page right under it.
        page_table
            .map_one(TRAPFRAME.into(), trap_frame, PteFlags::R | PteFlags::W)
            .ok()?;

        let mut memory = Self {
            page_table,
            size: 0,
        };

        if let Some(src) = src_opt {
            assert!(src.len() < PGSIZE, "UserMemory::new: more than a page");
            let mut page = kernel().alloc()?;
            page.write_bytes(0);
            page[..src.len()].copy_from_slice(src);
            memory
                .push_page(
                    page,
                    PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                )
                .map_err(|page| kernel().free(page))
                .ok()?;
        }

        Some(memory)
    }

    /// Duplicates the whole image for fork: fresh table, fresh frames,
    /// same bytes and permissions. Everything built so far is freed again
    /// on failure.
    pub fn try_clone(&mut self, trap_frame: PAddr) -> Option<Self> {
        let new = Self::new(trap_frame, None)?;
        let mut new = scopeguard::guard(new, |mut new| {
            let _ = new.dealloc(0);
        });
        for va in num_iter::range_step(0, self.size, PGSIZE) {
            let pte = self
                .page_table
                .walk(va.into(), false)
                .expect("try_clone: hole in image");
            assert!(pte.is_leaf(), "try_clone: branch in image");

            let pa = pte.pa();
            let flags = pte.flags() & !(PteFlags::V | PteFlags::A | PteFlags::D);
            let mut page = kernel().alloc()?;
            // SAFETY: pa is mapped here, hence a frame, by the invariant.
            let src = unsafe { slice::from_raw_parts(pa.into_usize() as *const u8, PGSIZE) };
            page.copy_from_slice(src);
            new.push_page(page, flags)
                .map_err(|page| kernel().free(page))
                .ok()?;
        }
        let mut new = scopeguard::ScopeGuard::into_inner(new);
        new.size = self.size;
        Some(new)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Reads `sz` bytes of file content, starting at `offset`, into the
    /// image at `va`. `va` must be page-aligned and the destination pages
    /// already mapped.
    pub fn load_file(
        &mut self,
        va: UVAddr,
        ip: &mut InodeGuard<'_>,
        offset: u32,
        sz: u32,
    ) -> Result<(), ()> {
        assert!(va.is_page_aligned(), "load_file: va not aligned");
        let mut done = 0;
        while done < sz {
            let dst = self
                .user_page(va + done as usize)
                .expect("load_file: destination unmapped");
            let n = cmp::min((sz - done) as usize, PGSIZE);
            if ip.read_bytes_kernel(&mut dst[..n], offset + done) != n {
                return Err(());
            }
            done += PGSIZE as u32;
        }
        Ok(())
    }

    /// Grows the image to `newsz` bytes (not necessarily page-aligned),
    /// zeroing each new frame and mapping it R|U plus `xperm`. On failure
    /// the growth is rolled back.
    pub fn alloc(&mut self, newsz: usize, xperm: PteFlags) -> Result<usize, ()> {
        if newsz <= self.size {
            return Ok(self.size);
        }

        let oldsz = self.size;
        let mut this = scopeguard::guard(self, |this| {
            let _ = this.dealloc(oldsz);
        });
        while pgroundup(this.size) < pgroundup(newsz) {
            let mut page = kernel().alloc().ok_or(())?;
            page.write_bytes(0);
            this.push_page(page, PteFlags::R | PteFlags::U | xperm)
                .map_err(|page| kernel().free(page))?;
        }
        let this = scopeguard::ScopeGuard::into_inner(this);
        this.size = newsz;
        Ok(newsz)
    }

    /// Shrinks the image to `newsz` bytes, unmapping and freeing the
    /// pages above it. Returns the resulting size.
    pub fn dealloc(&mut self, newsz: usize) -> usize {
        if self.size <= newsz {
            return self.size;
        }

        while pgroundup(newsz) < pgroundup(self.size) {
            if let Some(page) = self.pop_page() {
                kernel().free(page);
            }
        }
        self.size = newsz;
        newsz
    }

    /// sbrk: adjusts the image by `n` bytes either way and reports the
    /// old size.
    pub fn resize(&mut self, n: isize) -> Result<usize, ()> {
        let size = self.size;
        match n.cmp(&0) {
            cmp::Ordering::Equal => (),
            cmp::Ordering::Greater => {
                let _ = self.alloc(size + n as usize, PteFlags::W)?;
            }
            cmp::Ordering::Less => {
                let _ = self.dealloc(size - n.unsigned_abs());
            }
        }
        Ok(size)
    }

    /// Revokes user access to the page at `va`; exec's stack guard.
    pub fn clear_user(&mut self, va: UVAddr) {
        self.page_table
            .walk(va, false)
            .expect("clear_user")
            .strip_user();
    }

    /// Copies `src` into the image at `dstva`, page by page.
    pub fn copy_out_bytes(&mut self, dstva: UVAddr, src: &[u8]) -> Result<(), ()> {
        let mut copied = 0;
        while copied < src.len() {
            let va = dstva.into_usize() + copied;
            let within = va % PGSIZE;
            let n = cmp::min(PGSIZE - within, src.len() - copied);
            let page = self.user_page(pgrounddown(va).into()).ok_or(())?;
            page[within..within + n].copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    /// Copies one value into the image at `dstva`.
    pub fn copy_out<T: AsBytes>(&mut self, dstva: UVAddr, src: &T) -> Result<(), ()> {
        self.copy_out_bytes(dstva, src.as_bytes())
    }

    /// Copies from the image at `srcva` into `dst`, page by page.
    pub fn copy_in_bytes(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<(), ()> {
        let mut copied = 0;
        while copied < dst.len() {
            let va = srcva.into_usize() + copied;
            let within = va % PGSIZE;
            let n = cmp::min(PGSIZE - within, dst.len() - copied);
            let page = self.user_page(pgrounddown(va).into()).ok_or(())?;
            dst[copied..copied + n].copy_from_slice(&page[within..within + n]);
            copied += n;
        }
        Ok(())
    }

    /// Copies one value out of the image at `srcva`.
    pub fn copy_in<T: AsBytes + FromBytes>(&mut self, dst: &mut T, srcva: UVAddr) -> Result<(), ()> {
        self.copy_in_bytes(dst.as_bytes_mut(), srcva)
    }

    /// Copies a NUL-terminated string out of the image, including the
    /// NUL. Errors when a page is inaccessible or no NUL shows up within
    /// `dst.len()` bytes.
    pub fn copy_in_str(&mut self, dst: &mut [u8], srcva: UVAddr) -> Result<(), ()> {
        let mut copied = 0;
        while copied < dst.len() {
            let va = srcva.into_usize() + copied;
            let within = va % PGSIZE;
            let n = cmp::min(PGSIZE - within, dst.len() - copied);
            let page = self.user_page(pgrounddown(va).into()).ok_or(())?;

            let chunk = &page[within..within + n];
            match chunk.iter().position(|c| *c == 0) {
                Some(nul) => {
                    dst[copied..copied + nul + 1].copy_from_slice(&chunk[..nul + 1]);
                    return Ok(());
                }
                None => {
                    dst[copied..copied + n].copy_from_slice(chunk);
                    copied += n;
                }
            }
        }
        Err(())
    }

    /// This image's page table, encoded for the satp register.
    pub fn satp(&self) -> usize {
        make_satp(self.page_table.root_addr())
    }

    /// The frame behind `va`, as a byte slice; `None` unless `va` is
    /// mapped with the U bit.
    fn user_page(&mut self, va: UVAddr) -> Option<&mut [u8]> {
        if va.into_usize() >= TRAPFRAME {
            return None;
        }
        let pa = self.page_table.walk_addr(va)?;
        // SAFETY: va < TRAPFRAME, so pa is a frame this image owns, by
        // the invariant.
        Some(unsafe { slice::from_raw_parts_mut(pa.into_usize() as *mut u8, PGSIZE) })
    }

    /// Appends one page at the top of the image.
    fn push_page(&mut self, page: Page, perm: PteFlags) -> Result<(), Page> {
        let pa = page.into_usize();
        let top = pgroundup(self.size);
        self.page_table
            .map_one(top.into(), pa.into(), perm)
            // SAFETY: pa is the frame that was just consumed.
            .map_err(|_| unsafe { Page::from_usize(pa) })?;
        self.size = top + PGSIZE;
        Ok(())
    }

    /// Unmaps the topmost page of the image and returns its frame.
    fn pop_page(&mut self) -> Option<Page> {
        if self.size == 0 {
            return None;
        }
        self.size = pgroundup(self.size) - PGSIZE;
        let pa = self
            .page_table
            .unmap_one(self.size.into())
            .expect("pop_page")
            .into_usize();
        // SAFETY: pa was mapped in the image, hence a frame it owns.
        Some(unsafe { Page::from_usize(pa) })
    }
}

impl Drop for UserMemory {
    fn drop(&mut self) {
        let _ = self.dealloc(0);
    }
}

/// The kernel's address space: an identity map of RAM and MMIO, the
/// trampoline, and one stack per process slot. Nothing here is ever
/// unmapped, and apart from the stacks no mapped frame comes from the
/// allocator, so the type needs no invariant beyond `PageTable`'s.
pub struct KernelMemory {
    page_table: PageTable<KVAddr>,
}

impl KernelMemory {
    /// Builds the direct-map kernel page table.
    pub fn new() -> Option<Self> {
        let mut page_table = PageTable::new()?;

        // Uart registers.
        page_table
            .map_range(UART0.into(), PGSIZE, UART0.into(), PteFlags::R | PteFlags::W)
            .ok()?;

        // Virtio mmio disk interface.
        page_table
            .map_range(
                VIRTIO0.into(),
                PGSIZE,
                VIRTIO0.into(),
                PteFlags::R | PteFlags::W,
            )
            .ok()?;

        // PLIC.
        page_table
            .map_range(PLIC.into(), 0x40_0000, PLIC.into(), PteFlags::R | PteFlags::W)
            .ok()?;

        // Kernel text, executable and read-only.
        let et = text_end();
        page_table
            .map_range(
                KERNBASE.into(),
                et - KERNBASE,
                KERNBASE.into(),
                PteFlags::R | PteFlags::X,
            )
            .ok()?;

        // Kernel data and the rest of usable RAM.
        page_table
            .map_range(et.into(), PHYSTOP - et, et.into(), PteFlags::R | PteFlags::W)
            .ok()?;

        // The trampoline, at the same high address user tables put it.
        page_table
            .map_range(
                TRAMPOLINE.into(),
                PGSIZE,
                trampoline_base().into(),
                PteFlags::R | PteFlags::X,
            )
            .ok()?;

        // One kernel stack per process slot, high in memory, each
        // followed by an unmapped guard page.
        for i in 0..NPROC {
            let pa = kernel().alloc()?.into_usize();
            page_table
                .map_range(
                    kstack(i).into(),
                    PGSIZE,
                    pa.into(),
                    PteFlags::R | PteFlags::W,
                )
                .ok()?;
        }

        Some(Self { page_table })
    }

    /// Points this hart's satp at the kernel table and flushes the TLB.
    pub unsafe fn init_hart(&self) {
        unsafe {
            w_satp(make_satp(self.page_table.root_addr()));
            sfence_vma();
        }
    }
}
