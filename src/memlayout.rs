//! Physical memory layout
//!
//! qemu -machine virt is set up like this, based on qemu's
//! hw/riscv/virt.c:
//!
//! 00001000 -- boot ROM, provided by qemu
//! 02000000 -- CLINT
//! 0C000000 -- PLIC
//! 10000000 -- uart0
//! 10001000 -- virtio disk
//! 80000000 -- boot ROM jumps here in machine mode
//!             -kernel loads the kernel here
//! unused RAM after 80000000.
//!
//! the kernel uses physical memory thus:
//! 80000000 -- entry.S, then kernel text and data
//! end -- start of kernel page allocation area
//! PHYSTOP -- end of RAM used by the kernel

use crate::{
    param::NPROC,
    riscv::{MAXVA, PGSIZE},
};

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: usize = 10;

/// virtio mmio interface
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: usize = 1;

/// qemu puts platform-level interrupt controller (PLIC) here.
pub const PLIC: usize = 0x0c00_0000;

/// The kernel expects there to be RAM for use by the kernel and user pages
/// from physical address KERNBASE to PHYSTOP.
pub const KERNBASE: usize = 0x8000_0000;
pub const PHYSTOP: usize = KERNBASE + 128 * 1024 * 1024;

/// Map the trampoline page to the highest address, in both user and kernel
/// space.
pub const TRAMPOLINE: usize = MAXVA - PGSIZE;

/// User memory layout.
/// Address zero first:
///   text
///   original data and bss
///   fixed-size stack
///   expandable heap
///   ...
///   TRAPFRAME (p->trap_frame, used by the trampoline)
///   TRAMPOLINE (the same page as in the kernel)
pub const TRAPFRAME: usize = TRAMPOLINE - PGSIZE;

/// Map kernel stacks beneath the trampoline, each surrounded by invalid
/// guard pages.
pub const fn kstack(p: usize) -> usize {
    TRAMPOLINE - (p + 1) * 2 * PGSIZE
}

const _: () = assert!(kstack(NPROC - 1) > PHYSTOP);

#[cfg(target_arch = "riscv64")]
mod symbols {
    extern "C" {
        // kernel.ld sets these.
        static mut etext: [u8; 0];
        static mut end: [u8; 0];

        // trampoline.S
        static mut trampoline: [u8; 0];
    }

    /// First address after kernel text.
    pub fn text_end() -> usize {
        // SAFETY: it is safe to take only the address of a linker symbol.
        unsafe { etext.as_ptr() as usize }
    }

    /// First address after the kernel image; start of the allocatable heap.
    pub fn kernel_end() -> usize {
        // SAFETY: it is safe to take only the address of a linker symbol.
        unsafe { end.as_ptr() as usize }
    }

    /// Physical address of the trap entry/exit page.
    pub fn trampoline_base() -> usize {
        // SAFETY: it is safe to take only the address of a linker symbol.
        unsafe { trampoline.as_ptr() as usize }
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod symbols {
    //! Host stand-ins; nothing maps or allocates real physical memory when
    //! the crate is built for the test host.

    use super::KERNBASE;

    pub fn text_end() -> usize {
        KERNBASE
    }

    pub fn kernel_end() -> usize {
        KERNBASE
    }

    pub fn trampoline_base() -> usize {
        KERNBASE
    }
}

pub use symbols::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_stacks_have_guard_gaps() {
        // Each stack slot is one mapped page below an unmapped guard page.
        assert_eq!(kstack(0), TRAMPOLINE - 2 * PGSIZE);
        assert_eq!(kstack(0) - kstack(1), 2 * PGSIZE);
    }

    #[test]
    fn trapframe_sits_below_trampoline() {
        assert_eq!(TRAPFRAME + PGSIZE, TRAMPOLINE);
        assert_eq!(TRAMPOLINE + PGSIZE, MAXVA);
    }
}
