//! RISC-V CSR access and Sv39 page-table constants.
//!
//! The CSR accessors are real instructions only when compiling for
//! `riscv64`; other targets get inert stand-ins so that the pure parts of
//! the kernel (and the unit tests) can be compiled and run on the host.

// Not every register accessor has a caller.
#![allow(dead_code)]

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

bitflags! {
    /// Page-table entry flag bits.
    pub struct PteFlags: usize {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// Global mapping.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
    }
}

/// Shift a physical address to the right place for a PTE.
pub const fn pa2pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

pub const fn pte2pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

/// Extract one of the three 9-bit page-table indices from a virtual address.
pub const PXMASK: usize = 0x1ff;

pub const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

/// One beyond the highest possible virtual address.
///
/// MAXVA is actually one bit less than the max allowed by Sv39, to avoid
/// having to sign-extend virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Use riscv's sv39 page table scheme.
pub const SATP_SV39: usize = 8 << 60;

pub const fn make_satp(pagetable: usize) -> usize {
    SATP_SV39 | (pagetable >> 12)
}

// Supervisor Status Register, sstatus.

/// Previous mode, 1=Supervisor, 0=User.
pub const SSTATUS_SPP: usize = 1 << 8;
/// Supervisor Previous Interrupt Enable.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// Supervisor Interrupt Enable.
pub const SSTATUS_SIE: usize = 1 << 1;

// Supervisor Interrupt Enable, sie.

/// External.
pub const SIE_SEIE: usize = 1 << 9;
/// Timer.
pub const SIE_STIE: usize = 1 << 5;
/// Software.
pub const SIE_SSIE: usize = 1 << 1;

// Machine Status Register, mstatus.

/// Previous mode mask.
pub const MSTATUS_MPP_MASK: usize = 3 << 11;
pub const MSTATUS_MPP_S: usize = 1 << 11;

#[cfg(target_arch = "riscv64")]
mod imp {
    use core::arch::asm;

    use super::*;

    #[inline]
    pub unsafe fn r_mhartid() -> usize {
        let x: usize;
        asm!("csrr {}, mhartid", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn r_mstatus() -> usize {
        let x: usize;
        asm!("csrr {}, mstatus", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_mstatus(x: usize) {
        asm!("csrw mstatus, {}", in(reg) x);
    }

    /// Machine exception program counter; holds the instruction address to
    /// which mret returns.
    #[inline]
    pub unsafe fn w_mepc(x: usize) {
        asm!("csrw mepc, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn r_sstatus() -> usize {
        let x: usize;
        asm!("csrr {}, sstatus", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_sstatus(x: usize) {
        asm!("csrw sstatus, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn r_sie() -> usize {
        let x: usize;
        asm!("csrr {}, sie", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_sie(x: usize) {
        asm!("csrw sie, {}", in(reg) x);
    }

    /// Supervisor exception program counter; holds the instruction address
    /// to which a return from trap will go.
    #[inline]
    pub unsafe fn w_sepc(x: usize) {
        asm!("csrw sepc, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn r_sepc() -> usize {
        let x: usize;
        asm!("csrr {}, sepc", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_medeleg(x: usize) {
        asm!("csrw medeleg, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn w_mideleg(x: usize) {
        asm!("csrw mideleg, {}", in(reg) x);
    }

    /// Supervisor trap-vector base address; low two bits are mode.
    #[inline]
    pub unsafe fn w_stvec(x: usize) {
        asm!("csrw stvec, {}", in(reg) x);
    }

    /// Supervisor address translation and protection; holds the address of
    /// the page table.
    #[inline]
    pub unsafe fn w_satp(x: usize) {
        asm!("csrw satp, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn r_satp() -> usize {
        let x: usize;
        asm!("csrr {}, satp", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn r_scause() -> usize {
        let x: usize;
        asm!("csrr {}, scause", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn r_stval() -> usize {
        let x: usize;
        asm!("csrr {}, stval", out(reg) x);
        x
    }

    /// Machine-mode counter enable.
    #[inline]
    pub unsafe fn w_mcounteren(x: usize) {
        asm!("csrw mcounteren, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn r_mcounteren() -> usize {
        let x: usize;
        asm!("csrr {}, mcounteren", out(reg) x);
        x
    }

    /// Machine-mode environment configuration register, menvcfg (0x30a).
    /// Not every assembler knows the name, so use the CSR number.
    #[inline]
    pub unsafe fn r_menvcfg() -> usize {
        let x: usize;
        asm!("csrr {}, 0x30a", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_menvcfg(x: usize) {
        asm!("csrw 0x30a, {}", in(reg) x);
    }

    /// Supervisor timer comparison register, stimecmp (0x14d), from the
    /// Sstc extension. Addressed by number for the same reason as menvcfg.
    #[inline]
    pub unsafe fn w_stimecmp(x: usize) {
        asm!("csrw 0x14d, {}", in(reg) x);
    }

    /// Physical memory protection registers.
    #[inline]
    pub unsafe fn w_pmpcfg0(x: usize) {
        asm!("csrw pmpcfg0, {}", in(reg) x);
    }

    #[inline]
    pub unsafe fn w_pmpaddr0(x: usize) {
        asm!("csrw pmpaddr0, {}", in(reg) x);
    }

    /// Machine-mode cycle counter.
    #[inline]
    pub unsafe fn r_time() -> usize {
        let x: usize;
        asm!("csrr {}, time", out(reg) x);
        x
    }

    /// Enable device interrupts.
    #[inline]
    pub unsafe fn intr_on() {
        w_sstatus(r_sstatus() | SSTATUS_SIE);
    }

    /// Disable device interrupts.
    #[inline]
    pub unsafe fn intr_off() {
        w_sstatus(r_sstatus() & !SSTATUS_SIE);
    }

    /// Are device interrupts enabled?
    #[inline]
    pub unsafe fn intr_get() -> bool {
        r_sstatus() & SSTATUS_SIE != 0
    }

    /// Read tp, the thread pointer, which holds this core's hartid, the
    /// index into cpus[].
    #[inline]
    pub unsafe fn r_tp() -> usize {
        let x: usize;
        asm!("mv {}, tp", out(reg) x);
        x
    }

    #[inline]
    pub unsafe fn w_tp(x: usize) {
        asm!("mv tp, {}", in(reg) x);
    }

    /// Flush the TLB. The zero, zero means flush all TLB entries.
    #[inline]
    pub unsafe fn sfence_vma() {
        asm!("sfence.vma zero, zero");
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    //! Host stand-ins. None of the hardware paths run during unit tests;
    //! these exist so the crate links on the build machine.

    #[inline]
    pub unsafe fn r_mhartid() -> usize {
        0
    }

    #[inline]
    pub unsafe fn r_mstatus() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_mstatus(_x: usize) {}

    #[inline]
    pub unsafe fn w_mepc(_x: usize) {}

    #[inline]
    pub unsafe fn r_sstatus() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_sstatus(_x: usize) {}

    #[inline]
    pub unsafe fn r_sie() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_sie(_x: usize) {}

    #[inline]
    pub unsafe fn w_sepc(_x: usize) {}

    #[inline]
    pub unsafe fn r_sepc() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_medeleg(_x: usize) {}

    #[inline]
    pub unsafe fn w_mideleg(_x: usize) {}

    #[inline]
    pub unsafe fn w_stvec(_x: usize) {}

    #[inline]
    pub unsafe fn w_satp(_x: usize) {}

    #[inline]
    pub unsafe fn r_satp() -> usize {
        0
    }

    #[inline]
    pub unsafe fn r_scause() -> usize {
        0
    }

    #[inline]
    pub unsafe fn r_stval() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_mcounteren(_x: usize) {}

    #[inline]
    pub unsafe fn r_mcounteren() -> usize {
        0
    }

    #[inline]
    pub unsafe fn r_menvcfg() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_menvcfg(_x: usize) {}

    #[inline]
    pub unsafe fn w_stimecmp(_x: usize) {}

    #[inline]
    pub unsafe fn w_pmpcfg0(_x: usize) {}

    #[inline]
    pub unsafe fn w_pmpaddr0(_x: usize) {}

    #[inline]
    pub unsafe fn r_time() -> usize {
        0
    }

    #[inline]
    pub unsafe fn intr_on() {}

    #[inline]
    pub unsafe fn intr_off() {}

    #[inline]
    pub unsafe fn intr_get() -> bool {
        false
    }

    #[inline]
    pub unsafe fn r_tp() -> usize {
        0
    }

    #[inline]
    pub unsafe fn w_tp(_x: usize) {}

    #[inline]
    pub unsafe fn sfence_vma() {}
}

pub use imp::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(pgroundup(0), 0);
        assert_eq!(pgroundup(1), PGSIZE);
        assert_eq!(pgroundup(PGSIZE), PGSIZE);
        assert_eq!(pgroundup(PGSIZE + 1), 2 * PGSIZE);
        assert_eq!(pgrounddown(PGSIZE - 1), 0);
        assert_eq!(pgrounddown(PGSIZE + 1), PGSIZE);
    }

    #[test]
    fn pte_address_round_trip() {
        let pa = 0x8020_3000;
        assert_eq!(pte2pa(pa2pte(pa)), pa);
    }

    #[test]
    fn px_field_extraction() {
        // Sv39: indices live at bits 12..21, 21..30, 30..39.
        let va = (1usize << 30) | (2 << 21) | (3 << 12) | 0x123;
        assert_eq!((va >> pxshift(2)) & PXMASK, 1);
        assert_eq!((va >> pxshift(1)) & PXMASK, 2);
        assert_eq!((va >> pxshift(0)) & PXMASK, 3);
    }
}
