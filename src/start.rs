//! Machine-mode boot: entry.S runs here on every hart, still in M-mode.

#![cfg(target_arch = "riscv64")]

use core::arch::asm;

use crate::{
    kernel::kernel_main,
    param::NCPU,
    riscv::{
        r_menvcfg, r_mhartid, r_mstatus, r_sie, r_time, w_medeleg, w_menvcfg, w_mepc, w_mideleg,
        w_mstatus, w_pmpaddr0, w_pmpcfg0, w_sie, w_stimecmp, w_tp, MSTATUS_MPP_MASK, MSTATUS_MPP_S,
        SIE_SEIE, SIE_SSIE, SIE_STIE,
    },
};

/// One boot stack per hart; entry.S points sp here.
#[repr(C, align(16))]
struct Stack0([u8; 4096 * NCPU]);

#[no_mangle]
static mut stack0: Stack0 = Stack0([0; 4096 * NCPU]);

/// entry.S jumps here in machine mode on stack0.
#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    unsafe {
        // Set M Previous Privilege mode to Supervisor, for mret.
        let mut x = r_mstatus();
        x &= !MSTATUS_MPP_MASK;
        x |= MSTATUS_MPP_S;
        w_mstatus(x);

        // Set M Exception Program Counter to main, for mret.
        w_mepc(kernel_main as usize);

        // Disable paging for now.
        asm!("csrw satp, zero");

        // Delegate all interrupts and exceptions to supervisor mode.
        w_medeleg(0xffff);
        w_mideleg(0xffff);
        w_sie(r_sie() | SIE_SEIE | SIE_STIE | SIE_SSIE);

        // Configure Physical Memory Protection to give supervisor mode
        // access to all of physical memory.
        w_pmpaddr0(0x3f_ffff_ffff_ffff);
        w_pmpcfg0(0xf);

        // Ask for clock interrupts.
        timerinit();

        // Keep each CPU's hartid in its tp register, for cpuid().
        w_tp(r_mhartid());

        // Switch to supervisor mode and jump to main().
        asm!("mret", options(noreturn))
    }
}

/// Arranges to receive timer interrupts in supervisor mode, via the Sstc
/// extension's stimecmp.
unsafe fn timerinit() {
    unsafe {
        // Enable supervisor-mode timer interrupts.
        asm!("csrs mie, {}", in(reg) (1usize << 5));

        // Enable the sstc extension (i.e. stimecmp).
        w_menvcfg(r_menvcfg() | (1 << 63));

        // Allow supervisor mode to use stimecmp and time.
        asm!("csrs mcounteren, {}", in(reg) 2usize);

        // Ask for the very first timer interrupt.
        w_stimecmp(r_time() + 1_000_000);
    }
}
