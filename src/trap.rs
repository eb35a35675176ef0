//! Trap handling for both user and kernel mode.

use crate::{
    kernel::kernel,
    memlayout::{trampoline_base, TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ},
    plic::{plic_claim, plic_complete},
    println,
    proc::{cpuid, myproc, proc_yield, Procstate},
    riscv::{
        intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_sstatus, r_stval, r_time, r_tp,
        w_sepc, w_sstatus, w_stimecmp, w_stvec, PGSIZE, SSTATUS_SPIE, SSTATUS_SPP,
    },
    syscall::syscall,
    virtio::virtio_disk_intr,
};

/// Supervisor external interrupt.
const SCAUSE_EXTERNAL: usize = 0x8000_0000_0000_0009;
/// Supervisor timer interrupt.
const SCAUSE_TIMER: usize = 0x8000_0000_0000_0005;
/// Environment call from U-mode.
const SCAUSE_SYSCALL: usize = 8;

/// Timer interrupt interval, in cycles; about a tenth of a second in
/// qemu.
const TIMER_INTERVAL: usize = 1_000_000;

#[cfg(target_arch = "riscv64")]
extern "C" {
    // trampoline.S
    fn uservec();
    fn userret();

    // kernelvec.S, which calls kerneltrap().
    fn kernelvec();
}

// Host stand-ins so the crate links on the build machine.
#[cfg(not(target_arch = "riscv64"))]
unsafe fn uservec() {}
#[cfg(not(target_arch = "riscv64"))]
unsafe fn userret() {}
#[cfg(not(target_arch = "riscv64"))]
unsafe fn kernelvec() {}

/// Installs the kernel trap vector on this hart and arms its timer.
pub unsafe fn trapinithart() {
    unsafe {
        w_stvec(kernelvec as usize);
        // Ask for the very first timer interrupt.
        w_stimecmp(r_time() + TIMER_INTERVAL);
    }
}

/// Handles an interrupt, exception, or system call from user space.
/// Called from the trampoline.
#[no_mangle]
pub unsafe extern "C" fn usertrap() {
    assert!(
        unsafe { r_sstatus() } & SSTATUS_SPP == 0,
        "usertrap: not from user mode"
    );

    // We are in the kernel now, so redirect traps to kerneltrap().
    unsafe { w_stvec(kernelvec as usize) };

    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    // Save the user program counter.
    data.trap_frame_mut().epc = unsafe { r_sepc() };

    let scause = unsafe { r_scause() };
    let mut which_dev = 0;
    if scause == SCAUSE_SYSCALL {
        // System call.
        if unsafe { (*p).killed() } {
            unsafe { kernel().procs.exit_current(-1) };
        }

        // sepc points to the ecall instruction, but we want to return to
        // the next instruction.
        data.trap_frame_mut().epc += 4;

        // An interrupt will change sepc, scause, and sstatus, so enable
        // only now that we are done with those registers.
        unsafe { intr_on() };

        unsafe { syscall() };
    } else {
        which_dev = unsafe { devintr() };
        if which_dev == 0 {
            println!(
                "usertrap(): unexpected scause {:#x} pid={}",
                scause,
                unsafe { (*p).pid() }
            );
            println!("            sepc={:#x} stval={:#x}", unsafe { r_sepc() }, unsafe {
                r_stval()
            });
            unsafe { (*p).kill() };
        }
    }

    if unsafe { (*p).killed() } {
        unsafe { kernel().procs.exit_current(-1) };
    }

    // Give up the CPU if this was a timer interrupt.
    if which_dev == 2 {
        proc_yield();
    }

    unsafe { usertrapret() };
}

/// Returns to user space through the trampoline.
pub unsafe fn usertrapret() -> ! {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(); turn interrupts off until we're back in user space where
    // usertrap() is correct.
    unsafe { intr_off() };

    // Send syscalls, interrupts, and exceptions to uservec in
    // trampoline.S.
    let trampoline_uservec = TRAMPOLINE + (uservec as usize - trampoline_base());
    unsafe { w_stvec(trampoline_uservec) };

    // Set up the trapframe values uservec will need when the process traps
    // into the kernel next.
    let kstack = data.kstack;
    let tf = data.trap_frame_mut();
    tf.kernel_satp = unsafe { r_satp() };
    tf.kernel_sp = kstack + PGSIZE;
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = unsafe { r_tp() };

    // Set up the registers trampoline.S's sret will use to get to user
    // space: S Previous Privilege mode to User, user interrupts enabled.
    let mut sstatus = unsafe { r_sstatus() };
    sstatus &= !SSTATUS_SPP;
    sstatus |= SSTATUS_SPIE;
    unsafe { w_sstatus(sstatus) };

    // Set S Exception Program Counter to the saved user pc.
    unsafe { w_sepc(data.trap_frame().epc) };

    // Tell the trampoline the user page table to switch to.
    let satp = data.memory_mut().satp();

    // Jump to userret in trampoline.S at the top of memory, which switches
    // to the user page table, restores user registers, and sret's to user
    // mode.
    let trampoline_userret = TRAMPOLINE + (userret as usize - trampoline_base());
    // SAFETY: the trampoline page is mapped executable at this address in
    // every address space.
    let userret: unsafe extern "C" fn(usize, usize) -> ! =
        unsafe { core::mem::transmute(trampoline_userret) };
    unsafe { userret(TRAPFRAME, satp) }
}

/// Handles an interrupt or exception taken while in supervisor mode, via
/// kernelvec.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = unsafe { r_sepc() };
    let sstatus = unsafe { r_sstatus() };

    assert!(
        sstatus & SSTATUS_SPP != 0,
        "kerneltrap: not from supervisor mode"
    );
    assert!(!unsafe { intr_get() }, "kerneltrap: interrupts enabled");

    let which_dev = unsafe { devintr() };
    if which_dev == 0 {
        println!("scause={:#x} sepc={:#x} stval={:#x}", unsafe { r_scause() }, sepc, unsafe {
            r_stval()
        });
        panic!("kerneltrap");
    }

    // Give up the CPU if this was a timer interrupt and a process is
    // running.
    let p = myproc();
    if which_dev == 2 && !p.is_null() && unsafe { (*p).state() } == Procstate::RUNNING {
        proc_yield();
    }

    // proc_yield() may have caused some traps to occur, so restore the
    // trap registers for use by kernelvec.S's sepc instruction.
    unsafe { w_sepc(sepc) };
    unsafe { w_sstatus(sstatus) };
}

/// The timer tick: bump ticks on one hart, wake sleepers, rearm.
unsafe fn clockintr() {
    if cpuid() == 0 {
        let mut ticks = kernel().ticks.lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup();
    }

    // Ask for the next timer interrupt; this also clears the pending one.
    unsafe { w_stimecmp(r_time() + TIMER_INTERVAL) };
}

/// Checks if this is an external or timer interrupt and handles it.
/// Returns 2 for a timer interrupt, 1 for another device, 0 if
/// unrecognized.
unsafe fn devintr() -> i32 {
    let scause = unsafe { r_scause() };

    if scause == SCAUSE_EXTERNAL {
        // This is a supervisor external interrupt, via the PLIC.
        let irq = plic_claim();

        if irq as usize == UART0_IRQ {
            kernel().console.intr();
        } else if irq as usize == VIRTIO0_IRQ {
            virtio_disk_intr();
        } else if irq != 0 {
            println!("unexpected interrupt irq={}", irq);
        }

        // The PLIC only lets each device raise one interrupt at a time;
        // telling it we are done allows the next one through.
        if irq != 0 {
            plic_complete(irq);
        }
        1
    } else if scause == SCAUSE_TIMER {
        unsafe { clockintr() };
        2
    } else {
        0
    }
}
