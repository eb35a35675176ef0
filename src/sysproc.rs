//! Process-related system calls.

use crate::{
    kernel::kernel,
    proc::{growproc, myproc},
    syscall::{argaddr, argint},
};

pub fn sys_exit() -> Result<usize, ()> {
    let status = argint(0);
    unsafe { kernel().procs.exit_current(status) }
}

pub fn sys_getpid() -> Result<usize, ()> {
    // SAFETY: myproc() is the current process.
    Ok(unsafe { (*myproc()).pid() } as usize)
}

pub fn sys_fork() -> Result<usize, ()> {
    unsafe { kernel().procs.fork() }.map(|pid| pid as usize)
}

pub fn sys_wait() -> Result<usize, ()> {
    let addr = argaddr(0);
    unsafe { kernel().procs.wait(addr.into()) }.map(|pid| pid as usize)
}

pub fn sys_sbrk() -> Result<usize, ()> {
    let n = argint(0);
    let p = myproc();
    // SAFETY: p is the current process.
    let addr = unsafe { (*p).deref_mut_data() }.memory_mut().size();
    growproc(n as isize)?;
    Ok(addr)
}

pub fn sys_sleep() -> Result<usize, ()> {
    let n = argint(0) as u32;
    let mut ticks = kernel().ticks.lock();
    let ticks0 = *ticks;
    while ticks.wrapping_sub(ticks0) < n {
        // SAFETY: myproc() is the current process.
        if unsafe { (*myproc()).killed() } {
            return Err(());
        }
        ticks.sleep();
    }
    Ok(0)
}

pub fn sys_kill() -> Result<usize, ()> {
    let pid = argint(0);
    kernel().procs.kill(pid).map(|_| 0)
}

/// Returns how many clock tick interrupts have occurred since start.
pub fn sys_uptime() -> Result<usize, ()> {
    Ok(*kernel().ticks.lock() as usize)
}
