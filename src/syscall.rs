//! System call argument fetch and dispatch.

use cstr_core::CStr;

use crate::{fs::Path, println, proc::myproc, sysfile, sysproc};

// System call numbers.
pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;

/// Fetches the nth system call argument as a raw register value.
fn argraw(n: usize) -> usize {
    let p = myproc();
    // SAFETY: p is the current process; the trapframe is private to it.
    let tf = unsafe { (*p).deref_data() }.trap_frame();
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw"),
    }
}

/// Fetches the nth system call argument as an integer.
pub fn argint(n: usize) -> i32 {
    argraw(n) as i32
}

/// Fetches the nth system call argument as an address. Doesn't check
/// legality, since copyin/copyout will do that.
pub fn argaddr(n: usize) -> usize {
    argraw(n)
}

/// Fetches a usize at user address `addr`.
pub fn fetchaddr(addr: usize) -> Result<usize, ()> {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    let mut value: usize = 0;
    data.memory_mut().copy_in(&mut value, addr.into())?;
    Ok(value)
}

/// Fetches the NUL-terminated string at user address `addr` into `buf`.
pub fn fetchstr<'a>(addr: usize, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    data.memory_mut().copy_in_str(buf, addr.into())?;
    let nul = buf.iter().position(|c| *c == 0).ok_or(())?;
    CStr::from_bytes_with_nul(&buf[..=nul]).map_err(|_| ())
}

/// Fetches the nth system call argument as a path.
pub fn argstr<'a>(n: usize, buf: &'a mut [u8]) -> Result<&'a Path, ()> {
    let cstr = fetchstr(argaddr(n), buf)?;
    Ok(Path::new(cstr))
}

/// Dispatches the system call the current process requested; its number
/// arrives in a7 and the return value leaves in a0, with every error
/// collapsed to -1.
pub unsafe fn syscall() {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    let num = data.trap_frame().a7;

    let ret = match num {
        SYS_FORK => sysproc::sys_fork(),
        SYS_EXIT => sysproc::sys_exit(),
        SYS_WAIT => sysproc::sys_wait(),
        SYS_PIPE => sysfile::sys_pipe(),
        SYS_READ => sysfile::sys_read(),
        SYS_KILL => sysproc::sys_kill(),
        SYS_EXEC => sysfile::sys_exec(),
        SYS_FSTAT => sysfile::sys_fstat(),
        SYS_CHDIR => sysfile::sys_chdir(),
        SYS_DUP => sysfile::sys_dup(),
        SYS_GETPID => sysproc::sys_getpid(),
        SYS_SBRK => sysproc::sys_sbrk(),
        SYS_SLEEP => sysproc::sys_sleep(),
        SYS_UPTIME => sysproc::sys_uptime(),
        SYS_OPEN => sysfile::sys_open(),
        SYS_WRITE => sysfile::sys_write(),
        SYS_MKNOD => sysfile::sys_mknod(),
        SYS_UNLINK => sysfile::sys_unlink(),
        SYS_LINK => sysfile::sys_link(),
        SYS_MKDIR => sysfile::sys_mkdir(),
        SYS_CLOSE => sysfile::sys_close(),
        _ => {
            let name_len = data
                .name
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(data.name.len());
            println!(
                "{} {}: unknown sys call {}",
                unsafe { (*p).pid() },
                core::str::from_utf8(&data.name[..name_len]).unwrap_or("???"),
                num
            );
            Err(())
        }
    };

    data.trap_frame_mut().a0 = match ret {
        Ok(value) => value,
        Err(()) => usize::MAX, // -1
    };
}
