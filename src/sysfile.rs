//! File-related system calls. Mostly argument checking, since the real
//! work happens in the file, inode, and pipe layers.

use arrayvec::ArrayVec;

use crate::{
    exec::exec,
    file::{FileType, RcFile},
    fs::{Dirent, FileName, FsTransaction, InodeGuard, Path, RcInode, T_DEVICE, T_DIR, T_FILE},
    kernel::kernel,
    page::Page,
    param::{MAXARG, MAXPATH, NDEV, NOFILE},
    pipe::AllocatedPipe,
    proc::myproc,
    syscall::{argaddr, argint, argstr, fetchaddr},
};

pub const O_RDONLY: i32 = 0;
pub const O_WRONLY: i32 = 0x1;
pub const O_RDWR: i32 = 0x2;
pub const O_CREATE: i32 = 0x200;
pub const O_TRUNC: i32 = 0x400;

/// Fetches the nth word-sized system call argument as a file descriptor
/// and returns the corresponding open file.
fn argfd(n: usize) -> Result<(usize, &'static RcFile), ()> {
    let fd = argint(n);
    if fd < 0 || fd as usize >= NOFILE {
        return Err(());
    }
    let p = myproc();
    // SAFETY: p is the current process; its fd table only changes from
    // its own syscalls, and we hand out a borrow no longer-lived than the
    // trap that asked.
    let data = unsafe { (*p).deref_mut_data() };
    let file = data.open_files[fd as usize].as_ref().ok_or(())?;
    // SAFETY: the slot outlives this syscall; see above.
    let file = unsafe { &*(file as *const RcFile) };
    Ok((fd as usize, file))
}

/// Installs an open file in the current process's table.
/// Hands the file back when every slot is taken.
fn fdalloc(f: RcFile) -> Result<usize, RcFile> {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    for (fd, slot) in data.open_files.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(f);
            return Ok(fd);
        }
    }
    Err(f)
}

pub fn sys_dup() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    match fdalloc(f.dup()) {
        Ok(fd) => Ok(fd),
        Err(f) => {
            f.close();
            Err(())
        }
    }
}

pub fn sys_read() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let addr = argaddr(1);
    let n = argint(2);
    f.read(addr, n)
}

pub fn sys_write() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let addr = argaddr(1);
    let n = argint(2);
    f.write(addr, n)
}

pub fn sys_close() -> Result<usize, ()> {
    let (fd, _) = argfd(0)?;
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    data.open_files[fd].take().unwrap().close();
    Ok(0)
}

pub fn sys_fstat() -> Result<usize, ()> {
    let (_, f) = argfd(0)?;
    let addr = argaddr(1);
    f.stat(addr).map(|_| 0)
}

/// Creates the path `new` as a link to the same inode as `old`.
pub fn sys_link() -> Result<usize, ()> {
    let mut old_buf = [0u8; MAXPATH];
    let mut new_buf = [0u8; MAXPATH];
    let old = argstr(0, &mut old_buf)?;
    let new = argstr(1, &mut new_buf)?;

    let tx = kernel().fs.begin_op();
    let ip = kernel().itable.namei(old, &tx)?;

    let mut guard = ip.lock();
    if guard.typ == T_DIR {
        drop(guard);
        ip.put(&tx);
        return Err(());
    }
    guard.nlink += 1;
    guard.update(&tx);
    drop(guard);

    let linked = (|| -> Result<(), ()> {
        let (dp, name) = kernel().itable.nameiparent(new, &tx)?;
        let mut dguard = dp.lock();
        if dguard.dev() != ip.dev() || dguard.dirlink(name, ip.inum(), &tx).is_err() {
            drop(dguard);
            dp.put(&tx);
            return Err(());
        }
        drop(dguard);
        dp.put(&tx);
        Ok(())
    })();

    match linked {
        Ok(()) => {
            ip.put(&tx);
            Ok(0)
        }
        Err(()) => {
            let mut guard = ip.lock();
            guard.nlink -= 1;
            guard.update(&tx);
            drop(guard);
            ip.put(&tx);
            Err(())
        }
    }
}

pub fn sys_unlink() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;

    let tx = kernel().fs.begin_op();
    let (dp, name) = kernel().itable.nameiparent(path, &tx)?;
    let mut dguard = dp.lock();

    let unlinked = (|| -> Result<(), ()> {
        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(());
        }

        let (ip, off) = dguard.dirlookup(name)?;
        let mut guard = ip.lock();
        assert!(guard.nlink >= 1, "unlink: nlink < 1");

        if guard.typ == T_DIR && !guard.is_dir_empty() {
            drop(guard);
            ip.put(&tx);
            return Err(());
        }

        // Erase the directory entry.
        let de = Dirent::default();
        dguard.write_kernel(&de, off, &tx).expect("unlink: write");
        if guard.typ == T_DIR {
            // The victim's ".." no longer references the parent.
            dguard.nlink -= 1;
            dguard.update(&tx);
        }

        guard.nlink -= 1;
        guard.update(&tx);
        drop(guard);
        ip.put(&tx);
        Ok(())
    })();

    drop(dguard);
    dp.put(&tx);
    unlinked.map(|_| 0)
}

/// Creates a new inode bound at `path`, returning it referenced and
/// locked. For T_FILE, an existing file of the same name is returned
/// instead of a fresh inode.
fn create(
    path: &Path,
    typ: i16,
    major: i16,
    minor: i16,
    tx: &FsTransaction<'_>,
) -> Result<(RcInode, InodeGuard<'static>), ()> {
    let (dp, name) = kernel().itable.nameiparent(path, tx)?;
    let mut dguard = dp.lock();

    if let Ok((ip, _)) = dguard.dirlookup(name) {
        drop(dguard);
        dp.put(tx);
        let guard = ip.lock();
        if typ == T_FILE && (guard.typ == T_FILE || guard.typ == T_DEVICE) {
            return Ok((ip, guard));
        }
        drop(guard);
        ip.put(tx);
        return Err(());
    }

    let ip = kernel().itable.alloc_inode(dp.dev(), typ, tx);
    let mut guard = ip.lock();
    guard.major = major;
    guard.minor = minor;
    guard.nlink = 1;
    guard.update(tx);

    let entered = (|| -> Result<(), ()> {
        if typ == T_DIR {
            // Create "." and "..". No nlink++ for ".": that would be a
            // cyclic reference count.
            // SAFETY: the literals contain no NUL.
            let dot = unsafe { FileName::from_bytes(b".") };
            let dotdot = unsafe { FileName::from_bytes(b"..") };
            guard.dirlink(dot, ip.inum(), tx)?;
            guard.dirlink(dotdot, dp.inum(), tx)?;
        }
        dguard.dirlink(name, ip.inum(), tx)?;
        if typ == T_DIR {
            // Success; the new directory's ".." references dp.
            dguard.nlink += 1;
            dguard.update(tx);
        }
        Ok(())
    })();

    drop(dguard);
    dp.put(tx);

    match entered {
        Ok(()) => Ok((ip, guard)),
        Err(()) => {
            // Deallocate: clearing nlink makes put() free the inode.
            guard.nlink = 0;
            guard.update(tx);
            drop(guard);
            ip.put(tx);
            Err(())
        }
    }
}

pub fn sys_open() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;
    let omode = argint(1);

    let tx = kernel().fs.begin_op();

    let (ip, mut guard) = if omode & O_CREATE != 0 {
        create(path, T_FILE, 0, 0, &tx)?
    } else {
        let ip = kernel().itable.namei(path, &tx)?;
        let guard = ip.lock();
        if guard.typ == T_DIR && omode != O_RDONLY {
            drop(guard);
            ip.put(&tx);
            return Err(());
        }
        (ip, guard)
    };

    if guard.typ == T_DEVICE && (guard.major < 0 || guard.major as usize >= NDEV) {
        drop(guard);
        ip.put(&tx);
        return Err(());
    }

    let readable = omode & O_WRONLY == 0;
    let writable = omode & O_WRONLY != 0 || omode & O_RDWR != 0;
    let typ = if guard.typ == T_DEVICE {
        FileType::Device {
            major: guard.major as u16,
            ip,
        }
    } else {
        FileType::Inode {
            ip,
            off: core::cell::UnsafeCell::new(0),
        }
    };

    let f = match kernel().ftable.alloc(typ, readable, writable) {
        Ok(f) => f,
        Err(typ) => {
            drop(guard);
            match typ {
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => ip.put(&tx),
                _ => (),
            }
            return Err(());
        }
    };

    if omode & O_TRUNC != 0 && guard.typ == T_FILE {
        guard.itrunc(&tx);
    }
    drop(guard);
    drop(tx);

    match fdalloc(f) {
        Ok(fd) => Ok(fd),
        Err(f) => {
            f.close();
            Err(())
        }
    }
}

pub fn sys_mkdir() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;

    let tx = kernel().fs.begin_op();
    let (ip, guard) = create(path, T_DIR, 0, 0, &tx)?;
    drop(guard);
    ip.put(&tx);
    Ok(0)
}

pub fn sys_mknod() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;
    let major = argint(1) as i16;
    let minor = argint(2) as i16;

    let tx = kernel().fs.begin_op();
    let (ip, guard) = create(path, T_DEVICE, major, minor, &tx)?;
    drop(guard);
    ip.put(&tx);
    Ok(0)
}

pub fn sys_chdir() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;

    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    let tx = kernel().fs.begin_op();
    let ip = kernel().itable.namei(path, &tx)?;
    let guard = ip.lock();
    if guard.typ != T_DIR {
        drop(guard);
        ip.put(&tx);
        return Err(());
    }
    drop(guard);

    let old = data.cwd.replace(ip).unwrap();
    old.put(&tx);
    Ok(0)
}

pub fn sys_exec() -> Result<usize, ()> {
    let mut path_buf = [0u8; MAXPATH];
    let path = argstr(0, &mut path_buf)?;
    let uargv = argaddr(1);

    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    // Gather the argument strings, one kernel page each.
    let mut args = ArrayVec::<Page, MAXARG>::new();
    let result = (|| -> Result<usize, ()> {
        loop {
            let i = args.len();
            if i >= MAXARG {
                return Err(());
            }
            let uarg = fetchaddr(uargv + core::mem::size_of::<usize>() * i)?;
            if uarg == 0 {
                break;
            }

            let mut page = kernel().alloc().ok_or(())?;
            if data
                .memory_mut()
                .copy_in_str(&mut page[..], uarg.into())
                .is_err()
            {
                kernel().free(page);
                return Err(());
            }
            args.push(page);
        }
        exec(path, &args)
    })();

    while let Some(page) = args.pop() {
        kernel().free(page);
    }
    result
}

pub fn sys_pipe() -> Result<usize, ()> {
    // User pointer to an array of two integers.
    let fdarray = argaddr(0);

    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    let (rf, wf) = AllocatedPipe::alloc()?;

    let fd0 = match fdalloc(rf) {
        Ok(fd) => fd,
        Err(rf) => {
            rf.close();
            wf.close();
            return Err(());
        }
    };
    let fd1 = match fdalloc(wf) {
        Ok(fd) => fd,
        Err(wf) => {
            data.open_files[fd0].take().unwrap().close();
            wf.close();
            return Err(());
        }
    };

    let memory = data.memory_mut();
    if memory.copy_out(fdarray.into(), &(fd0 as i32)).is_err()
        || memory
            .copy_out(
                (fdarray + core::mem::size_of::<i32>()).into(),
                &(fd1 as i32),
            )
            .is_err()
    {
        data.open_files[fd0].take().unwrap().close();
        data.open_files[fd1].take().unwrap().close();
        return Err(());
    }
    Ok(0)
}
