//! exec(): replace the current image with a program loaded from disk.

use core::cmp;
use core::mem;

use itertools::izip;

use crate::{
    elf::{ElfHdr, ProgHdr, ELF_PROG_FLAG_EXEC, ELF_PROG_FLAG_WRITE},
    fs::{InodeGuard, Path},
    kernel::kernel,
    page::Page,
    param::{MAXARG, MAXPROCNAME},
    proc::{myproc, TrapFrame},
    riscv::{pgroundup, PteFlags, PGSIZE},
    vm::{PAddr, UserMemory},
};

/// Loads the program at `path` over the current process. `args` holds the
/// NUL-terminated argument strings, one per page. On success, returns
/// argc, which lands in a0 so user main receives (argc, argv). Only the
/// trapframe changes on failure.
pub fn exec(path: &Path, args: &[Page]) -> Result<usize, ()> {
    if args.len() > MAXARG {
        return Err(());
    }

    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };

    // Read the image while holding the inode; exec reads inode data, so
    // it runs inside a transaction.
    let tx = kernel().fs.begin_op();
    let ptr = kernel().itable.namei(path, &tx)?;
    let mut ip = ptr.lock();

    let trap_frame: PAddr = (data.trap_frame() as *const TrapFrame as usize).into();
    let loaded = load_image(&mut ip, trap_frame);
    drop(ip);
    ptr.put(&tx);
    drop(tx);
    let (mut mem, entry) = loaded?;

    // Allocate two pages at the next page boundary: the lower becomes the
    // stack guard, the upper the user stack.
    let sz = pgroundup(mem.size());
    let sz = mem.alloc(sz + 2 * PGSIZE, PteFlags::W)?;
    mem.clear_user((sz - 2 * PGSIZE).into());
    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    // Push argument strings, remembering their addresses in ustack.
    let mut ustack = [0usize; MAXARG + 1];
    for (arg, slot) in izip!(args, &mut ustack) {
        let nul = arg
            .iter()
            .position(|c| *c == 0)
            .expect("exec: argument not NUL-terminated");
        let bytes = &arg[..nul + 1];
        sp -= bytes.len();
        // The riscv sp must be 16-byte aligned.
        sp &= !0xf;
        if sp < stackbase {
            return Err(());
        }
        mem.copy_out_bytes(sp.into(), bytes)?;
        *slot = sp;
    }
    let argc = args.len();
    ustack[argc] = 0;

    // Push the array of argv[] pointers.
    let argv_size = (argc + 1) * mem::size_of::<usize>();
    sp -= argv_size;
    sp &= !0xf;
    if sp < stackbase {
        return Err(());
    }
    // SAFETY: any byte pattern is a valid u8.
    let (_, ustack_bytes, _) = unsafe { ustack.align_to::<u8>() };
    mem.copy_out_bytes(sp.into(), &ustack_bytes[..argv_size])?;

    // Save the program name for debugging.
    let path_bytes = path.as_bytes();
    let name = path_bytes
        .rsplit(|c| *c == b'/')
        .next()
        .unwrap_or(path_bytes);
    let len = cmp::min(MAXPROCNAME - 1, name.len());
    data.name[..len].copy_from_slice(&name[..len]);
    data.name[len] = 0;

    // Commit to the new image; dropping the old one frees it.
    let tf = data.trap_frame_mut();
    tf.a1 = sp; // argv for user main(argc, argv)
    tf.epc = entry; // initial program counter = main
    tf.sp = sp; // initial stack pointer
    data.memory = Some(mem);

    Ok(argc)
}

/// Builds a fresh address space holding the ELF image. Failures free
/// whatever was built so far when the UserMemory drops.
fn load_image(ip: &mut InodeGuard<'_>, trap_frame: PAddr) -> Result<(UserMemory, usize), ()> {
    // Check the ELF header.
    let mut elf = ElfHdr::default();
    ip.read_kernel(&mut elf, 0)?;
    if !elf.is_valid() {
        return Err(());
    }

    let mut mem = UserMemory::new(trap_frame, None).ok_or(())?;

    // Load each program segment.
    for i in 0..elf.phnum as usize {
        let off = elf.phoff + i * mem::size_of::<ProgHdr>();

        let mut ph = ProgHdr::default();
        ip.read_kernel(&mut ph, off as u32)?;
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(());
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return Err(());
        }
        if ph.vaddr % PGSIZE != 0 {
            return Err(());
        }
        // Segments must come in ascending order; an overlap would load
        // over an earlier one.
        if ph.vaddr < mem.size() {
            return Err(());
        }

        let _ = mem.alloc(ph.vaddr + ph.memsz, segment_perm(ph.flags))?;
        mem.load_file(ph.vaddr.into(), ip, ph.off as u32, ph.filesz as u32)?;
    }

    Ok((mem, elf.entry))
}

/// Extra page permissions for one ELF segment; R|U is implied.
fn segment_perm(flags: u32) -> PteFlags {
    let mut perm = PteFlags::empty();
    if flags & ELF_PROG_FLAG_EXEC != 0 {
        perm |= PteFlags::X;
    }
    if flags & ELF_PROG_FLAG_WRITE != 0 {
        perm |= PteFlags::W;
    }
    perm
}
