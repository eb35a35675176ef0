//! Open files and the system-wide file table.

use core::cell::UnsafeCell;
use core::cmp;

use array_macro::array;

use crate::{
    fs::{RcInode, Stat},
    kernel::kernel,
    param::{BSIZE, MAXOPBLOCKS, NFILE},
    pipe::AllocatedPipe,
    proc::myproc,
    spinlock::RawSpinlock,
};

pub enum FileType {
    None,
    Pipe {
        pipe: AllocatedPipe,
    },
    Inode {
        ip: RcInode,
        /// The read/write offset. Only mutated under the inode's sleep
        /// lock, so no extra lock is needed.
        off: UnsafeCell<u32>,
    },
    Device {
        ip: RcInode,
        major: u16,
    },
}

/// An open file. `typ`, `readable`, and `writable` never change between
/// alloc and the final close.
pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    const fn none() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }
}

/// Maps a major device number to device read/write functions.
/// `user` tells whether the address is a user or kernel one.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(user: bool, addr: usize, n: i32) -> i32>,
    pub write: Option<fn(user: bool, addr: usize, n: i32) -> i32>,
}

/// Console major device number.
pub const CONSOLE: usize = 1;

struct FileSlot {
    /// Guarded by the table lock.
    nref: UnsafeCell<i32>,
    /// Written only while unreferenced; immutable while nref > 0 (apart
    /// from the inner offset cell).
    file: UnsafeCell<File>,
}

pub struct FileTable {
    lock: RawSpinlock,
    pool: [FileSlot; NFILE],
}

// Slots are guarded by the table lock as described above.
unsafe impl Sync for FileTable {}

impl FileTable {
    pub const fn zero() -> Self {
        Self {
            lock: RawSpinlock::new("ftable"),
            pool: array![_ => FileSlot {
                nref: UnsafeCell::new(0),
                file: UnsafeCell::new(File::none()),
            }; NFILE],
        }
    }

    /// Allocates a file structure. When the table is full, hands the file
    /// type back so the caller can release what it refers to.
    pub fn alloc(
        &'static self,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Result<RcFile, FileType> {
        self.lock.acquire();
        for slot in &self.pool {
            // SAFETY: the table lock is held.
            let nref = unsafe { &mut *slot.nref.get() };
            if *nref == 0 {
                *nref = 1;
                // SAFETY: the slot was unreferenced, so nothing reads it.
                unsafe {
                    *slot.file.get() = File {
                        typ,
                        readable,
                        writable,
                    }
                };
                self.lock.release();
                return Ok(RcFile { slot });
            }
        }
        self.lock.release();
        Err(typ)
    }
}

/// A counted reference to an open file. Closed explicitly with close();
/// the last close releases whatever the file refers to.
pub struct RcFile {
    slot: &'static FileSlot,
}

impl RcFile {
    fn file(&self) -> &File {
        // SAFETY: immutable while referenced; see FileSlot.
        unsafe { &*self.slot.file.get() }
    }

    /// Increments the reference count and hands out another handle.
    pub fn dup(&self) -> RcFile {
        let ftable = &kernel().ftable;
        ftable.lock.acquire();
        // SAFETY: the table lock is held.
        unsafe { *self.slot.nref.get() += 1 };
        ftable.lock.release();
        RcFile { slot: self.slot }
    }

    /// Drops this handle; the last one closes the file.
    pub fn close(self) {
        let ftable = &kernel().ftable;
        ftable.lock.acquire();
        // SAFETY: the table lock is held.
        let nref = unsafe { &mut *self.slot.nref.get() };
        *nref -= 1;
        if *nref > 0 {
            ftable.lock.release();
            return;
        }

        // Last reference; pull the file out and release it with no lock
        // held, since releasing may sleep.
        // SAFETY: nref just reached 0, so this handle was the only viewer.
        let file = unsafe { core::mem::replace(&mut *self.slot.file.get(), File::none()) };
        ftable.lock.release();

        match file.typ {
            FileType::Pipe { pipe } => pipe.close(file.writable),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                // put() may free the inode on disk.
                let tx = kernel().fs.begin_op();
                ip.put(&tx);
            }
            FileType::None => (),
        }
    }

    /// Gets metadata about the file; `addr` is a user virtual address
    /// pointing to a struct stat.
    pub fn stat(&self, addr: usize) -> Result<(), ()> {
        let p = myproc();

        match &self.file().typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let st: Stat = ip.lock().stat();
                // SAFETY: p is the current process.
                let data = unsafe { (*p).deref_mut_data() };
                data.memory_mut().copy_out(addr.into(), &st)
            }
            _ => Err(()),
        }
    }

    /// Reads from the file; `addr` is a user virtual address.
    pub fn read(&self, addr: usize, n: i32) -> Result<usize, ()> {
        if !self.file().readable {
            return Err(());
        }

        match &self.file().typ {
            FileType::Pipe { pipe } => pipe.read(addr, n as usize),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock();
                // SAFETY: the offset cell is only touched under the
                // inode's sleep lock, which we hold.
                let cur = unsafe { *off.get() };
                let r = guard.readi(true, addr, cur, n as u32)?;
                unsafe { *off.get() = cur + r as u32 };
                Ok(r)
            }
            FileType::Device { major, .. } => {
                let read = kernel()
                    .devsw
                    .get(*major as usize)
                    .and_then(|dev| dev.read)
                    .ok_or(())?;
                let r = read(true, addr, n);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as usize)
                }
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Writes to the file; `addr` is a user virtual address.
    pub fn write(&self, addr: usize, n: i32) -> Result<usize, ()> {
        if !self.file().writable {
            return Err(());
        }

        match &self.file().typ {
            FileType::Pipe { pipe } => pipe.write(addr, n as usize),
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including inode, indirect
                // block, allocation blocks, and 2 blocks of slop for
                // non-aligned writes. This really belongs lower down,
                // since writei() might be writing a device like the
                // console.
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let n = n as usize;
                let mut written = 0;
                while written < n {
                    let chunk = cmp::min(n - written, max);
                    let tx = kernel().fs.begin_op();
                    let mut guard = ip.lock();
                    // SAFETY: offset cell under the inode sleep lock.
                    let cur = unsafe { *off.get() };
                    let r = guard.writei(true, addr + written, cur, chunk as u32, &tx)?;
                    unsafe { *off.get() = cur + r as u32 };
                    if r != chunk {
                        // writei reported a short copy.
                        return Err(());
                    }
                    written += chunk;
                }
                Ok(n)
            }
            FileType::Device { major, .. } => {
                let write = kernel()
                    .devsw
                    .get(*major as usize)
                    .and_then(|dev| dev.write)
                    .ok_or(())?;
                let r = write(true, addr, n);
                if r < 0 {
                    Err(())
                } else {
                    Ok(r as usize)
                }
            }
            FileType::None => panic!("File::write"),
        }
    }
}
