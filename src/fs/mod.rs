//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /usr/rtm/xv6/fs.c for convenient naming.
//!
//! The (higher-level) system call implementations are in sysfile.rs.

use core::mem;

use spin::Once;

use crate::{
    kernel::kernel,
    param::BSIZE,
    sleepablelock::Sleepablelock,
};

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{Dinode, Dirent, InodeGuard, Itable, RcInode, DIRENT_SIZE, DIRSIZ};
pub use log::Log;
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEVICE, T_DIR, T_FILE};
pub use superblock::{Superblock, BPB, IPB};

/// Root i-number.
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// The file system: the superblock, read once at boot, and the write-ahead
/// log that guards every on-disk mutation.
pub struct FileSystem {
    superblock: Once<Superblock>,
    log: Once<Sleepablelock<Log>>,
}

impl FileSystem {
    pub const fn zero() -> Self {
        Self {
            superblock: Once::new(),
            log: Once::new(),
        }
    }

    /// Reads the superblock and initializes the log, replaying any
    /// committed transaction left behind by a crash. Runs in the context of
    /// the first process because log recovery sleeps on disk I/O.
    pub fn init(&self, dev: u32) {
        let sb = self.superblock.call_once(|| {
            let bp = kernel().bcache.bread(dev, 1);
            Superblock::new(&bp)
        });
        self.log.call_once(|| {
            Sleepablelock::new("LOG", Log::new(dev, sb.logstart, sb.nlog))
        });
    }

    /// The superblock; valid only after init().
    pub fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("fs used before init")
    }

    fn log(&self) -> &Sleepablelock<Log> {
        self.log.get().expect("fs used before init")
    }

    /// Marks the start of a file-system operation. The returned guard is
    /// the capability for every disk write; dropping it ends the operation
    /// and commits once no operation remains outstanding.
    pub fn begin_op(&self) -> FsTransaction<'_> {
        self.log().begin_op();
        FsTransaction { fs: self }
    }
}

/// A live slot in the current log transaction. Everything that mutates
/// disk blocks, allocates or frees them, or may drop the last reference to
/// an unlinked inode takes one of these, which proves the log scope is
/// open.
pub struct FsTransaction<'s> {
    fs: &'s FileSystem,
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        self.fs.log().end_op();
    }
}

impl FsTransaction<'_> {
    /// Sends a modified buffer into the log in place of a direct disk
    /// write; consuming the buffer releases it.
    pub fn write(&self, b: crate::bio::Buf) {
        self.fs.log().log_write(b);
    }

    /// Zeroes a block, through the log.
    fn bzero(&self, dev: u32, bno: u32) {
        let mut bp = kernel().bcache.bread(dev, bno);
        bp.data_mut().fill(0);
        self.write(bp);
    }

    /// Allocates a zeroed disk block; linear scan over the bitmap.
    pub fn balloc(&self, dev: u32) -> u32 {
        let sb = self.fs.superblock();
        let mut b = 0;
        while b < sb.size {
            let mut bp = kernel().bcache.bread(dev, sb.bblock(b));
            let mut bi = 0;
            while bi < BPB && b + bi < sb.size {
                let m = 1u8 << (bi % 8);
                if bp.data()[bi as usize / 8] & m == 0 {
                    // The block is free; claim it.
                    bp.data_mut()[bi as usize / 8] |= m;
                    self.write(bp);
                    self.bzero(dev, b + bi);
                    return b + bi;
                }
                bi += 1;
            }
            drop(bp);
            b += BPB;
        }
        panic!("balloc: out of blocks");
    }

    /// Frees a disk block.
    pub fn bfree(&self, dev: u32, b: u32) {
        let sb = self.fs.superblock();
        let mut bp = kernel().bcache.bread(dev, sb.bblock(b));
        let bi = (b % BPB) as usize;
        let m = 1u8 << (bi % 8);
        assert!(bp.data()[bi / 8] & m != 0, "freeing free block");
        bp.data_mut()[bi / 8] &= !m;
        self.write(bp);
    }
}
