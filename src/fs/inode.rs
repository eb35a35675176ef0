//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links
//! referring to it, and the list of blocks holding the file's content.
//!
//! The inodes are laid out sequentially on disk at sb.inodestart. Each
//! inode has a number, indicating its position on the disk.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple processes. The
//! in-memory inodes include book-keeping information that is not stored on
//! disk: nref and valid.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file system code.
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   Itable::alloc_inode() allocates, and RcInode::put() frees if the
//!   reference and link counts have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is free if nref is
//!   zero. Otherwise nref tracks the number of in-memory handles to the
//!   entry (open files and current directories). Itable::get() finds or
//!   creates a table entry and increments its nref; RcInode::put()
//!   decrements it.
//!
//! * Valid: the information (type, size, &c) in a table entry is only
//!   correct when valid is true. RcInode::lock() reads the inode from the
//!   disk and sets valid, while RcInode::put() clears valid if nref has
//!   fallen to zero.
//!
//! * Locked: file system code may only examine and modify the information
//!   in an inode and its content if it has first locked the inode.
//!
//! Thus a typical sequence is:
//!   let ip = kernel().itable.get(dev, inum);
//!   let mut guard = ip.lock();
//!   ... examine and modify through the guard ...
//!   drop(guard);
//!   ip.put(&tx);
//!
//! lock() is separate from get() so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g., in read()). The separation also helps avoid
//! deadlock and races during pathname lookup.
//!
//! The table's spinlock protects nref, dev, and inum. An inode's sleep
//! lock protects all the other fields. Holding both is never required at
//! once.

use core::cell::UnsafeCell;
use core::mem::{self, ManuallyDrop};
use core::ops::{Deref, DerefMut};

use array_macro::array;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::{FileName, FsTransaction, Path, Stat, IPB, MAXFILE, NDIRECT, NINDIRECT, ROOTINO};
use crate::{
    bio::BufData,
    kernel::kernel,
    param::{BSIZE, NINODE, ROOTDEV},
    proc::{either_copy_in, either_copy_out, myproc},
    sleeplock::{Sleeplock, SleeplockGuard},
    spinlock::RawSpinlock,
};

/// Directory entry name length.
pub const DIRSIZ: usize = 14;

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// On-disk inode structure.
// repr(C): on-disk representation.
#[derive(Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dinode {
    /// File type; 0 marks a free slot.
    pub typ: i16,

    /// Major device number (T_DEVICE only).
    pub major: i16,

    /// Minor device number (T_DEVICE only).
    pub minor: i16,

    /// Number of links to inode in file system.
    pub nlink: i16,

    /// Size of file (bytes).
    pub size: u32,

    /// Data block addresses; the last is the indirect block.
    pub addrs: [u32; NDIRECT + 1],
}

const_assert!(IPB <= mem::size_of::<BufData>() / mem::size_of::<Dinode>());
const_assert!(mem::align_of::<BufData>() % mem::align_of::<Dinode>() == 0);

/// A directory is a file containing a sequence of these.
#[derive(Default, Copy, Clone, AsBytes, FromBytes)]
#[repr(C)]
pub struct Dirent {
    /// Referenced inode number; 0 marks a free slot.
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl Dirent {
    /// Fills in the name. If it is shorter than DIRSIZ, a NUL terminator
    /// is appended.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the stored name without the padding.
    fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        // SAFETY: name[..len] contains no NUL and len <= DIRSIZ.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// Fields identifying a table slot; guarded by the table spinlock.
struct InodeMeta {
    dev: u32,
    inum: u32,
    nref: i32,
}

/// Copy of the disk inode plus the valid flag; guarded by the sleep lock.
pub struct InodeInner {
    /// Has the inode been read from disk?
    pub valid: bool,
    pub typ: i16,
    pub major: i16,
    pub minor: i16,
    pub nlink: i16,
    pub size: u32,
    pub addrs: [u32; NDIRECT + 1],
}

/// One in-memory inode slot.
pub struct Inode {
    meta: UnsafeCell<InodeMeta>,
    inner: Sleeplock<InodeInner>,
}

// meta is guarded by the table lock, inner by its sleep lock.
unsafe impl Sync for Inode {}

impl Inode {
    const fn zero() -> Self {
        Self {
            meta: UnsafeCell::new(InodeMeta {
                dev: 0,
                inum: 0,
                nref: 0,
            }),
            inner: Sleeplock::new(
                "inode",
                InodeInner {
                    valid: false,
                    typ: 0,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 1],
                },
            ),
        }
    }

    /// Device number. Immutable while the slot is referenced, so no lock
    /// is needed.
    pub fn dev(&self) -> u32 {
        unsafe { (*self.meta.get()).dev }
    }

    /// Inode number, same reasoning as dev().
    pub fn inum(&self) -> u32 {
        unsafe { (*self.meta.get()).inum }
    }
}

/// A referenced handle to an in-memory inode. The reference is released
/// explicitly with put(), which needs a transaction because dropping the
/// last reference to an unlinked inode frees it on disk.
pub struct RcInode {
    ptr: &'static Inode,
}

impl Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        self.ptr
    }
}

impl RcInode {
    /// Increments the reference count and returns a second handle.
    pub fn dup(&self) -> RcInode {
        let itable = &kernel().itable;
        itable.lock.acquire();
        // SAFETY: the table lock is held.
        unsafe { (*self.ptr.meta.get()).nref += 1 };
        itable.lock.release();
        RcInode { ptr: self.ptr }
    }

    /// Locks the inode, reading it from disk if necessary. The guard
    /// borrows the table slot, not this handle, so the handle may move
    /// while the lock is held.
    pub fn lock(&self) -> InodeGuard<'static> {
        let mut guard = self.ptr.inner.lock();
        if !guard.valid {
            let bp = kernel()
                .bcache
                .bread(self.dev(), kernel().fs.superblock().iblock(self.inum()));
            // SAFETY: BufData is aligned for Dinode and IPB of them fit.
            let dip = unsafe {
                &*(bp.data().as_ptr() as *const Dinode).add(self.inum() as usize % IPB)
            };
            guard.typ = dip.typ;
            guard.major = dip.major;
            guard.minor = dip.minor;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs.copy_from_slice(&dip.addrs);
            drop(bp);
            guard.valid = true;
            assert!(guard.typ != 0, "ilock: no type");
        }
        InodeGuard {
            ip: self.ptr,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Drops this reference. If that was the last reference and the inode
    /// has no links, the inode and its content are freed on disk, which is
    /// why a live transaction is required.
    pub fn put(self, tx: &FsTransaction<'_>) {
        let itable = &kernel().itable;
        itable.lock.acquire();

        // SAFETY: the table lock is held.
        let truncate = {
            let meta = unsafe { &*self.ptr.meta.get() };
            // nref == 1 means no one else holds the sleep lock, so reading
            // valid and nlink through it cannot race.
            let inner = unsafe { &*self.ptr.inner.get_mut_raw() };
            meta.nref == 1 && inner.valid && inner.nlink == 0
        };

        if truncate {
            // The sleep lock below cannot block: nref == 1 means no other
            // process has the inode locked or can get it.
            itable.lock.release();

            let mut guard = InodeGuard {
                ip: self.ptr,
                guard: ManuallyDrop::new(self.ptr.inner.lock()),
            };
            guard.itrunc(tx);
            guard.typ = 0;
            guard.update(tx);
            guard.valid = false;
            drop(guard);

            itable.lock.acquire();
        }

        // SAFETY: the table lock is held.
        unsafe { (*self.ptr.meta.get()).nref -= 1 };
        itable.lock.release();
    }
}

/// A locked inode; dereferences to the disk-resident fields.
pub struct InodeGuard<'a> {
    ip: &'a Inode,
    guard: ManuallyDrop<SleeplockGuard<'a, InodeInner>>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: self is going away; the sleep lock is released once.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
    }
}

impl InodeGuard<'_> {
    pub fn dev(&self) -> u32 {
        self.ip.dev()
    }

    pub fn inum(&self) -> u32 {
        self.ip.inum()
    }

    /// Copies a modified in-memory inode to disk. Must be called after
    /// every change to a field that lives on disk.
    pub fn update(&self, tx: &FsTransaction<'_>) {
        let mut bp = kernel()
            .bcache
            .bread(self.dev(), kernel().fs.superblock().iblock(self.inum()));
        // SAFETY: alignment and capacity per the asserts at Dinode.
        let dip = unsafe {
            &mut *(bp.data_mut().as_mut_ptr() as *mut Dinode).add(self.inum() as usize % IPB)
        };
        dip.typ = self.typ;
        dip.major = self.major;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs.copy_from_slice(&self.addrs);
        tx.write(bp);
    }

    /// Returns the disk block hosting the `bn`th block of this file.
    /// Panics if it does not exist; the write paths that may need to grow
    /// the file use bmap_or_alloc.
    fn bmap(&mut self, bn: usize) -> u32 {
        self.bmap_internal(bn, None)
    }

    fn bmap_or_alloc(&mut self, bn: usize, tx: &FsTransaction<'_>) -> u32 {
        self.bmap_internal(bn, Some(tx))
    }

    /// Inode content.
    ///
    /// The content (data) associated with each inode is stored in blocks
    /// on the disk. The first NDIRECT block numbers are listed directly;
    /// the next NINDIRECT live in the block named by the last address
    /// slot, which is allocated lazily.
    fn bmap_internal(&mut self, bn: usize, tx: Option<&FsTransaction<'_>>) -> u32 {
        let dev = self.dev();
        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = tx.expect("bmap: read found a hole").balloc(dev);
                self.addrs[bn] = addr;
            }
            addr
        } else {
            let bn = bn - NDIRECT;
            assert!(bn < NINDIRECT, "bmap: out of range");

            // Load the indirect block, allocating if necessary.
            let mut indirect = self.addrs[NDIRECT];
            if indirect == 0 {
                indirect = tx.expect("bmap: read found a hole").balloc(dev);
                self.addrs[NDIRECT] = indirect;
            }

            let mut bp = kernel().bcache.bread(dev, indirect);
            // SAFETY: BufData is aligned for u32.
            let slots = unsafe {
                core::slice::from_raw_parts_mut(
                    bp.data_mut().as_mut_ptr() as *mut u32,
                    NINDIRECT,
                )
            };
            let mut addr = slots[bn];
            if addr == 0 {
                let tx = tx.expect("bmap: read found a hole");
                addr = tx.balloc(dev);
                slots[bn] = addr;
                tx.write(bp);
            }
            addr
        }
    }

    /// Truncates the inode (discards contents).
    pub fn itrunc(&mut self, tx: &FsTransaction<'_>) {
        let dev = self.dev();
        for bn in 0..NDIRECT {
            if self.addrs[bn] != 0 {
                tx.bfree(dev, self.addrs[bn]);
                self.addrs[bn] = 0;
            }
        }

        if self.addrs[NDIRECT] != 0 {
            let bp = kernel().bcache.bread(dev, self.addrs[NDIRECT]);
            // SAFETY: BufData is aligned for u32.
            let slots = unsafe {
                core::slice::from_raw_parts(bp.data().as_ptr() as *const u32, NINDIRECT)
            };
            for addr in slots {
                if *addr != 0 {
                    tx.bfree(dev, *addr);
                }
            }
            drop(bp);
            tx.bfree(dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update(tx);
    }

    /// Reads data from the inode into a user or kernel destination.
    /// Returns the number of bytes read, clipped to the file size.
    pub fn readi(
        &mut self,
        user_dst: bool,
        dst: usize,
        mut off: u32,
        mut n: u32,
    ) -> Result<usize, ()> {
        if off > self.size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > self.size {
            n = self.size - off;
        }

        let mut tot: u32 = 0;
        while tot < n {
            let bp = kernel()
                .bcache
                .bread(self.dev(), self.bmap(off as usize / BSIZE));
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let res = either_copy_out(
                user_dst,
                dst + tot as usize,
                &bp.data()[begin..begin + m as usize],
            );
            drop(bp);
            res?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Writes data to the inode from a user or kernel source, extending
    /// the file if needed. Returns the number of bytes written; less than
    /// `n` only if a copy failed along the way.
    pub fn writei(
        &mut self,
        user_src: bool,
        src: usize,
        mut off: u32,
        n: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<usize, ()> {
        if off > self.size || off.wrapping_add(n) < off {
            return Err(());
        }
        if (off + n) as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot: u32 = 0;
        while tot < n {
            let mut bp = kernel()
                .bcache
                .bread(self.dev(), self.bmap_or_alloc(off as usize / BSIZE, tx));
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            if either_copy_in(
                &mut bp.data_mut()[begin..begin + m as usize],
                user_src,
                src + tot as usize,
            )
            .is_err()
            {
                drop(bp);
                break;
            }
            tx.write(bp);
            tot += m;
            off += m;
        }

        if off > self.size {
            self.size = off;
        }

        // Write the inode back even if the size didn't change, because the
        // loop above may have called bmap_or_alloc and added a new block
        // to addrs.
        self.update(tx);
        Ok(tot as usize)
    }

    /// Reads one typed record at `off`; fails unless it is fully present.
    pub fn read_kernel<T: AsBytes + FromBytes>(&mut self, dst: &mut T, off: u32) -> Result<(), ()> {
        let n = self.read_bytes_kernel(dst.as_bytes_mut(), off);
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Reads into a kernel buffer; returns the number of bytes read.
    pub fn read_bytes_kernel(&mut self, dst: &mut [u8], off: u32) -> usize {
        self.readi(false, dst.as_mut_ptr() as usize, off, dst.len() as u32)
            .expect("read_bytes_kernel")
    }

    /// Writes one typed record at `off`; fails unless fully written.
    pub fn write_kernel<T: AsBytes>(
        &mut self,
        src: &T,
        off: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        let n = self.writei(
            false,
            src.as_bytes().as_ptr() as usize,
            off,
            mem::size_of::<T>() as u32,
            tx,
        )?;
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Copies stat information from the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev() as i32,
            ino: self.inum(),
            typ: self.typ,
            nlink: self.nlink,
            _pad: 0,
            size: self.size as u64,
        }
    }

    // Directories.

    /// Looks for a directory entry with the given name. On a match,
    /// returns a referenced inode for it and the entry's byte offset.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.typ, super::T_DIR, "dirlookup not DIR");

        let mut de = Dirent::default();
        for off in (0..self.size).step_by(DIRENT_SIZE) {
            self.read_kernel(&mut de, off).expect("dirlookup read");
            if de.inum != 0 && de.get_name() == name {
                // Entry matches path element.
                return Ok((kernel().itable.get(self.dev(), de.inum as u32), off));
            }
        }
        Err(())
    }

    /// Writes a new directory entry (name, inum) into this directory.
    /// Refuses duplicates; reuses the first free slot or appends.
    pub fn dirlink(
        &mut self,
        name: &FileName,
        inum: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        // Check that the name is not present.
        if let Ok((ip, _)) = self.dirlookup(name) {
            ip.put(tx);
            return Err(());
        }

        // Look for a free dirent.
        let mut de = Dirent::default();
        let mut off = 0;
        while off < self.size {
            self.read_kernel(&mut de, off).expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += DIRENT_SIZE as u32;
        }

        de.inum = inum as u16;
        de.set_name(name);
        self.write_kernel(&de, off, tx).expect("dirlink");
        Ok(())
    }

    /// Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = Dirent::default();
        for off in ((2 * DIRENT_SIZE as u32)..self.size).step_by(DIRENT_SIZE) {
            self.read_kernel(&mut de, off).expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dinode_layout() {
        // Sixteen per block, no padding anywhere.
        assert_eq!(mem::size_of::<Dinode>(), 64);
        assert_eq!(mem::size_of::<Dirent>(), DIRENT_SIZE);
        assert_eq!(DIRENT_SIZE, 16);
    }

    #[test]
    fn dirent_name_round_trip() {
        let mut de = Dirent::default();
        let name = unsafe { FileName::from_bytes(b"init") };
        de.set_name(name);
        assert_eq!(de.get_name().as_bytes(), b"init");
    }

    #[test]
    fn dirent_name_full_width() {
        let mut de = Dirent::default();
        // Exactly DIRSIZ bytes: stored without a terminator.
        let name = unsafe { FileName::from_bytes(b"abcdefghijklmn") };
        de.set_name(name);
        assert_eq!(de.get_name().as_bytes().len(), DIRSIZ);
        assert_eq!(de.get_name(), name);
    }
}

/// The in-memory inode table.
pub struct Itable {
    lock: RawSpinlock,
    pool: [Inode; NINODE],
}

// Slots are individually synchronized; see Inode.
unsafe impl Sync for Itable {}

impl Itable {
    pub const fn zero() -> Self {
        Self {
            lock: RawSpinlock::new("itable"),
            pool: array![_ => Inode::zero(); NINODE],
        }
    }

    /// Finds the inode with number `inum` on device `dev` and returns its
    /// in-memory copy. Does not lock the inode and does not read it from
    /// disk.
    pub fn get(&'static self, dev: u32, inum: u32) -> RcInode {
        self.lock.acquire();

        // Is the inode already in the table?
        let mut empty: Option<&'static Inode> = None;
        for ip in &self.pool {
            // SAFETY: the table lock is held.
            let meta = unsafe { &mut *ip.meta.get() };
            if meta.nref > 0 && meta.dev == dev && meta.inum == inum {
                meta.nref += 1;
                self.lock.release();
                return RcInode { ptr: ip };
            }
            if empty.is_none() && meta.nref == 0 {
                empty = Some(ip);
            }
        }

        // Recycle a free slot.
        let ip = empty.expect("iget: no inodes");
        // SAFETY: the table lock is held and the slot is unreferenced.
        let meta = unsafe { &mut *ip.meta.get() };
        meta.dev = dev;
        meta.inum = inum;
        meta.nref = 1;
        // SAFETY: unreferenced means nobody holds or can take the sleep
        // lock before we release the table lock.
        unsafe { (*ip.inner.get_mut_raw()).valid = false };
        self.lock.release();
        RcInode { ptr: ip }
    }

    /// Allocates an inode on device `dev`, marking it allocated by giving
    /// it the type. Returns an unlocked but allocated and referenced
    /// inode.
    pub fn alloc_inode(&'static self, dev: u32, typ: i16, tx: &FsTransaction<'_>) -> RcInode {
        for inum in 1..kernel().fs.superblock().ninodes {
            let mut bp = kernel()
                .bcache
                .bread(dev, kernel().fs.superblock().iblock(inum));
            // SAFETY: alignment and capacity per the asserts at Dinode.
            let dip = unsafe {
                &mut *(bp.data_mut().as_mut_ptr() as *mut Dinode).add(inum as usize % IPB)
            };
            if dip.typ == 0 {
                // A free inode; claim it on disk.
                *dip = Dinode {
                    typ,
                    major: 0,
                    minor: 0,
                    nlink: 0,
                    size: 0,
                    addrs: [0; NDIRECT + 1],
                };
                tx.write(bp);
                return self.get(dev, inum);
            }
            drop(bp);
        }
        panic!("ialloc: no inodes");
    }

    pub fn root(&'static self) -> RcInode {
        self.get(ROOTDEV, ROOTINO)
    }

    /// Looks up and returns the inode for a path name.
    /// Must be called inside a transaction since it may put().
    pub fn namei(&'static self, path: &Path, tx: &FsTransaction<'_>) -> Result<RcInode, ()> {
        Ok(self.namex(path, false, tx)?.0)
    }

    /// Like namei, but returns the inode for the parent directory and the
    /// final path element.
    pub fn nameiparent<'p>(
        &'static self,
        path: &'p Path,
        tx: &FsTransaction<'_>,
    ) -> Result<(RcInode, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true, tx)?;
        Ok((ip, name.ok_or(())?))
    }

    /// The shared walk. Holds at most one inode lock at a time, so the
    /// walk cannot deadlock with a concurrent unlink of a path component.
    fn namex<'p>(
        &'static self,
        mut path: &'p Path,
        parent: bool,
        tx: &FsTransaction<'_>,
    ) -> Result<(RcInode, Option<&'p FileName>), ()> {
        let mut ptr = if path.is_absolute() {
            self.root()
        } else {
            let p = myproc();
            // SAFETY: p is the current process; cwd is private to it.
            unsafe { (*p).deref_mut_data() }.cwd.as_ref().unwrap().dup()
        };

        while let Some((rest, name)) = path.skipelem() {
            path = rest;

            let mut ip = ptr.lock();
            if ip.typ != super::T_DIR {
                drop(ip);
                ptr.put(tx);
                return Err(());
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let next = ip.dirlookup(name);
            drop(ip);
            ptr.put(tx);
            ptr = next?.0;
        }
        if parent {
            ptr.put(tx);
            return Err(());
        }
        Ok((ptr, None))
    }
}
