//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching
//! disk blocks in memory reduces the number of disk reads and also
//! provides a synchronization point for blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call bread.
//! * After changing buffer data, call write to flush it to disk.
//! * Dropping the buffer releases it (brelse).
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.
//!
//! The cached set and the reference counts are guarded by one spinlock;
//! each block's contents are guarded by that buffer's sleep lock. Recency
//! is tracked by a doubly linked list threaded through index arrays, with
//! NBUF acting as the sentinel node; the entries themselves never move.

use core::mem::ManuallyDrop;

use array_macro::array;

use crate::{
    kernel::kernel,
    param::{BSIZE, NBUF},
    proc::WaitChannel,
    sleeplock::{Sleeplock, SleeplockGuard},
    spinlock::Spinlock,
    virtio::virtio_disk_rw,
};

/// Block contents. The alignment makes it sound to view the bytes as the
/// u32 arrays and on-disk records the file system stores in blocks.
#[repr(align(8))]
pub struct BufData {
    inner: [u8; BSIZE],
}

impl core::ops::Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl core::ops::DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

pub struct BufInner {
    /// Has data been read from disk?
    pub valid: bool,

    /// Does the disk own the buffer? Guarded by the virtio driver's lock,
    /// not this buffer's sleep lock.
    pub disk: bool,

    pub data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            disk: false,
            data: BufData { inner: [0; BSIZE] },
        }
    }
}

pub struct BufEntry {
    /// WaitChannel saying the virtio request for this buffer is done.
    pub vdisk_waitchannel: WaitChannel,

    pub inner: Sleeplock<BufInner>,
}

impl BufEntry {
    const fn new() -> Self {
        Self {
            vdisk_waitchannel: WaitChannel::new(),
            inner: Sleeplock::new("buffer", BufInner::new()),
        }
    }
}

/// Identity and reference count of one cache slot; guarded by the cache
/// spinlock.
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            dev: 0,
            blockno: 0,
            refcnt: 0,
        }
    }
}

const SENTINEL: usize = NBUF;

struct BufLru {
    meta: [BufMeta; NBUF],

    /// meta[next[SENTINEL]] is the most recently released buffer;
    /// meta[prev[SENTINEL]] the least.
    prev: [usize; NBUF + 1],
    next: [usize; NBUF + 1],
}

impl BufLru {
    const fn new() -> Self {
        let mut prev = [0; NBUF + 1];
        let mut next = [0; NBUF + 1];
        let mut i = 0;
        while i <= NBUF {
            prev[i] = if i == 0 { SENTINEL } else { i - 1 };
            next[i] = if i == SENTINEL { 0 } else { i + 1 };
            i += 1;
        }
        Self {
            meta: array![_ => BufMeta::new(); NBUF],
            prev,
            next,
        }
    }

    fn detach(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p] = n;
        self.prev[n] = p;
    }

    fn attach_front(&mut self, i: usize) {
        let n = self.next[SENTINEL];
        self.prev[i] = SENTINEL;
        self.next[i] = n;
        self.prev[n] = i;
        self.next[SENTINEL] = i;
    }
}

pub struct Bcache {
    lru: Spinlock<BufLru>,
    entries: [BufEntry; NBUF],
}

impl Bcache {
    pub const fn zero() -> Self {
        Self {
            lru: Spinlock::new("bcache", BufLru::new()),
            entries: array![_ => BufEntry::new(); NBUF],
        }
    }

    /// Looks through the cache for block `blockno` on device `dev`. If not
    /// found, recycles the least recently used unreferenced buffer. In
    /// either case, returns the buffer sleep-locked.
    fn bget(&'static self, dev: u32, blockno: u32) -> Buf {
        let mut lru = self.lru.lock();

        // Is the block already cached?
        let mut i = lru.next[SENTINEL];
        while i != SENTINEL {
            if lru.meta[i].dev == dev && lru.meta[i].blockno == blockno {
                lru.meta[i].refcnt += 1;
                drop(lru);
                let guard = self.entries[i].inner.lock();
                return Buf {
                    idx: i,
                    dev,
                    blockno,
                    guard: ManuallyDrop::new(guard),
                };
            }
            i = lru.next[i];
        }

        // Not cached. Recycle the least recently used unreferenced buffer.
        let mut i = lru.prev[SENTINEL];
        while i != SENTINEL {
            if lru.meta[i].refcnt == 0 {
                lru.meta[i].dev = dev;
                lru.meta[i].blockno = blockno;
                lru.meta[i].refcnt = 1;
                // SAFETY: refcnt was 0, so no one holds the sleep lock, and
                // new claimants are stuck behind the cache lock we hold.
                unsafe { (*self.entries[i].inner.get_mut_raw()).valid = false };
                drop(lru);
                let guard = self.entries[i].inner.lock();
                return Buf {
                    idx: i,
                    dev,
                    blockno,
                    guard: ManuallyDrop::new(guard),
                };
            }
            i = lru.prev[i];
        }
        panic!("bget: no buffers");
    }

    /// Returns a locked buffer with the contents of the indicated block.
    pub fn bread(&'static self, dev: u32, blockno: u32) -> Buf {
        let mut b = self.bget(dev, blockno);
        if !b.guard.valid {
            virtio_disk_rw(&mut b, false);
            b.guard.valid = true;
        }
        b
    }
}

/// A sleep-locked buffer. Holding one permits mutating the block contents.
/// Dropping it releases the sleep lock and the cache reference, moving the
/// buffer to the most-recently-used end when the count hits zero.
pub struct Buf {
    idx: usize,
    dev: u32,
    blockno: u32,
    guard: ManuallyDrop<SleeplockGuard<'static, BufInner>>,
}

impl Buf {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &BufData {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.guard.data
    }

    /// The cache entry, for the virtio driver's completion channel.
    pub fn entry(&self) -> &'static BufEntry {
        &kernel().bcache.entries[self.idx]
    }

    /// The raw inner state, for the virtio driver's `disk` handshake flag.
    pub fn inner_raw(&mut self) -> *mut BufInner {
        &mut **self.guard as *mut BufInner
    }

    /// Writes the buffer's contents to disk synchronously.
    pub fn write(&mut self) {
        virtio_disk_rw(self, true);
    }

    /// Raises the reference count so the buffer survives release; used by
    /// the log to keep dirty blocks cached until they are installed.
    pub fn pin(&self) {
        let mut lru = kernel().bcache.lru.lock();
        lru.meta[self.idx].refcnt += 1;
    }

    /// Undoes a pin.
    pub fn unpin(&self) {
        let mut lru = kernel().bcache.lru.lock();
        assert!(lru.meta[self.idx].refcnt > 1, "unpin");
        lru.meta[self.idx].refcnt -= 1;
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // Release the sleep lock first; holding it across the cache lock
        // would invert the locking order used everywhere else.
        // SAFETY: self is being dropped and guard is not used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };

        let mut lru = kernel().bcache.lru.lock();
        lru.meta[self.idx].refcnt -= 1;
        if lru.meta[self.idx].refcnt == 0 {
            // No one is waiting for it; move to the head of the list.
            lru.detach(self.idx);
            lru.attach_front(self.idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_links_form_one_ring() {
        let lru = BufLru::new();
        let mut seen = 0;
        let mut i = lru.next[SENTINEL];
        while i != SENTINEL {
            seen += 1;
            assert_eq!(lru.next[lru.prev[i]], i);
            assert_eq!(lru.prev[lru.next[i]], i);
            i = lru.next[i];
        }
        assert_eq!(seen, NBUF);
    }

    #[test]
    fn detach_attach_moves_to_front() {
        let mut lru = BufLru::new();
        let tail = lru.prev[SENTINEL];
        lru.detach(tail);
        lru.attach_front(tail);
        assert_eq!(lru.next[SENTINEL], tail);
        // Still a consistent ring of NBUF nodes.
        let mut seen = 0;
        let mut i = lru.next[SENTINEL];
        while i != SENTINEL {
            seen += 1;
            i = lru.next[i];
        }
        assert_eq!(seen, NBUF);
    }
}
