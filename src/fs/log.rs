//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call should hold an `FsTransaction` across its whole run.
//! Opening one usually just increments the count of in-progress FS system
//! calls and returns. But if the log is close to running out, it sleeps
//! until the last outstanding transaction commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;

use crate::{
    bio::{Buf, BufData},
    kernel::kernel,
    param::{BSIZE, LOGSIZE, MAXOPBLOCKS},
    sleepablelock::Sleepablelock,
};

/// Contents of the on-disk header block.
#[repr(C)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);
const_assert!(mem::align_of::<BufData>() % mem::align_of::<LogHeader>() == 0);

pub struct Log {
    dev: u32,
    start: u32,
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: i32,

    /// In commit(), please wait.
    committing: bool,

    /// Block numbers of the current transaction, duplicates absorbed. Each
    /// listed block is pinned in the buffer cache until installed.
    head: ArrayVec<u32, LOGSIZE>,
}

impl Log {
    /// Recovers from the log if needed and returns it ready for use.
    pub fn new(dev: u32, start: u32, size: u32) -> Self {
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            head: ArrayVec::new(),
        };
        log.recover();
        log
    }

    /// Views a buffer holding the header block as a LogHeader.
    fn header_mut(bp: &mut Buf) -> &mut LogHeader {
        // SAFETY: BufData is aligned and large enough per the asserts
        // above, and the buffer's sleep lock is held.
        unsafe { &mut *(bp.data_mut().as_mut_ptr() as *mut LogHeader) }
    }

    /// Reads the log header from disk into the in-memory list.
    fn read_head(&mut self) {
        let mut bp = kernel().bcache.bread(self.dev, self.start);
        let lh = Self::header_mut(&mut bp);
        self.head.clear();
        for i in 0..lh.n as usize {
            self.head.push(lh.block[i]);
        }
    }

    /// Writes the in-memory list to the on-disk header. This is the true
    /// point at which the current transaction commits.
    fn write_head(&mut self) {
        let mut bp = kernel().bcache.bread(self.dev, self.start);
        let lh = Self::header_mut(&mut bp);
        lh.n = self.head.len() as u32;
        for (slot, blockno) in izip!(&mut lh.block, &self.head) {
            *slot = *blockno;
        }
        bp.write();
    }

    /// Copies modified blocks from the cache to the log region.
    fn write_log(&mut self) {
        for (tail, blockno) in self.head.iter().enumerate() {
            // Log slot.
            let mut to = kernel()
                .bcache
                .bread(self.dev, self.start + tail as u32 + 1);
            // Cache block.
            let from = kernel().bcache.bread(self.dev, *blockno);
            to.data_mut().copy_from_slice(&from.data()[..]);
            to.write();
        }
    }

    /// Copies committed blocks from the log region to their home
    /// locations. During recovery no buffer was pinned, so nothing is
    /// unpinned either.
    fn install_trans(&mut self, recovering: bool) {
        let dev = self.dev;
        let start = self.start;
        for (tail, blockno) in self.head.drain(..).enumerate() {
            // Read log block.
            let lbuf = kernel().bcache.bread(dev, start + tail as u32 + 1);
            // Read home location.
            let mut dbuf = kernel().bcache.bread(dev, blockno);
            dbuf.data_mut().copy_from_slice(&lbuf.data()[..]);
            dbuf.write();
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    fn recover(&mut self) {
        self.read_head();
        // If a header survived, the transaction committed; redo it.
        self.install_trans(true);
        // Clear the log.
        self.write_head();
    }

    fn commit(&mut self) {
        if !self.head.is_empty() {
            // Write modified blocks from cache to the log region.
            self.write_log();
            // Write header to disk -- the real commit.
            self.write_head();
            // Now install writes to home locations.
            self.install_trans(false);
            // Erase the transaction from the log.
            self.write_head();
        }
    }
}

impl Sleepablelock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.head.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call; commits if this was the
    /// last outstanding operation.
    pub fn end_op(&self) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op: committing");

        if guard.outstanding == 0 {
            // No transaction is in flight, and `committing` keeps new ones
            // out even while the lock is released below.
            guard.committing = true;

            // Commit without holding the lock, since commit sleeps on disk
            // I/O.
            // SAFETY: committing blocks every other accessor of the inner
            // data until the lock is retaken and the flag cleared.
            guard.reacquire_after(|| unsafe { &mut *self.get_mut_raw() }.commit());

            guard.committing = false;
        }

        // Waiters in begin_op may be blocked on committing or on the
        // reservation this op just returned.
        guard.wakeup();
    }

    /// Records that `b` belongs to the current transaction and pins it in
    /// the cache; the eventual commit will do the disk write. Consuming the
    /// buffer releases it.
    ///
    /// A typical use is:
    ///   let mut bp = kernel().bcache.bread(...);
    ///   modify bp.data_mut()
    ///   tx.write(bp)
    pub fn log_write(&self, b: Buf) {
        let mut guard = self.lock();
        assert!(
            guard.head.len() < LOGSIZE && (guard.head.len() as u32) < guard.size - 1,
            "too big a transaction"
        );
        assert!(guard.outstanding >= 1, "log_write outside of trans");

        // Log absorption: a block already in the list need not be listed
        // twice, and stays pinned from the first time.
        if !guard.head.contains(&b.blockno()) {
            b.pin();
            guard.head.push(b.blockno());
        }
        drop(guard);
        drop(b);
    }
}
