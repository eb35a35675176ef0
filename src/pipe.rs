//! Bounded in-memory FIFO connecting a read file descriptor to a write
//! file descriptor.

use core::mem;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::{
    file::{FileType, RcFile},
    kernel::kernel,
    page::Page,
    proc::{myproc, WaitChannel},
    spinlock::Spinlock,
};

const PIPESIZE: usize = 512;

// A pipe lives in a single frame from the allocator.
const_assert!(mem::size_of::<Pipe>() <= crate::riscv::PGSIZE);

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

enum PipeError {
    WaitForIo,
    Closed,
    InvalidCopyin(usize),
}

pub struct Pipe {
    inner: Spinlock<PipeInner>,

    /// WaitChannel saying there are unread bytes in data.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying some bytes in data were read.
    write_waitchannel: WaitChannel,
}

impl Pipe {
    /// Reads up to `n` bytes to user address `addr`, blocking while the
    /// pipe is empty and some writer remains. Returns the byte count, or
    /// an error if the process was killed while waiting.
    pub fn read(&self, addr: usize, n: usize) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(addr, n) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                _ => return Err(()),
            }
        }
    }

    /// Writes up to `n` bytes from user address `addr`, blocking while the
    /// pipe is full and the reader remains. May return less than `n` if a
    /// copy-in failed part way.
    pub fn write(&self, addr: usize, n: usize) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(addr + written, n - written) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < n {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(PipeError::InvalidCopyin(i)) => {
                    self.read_waitchannel.wakeup();
                    return Ok(written + i);
                }
                _ => return Err(()),
            }
        }
    }

    /// Closes one side; returns true when both sides are now closed and
    /// the pipe should be freed.
    fn close(&self, writable: bool) -> bool {
        let mut inner = self.inner.lock();

        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }

        !inner.readopen && !inner.writeopen
    }
}

impl PipeInner {
    /// Writes as much as fits right now. `Ok(i)` after writing i bytes
    /// (possibly 0 when full), `Err(Closed)` when the reader is gone or
    /// the process was killed, `Err(InvalidCopyin(i))` when the source
    /// address went bad after i bytes.
    fn try_write(&mut self, addr: usize, n: usize) -> Result<usize, PipeError> {
        let p = myproc();
        if !self.readopen || unsafe { (*p).killed() } {
            return Err(PipeError::Closed);
        }

        let mut ch = [0u8];
        for i in 0..n {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // Pipe is full.
                return Ok(i);
            }
            // SAFETY: p is the current process.
            let data = unsafe { (*p).deref_mut_data() };
            if data
                .memory_mut()
                .copy_in_bytes(&mut ch, (addr + i).into())
                .is_err()
            {
                return Err(PipeError::InvalidCopyin(i));
            }
            self.data[self.nwrite as usize % PIPESIZE] = ch[0];
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }

    /// Reads what is buffered right now. `Ok(i)` after i > 0 bytes or at
    /// end of file, `Err(WaitForIo)` when empty with a live writer,
    /// `Err(Closed)` when the process was killed.
    fn try_read(&mut self, addr: usize, n: usize) -> Result<usize, PipeError> {
        let p = myproc();
        if self.nread == self.nwrite && self.writeopen {
            if unsafe { (*p).killed() } {
                return Err(PipeError::Closed);
            }
            return Err(PipeError::WaitForIo);
        }

        for i in 0..n {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            let ch = [self.data[self.nread as usize % PIPESIZE]];
            self.nread = self.nread.wrapping_add(1);
            // SAFETY: p is the current process.
            let data = unsafe { (*p).deref_mut_data() };
            if data
                .memory_mut()
                .copy_out_bytes((addr + i).into(), &ch)
                .is_err()
            {
                return Ok(i);
            }
        }
        Ok(n)
    }
}

/// # Safety
///
/// `ptr` refers to a `Pipe` living in a page from the frame allocator.
/// For each pipe there is one read-only and one write-only handle; the
/// readopen/writeopen flags record which still exist, and the page is
/// freed only when both have been closed.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// Access to the pipe goes through its spinlock.
unsafe impl Send for AllocatedPipe {}

impl core::ops::Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: see the struct invariant.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Creates a pipe and the two file handles that share it.
    pub fn alloc() -> Result<(RcFile, RcFile), ()> {
        let page = kernel().alloc().ok_or(())?;
        let mut page = scopeguard::guard(page, |page| kernel().free(page));

        let ptr = page.as_mut_ptr() as *mut Pipe;
        // SAFETY: the page is exclusively ours and large enough.
        unsafe {
            ptr.write(Pipe {
                inner: Spinlock::new(
                    "pipe",
                    PipeInner {
                        data: [0; PIPESIZE],
                        nread: 0,
                        nwrite: 0,
                        readopen: true,
                        writeopen: true,
                    },
                ),
                read_waitchannel: WaitChannel::new(),
                write_waitchannel: WaitChannel::new(),
            })
        };
        let ptr = NonNull::new(ptr).unwrap();

        let f0 = kernel()
            .ftable
            .alloc(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr },
                },
                true,
                false,
            )
            .map_err(|_| ())?;
        let f0 = scopeguard::guard(f0, |f0| f0.close());
        let f1 = kernel()
            .ftable
            .alloc(
                FileType::Pipe {
                    pipe: AllocatedPipe { ptr },
                },
                false,
                true,
            )
            .map_err(|_| ())?;

        // Both files exist; keep the page.
        let _ = scopeguard::ScopeGuard::into_inner(page).into_usize();
        Ok((scopeguard::ScopeGuard::into_inner(f0), f1))
    }

    /// Closes this side; frees the backing page when both are gone.
    pub fn close(self, writable: bool) {
        if (*self).close(writable) {
            // SAFETY: both handles are closed, so no one else refers to
            // the page, which came from the frame allocator.
            kernel().free(unsafe { Page::from_usize(self.ptr.as_ptr() as usize) });
        }
    }
}
