//! Sleepable locks: spin locks whose guards can block on an associated
//! wait channel. This is the condition-variable idiom of the kernel; the
//! guard is released atomically with going to sleep and reacquired on
//! wakeup, so no wakeup between the predicate check and the sleep can be
//! lost.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::proc::{WaitChannel, Waitable};
use crate::spinlock::RawSpinlock;

pub struct Sleepablelock<T> {
    lock: RawSpinlock,
    /// WaitChannel the guards of this lock sleep on.
    waitchannel: WaitChannel,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Sleepablelock<T> {}

pub struct SleepablelockGuard<'s, T> {
    lock: &'s Sleepablelock<T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released by the CPU that acquired
// it.
unsafe impl<'s, T: Sync> Sync for SleepablelockGuard<'s, T> {}

impl<T> Sleepablelock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleepablelockGuard<'_, T> {
        self.lock.acquire();
        SleepablelockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Returns a mutable pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur a
    /// race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically releases the lock and sleeps on this lock's channel;
    /// holds the lock again when it returns.
    pub fn sleep(&mut self) {
        let channel: &WaitChannel = &self.lock.waitchannel;
        channel.sleep(self);
    }

    /// Wakes up everything sleeping on this lock's channel.
    pub fn wakeup(&self) {
        self.lock.waitchannel.wakeup();
    }

    /// Temporarily releases the lock while running `f`, then reacquires.
    /// The data must not be accessed inside `f`.
    pub fn reacquire_after<F, U>(&mut self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<T> Waitable for SleepablelockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Drop for SleepablelockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<T> Deref for SleepablelockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepablelockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
