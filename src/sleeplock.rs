//! Sleeping locks: long-term locks for processes. The holder may be
//! preempted and may itself sleep, which a spin lock never allows.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::proc::myproc;
use crate::sleepablelock::Sleepablelock;

/// A sleep lock that owns its data.
pub struct Sleeplock<T> {
    /// Process holding the lock. `-1` means unlocked.
    locked: Sleepablelock<i32>,

    /// Name of lock, for debugging.
    name: &'static str,

    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Sleeplock<T> {}

pub struct SleeplockGuard<'s, T> {
    lock: &'s Sleeplock<T>,
    _marker: PhantomData<*const ()>,
}

// Do not implement Send; a lock must be released by the process that
// acquired it.
unsafe impl<'s, T: Sync> Sync for SleeplockGuard<'s, T> {}

impl<T> Sleeplock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: Sleepablelock::new("sleep lock", -1),
            name,
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SleeplockGuard<'_, T> {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            guard.sleep();
        }
        // SAFETY: there is a current process whenever a sleep lock is taken;
        // only its pid is read.
        *guard = unsafe { (*myproc()).pid() };
        drop(guard);

        SleeplockGuard {
            lock: self,
            _marker: PhantomData,
        }
    }

    /// Checks whether the current process is holding the lock.
    pub fn holding(&self) -> bool {
        let guard = self.locked.lock();
        // SAFETY: same as in lock().
        *guard == unsafe { (*myproc()).pid() }
    }

    /// Returns a mutable pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur a
    /// race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    /// Returns a mutable reference to the inner data.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other process is accessing the data, e.g.,
    /// because the slot holding this lock is known to be unreferenced.
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<T> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        assert!(self.lock.holding(), "release {}", self.lock.name);
        let mut guard = self.lock.locked.lock();
        *guard = -1;
        guard.wakeup();
    }
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}
