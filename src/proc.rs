//! Processes, the scheduler, and sleep/wakeup.

use core::cell::UnsafeCell;
use core::mem;
use core::ops::Deref;
use core::ptr;
use core::str;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use array_macro::array;

use crate::{
    file::RcFile,
    fs::RcInode,
    kernel::kernel,
    memlayout::kstack,
    page::Page,
    param::{MAXPROCNAME, NOFILE, NPROC, ROOTDEV},
    println,
    riscv::{intr_get, intr_on, r_tp, PGSIZE},
    spinlock::{pop_off, push_off, Spinlock, SpinlockGuard},
    trap::usertrapret,
    vm::{Addr, UVAddr, UserMemory},
};

#[cfg(target_arch = "riscv64")]
extern "C" {
    // swtch.S
    fn swtch(old: *mut Context, new: *mut Context);
}

/// Host stand-in so the crate links on the build machine; never called
/// there.
#[cfg(not(target_arch = "riscv64"))]
unsafe fn swtch(_old: *mut Context, _new: *mut Context) {
    unreachable!("swtch outside riscv64");
}

/// Saved registers for kernel context switches.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // Callee-saved.
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *mut Proc,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: i32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

/// Per-process data for the trap handling code in trampoline.S. Sits in a
/// page by itself just under the trampoline page in the user page table.
/// Not specially mapped in the kernel page table.
///
/// uservec in trampoline.S saves user registers in the trap frame, then
/// initializes registers from the trap frame's kernel_sp, kernel_hartid,
/// kernel_satp, and jumps to kernel_trap. usertrapret() and userret in
/// trampoline.S set up the trap frame's kernel_*, restore user registers
/// from the trap frame, switch to the user page table, and enter user
/// space. The trap frame includes callee-saved user registers like s0-s11
/// because the return-to-user path via usertrapret() doesn't return
/// through the entire kernel call stack.
///
/// The field offsets are what trampoline.S expects; keep them in sync.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// 0 - kernel page table (satp).
    pub kernel_satp: usize,
    /// 8 - top of process's kernel stack.
    pub kernel_sp: usize,
    /// 16 - usertrap().
    pub kernel_trap: usize,
    /// 24 - saved user program counter.
    pub epc: usize,
    /// 32 - saved kernel tp.
    pub kernel_hartid: usize,
    /// 40
    pub ra: usize,
    /// 48
    pub sp: usize,
    /// 56
    pub gp: usize,
    /// 64
    pub tp: usize,
    /// 72
    pub t0: usize,
    /// 80
    pub t1: usize,
    /// 88
    pub t2: usize,
    /// 96
    pub s0: usize,
    /// 104
    pub s1: usize,
    /// 112
    pub a0: usize,
    /// 120
    pub a1: usize,
    /// 128
    pub a2: usize,
    /// 136
    pub a3: usize,
    /// 144
    pub a4: usize,
    /// 152
    pub a5: usize,
    /// 160
    pub a6: usize,
    /// 168
    pub a7: usize,
    /// 176
    pub s2: usize,
    /// 184
    pub s3: usize,
    /// 192
    pub s4: usize,
    /// 200
    pub s5: usize,
    /// 208
    pub s6: usize,
    /// 216
    pub s7: usize,
    /// 224
    pub s8: usize,
    /// 232
    pub s9: usize,
    /// 240
    pub s10: usize,
    /// 248
    pub s11: usize,
    /// 256
    pub t3: usize,
    /// 264
    pub t4: usize,
    /// 272
    pub t5: usize,
    /// 280
    pub t6: usize,
}

const _: () = assert!(mem::size_of::<TrapFrame>() == 288);

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    fn as_str(&self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Lock guards that a process can block on while keeping the guarded
/// predicate race-free.
pub trait Waitable {
    /// Releases the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a pair,
    /// only for temporarily releasing (and then reacquiring) the lock. Do
    /// not access the guarded data in between.
    unsafe fn raw_release(&mut self);

    /// Acquires the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// See `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

/// A token that pairs sleepers with wakers.
pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels could share an address and spuriously wake
    /// each other's sleepers.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically releases `lk` and sleeps on this channel; reacquires
    /// `lk` when awakened.
    pub fn sleep<T: Waitable>(&self, lk: &mut T) {
        let p = myproc();
        assert!(!p.is_null(), "sleep without a process");

        // Must acquire p's own lock in order to change p->state and then
        // call sched. Once we hold it, we are guaranteed not to miss any
        // wakeup (wakeup locks p's lock too), so it is okay to release lk.
        let mut guard = unsafe { (*p).lock() };
        unsafe { lk.raw_release() };

        // Go to sleep.
        guard.deref_mut_info().waitchannel = self;
        guard.deref_mut_info().state = Procstate::SLEEPING;
        unsafe { guard.sched() };

        // Tidy up.
        guard.deref_mut_info().waitchannel = ptr::null();

        // Reacquire original lock.
        drop(guard);
        unsafe { lk.raw_acquire() };
    }

    /// Wakes up all processes sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup_pool(self);
    }
}

/// Fields protected by the process's own spinlock.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this channel.
    waitchannel: *const WaitChannel,

    /// Exit status to be returned to parent's wait.
    xstate: i32,

    /// Process ID.
    pub pid: i32,
}

/// Fields private to the process, so its lock need not be held.
pub struct ProcData {
    /// Virtual address of kernel stack.
    pub kstack: usize,

    /// Data page for trampoline.S.
    trap_frame: *mut TrapFrame,

    /// User address space; present whenever state != UNUSED.
    pub memory: Option<UserMemory>,

    /// swtch() here to run the process.
    context: Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new(idx: usize) -> Self {
        Self {
            kstack: kstack(idx),
            trap_frame: ptr::null_mut(),
            memory: None,
            context: Context::new(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            name: [0; MAXPROCNAME],
        }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: non-null whenever the slot is in use; callers only reach
        // here through a live process.
        unsafe { &*self.trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as in trap_frame().
        unsafe { &mut *self.trap_frame }
    }

    pub fn memory_mut(&mut self) -> &mut UserMemory {
        self.memory.as_mut().expect("no user memory")
    }

    /// Closes all open files and drops the cwd reference.
    fn close_files(&mut self) {
        for file in self.open_files.iter_mut() {
            if let Some(file) = file.take() {
                file.close();
            }
        }
        // Dropping the cwd may free an inode, which writes the disk, so
        // it must happen inside a transaction.
        if let Some(cwd) = self.cwd.take() {
            let tx = kernel().fs.begin_op();
            cwd.put(&tx);
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// If `info.state` != UNUSED, then `data.trap_frame` is a valid frame
/// obtained from the allocator and `data.memory` is `Some`.
pub struct Proc {
    /// This slot's index in the pool; parents[idx] under the wait lock is
    /// the weak back-reference to the parent.
    idx: usize,

    info: Spinlock<ProcInfo>,

    pub data: UnsafeCell<ProcData>,

    /// WaitChannel saying a child has exited.
    child_waitchannel: WaitChannel,

    /// If true, the process has been killed.
    killed: AtomicBool,
}

impl Proc {
    const fn zero(idx: usize) -> Self {
        Self {
            idx,
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::UNUSED,
                    waitchannel: ptr::null(),
                    xstate: 0,
                    pid: 0,
                },
            ),
            data: UnsafeCell::new(ProcData::new(idx)),
            child_waitchannel: WaitChannel::new(),
            killed: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> ProcGuard {
        mem::forget(self.info.lock());
        ProcGuard { ptr: self }
    }

    /// Reads the pid without the lock; callers tolerate staleness.
    pub unsafe fn pid(&self) -> i32 {
        unsafe { self.info.get_mut_unchecked() }.pid
    }

    /// Reads the state without the lock; callers tolerate staleness.
    pub unsafe fn state(&self) -> Procstate {
        unsafe { self.info.get_mut_unchecked() }.state
    }

    /// Marks the process killed; it will exit at the next kill check.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn deref_data(&self) -> &ProcData {
        // SAFETY: data is private to the running process; see ProcData.
        unsafe { &*self.data.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub unsafe fn deref_mut_data(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }
}

/// # Safety
///
/// `ptr->info`'s spinlock is held.
pub struct ProcGuard {
    ptr: *const Proc,
}

impl ProcGuard {
    fn deref_info(&self) -> &ProcInfo {
        // SAFETY: info is locked.
        unsafe { (*self.ptr).info.get_mut_unchecked() }
    }

    fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: info is locked and &mut self is exclusive.
        unsafe { (*self.ptr).info.get_mut_unchecked() }
    }

    fn raw(&self) -> *const Proc {
        self.ptr
    }

    pub fn state(&self) -> Procstate {
        self.deref_info().state
    }

    /// Switch to the scheduler. Must hold only this process's lock and
    /// have changed proc->state. Saves and restores interrupt_enabled
    /// because it is a property of this kernel thread, not this CPU.
    unsafe fn sched(&mut self) {
        assert!(!unsafe { intr_get() }, "sched interruptible");
        assert_ne!(self.state(), Procstate::RUNNING, "sched running");
        let cpu = kernel().mycpu();
        assert_eq!(unsafe { (*cpu).noff }, 1, "sched locks");

        let interrupt_enabled = unsafe { (*cpu).interrupt_enabled };
        unsafe { swtch(&mut (*(*self.ptr).data.get()).context, &mut (*cpu).context) };

        // swtch may have moved this thread to another cpu.
        let cpu = kernel().mycpu();
        unsafe { (*cpu).interrupt_enabled = interrupt_enabled };
    }

    /// Wakes the process from sleep().
    fn wakeup(&mut self) {
        if self.state() == Procstate::SLEEPING {
            self.deref_mut_info().state = Procstate::RUNNABLE;
        }
    }

    /// Frees a proc slot and the data hanging from it, including user
    /// pages. The caller holds the wait lock and has already cleared the
    /// parent entry.
    fn clear(&mut self) {
        // SAFETY: the slot is a zombie, so no other thread touches its
        // data.
        let data = unsafe { &mut *(*self.ptr).data.get() };
        let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
        if !trap_frame.is_null() {
            // SAFETY: trap_frame uniquely refers to a frame we own.
            kernel().free(unsafe { Page::from_usize(trap_frame as usize) });
        }
        data.memory = None;
        data.name[0] = 0;

        let info = self.deref_mut_info();
        info.waitchannel = ptr::null();
        info.pid = 0;
        info.xstate = 0;
        info.state = Procstate::UNUSED;

        unsafe { (*self.ptr).killed.store(false, Ordering::Release) };
    }
}

impl Deref for ProcGuard {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl Drop for ProcGuard {
    fn drop(&mut self) {
        // SAFETY: the guard owns the lock and is going away.
        unsafe { (*self.ptr).info.unlock() };
    }
}

/// The parent table: parents[i] is the parent of pool[i], a weak
/// reference owned by the table itself. Its spinlock is the wait lock; it
/// keeps wakeups of wait()ing parents from being lost and must be
/// acquired before any p->lock.
type Parents = Spinlock<[*mut Proc; NPROC]>;

/// The process table and everything that manages it.
pub struct ProcessSystem {
    nextpid: AtomicI32,
    pool: [Proc; NPROC],
    initial_proc: UnsafeCell<*mut Proc>,
    parents: Parents,
}

// All mutable state inside is guarded by the locks above.
unsafe impl Sync for ProcessSystem {}

impl ProcessSystem {
    pub const fn zero() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            pool: array![i => Proc::zero(i); NPROC],
            initial_proc: UnsafeCell::new(ptr::null_mut()),
            parents: Spinlock::new("wait_lock", [ptr::null_mut(); NPROC]),
        }
    }

    fn allocpid(&self) -> i32 {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    fn initial_proc(&self) -> *mut Proc {
        // SAFETY: written once during boot, read-only afterwards.
        unsafe { *self.initial_proc.get() }
    }

    /// Looks for an UNUSED slot. If found, initializes the state required
    /// to run in the kernel and returns with the slot's lock held. The
    /// trap frame page and the address space are supplied by the caller
    /// so that failure cannot strand a half-built slot.
    fn alloc(&self, trap_frame: Page, memory: UserMemory) -> Result<ProcGuard, ()> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.state() == Procstate::UNUSED {
                let pid = self.allocpid();
                // SAFETY: the slot was UNUSED, so nothing else touches
                // data.
                let data = unsafe { &mut *p.data.get() };
                let info = guard.deref_mut_info();
                info.pid = pid;
                info.state = Procstate::USED;

                data.trap_frame = trap_frame.into_usize() as *mut TrapFrame;
                data.memory = Some(memory);

                // Set up a new context to start executing at forkret,
                // which returns to user space.
                data.context = Context::default();
                data.context.ra = forkret as usize;
                data.context.sp = data.kstack + PGSIZE;
                return Ok(guard);
            }
        }

        kernel().free(trap_frame);
        Err(())
    }

    /// Passes p's abandoned children to init, waking init so that a dying
    /// init's orphans do not stall.
    fn reparent(&self, p: *mut Proc, parents: &mut SpinlockGuard<'_, [*mut Proc; NPROC]>) {
        for parent in parents.iter_mut() {
            if *parent == p {
                *parent = self.initial_proc();
                unsafe { (*self.initial_proc()).child_waitchannel.wakeup() };
            }
        }
    }

    /// Kills the process with the given pid. The victim won't exit until
    /// it tries to return to user space or blocks (see usertrap()).
    pub fn kill(&self, pid: i32) -> Result<(), ()> {
        for p in &self.pool {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid {
                p.kill();
                guard.wakeup();
                return Ok(());
            }
        }
        Err(())
    }

    /// Wakes up all processes in the pool sleeping on `target`.
    /// Must be called without any p->lock.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let me = myproc() as *const Proc;
        for p in &self.pool {
            if p as *const Proc != me {
                let mut guard = p.lock();
                if guard.deref_info().waitchannel == target as *const _ {
                    guard.wakeup();
                }
            }
        }
    }

    /// Sets up the first user process.
    pub unsafe fn user_proc_init(&'static self) {
        // Allocate a trap frame page.
        let trap_frame = kernel().alloc().expect("user_proc_init: alloc");

        // Allocate one user page and copy initcode's instructions and
        // data into it.
        let memory = UserMemory::new(trap_frame.addr().into(), Some(&INITCODE))
            .expect("user_proc_init: UserMemory::new");

        let mut guard = self
            .alloc(trap_frame, memory)
            .expect("user_proc_init: no free procs");

        unsafe { *self.initial_proc.get() = guard.raw() as *mut Proc };

        // SAFETY: the slot's lock is held and the process has not
        // started.
        let data = unsafe { &mut *guard.data.get() };

        // Prepare for the very first "return" from kernel to user: user
        // program counter and stack pointer.
        data.trap_frame_mut().epc = 0;
        data.trap_frame_mut().sp = PGSIZE;

        let name = b"initcode\x00";
        data.name[..name.len()].copy_from_slice(name);
        data.cwd = Some(kernel().itable.root());

        guard.deref_mut_info().state = Procstate::RUNNABLE;
    }

    /// Creates a new process, copying the parent. Sets up the child
    /// kernel stack to return as if from fork(). Returns the child's pid.
    pub unsafe fn fork(&self) -> Result<i32, ()> {
        let p = myproc();
        // SAFETY: p is the current process; data is private to it.
        let pdata = unsafe { (*p).deref_mut_data() };

        // Allocate a trap frame page; freed again if anything below
        // fails.
        let trap_frame =
            scopeguard::guard(kernel().alloc().ok_or(())?, |page| kernel().free(page));

        // Copy user memory from parent to child.
        let memory = pdata
            .memory_mut()
            .try_clone(trap_frame.addr().into())
            .ok_or(())?;

        // Allocate a slot.
        let mut np = self.alloc(scopeguard::ScopeGuard::into_inner(trap_frame), memory)?;
        // SAFETY: the child's lock is held and it has not started
        // running.
        let npdata = unsafe { &mut *np.data.get() };

        // Copy saved user registers; cause fork to return 0 in the child.
        *npdata.trap_frame_mut() = *pdata.trap_frame();
        npdata.trap_frame_mut().a0 = 0;

        // Increment reference counts on open file descriptors.
        for (nf, f) in npdata.open_files.iter_mut().zip(pdata.open_files.iter()) {
            if let Some(file) = f {
                *nf = Some(file.dup());
            }
        }
        npdata.cwd = Some(pdata.cwd.as_ref().unwrap().dup());
        npdata.name.copy_from_slice(&pdata.name);

        let pid = np.deref_info().pid;
        let child_idx = np.idx;
        let child = np.raw();

        // Drop the guard before taking the wait lock; the order is
        // wait_lock -> p->lock.
        drop(np);

        let mut parents = self.parents.lock();
        parents[child_idx] = p;

        let mut np = unsafe { (*child).lock() };
        np.deref_mut_info().state = Procstate::RUNNABLE;

        Ok(pid)
    }

    /// Waits for a child process to exit, reaps it, and returns its pid.
    /// The child's exit status is copied to user address `addr` unless it
    /// is null. Returns Err if this process has no children.
    pub unsafe fn wait(&self, addr: UVAddr) -> Result<i32, ()> {
        let p = myproc();
        // SAFETY: p is the current process.
        let data = unsafe { (*p).deref_mut_data() };

        let mut parents = self.parents.lock();

        loop {
            // Scan through the pool looking for exited children.
            let mut havekids = false;
            for (i, np) in self.pool.iter().enumerate() {
                if parents[i] == p {
                    // Make sure the child isn't still in exit() or
                    // swtch().
                    let mut np = np.lock();

                    havekids = true;
                    if np.state() == Procstate::ZOMBIE {
                        let pid = np.deref_info().pid;
                        let xstate = np.deref_info().xstate;
                        if !addr.is_null() && data.memory_mut().copy_out(addr, &xstate).is_err() {
                            return Err(());
                        }
                        // Reap the zombie.
                        parents[i] = ptr::null_mut();
                        np.clear();
                        return Ok(pid);
                    }
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || unsafe { (*p).killed() } {
                return Err(());
            }

            // Wait for a child to exit.
            unsafe { (*p).child_waitchannel.sleep(&mut parents) };
        }
    }

    /// Exits the current process; does not return. The process remains a
    /// zombie until its parent calls wait().
    pub unsafe fn exit_current(&self, status: i32) -> ! {
        let p = myproc();
        assert!(p != self.initial_proc(), "init exiting");

        // SAFETY: p is the current process.
        let data = unsafe { (*p).deref_mut_data() };
        data.close_files();

        // Give any children to init.
        let mut parents = self.parents.lock();
        self.reparent(p, &mut parents);

        // The parent might be sleeping in wait().
        let parent = parents[unsafe { (*p).idx }];
        unsafe { (*parent).child_waitchannel.wakeup() };

        let mut guard = unsafe { (*p).lock() };
        guard.deref_mut_info().xstate = status;
        guard.deref_mut_info().state = Procstate::ZOMBIE;

        // Release the wait lock by hand; this function never returns.
        drop(parents);

        // Jump into the scheduler, never to return.
        unsafe { guard.sched() };
        unreachable!("zombie exit");
    }

    /// Prints a process listing to the console for debugging. Runs when a
    /// user types ^P; takes no locks to avoid wedging a stuck machine
    /// further.
    pub fn dump(&self) {
        println!();
        for p in &self.pool {
            // SAFETY: lockless read of possibly racing fields, accepted
            // for a debug dump.
            let info = unsafe { p.info.get_mut_unchecked() };
            if info.state != Procstate::UNUSED {
                let data = p.deref_data();
                let len = data
                    .name
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(data.name.len());
                println!(
                    "{} {} {}",
                    info.pid,
                    info.state.as_str(),
                    str::from_utf8(&data.name[..len]).unwrap_or("???")
                );
            }
        }
    }
}

/// A user program that calls exec("/init").
/// od -t xC initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0, 0, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0, 0, 0x93, 0x85, 0x35, 0x02, 0x93, 0x08,
    0x70, 0, 0x73, 0, 0, 0, 0x93, 0x08, 0x20, 0, 0x73, 0, 0, 0, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0, 0, 0x24, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Returns this CPU's ID.
///
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
pub fn cpuid() -> usize {
    unsafe { r_tp() }
}

/// Returns the current struct Proc, or null if none.
pub fn myproc() -> *mut Proc {
    unsafe { push_off() };
    let c = kernel().mycpu();
    let p = unsafe { (*c).proc };
    unsafe { pop_off() };
    p
}

/// Grows or shrinks the current process's memory by n bytes.
pub fn growproc(n: isize) -> Result<(), ()> {
    let p = myproc();
    // SAFETY: p is the current process.
    let data = unsafe { (*p).deref_mut_data() };
    data.memory_mut().resize(n).map(|_| ())
}

/// Copies to either a user virtual address or a kernel address, depending
/// on `user_dst`.
pub fn either_copy_out(user_dst: bool, dst: usize, src: &[u8]) -> Result<(), ()> {
    if user_dst {
        let p = myproc();
        // SAFETY: p is the current process; its image is private to it.
        let data = unsafe { (*p).deref_mut_data() };
        data.memory_mut().copy_out_bytes(dst.into(), src)
    } else {
        // SAFETY: callers pass kernel buffers they own.
        unsafe { ptr::copy(src.as_ptr(), dst as *mut u8, src.len()) };
        Ok(())
    }
}

/// Copies from either a user virtual address or a kernel address,
/// depending on `user_src`.
pub fn either_copy_in(dst: &mut [u8], user_src: bool, src: usize) -> Result<(), ()> {
    if user_src {
        let p = myproc();
        // SAFETY: p is the current process; its image is private to it.
        let data = unsafe { (*p).deref_mut_data() };
        data.memory_mut().copy_in_bytes(dst, src.into())
    } else {
        // SAFETY: callers pass kernel buffers they own.
        unsafe { ptr::copy(src as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }
}

/// Per-CPU process scheduler. Each CPU calls scheduler() after setting
/// itself up. Scheduler never returns. It loops, doing:
///  - choose a process to run.
///  - swtch to start running that process.
///  - eventually that process transfers control back via swtch.
pub unsafe fn scheduler() -> ! {
    let c = kernel().mycpu();
    unsafe { (*c).proc = ptr::null_mut() };
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        unsafe { intr_on() };

        for p in &kernel().procs.pool {
            let mut guard = p.lock();
            if guard.state() == Procstate::RUNNABLE {
                // Switch to the chosen process. It is the process's job
                // to release its lock and then reacquire it before
                // jumping back to us.
                guard.deref_mut_info().state = Procstate::RUNNING;
                unsafe { (*c).proc = p as *const _ as *mut _ };
                unsafe { swtch(&mut (*c).context, &mut (*p.data.get()).context) };

                // Process is done running for now. It should have changed
                // its state before coming back.
                unsafe { (*c).proc = ptr::null_mut() };
            }
        }
    }
}

/// Gives up the CPU for one scheduling round.
pub fn proc_yield() {
    let p = myproc();
    let mut guard = unsafe { (*p).lock() };
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    unsafe { guard.sched() };
}

/// A fork child's very first scheduling by scheduler() will swtch here.
unsafe fn forkret() {
    // Still holding p->lock from scheduler.
    unsafe { (*myproc()).info.unlock() };

    // File system initialization must run in the context of a regular
    // process (e.g., because it calls sleep), and thus cannot be run from
    // kernel_main().
    kernel().fs.init(ROOTDEV);

    unsafe { usertrapret() };
}
