//! The kernel-wide context: every subsystem singleton, plus boot.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use spin::Once;

use crate::{
    bio::Bcache,
    console::{self, Console},
    file::{Devsw, FileTable},
    fs::{FileSystem, Itable},
    kalloc::Kmem,
    page::Page,
    param::{NCPU, NDEV},
    plic,
    printf::Printer,
    println,
    proc::{cpuid, scheduler, Cpu, ProcessSystem},
    sleepablelock::Sleepablelock,
    spinlock::Spinlock,
    trap,
    virtio::Disk,
    vm::KernelMemory,
};

pub struct Kernel {
    panicked: AtomicBool,

    pub console: Console,

    pub printer: Spinlock<Printer>,

    kmem: Spinlock<Kmem>,

    /// The kernel page table, built once by the boot hart.
    memory: Once<KernelMemory>,

    /// Timer ticks since boot; sleepers wait on it.
    pub ticks: Sleepablelock<u32>,

    pub procs: ProcessSystem,

    // The current hart's Cpu must be mutable through a shared reference,
    // so the slots are UnsafeCells; a hart only ever touches its own.
    cpus: [UnsafeCell<Cpu>; NCPU],

    pub bcache: Bcache,

    pub disk: Sleepablelock<Disk>,

    pub devsw: [Devsw; NDEV],

    pub ftable: FileTable,

    pub itable: Itable,

    pub fs: FileSystem,
}

// See the field comments; every piece is synchronized on its own.
unsafe impl Sync for Kernel {}

static KERNEL: Kernel = Kernel::new();

#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    const fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            console: Console::new(),
            printer: Spinlock::new("pr", Printer::new()),
            kmem: Spinlock::new("kmem", Kmem::new()),
            memory: Once::new(),
            ticks: Sleepablelock::new("time", 0),
            procs: ProcessSystem::zero(),
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            bcache: Bcache::zero(),
            disk: Sleepablelock::new("virtio_disk", Disk::zero()),
            devsw: console::devsw(),
            ftable: FileTable::zero(),
            itable: Itable::zero(),
            fs: FileSystem::zero(),
        }
    }

    pub fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Returns this hart's Cpu struct.
    ///
    /// It is safe to call this with interrupts enabled, but the returned
    /// address may then be stale, since the scheduler can move the process
    /// to another CPU on a timer interrupt.
    pub fn mycpu(&self) -> *mut Cpu {
        self.cpus[cpuid()].get()
    }

    /// Allocates one physical page frame.
    pub fn alloc(&self) -> Option<Page> {
        self.kmem.lock().alloc()
    }

    /// Returns a frame to the allocator.
    pub fn free(&self, page: Page) {
        self.kmem.lock().free(page);
    }

    /// Prints the formatted string with the printer, skipping the lock
    /// once the kernel has panicked.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        use core::fmt::Write;
        if self.is_panicked() {
            // SAFETY: every hart is parked in putc(); no one contends.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }
}

/// start() jumps here in supervisor mode on all CPUs.
pub unsafe fn kernel_main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpuid() == 0 {
        // Console first, so boot messages have somewhere to go.
        kernel().console.init();
        println!();
        println!("silex kernel is booting");
        println!();

        // Physical page allocator.
        unsafe { kernel().kmem.lock().init() };

        // Build the kernel page table and turn on paging.
        let memory = KernelMemory::new().expect("kernel_main: KernelMemory::new");
        unsafe { kernel().memory.call_once(|| memory).init_hart() };

        // Install the kernel trap vector.
        unsafe { trap::trapinithart() };

        // Set up the interrupt controller and ask it for device
        // interrupts.
        unsafe { plic::plicinit() };
        unsafe { plic::plicinithart() };

        // Emulated hard disk.
        unsafe { kernel().disk.lock().init() };

        // First user process.
        unsafe { kernel().procs.user_proc_init() };

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            spin_loop();
        }

        println!("hart {} starting", cpuid());

        // Turn on paging.
        unsafe { kernel().memory.get().unwrap().init_hart() };

        // Install the kernel trap vector.
        unsafe { trap::trapinithart() };

        // Ask the PLIC for device interrupts.
        unsafe { plic::plicinithart() };
    }

    unsafe { scheduler() }
}
