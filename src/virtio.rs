//! Driver for qemu's virtio disk device.
//! Uses qemu's mmio interface to virtio; qemu presents a "legacy" virtio
//! interface.
//!
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0 \
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0
//!
//! the virtio spec:
//! https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf

use core::mem;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::{
    bio::{Buf, BufInner},
    kernel::kernel,
    memlayout::VIRTIO0,
    param::BSIZE,
    proc::WaitChannel,
    riscv::{PGSHIFT, PGSIZE},
    sleepablelock::SleepablelockGuard,
};

/// This many virtio descriptors. Must be a power of two.
const NUM: usize = 8;

/// Virtio mmio control registers, mapped starting at VIRTIO0.
/// From qemu virtio_mmio.h.
#[derive(Copy, Clone)]
#[repr(usize)]
enum MmioRegs {
    /// 0x74726976
    MagicValue = 0x000,
    /// version; 1 is legacy
    Version = 0x004,
    /// device type; 1 is net, 2 is disk
    DeviceId = 0x008,
    /// 0x554d4551
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// page size for PFN, write-only
    GuestPageSize = 0x028,
    /// select queue, write-only
    QueueSel = 0x030,
    /// max size of current queue, read-only
    QueueNumMax = 0x034,
    /// size of current queue, write-only
    QueueNum = 0x038,
    /// physical page number for queue, read/write
    QueuePfn = 0x040,
    /// write-only
    QueueNotify = 0x050,
    /// read-only
    InterruptStatus = 0x060,
    /// write-only
    InterruptAck = 0x064,
    /// read/write
    Status = 0x070,
}

impl MmioRegs {
    unsafe fn read(self) -> u32 {
        unsafe { ptr::read_volatile((VIRTIO0 as *mut u8).add(self as usize) as *mut u32) }
    }

    unsafe fn write(self, src: u32) {
        unsafe { ptr::write_volatile((VIRTIO0 as *mut u8).add(self as usize) as *mut u32, src) }
    }
}

bitflags! {
    /// Status register bits, from qemu virtio_config.h.
    struct VirtIoStatus: u32 {
        const ACKNOWLEDGE = 0b0001;
        const DRIVER = 0b0010;
        const DRIVER_OK = 0b0100;
        const FEATURES_OK = 0b1000;
    }
}

bitflags! {
    /// Device feature bits.
    struct VirtIoFeatures: u32 {
        /// Disk is read-only.
        const BLK_F_RO = 1 << 5;
        /// Supports scsi command passthru.
        const BLK_F_SCSI = 1 << 7;
        /// Writeback mode available in config.
        const BLK_F_CONFIG_WCE = 1 << 11;
        /// Supports more than one vq.
        const BLK_F_MQ = 1 << 12;
        const F_ANY_LAYOUT = 1 << 27;
        const RING_F_INDIRECT_DESC = 1 << 28;
        const RING_F_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    struct VRingDescFlags: u16 {
        /// Chained with another descriptor.
        const NEXT = 0b01;
        /// Device writes (vs read).
        const WRITE = 0b10;
    }
}

// repr(C): read by the device.
#[derive(Copy, Clone)]
#[repr(C)]
struct VRingDesc {
    addr: usize,
    len: u32,
    flags: VRingDescFlags,
    next: u16,
}

impl VRingDesc {
    const fn zero() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: VRingDescFlags::empty(),
            next: 0,
        }
    }
}

// repr(C): written by the driver, read by the device.
#[repr(C)]
struct AvailRing {
    flags: u16,
    /// Tells the device how far to look in `ring`.
    idx: u16,
    /// Descriptor chain heads the device should process.
    ring: [u16; NUM],
}

#[derive(Copy, Clone)]
#[repr(C)]
struct VRingUsedElem {
    /// Index of the start of a completed descriptor chain.
    id: u32,
    len: u32,
}

// repr(C): written by the device, read by the driver.
#[repr(C)]
struct UsedArea {
    flags: u16,
    idx: u16,
    ring: [VRingUsedElem; NUM],
}

/// One block request header, read by the device.
#[derive(Copy, Clone)]
#[repr(C)]
struct VirtIoBlkReq {
    typ: u32,
    reserved: u32,
    sector: usize,
}

/// Read the disk.
const VIRTIO_BLK_T_IN: u32 = 0;
/// Write the disk.
const VIRTIO_BLK_T_OUT: u32 = 1;

/// Book-keeping for one in-flight operation, for use when the completion
/// interrupt arrives. Indexed by the first descriptor index of the chain.
#[derive(Copy, Clone)]
struct InflightInfo {
    /// The buffer's inner state, to clear its disk flag.
    b: *mut BufInner,
    /// The buffer's completion channel.
    chan: *const WaitChannel,
    /// Written by the device; zero means success.
    status: u8,
}

impl InflightInfo {
    const fn zero() -> Self {
        Self {
            b: ptr::null_mut(),
            chan: ptr::null(),
            status: 0,
        }
    }
}

/// Memory the device reads through the queue PFN: descriptors and the
/// available ring share the first page, the used ring gets the second.
#[repr(C, align(4096))]
struct VirtQueuePages {
    pages: [u8; 2 * PGSIZE],
}

pub struct Disk {
    queue: VirtQueuePages,

    /// Our own book-keeping of which descriptors are free.
    free: [bool; NUM],

    /// How far we have looked in the used ring.
    used_idx: u16,

    info: [InflightInfo; NUM],

    /// Request headers; they live here so they are direct-mapped for the
    /// device, unlike the kernel stack.
    ops: [VirtIoBlkReq; NUM],
}

// Raw pointers inside are only touched under the disk lock.
unsafe impl Send for Disk {}

impl Disk {
    pub const fn zero() -> Self {
        Self {
            queue: VirtQueuePages {
                pages: [0; 2 * PGSIZE],
            },
            free: [true; NUM],
            used_idx: 0,
            info: [InflightInfo::zero(); NUM],
            ops: [VirtIoBlkReq {
                typ: 0,
                reserved: 0,
                sector: 0,
            }; NUM],
        }
    }

    fn desc(&mut self) -> *mut [VRingDesc; NUM] {
        self.queue.pages.as_mut_ptr() as *mut _
    }

    fn avail(&mut self) -> *mut AvailRing {
        // The available ring follows the descriptor table in the first
        // page.
        unsafe { (self.queue.pages.as_mut_ptr() as *mut VRingDesc).add(NUM) as *mut _ }
    }

    fn used(&mut self) -> *mut UsedArea {
        unsafe { self.queue.pages.as_mut_ptr().add(PGSIZE) as *mut _ }
    }

    /// Finds the device, negotiates features, and hands it the queue.
    ///
    /// # Safety
    ///
    /// Must run once during boot, before interrupts are enabled.
    pub unsafe fn init(&mut self) {
        unsafe {
            if !(MmioRegs::MagicValue.read() == 0x7472_6976
                && MmioRegs::Version.read() == 1
                && MmioRegs::DeviceId.read() == 2
                && MmioRegs::VendorId.read() == 0x554d_4551)
            {
                panic!("could not find virtio disk");
            }

            let mut status = VirtIoStatus::empty();
            status.insert(VirtIoStatus::ACKNOWLEDGE);
            MmioRegs::Status.write(status.bits());
            status.insert(VirtIoStatus::DRIVER);
            MmioRegs::Status.write(status.bits());

            // Negotiate features.
            let mut features = VirtIoFeatures::from_bits_truncate(MmioRegs::DeviceFeatures.read());
            features.remove(
                VirtIoFeatures::BLK_F_RO
                    | VirtIoFeatures::BLK_F_SCSI
                    | VirtIoFeatures::BLK_F_CONFIG_WCE
                    | VirtIoFeatures::BLK_F_MQ
                    | VirtIoFeatures::F_ANY_LAYOUT
                    | VirtIoFeatures::RING_F_EVENT_IDX
                    | VirtIoFeatures::RING_F_INDIRECT_DESC,
            );
            MmioRegs::DriverFeatures.write(features.bits());

            // Tell the device that feature negotiation is complete, then
            // that we're completely ready.
            status.insert(VirtIoStatus::FEATURES_OK);
            MmioRegs::Status.write(status.bits());
            status.insert(VirtIoStatus::DRIVER_OK);
            MmioRegs::Status.write(status.bits());

            MmioRegs::GuestPageSize.write(PGSIZE as u32);

            // Initialize queue 0.
            MmioRegs::QueueSel.write(0);
            let max = MmioRegs::QueueNumMax.read();
            assert!(max != 0, "virtio disk has no queue 0");
            assert!(max >= NUM as u32, "virtio disk max queue too short");
            MmioRegs::QueueNum.write(NUM as u32);
            MmioRegs::QueuePfn.write((self.queue.pages.as_ptr() as usize >> PGSHIFT) as u32);
        }
    }

    /// Finds a free descriptor, marks it non-free, returns its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        let idx = self.free.iter().position(|free| *free)?;
        self.free[idx] = false;
        Some(idx)
    }

    /// Allocates the three descriptors a block request needs, or frees the
    /// ones obtained so far and reports failure.
    fn alloc_three_descs(&mut self) -> Option<[usize; 3]> {
        let mut descs = ArrayVec::<usize, 3>::new();
        for _ in 0..3 {
            match self.alloc_desc() {
                Some(idx) => descs.push(idx),
                None => {
                    for idx in descs {
                        self.free_desc(idx);
                    }
                    return None;
                }
            }
        }
        descs.into_inner().ok()
    }

    fn free_desc(&mut self, idx: usize) {
        assert!(!self.free[idx], "free_desc");
        // SAFETY: idx < NUM and the descriptor table is in our own pages.
        unsafe { (*self.desc())[idx] = VRingDesc::zero() };
        self.free[idx] = true;
    }

    /// Issues one read or write of buffer `b` and sleeps until the device
    /// reports completion.
    fn rw(this: &mut SleepablelockGuard<'_, Self>, b: &mut Buf, write: bool) {
        let sector = b.blockno() as usize * (BSIZE / 512);

        // The spec says that legacy block operations use three descriptors:
        // one for type/reserved/sector, one for the data, one for a 1-byte
        // status result.
        let desc = loop {
            match this.alloc_three_descs() {
                Some(desc) => break desc,
                None => this.sleep(),
            }
        };
        let [d0, d1, d2] = desc;

        this.ops[d0] = VirtIoBlkReq {
            typ: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        };

        let inner = b.inner_raw();
        let chan = &b.entry().vdisk_waitchannel as *const WaitChannel;

        // qemu's virtio-blk.c reads the three descriptors.
        let header_addr = &this.ops[d0] as *const _ as usize;
        let status_addr = &this.info[d0].status as *const _ as usize;
        this.info[d0].status = 0xff; // device writes 0 on success
        unsafe {
            (*this.desc())[d0] = VRingDesc {
                addr: header_addr,
                len: mem::size_of::<VirtIoBlkReq>() as u32,
                flags: VRingDescFlags::NEXT,
                next: d1 as u16,
            };
            // Device reads/writes b's data.
            (*this.desc())[d1] = VRingDesc {
                addr: b.data_mut().as_mut_ptr() as usize,
                len: BSIZE as u32,
                flags: if write {
                    VRingDescFlags::NEXT
                } else {
                    VRingDescFlags::NEXT | VRingDescFlags::WRITE
                },
                next: d2 as u16,
            };
            // Device writes the status byte.
            (*this.desc())[d2] = VRingDesc {
                addr: status_addr,
                len: 1,
                flags: VRingDescFlags::WRITE,
                next: 0,
            };
        }

        // Record the buffer for the completion interrupt.
        // SAFETY: b's sleep lock is held; disk is guarded by this lock.
        unsafe { (*inner).disk = true };
        this.info[d0].b = inner;
        this.info[d0].chan = chan;

        // Tell the device the first index in our chain of descriptors.
        unsafe {
            let avail = this.avail();
            let i = (*avail).idx as usize % NUM;
            (*avail).ring[i] = d0 as u16;
            fence(Ordering::SeqCst);
            (*avail).idx = (*avail).idx.wrapping_add(1);
            fence(Ordering::SeqCst);

            // Value is queue number.
            MmioRegs::QueueNotify.write(0);
        }

        // Wait for the interrupt handler to say the request has finished.
        // SAFETY: reading disk is racy only against intr(), which runs
        // under the same lock we sleep with.
        while unsafe { (*inner).disk } {
            unsafe { (*chan).sleep(&mut *this) };
        }

        this.info[d0].b = ptr::null_mut();
        this.info[d0].chan = ptr::null();
        for idx in desc {
            this.free_desc(idx);
        }

        // Freed descriptors may unblock another rw().
        this.wakeup();
    }

    /// Completion interrupt handler; wakes the processes whose requests
    /// finished.
    fn intr(&mut self) {
        unsafe {
            // Acknowledge the interrupt.
            MmioRegs::InterruptAck.write(MmioRegs::InterruptStatus.read() & 0x3);
        }
        fence(Ordering::SeqCst);

        let used = self.used();
        // SAFETY: the used ring is in our own pages; idx is written by the
        // device, hence the fences.
        while self.used_idx != unsafe { (*used).idx } {
            fence(Ordering::SeqCst);
            let id = unsafe { (*used).ring[self.used_idx as usize % NUM].id } as usize;

            assert_eq!(self.info[id].status, 0, "virtio_disk_intr status");

            // The device is done with the buffer.
            // SAFETY: requests outlive their entries in info; the flag and
            // channel are guarded by the disk lock held by our caller.
            unsafe {
                (*self.info[id].b).disk = false;
                (*self.info[id].chan).wakeup();
            }

            self.used_idx = self.used_idx.wrapping_add(1);
        }
    }
}

pub fn virtio_disk_rw(b: &mut Buf, write: bool) {
    let mut disk = kernel().disk.lock();
    Disk::rw(&mut disk, b, write);
}

pub fn virtio_disk_intr() {
    kernel().disk.lock().intr();
}
