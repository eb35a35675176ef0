//! Low-level driver for the 16550a UART on qemu's virt machine.

use core::ptr;

use crate::memlayout::UART0;

/// The UART control registers, memory mapped starting at UART0. Some have
/// different meanings for read vs write; see
/// http://byterunner.com/16550.html
#[derive(Copy, Clone)]
#[repr(usize)]
enum UartReg {
    /// Receive holding register (read) / transmit holding register
    /// (write).
    RhrThr = 0,
    /// Interrupt enable register.
    Ier = 1,
    /// FIFO control register (write) / interrupt status register (read).
    FcrIsr = 2,
    /// Line control register.
    Lcr = 3,
    /// Line status register.
    Lsr = 5,
}

const IER_RX_ENABLE: u8 = 1 << 0;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
/// Clear the content of the two FIFOs.
const FCR_FIFO_CLEAR: u8 = 3 << 1;
const LCR_EIGHT_BITS: u8 = 3;
/// Special mode to set the baud rate.
const LCR_BAUD_LATCH: u8 = 1 << 7;
/// Input is waiting to be read from RHR.
const LSR_RX_READY: u8 = 1 << 0;
/// THR can accept another character to send.
const LSR_TX_IDLE: u8 = 1 << 5;

impl UartReg {
    fn read(self) -> u8 {
        // SAFETY: the kernel page table direct-maps the UART registers.
        unsafe { ptr::read_volatile((UART0 + self as usize) as *const u8) }
    }

    fn write(self, value: u8) {
        // SAFETY: as in read().
        unsafe { ptr::write_volatile((UART0 + self as usize) as *mut u8, value) }
    }
}

pub struct Uart;

impl Uart {
    pub const fn new() -> Self {
        Self
    }

    pub fn init(&self) {
        // Disable interrupts.
        UartReg::Ier.write(0x00);

        // Set the baud rate to 38.4K.
        UartReg::Lcr.write(LCR_BAUD_LATCH);
        UartReg::RhrThr.write(0x03); // LSB
        UartReg::Ier.write(0x00); // MSB

        // Leave baud latch mode; word length 8 bits, no parity.
        UartReg::Lcr.write(LCR_EIGHT_BITS);

        // Reset and enable FIFOs.
        UartReg::FcrIsr.write(FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

        // Enable receive interrupts; transmit is polled.
        UartReg::Ier.write(IER_RX_ENABLE);
    }

    /// Busy-waits for the transmit register and sends one byte.
    pub fn putc(&self, c: u8) {
        while UartReg::Lsr.read() & LSR_TX_IDLE == 0 {}
        UartReg::RhrThr.write(c);
    }

    /// Reads one input character, if one is waiting.
    pub fn getc(&self) -> Option<u8> {
        if UartReg::Lsr.read() & LSR_RX_READY != 0 {
            Some(UartReg::RhrThr.read())
        } else {
            None
        }
    }
}
