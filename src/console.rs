//! Console input and output, to the uart. Reads are one line at a time;
//! writes go straight to the uart.
//!
//! Implements special input characters:
//! * newline -- end of line
//! * control-h -- backspace
//! * control-u -- kill line
//! * control-d -- end of file
//! * control-p -- print process table

use array_macro::array;

use crate::{
    file::{Devsw, CONSOLE},
    kernel::kernel,
    param::NDEV,
    proc::{either_copy_in, either_copy_out, myproc},
    sleepablelock::Sleepablelock,
    uart::Uart,
};

/// Size of console input buffer.
const INPUT_BUF: usize = 128;

/// Control-x.
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const CTRL_D: u8 = ctrl(b'D');
const CTRL_H: u8 = ctrl(b'H');
const CTRL_P: u8 = ctrl(b'P');
const CTRL_U: u8 = ctrl(b'U');
const DEL: u8 = 0x7f;

struct InputBuffer {
    buf: [u8; INPUT_BUF],
    /// Read index.
    r: usize,
    /// Write index; input up to here has been committed by a newline.
    w: usize,
    /// Edit index; input past w that can still be erased.
    e: usize,
}

pub struct Console {
    uart: Uart,
    input: Sleepablelock<InputBuffer>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            uart: Uart::new(),
            input: Sleepablelock::new(
                "cons",
                InputBuffer {
                    buf: [0; INPUT_BUF],
                    r: 0,
                    w: 0,
                    e: 0,
                },
            ),
        }
    }

    pub fn init(&self) {
        self.uart.init();
    }

    /// Sends one character to the uart, spinning. Used by the printer and
    /// to echo input; a panicked kernel parks every caller here.
    pub fn putc(&self, c: u8) {
        if kernel().is_panicked() {
            loop {
                core::hint::spin_loop();
            }
        }
        self.uart.putc(c);
    }

    /// Rubs out the last echoed character.
    fn put_backspace(&self) {
        self.putc(8);
        self.putc(b' ');
        self.putc(8);
    }

    /// User write()s to the console come here; one byte at a time,
    /// straight to the uart.
    fn write(&self, user_src: bool, src: usize, n: i32) -> i32 {
        for i in 0..n {
            let mut c = [0u8];
            if either_copy_in(&mut c, user_src, src + i as usize).is_err() {
                return i;
            }
            self.putc(c[0]);
        }
        n
    }

    /// User read()s from the console come here. Copies up to a whole input
    /// line to dst, waiting until one has arrived.
    fn read(&self, user_dst: bool, mut dst: usize, mut n: i32) -> i32 {
        let target = n;
        let mut guard = self.input.lock();
        while n > 0 {
            // Wait until the interrupt handler has put some input into the
            // buffer.
            while guard.r == guard.w {
                // SAFETY: a device read always has a current process.
                if unsafe { (*myproc()).killed() } {
                    return -1;
                }
                guard.sleep();
            }

            let c = guard.buf[guard.r % INPUT_BUF];
            guard.r += 1;

            if c == CTRL_D {
                // End of file.
                if n < target {
                    // Save ^D for next time, so the caller gets a 0-byte
                    // result on the next read.
                    guard.r -= 1;
                }
                break;
            }

            // Copy the input byte to the caller's buffer.
            if either_copy_out(user_dst, dst, &[c]).is_err() {
                break;
            }
            dst += 1;
            n -= 1;

            if c == b'\n' {
                // A whole line has arrived; return to the user-level
                // read().
                break;
            }
        }
        target - n
    }

    /// Handles a uart interrupt: input has arrived. Does erase/kill
    /// processing, appends to the input buffer, and wakes readers when a
    /// whole line (or end-of-file) is there.
    pub fn intr(&self) {
        while let Some(c) = self.uart.getc() {
            let mut guard = self.input.lock();
            match c {
                CTRL_P => {
                    // Print the process table.
                    drop(guard);
                    kernel().procs.dump();
                    continue;
                }

                CTRL_U => {
                    // Kill the line being edited.
                    while guard.e != guard.w
                        && guard.buf[(guard.e.wrapping_sub(1)) % INPUT_BUF] != b'\n'
                    {
                        guard.e = guard.e.wrapping_sub(1);
                        self.put_backspace();
                    }
                }

                CTRL_H | DEL => {
                    // Backspace, not past the committed line.
                    if guard.e != guard.w {
                        guard.e = guard.e.wrapping_sub(1);
                        self.put_backspace();
                    }
                }

                _ => {
                    if c != 0 && guard.e.wrapping_sub(guard.r) < INPUT_BUF {
                        let c = if c == b'\r' { b'\n' } else { c };

                        // Echo back to the user.
                        self.putc(c);

                        // Store for consumption by read().
                        let e = guard.e % INPUT_BUF;
                        guard.buf[e] = c;
                        guard.e = guard.e.wrapping_add(1);

                        if c == b'\n' || c == CTRL_D || guard.e == guard.r.wrapping_add(INPUT_BUF)
                        {
                            // A whole line (or end-of-file) has arrived;
                            // commit it and wake up read().
                            guard.w = guard.e;
                            guard.wakeup();
                        }
                    }
                }
            }
        }
    }
}

fn console_read(user_dst: bool, addr: usize, n: i32) -> i32 {
    kernel().console.read(user_dst, addr, n)
}

fn console_write(user_src: bool, addr: usize, n: i32) -> i32 {
    kernel().console.write(user_src, addr, n)
}

/// The device-switch table, with the console installed at major CONSOLE.
pub const fn devsw() -> [Devsw; NDEV] {
    let mut table = array![_ => Devsw { read: None, write: None }; NDEV];
    table[CONSOLE] = Devsw {
        read: Some(console_read as fn(bool, usize, i32) -> i32),
        write: Some(console_write as fn(bool, usize, i32) -> i32),
    };
    table
}
