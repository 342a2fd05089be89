//! 8042 keyboard controller (ports 0x60/0x64) and the port-0x92 alternate
//! A20 gate.
//!
//! The controller keeps a 16-byte scan-code ring buffer plus the
//! guest-visible output buffer. System side effects go through shared
//! handles instead of back-references: A20 through [`A20Gate`] (output-port
//! bit 1), reset through [`ResetLine`] (command 0xFE), and IRQ1 through an
//! [`IrqLine`] when command-byte bit 0 enables it.

use crate::io::PortIoDevice;
use crate::irq::IrqLine;
use crate::{A20Gate, ResetLine};

const BUFFER_SIZE: usize = 16;

// Status register bits.
const STATUS_OBF: u8 = 0x01;
const STATUS_IBF: u8 = 0x02;

pub struct I8042 {
    pub status: u8,
    command: u8,
    command_byte: u8,
    output_port: u8,
    output_buffer: u8,
    buffer: [u8; BUFFER_SIZE],
    head: usize,
    tail: usize,
    irq1: Box<dyn IrqLine>,
    a20: A20Gate,
    reset: ResetLine,
}

impl I8042 {
    pub fn new(irq1: Box<dyn IrqLine>, a20: A20Gate, reset: ResetLine) -> Self {
        a20.set(false);
        Self {
            status: 0x14,
            command: 0,
            command_byte: 0x45,
            output_port: 0xDD,
            output_buffer: 0,
            buffer: [0; BUFFER_SIZE],
            head: 0,
            tail: 0,
            irq1,
            a20,
            reset,
        }
    }

    /// Queue one byte toward the guest. Full buffers drop the byte. If the
    /// output buffer is idle the byte becomes visible immediately and IRQ1
    /// fires when enabled.
    pub fn send_scancode(&mut self, scancode: u8) {
        let next_head = (self.head + 1) % BUFFER_SIZE;
        if next_head == self.tail {
            return;
        }
        self.buffer[self.head] = scancode;
        self.head = next_head;
        if self.status & STATUS_OBF == 0 {
            self.output_buffer = scancode;
            self.status |= STATUS_OBF;
            if self.command_byte & 1 != 0 {
                self.irq1.raise();
            }
        }
    }

    fn write_command(&mut self, value: u8) {
        self.status |= STATUS_IBF;
        self.command = value;
        match value {
            0x20 => {
                let cb = self.command_byte;
                self.send_scancode(cb);
            }
            0xAA => self.send_scancode(0x55),
            0xAD => self.command_byte |= 0x10,
            0xAE => self.command_byte &= !0x10,
            0xA7 => self.command_byte |= 0x20,
            0xA8 => self.command_byte &= !0x20,
            0xC0 => self.send_scancode(0x00),
            0xD0 => {
                let op = self.output_port;
                self.send_scancode(op);
            }
            0xE0 => self.send_scancode(0x00),
            0xFE => self.reset.request(),
            _ => {}
        }
        // Commands that do not expect a data byte complete immediately.
        if !matches!(value, 0x60 | 0xD1 | 0xD3 | 0xD4) {
            self.status &= !STATUS_IBF;
        }
    }

    fn write_data(&mut self, value: u8) {
        if self.command != 0 {
            match self.command {
                0x60 => self.command_byte = value,
                0xD1 => {
                    self.output_port = value;
                    self.a20.set(value & 0x02 != 0);
                }
                0xD3 => {}
                0xD4 => {
                    self.send_scancode(0xFA);
                    if value == 0xFF {
                        self.send_scancode(0xAA);
                        self.send_scancode(0x00);
                    }
                }
                _ => {}
            }
            self.command = 0;
            self.status &= !STATUS_IBF;
        } else {
            // Data straight to the keyboard: acknowledge.
            self.send_scancode(0xFA);
        }
    }

    fn read_data(&mut self) -> u8 {
        let data = self.output_buffer;
        if self.head != self.tail {
            self.output_buffer = self.buffer[self.tail];
            self.tail = (self.tail + 1) % BUFFER_SIZE;
        } else {
            self.status &= !STATUS_OBF;
        }
        if self.head != self.tail && self.command_byte & 1 != 0 {
            self.irq1.raise();
        }
        self.status &= !STATUS_OBF;
        data
    }
}

impl PortIoDevice for I8042 {
    fn read_u8(&mut self, port: u16) -> u8 {
        match port {
            0x64 => self.status,
            0x60 => self.read_data(),
            _ => 0xFF,
        }
    }

    fn write_u8(&mut self, port: u16, val: u8) {
        match port {
            0x64 => self.write_command(val),
            0x60 => self.write_data(val),
            _ => {}
        }
    }
}

/// System control port A: bit 1 is the alternate A20 gate.
pub struct Port92 {
    data: u8,
    a20: A20Gate,
}

impl Port92 {
    pub fn new(a20: A20Gate) -> Self {
        Self { data: 0, a20 }
    }
}

impl PortIoDevice for Port92 {
    fn read_u8(&mut self, _port: u16) -> u8 {
        self.data
    }

    fn write_u8(&mut self, _port: u16, val: u8) {
        self.data = val;
        self.a20.set(val & 0x02 != 0);
    }
}
