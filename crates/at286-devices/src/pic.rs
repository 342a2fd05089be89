//! Dual Intel 8259A interrupt controller.
//!
//! Two cascaded 8-line chips: the master at ports 0x20/0x21 (vector offset
//! 0x08 until reprogrammed), the slave at 0xA0/0xA1 (offset 0x70), with the
//! slave cascaded onto master line 2. [`DualPic`] owns both chips so the
//! cascade is a plain method call rather than cross-references between them.

use std::cell::RefCell;
use std::rc::Rc;

use crate::io::PortIoDevice;
use crate::irq::IrqLine;

/// One 8259 chip.
#[derive(Debug, Clone, Default)]
pub struct Pic {
    pub imr: u8,
    pub irr: u8,
    pub isr: u8,
    pub icwstep: u8,
    pub icw: [u8; 5],
    pub ocw: [u8; 5],
    readmode: u8,
}

impl Pic {
    fn new(offset: u8) -> Self {
        let mut pic = Pic::default();
        // ICW2 holds the vector offset; seed it with the power-on default so
        // an unprogrammed controller still delivers sensible vectors.
        pic.icw[2] = offset;
        pic
    }

    /// Assert a request line. Lines masked by the IMR are dropped at assert
    /// time.
    fn raise(&mut self, line: u8) {
        self.irr |= (1 << line) & !self.imr;
    }

    fn pending(&self) -> bool {
        self.irr & !self.imr != 0
    }

    /// Acknowledge the highest-priority pending line (line 0 first) and
    /// return its vector. Returns 0 with no state change when nothing is
    /// pending.
    fn acknowledge(&mut self) -> Option<u8> {
        let ready = self.irr & !self.imr;
        for line in 0..8 {
            if ready & (1 << line) != 0 {
                self.irr &= !(1 << line);
                self.isr |= 1 << line;
                return Some((self.icw[2] & 0xF8) + line);
            }
        }
        None
    }

    fn read(&self, port: u16) -> u8 {
        if port & 1 == 0 {
            if self.readmode == 0 {
                self.irr
            } else {
                self.isr
            }
        } else {
            self.imr
        }
    }

    fn write(&mut self, port: u16, value: u8) {
        if port & 1 == 0 {
            if value & 0x10 != 0 {
                // ICW1 restarts initialization and clears the mask.
                self.imr = 0x00;
                self.icw[1] = value;
                self.icwstep = 2;
                self.readmode = 0;
            } else if value & 0x08 == 0 {
                // OCW2
                self.ocw[2] = value;
                match value & 0xE0 {
                    0x60 => {
                        // Specific EOI.
                        self.irr &= !(1 << (value & 0x07));
                        self.isr &= !(1 << (value & 0x07));
                    }
                    0x20 => {
                        // Non-specific EOI.
                        self.irr &= !self.isr;
                        self.isr = 0x00;
                    }
                    _ => {}
                }
            } else {
                // OCW3
                self.ocw[3] = value;
                if value & 0x02 != 0 {
                    self.readmode = value & 1;
                }
            }
        } else {
            match self.icwstep {
                2 => {
                    self.icw[2] = value;
                    self.icwstep = if self.icw[1] & 0x02 != 0 { 5 } else { 3 };
                }
                3 => {
                    self.icw[3] = value;
                    self.icwstep = if self.icw[1] & 0x01 != 0 { 4 } else { 5 };
                }
                4 => {
                    self.icw[4] = value;
                    self.icwstep = 5;
                }
                5 => self.imr = value,
                // Before ICW1 the data port is inert.
                _ => {}
            }
        }
    }
}

/// The cascaded master/slave pair.
#[derive(Debug, Clone)]
pub struct DualPic {
    master: Pic,
    slave: Pic,
}

impl Default for DualPic {
    fn default() -> Self {
        Self::new()
    }
}

impl DualPic {
    pub fn new() -> Self {
        Self {
            master: Pic::new(0x08),
            slave: Pic::new(0x70),
        }
    }

    /// Post IRQ 0..=15. Slave requests also assert master line 2.
    pub fn doirq(&mut self, irq: u8) {
        if irq < 8 {
            self.master.raise(irq);
        } else {
            self.slave.raise(irq - 8);
            self.master.raise(2);
        }
    }

    /// Whether the master reports an unmasked pending request.
    pub fn pending(&self) -> bool {
        self.master.pending()
    }

    /// Acknowledge the highest-priority pending request, cascading master
    /// line 2 into the slave, and return its vector.
    pub fn next_intr(&mut self) -> u8 {
        let ready = self.master.irr & !self.master.imr;
        for line in 0..8 {
            if ready & (1 << line) != 0 {
                if line == 2 {
                    return self.slave.acknowledge().unwrap_or(0);
                }
                self.master.irr &= !(1 << line);
                self.master.isr |= 1 << line;
                return (self.master.icw[2] & 0xF8) + line;
            }
        }
        0
    }

    /// Pending-check plus acknowledge in one step, for the CPU's external
    /// interrupt acceptance point.
    pub fn poll(&mut self) -> Option<u8> {
        if self.pending() {
            Some(self.next_intr())
        } else {
            None
        }
    }

    pub fn master(&self) -> &Pic {
        &self.master
    }

    pub fn slave(&self) -> &Pic {
        &self.slave
    }
}

impl PortIoDevice for DualPic {
    fn read_u8(&mut self, port: u16) -> u8 {
        match port {
            0x20 | 0x21 => self.master.read(port),
            0xA0 | 0xA1 => self.slave.read(port),
            _ => 0xFF,
        }
    }

    fn write_u8(&mut self, port: u16, val: u8) {
        match port {
            0x20 | 0x21 => self.master.write(port, val),
            0xA0 | 0xA1 => self.slave.write(port, val),
            _ => {}
        }
    }
}

/// [`IrqLine`] handle that posts a fixed IRQ number into a shared
/// [`DualPic`].
#[derive(Clone)]
pub struct PicIrqLine {
    pic: Rc<RefCell<DualPic>>,
    irq: u8,
}

impl PicIrqLine {
    pub fn new(pic: Rc<RefCell<DualPic>>, irq: u8) -> Self {
        Self { pic, irq }
    }
}

impl IrqLine for PicIrqLine {
    fn raise(&self) {
        self.pic.borrow_mut().doirq(self.irq);
    }
}
