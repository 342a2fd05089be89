//! Intel 8254 programmable interval timer (ports 0x40-0x43).
//!
//! The subset a PC BIOS and DOS-era guests program: three channels with
//! lobyte/hibyte sequencing, count latching, and periodic modes (0-5, with
//! the 6/7 aliases folded to 2/3). Time advances only through
//! [`Pit::advance_ticks`]; channel 0 drives its [`IrqLine`] (IRQ0) once per
//! elapsed period.

use crate::io::PortIoDevice;
use crate::irq::{IrqLine, NoIrq};

/// PIT input clock frequency (Hz).
pub const PIT_HZ: u64 = 1_193_182;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LatchCount,
    LobyteOnly,
    HibyteOnly,
    LobyteHibyte,
}

impl AccessMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => AccessMode::LatchCount,
            0b01 => AccessMode::LobyteOnly,
            0b10 => AccessMode::HibyteOnly,
            _ => AccessMode::LobyteHibyte,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BytePhase {
    Low,
    High,
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    mode: u8,
    access: AccessMode,
    write_phase: BytePhase,
    read_phase: BytePhase,
    write_latch_low: u8,
    /// Reload value; 0 means not yet programmed, 0x0000 writes mean 65536.
    reload: u32,
    /// Ticks into the current period.
    phase_ticks: u32,
    latched: Option<u16>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            mode: 0,
            access: AccessMode::LobyteHibyte,
            write_phase: BytePhase::Low,
            read_phase: BytePhase::Low,
            write_latch_low: 0,
            reload: 0,
            phase_ticks: 0,
            latched: None,
        }
    }
}

impl Channel {
    fn set_mode(&mut self, access: AccessMode, mode_bits: u8) {
        self.access = access;
        self.mode = match mode_bits {
            6 => 2,
            7 => 3,
            m => m,
        };
        self.write_phase = BytePhase::Low;
        self.read_phase = BytePhase::Low;
        self.latched = None;
        self.phase_ticks = 0;
    }

    fn load_count(&mut self, raw: u16) {
        self.reload = if raw == 0 { 65_536 } else { raw as u32 };
        self.phase_ticks = 0;
    }

    fn current_count(&self) -> u16 {
        if self.reload == 0 {
            return 0;
        }
        let remaining = self.reload - self.phase_ticks;
        if remaining == 65_536 {
            0
        } else {
            remaining as u16
        }
    }

    fn latch(&mut self) {
        if self.latched.is_none() {
            self.latched = Some(self.current_count());
            self.read_phase = BytePhase::Low;
        }
    }

    fn write_data(&mut self, val: u8) {
        match self.access {
            AccessMode::LobyteOnly => self.load_count(val as u16),
            AccessMode::HibyteOnly => self.load_count((val as u16) << 8),
            _ => match self.write_phase {
                BytePhase::Low => {
                    self.write_latch_low = val;
                    self.write_phase = BytePhase::High;
                }
                BytePhase::High => {
                    self.load_count(((val as u16) << 8) | self.write_latch_low as u16);
                    self.write_phase = BytePhase::Low;
                }
            },
        }
    }

    fn read_data(&mut self) -> u8 {
        let value = self.latched.unwrap_or_else(|| self.current_count());
        match self.access {
            AccessMode::LobyteOnly => {
                self.latched = None;
                value as u8
            }
            AccessMode::HibyteOnly => {
                self.latched = None;
                (value >> 8) as u8
            }
            _ => match self.read_phase {
                BytePhase::Low => {
                    self.read_phase = BytePhase::High;
                    value as u8
                }
                BytePhase::High => {
                    self.read_phase = BytePhase::Low;
                    self.latched = None;
                    (value >> 8) as u8
                }
            },
        }
    }

    /// Advance by `ticks`; returns how many periods elapsed.
    fn advance(&mut self, ticks: u64) -> u64 {
        if self.reload == 0 {
            return 0;
        }
        let total = self.phase_ticks as u64 + ticks;
        let fired = total / self.reload as u64;
        self.phase_ticks = (total % self.reload as u64) as u32;
        fired
    }
}

pub struct Pit {
    channels: [Channel; 3],
    irq0: Box<dyn IrqLine>,
}

impl Default for Pit {
    fn default() -> Self {
        Self::new(Box::new(NoIrq))
    }
}

impl Pit {
    pub fn new(irq0: Box<dyn IrqLine>) -> Self {
        Self {
            channels: [Channel::default(); 3],
            irq0,
        }
    }

    /// Advance all channels by `ticks` input-clock ticks (1.193182 MHz),
    /// raising IRQ0 once per elapsed channel-0 period.
    pub fn advance_ticks(&mut self, ticks: u64) {
        let fired = self.channels[0].advance(ticks);
        for _ in 0..fired {
            self.irq0.raise();
        }
        self.channels[1].advance(ticks);
        self.channels[2].advance(ticks);
    }

    /// Channel-0 reload value, for hosts pacing their tick loop.
    pub fn channel0_reload(&self) -> u32 {
        self.channels[0].reload
    }
}

impl PortIoDevice for Pit {
    fn read_u8(&mut self, port: u16) -> u8 {
        match port {
            0x40..=0x42 => self.channels[(port - 0x40) as usize].read_data(),
            _ => 0xFF,
        }
    }

    fn write_u8(&mut self, port: u16, val: u8) {
        match port {
            0x40..=0x42 => self.channels[(port - 0x40) as usize].write_data(val),
            0x43 => {
                let channel = (val >> 6) as usize;
                if channel == 3 {
                    // 8254 read-back command: not modeled.
                    return;
                }
                let access = AccessMode::from_bits(val >> 4);
                if access == AccessMode::LatchCount {
                    self.channels[channel].latch();
                } else {
                    self.channels[channel].set_mode(access, (val >> 1) & 0x07);
                }
            }
            _ => {}
        }
    }
}
