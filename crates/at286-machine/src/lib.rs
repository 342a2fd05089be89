#![forbid(unsafe_code)]

//! The machine: single owner of the CPU, the memory map, and the chipset.
//!
//! Devices never hold references back into the CPU. They communicate through
//! the shared [`A20Gate`] and [`ResetLine`] and through IRQ lines into the
//! PIC; the CPU reaches them only via the [`Bus`] the machine assembles per
//! execution slice. The host paces wall-clock progress by choosing how many
//! instructions to run per slice and how many PIT ticks to advance between
//! slices.

pub mod memory;

use std::cell::RefCell;
use std::rc::Rc;

use at286_cpu_core::{Bus, Cpu, InterruptController};
use at286_devices::cmos::{Clock, Cmos, ManualClock};
use at286_devices::i8042::{I8042, Port92};
use at286_devices::io::IoPortBus;
use at286_devices::pic::{DualPic, PicIrqLine};
use at286_devices::pit::Pit;
use at286_devices::{A20Gate, ResetLine};
use log::info;
use memory::{MemoryMap, MEMORY_RANGE};

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("RAM size {0:#x} exceeds the 24-bit address space")]
    RamTooLarge(u32),
    #[error("BIOS image of {len:#x} bytes does not fit below {limit:#x}")]
    BiosTooLarge { len: usize, limit: u32 },
}

/// Construction-time knobs. `ram_size` covers conventional plus extended
/// memory as one flat allocation.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_size: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            // 640 KiB conventional + 15 MiB extended.
            ram_size: MEMORY_RANGE,
        }
    }
}

/// Memory map + port bus pair handed to the CPU for one slice.
struct MachineBus<'a> {
    mem: &'a mut MemoryMap,
    io: &'a mut IoPortBus,
    a20: &'a A20Gate,
}

impl Bus for MachineBus<'_> {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, val: u8) {
        self.mem.write_u8(addr, val);
    }

    fn io_read_u8(&mut self, port: u16) -> u8 {
        self.io.read_u8(port)
    }

    fn io_write_u8(&mut self, port: u16, val: u8) {
        self.io.write_u8(port, val);
    }

    fn a20_enabled(&self) -> bool {
        self.a20.enabled()
    }
}

/// Adapts the shared PIC to the CPU's external-interrupt contract.
struct PicController<'a>(&'a RefCell<DualPic>);

impl InterruptController for PicController<'_> {
    fn poll_interrupt(&mut self) -> Option<u8> {
        self.0.borrow_mut().poll()
    }
}

pub struct Machine {
    pub cpu: Cpu,
    mem: MemoryMap,
    io: IoPortBus,
    pic: Rc<RefCell<DualPic>>,
    pit: Rc<RefCell<Pit>>,
    kbc: Rc<RefCell<I8042>>,
    cmos: Rc<RefCell<Cmos>>,
    a20: A20Gate,
    reset: ResetLine,
    /// Cleared by the host to stop the outer loop.
    pub running: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        Self::with_clock(config, Box::new(ManualClock::new()))
    }

    pub fn with_clock(config: MachineConfig, clock: Box<dyn Clock>) -> Result<Self, MachineError> {
        if config.ram_size > MEMORY_RANGE {
            return Err(MachineError::RamTooLarge(config.ram_size));
        }

        let a20 = A20Gate::new();
        let reset = ResetLine::new();
        let mem = MemoryMap::new(config.ram_size, a20.clone());
        let mut io = IoPortBus::new();

        let pic = Rc::new(RefCell::new(DualPic::new()));
        io.register(0x20, 2, pic.clone());
        io.register(0xA0, 2, pic.clone());

        let pit = Rc::new(RefCell::new(Pit::new(Box::new(PicIrqLine::new(
            pic.clone(),
            0,
        )))));
        io.register(0x40, 4, pit.clone());

        let kbc = Rc::new(RefCell::new(I8042::new(
            Box::new(PicIrqLine::new(pic.clone(), 1)),
            a20.clone(),
            reset.clone(),
        )));
        io.register(0x60, 1, kbc.clone());
        io.register(0x64, 1, kbc.clone());

        let port92 = Rc::new(RefCell::new(Port92::new(a20.clone())));
        io.register(0x92, 1, port92);

        let cmos = Rc::new(RefCell::new(Cmos::new(clock)));
        io.register(0x70, 2, cmos.clone());

        Ok(Self {
            cpu: Cpu::new(),
            mem,
            io,
            pic,
            pit,
            kbc,
            cmos,
            a20,
            reset,
            running: true,
        })
    }

    /// Map a BIOS image so it ends at the top of the first megabyte, where
    /// the reset vector points.
    pub fn load_bios(&mut self, image: &[u8]) -> Result<(), MachineError> {
        let limit = 0x10_0000u32;
        if image.len() as u32 > limit {
            return Err(MachineError::BiosTooLarge {
                len: image.len(),
                limit,
            });
        }
        let base = limit - image.len() as u32;
        info!("BIOS image at {base:06X}, {} bytes", image.len());
        self.mem.map_rom(base, image.to_vec());
        Ok(())
    }

    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.mem
    }

    pub fn pic(&self) -> Rc<RefCell<DualPic>> {
        self.pic.clone()
    }

    pub fn keyboard(&self) -> Rc<RefCell<I8042>> {
        self.kbc.clone()
    }

    pub fn cmos(&self) -> Rc<RefCell<Cmos>> {
        self.cmos.clone()
    }

    pub fn a20(&self) -> A20Gate {
        self.a20.clone()
    }

    /// Post an external IRQ as a device would.
    pub fn raise_irq(&mut self, irq: u8) {
        self.pic.borrow_mut().doirq(irq);
    }

    /// Advance the PIT between instruction batches.
    pub fn tick_pit(&mut self, ticks: u64) {
        self.pit.borrow_mut().advance_ticks(ticks);
    }

    /// One outer-loop iteration: service a pending reset, accept one external
    /// interrupt, then execute `instructions` dispatcher iterations.
    pub fn run_slice(&mut self, instructions: u32) {
        if self.reset.take() {
            info!("system reset requested");
            self.cpu.reset();
            self.a20.set(false);
        }

        let mut bus = MachineBus {
            mem: &mut self.mem,
            io: &mut self.io,
            a20: &self.a20,
        };
        self.cpu
            .interrupt_check(&mut bus, &mut PicController(&self.pic));
        self.cpu.run(&mut bus, instructions);
    }

    /// Single-step helper for tests and debuggers.
    pub fn step(&mut self) -> u32 {
        let mut bus = MachineBus {
            mem: &mut self.mem,
            io: &mut self.io,
            a20: &self.a20,
        };
        self.cpu.step(&mut bus)
    }
}
