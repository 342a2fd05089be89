#![forbid(unsafe_code)]

//! 80286-class CPU core.
//!
//! The crate is centered around [`state::Cpu`], which holds every piece of
//! architecturally visible state (register file, segment descriptor caches,
//! MSW, table registers, x87 stack). Execution is driven by
//! [`state::Cpu::step`] / [`state::Cpu::run`] against a host-supplied
//! [`bus::Bus`], which provides byte-granular physical memory at 24-bit
//! addresses plus the 16-bit I/O port space.
//!
//! Architectural faults never surface as Rust errors: they are delivered as
//! vectored interrupts through the dispatcher in [`interrupts`], with nested
//! faults escalating to double fault and double faults during delivery
//! escalating to a full reset.

mod alu;
mod decode;
mod exec;
mod segmentation;

pub mod bus;
pub mod interrupts;
pub mod state;
pub mod x87;

pub use bus::{Bus, FlatTestBus};
pub use interrupts::{InterruptController, InterruptHook};
pub use state::{Cpu, DescriptorCache, Flags, RegisterFile, Seg};
pub use x87::Fpu;
