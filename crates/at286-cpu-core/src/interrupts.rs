//! Interrupt delivery: software/hardware vectors, fault nesting, and the
//! external-interrupt acceptance point.
//!
//! All architectural faults funnel through [`Cpu::intcall`]. A fault raised
//! while another fault gate is being entered escalates to double fault
//! (vector 8); a double fault in that window performs a full reset (the
//! triple-fault path).

use log::{debug, error, warn};

use crate::bus::Bus;
use crate::state::{Cpu, Seg};

/// Host callback registered for an interrupt vector. When present it preempts
/// the normal gate entry entirely.
pub type InterruptHook = Box<dyn FnMut(&mut Cpu, &mut dyn Bus, u8)>;

/// External interrupt controller, sampled between instructions.
///
/// `poll_interrupt` returns the next pending unmasked vector, acknowledging
/// it in the same call, or `None` when no line is pending. This folds the
/// pending-check plus acknowledge sequence of the 8259 contract into one
/// operation so the controller's priority resolution happens exactly once.
pub trait InterruptController {
    fn poll_interrupt(&mut self) -> Option<u8>;
}

impl Cpu {
    pub fn register_interrupt_hook(&mut self, vector: u8, hook: InterruptHook) {
        self.hooks[vector as usize] = Some(hook);
    }

    pub fn clear_interrupt_hook(&mut self, vector: u8) {
        self.hooks[vector as usize] = None;
    }

    /// Accept one external interrupt if permitted: not single-stepping, IF
    /// set, and the controller reporting a pending line. Acceptance clears
    /// the halt latch.
    pub fn interrupt_check<B: Bus, C: InterruptController>(&mut self, bus: &mut B, ctrl: &mut C) {
        if !self.trap_toggle && self.flags.ifl {
            if let Some(vector) = ctrl.poll_interrupt() {
                self.halted = false;
                self.intcall(bus, vector);
            }
        }
    }

    /// Deliver interrupt `vector` through the real-mode IVT or the
    /// protected-mode IDT, with fault-nesting escalation: a fault while
    /// another fault gate is being entered becomes a double fault (vector 8),
    /// and any fault while the double-fault gate is being entered resets the
    /// machine.
    pub fn intcall<B: Bus>(&mut self, bus: &mut B, vector: u8) {
        if self.delivering_double_fault {
            error!("triple fault (INT {vector} during double-fault entry), resetting");
            self.reset();
            return;
        }

        if self.fault_in_flight {
            if vector == 8 {
                error!("triple fault, resetting");
                self.reset();
                return;
            }
            warn!("double fault: INT {vector} while another fault is in flight");
            self.delivering_double_fault = true;
            self.deliver(bus, 8);
            self.delivering_double_fault = false;
            self.fault_in_flight = false;
            return;
        }

        if matches!(vector, 8 | 10 | 11 | 12 | 13) {
            self.fault_in_flight = true;
        }

        self.deliver(bus, vector);
    }

    fn deliver<B: Bus>(&mut self, bus: &mut B, vector: u8) {

        // Extended-memory BIOS services are handled in place: 286 BIOS images
        // are not bundled, and HIMEM-style guests need exactly these two.
        if vector == 0x15 {
            match self.regs.ah() {
                0x88 => {
                    debug!("INT 15h AH=88h: extended memory size");
                    self.regs.set_ax(15360);
                    self.flags.cf = false;
                    return;
                }
                0x87 => {
                    self.int15_block_move(bus);
                    return;
                }
                _ => {}
            }
        }

        if self.hooks[vector as usize].is_some() {
            let mut hook = self.hooks[vector as usize].take().unwrap();
            hook(self, bus, vector);
            if self.hooks[vector as usize].is_none() {
                self.hooks[vector as usize] = Some(hook);
            }
            self.fault_in_flight = false;
            return;
        }

        if self.protected_mode {
            self.intcall_protected(bus, vector);
        } else {
            let flags_to_push = self.flags.to_word();
            self.flags.ifl = false;
            self.flags.tf = false;
            self.push(bus, flags_to_push);
            self.push(bus, self.seg(Seg::Cs));
            self.push(bus, self.ip);
            let vec_off = vector as u16 * 4;
            self.segs[Seg::Cs as usize] = self.get_mem16(bus, 0, vec_off + 2);
            self.ip = self.get_mem16(bus, 0, vec_off);
            self.fault_in_flight = false;
        }
    }

    fn intcall_protected<B: Bus>(&mut self, bus: &mut B, vector: u8) {
        let gate_offset = vector as u32 * 8;
        if gate_offset + 7 > self.idtr.limit as u32 {
            warn!("GP: INT {vector} outside IDT limit, escalating to double fault");
            self.intcall(bus, 8);
            return;
        }

        let gate_addr = self.idtr.base + gate_offset;
        let access = bus.read_u8(gate_addr + 5);

        if access & 0x80 == 0 {
            warn!("NP(11): gate for INT {vector} not present");
            self.intcall(bus, 11);
            return;
        }

        let new_ip = bus.read_u16(gate_addr);
        let new_cs = bus.read_u16(gate_addr + 2);
        let gate_type = access & 0x1F;

        let Some((_, _, target_access)) = self.descriptor_info(bus, new_cs) else {
            warn!("GP(13): bad CS selector {new_cs:04X} in gate for INT {vector}");
            self.intcall(bus, 13);
            return;
        };

        let target_dpl = (target_access >> 5) & 3;
        let cpl = self.cpl();

        let old_flags = self.flags.to_word();
        let old_cs = self.seg(Seg::Cs);
        let old_ip = self.ip;
        let pushes_error_code = vector == 8 || (10..=13).contains(&vector);

        if target_dpl < cpl {
            if !self.tr_cache.valid {
                warn!("GP: no valid TSS for privilege change on INT {vector}");
                self.intcall(bus, 8);
                return;
            }
            let new_sp = self.tr_cache.sp0;
            let new_ss = self.tr_cache.ss0;
            let old_ss = self.seg(Seg::Ss);
            let old_sp = self.regs.sp();

            self.load_descriptor(bus, Seg::Ss, new_ss);
            self.segs[Seg::Ss as usize] = new_ss;
            self.regs.set_sp(new_sp);

            self.push(bus, old_ss);
            self.push(bus, old_sp);
            self.push(bus, old_flags);
            self.push(bus, old_cs);
            self.push(bus, old_ip);
            if pushes_error_code {
                self.push(bus, 0);
            }
        } else {
            self.push(bus, old_flags);
            self.push(bus, old_cs);
            self.push(bus, old_ip);
            if pushes_error_code {
                self.push(bus, 0);
            }
        }

        if !self.load_descriptor(bus, Seg::Cs, new_cs) {
            // The failed load has already escalated; do not clobber the
            // redirected CS:IP.
            return;
        }
        self.segs[Seg::Cs as usize] = new_cs;
        self.ip = new_ip;

        self.flags.tf = false;
        if gate_type == 0x06 {
            self.flags.ifl = false;
        }

        self.fault_in_flight = false;
    }

    /// INT 15h AH=87h: block move through a caller-supplied descriptor table
    /// at ES:SI. Only the 24-bit bases at offsets 0x0A and 0x12 are honored.
    fn int15_block_move<B: Bus>(&mut self, bus: &mut B) {
        let count = self.regs.cx();
        let num_bytes = count as u32 * 2;
        let table_addr = self.linear(bus, self.seg(Seg::Es), self.regs.si());
        let source_base = bus.read_u8(table_addr + 10) as u32
            | (bus.read_u8(table_addr + 11) as u32) << 8
            | (bus.read_u8(table_addr + 12) as u32) << 16;
        let dest_base = bus.read_u8(table_addr + 18) as u32
            | (bus.read_u8(table_addr + 19) as u32) << 8
            | (bus.read_u8(table_addr + 20) as u32) << 16;
        debug!("INT 15h AH=87h: move {count} words {source_base:06X} -> {dest_base:06X}");
        for i in 0..num_bytes {
            let b = bus.read_u8(source_base + i);
            bus.write_u8(dest_base + i, b);
        }
        self.flags.cf = false;
        self.regs.set_ah(0x00);
        self.flags.zf = true;
    }
}
