//! The fetch/decode/dispatch loop.
//!
//! One `step` is one iteration of the dispatcher: deliver a delayed
//! single-step trap, skip if halted, collect prefixes, then execute exactly
//! one instruction. String instructions under a repetition prefix execute a
//! single transfer and rewind IP so external interrupts can preempt long
//! moves between iterations.

use log::{debug, warn};

use crate::alu;
use crate::bus::Bus;
use crate::decode::ModRm;
use crate::state::{signext, signext32, Cpu, RepPrefix, Seg, AX, BP, BX, CX, DI, DX, SI, SP};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringOp {
    MovsB,
    MovsW,
    CmpsB,
    CmpsW,
    StosB,
    StosW,
    LodsB,
    LodsW,
    ScasB,
    ScasW,
    InsB,
    InsW,
    OutsB,
    OutsW,
}

impl StringOp {
    fn word(self) -> bool {
        matches!(
            self,
            StringOp::MovsW
                | StringOp::CmpsW
                | StringOp::StosW
                | StringOp::LodsW
                | StringOp::ScasW
                | StringOp::InsW
                | StringOp::OutsW
        )
    }

    fn compares(self) -> bool {
        matches!(
            self,
            StringOp::CmpsB | StringOp::CmpsW | StringOp::ScasB | StringOp::ScasW
        )
    }
}

impl Cpu {
    pub(crate) fn readrm8<B: Bus>(&mut self, bus: &mut B, m: &ModRm) -> u8 {
        if m.is_memory() {
            let addr = self.ea(bus, m);
            bus.read_u8(addr)
        } else {
            self.regs.get8(m.rm as usize)
        }
    }

    pub(crate) fn readrm16<B: Bus>(&mut self, bus: &mut B, m: &ModRm) -> u16 {
        if m.is_memory() {
            let addr = self.ea(bus, m);
            bus.read_u16(addr)
        } else {
            self.regs.get16(m.rm as usize)
        }
    }

    pub(crate) fn writerm8<B: Bus>(&mut self, bus: &mut B, m: &ModRm, val: u8) {
        if m.is_memory() {
            let addr = self.ea(bus, m);
            bus.write_u8(addr, val);
        } else {
            self.regs.set8(m.rm as usize, val);
        }
    }

    pub(crate) fn writerm16<B: Bus>(&mut self, bus: &mut B, m: &ModRm, val: u16) {
        if m.is_memory() {
            let addr = self.ea(bus, m);
            bus.write_u16(addr, val);
        } else {
            self.regs.set16(m.rm as usize, val);
        }
    }

    pub(crate) fn push<B: Bus>(&mut self, bus: &mut B, val: u16) {
        let sp = self.regs.sp().wrapping_sub(2);
        self.regs.set_sp(sp);
        self.put_mem16(bus, self.seg(Seg::Ss), sp, val);
    }

    pub(crate) fn pop<B: Bus>(&mut self, bus: &mut B) -> u16 {
        let sp = self.regs.sp();
        let val = self.get_mem16(bus, self.seg(Seg::Ss), sp);
        self.regs.set_sp(sp.wrapping_add(2));
        val
    }

    /// Execute up to `count` dispatcher iterations. A string-instruction
    /// transfer consumes two iterations, everything else one.
    pub fn run<B: Bus>(&mut self, bus: &mut B, count: u32) {
        let mut executed = 0u32;
        while executed < count {
            executed += self.step(bus);
        }
    }

    /// One dispatcher iteration. Returns the number of iterations consumed.
    pub fn step<B: Bus>(&mut self, bus: &mut B) -> u32 {
        if self.trap_toggle {
            self.intcall(bus, 1);
        }
        self.trap_toggle = self.flags.tf;

        if self.halted {
            return 1;
        }

        self.rep = RepPrefix::None;
        self.seg_override = false;
        self.use_seg = self.seg(Seg::Ds);
        self.first_ip = self.ip;

        let mut prefix_count = 0u8;
        let opcode = loop {
            self.saved_cs = self.seg(Seg::Cs);
            self.saved_ip = self.ip;
            let byte = self.fetch8(bus);

            prefix_count += 1;
            if prefix_count > 10 {
                self.intcall(bus, 13);
                break byte;
            }

            match byte {
                0x2E => {
                    self.use_seg = self.seg(Seg::Cs);
                    self.seg_override = true;
                }
                0x3E => {
                    self.use_seg = self.seg(Seg::Ds);
                    self.seg_override = true;
                }
                0x26 => {
                    self.use_seg = self.seg(Seg::Es);
                    self.seg_override = true;
                }
                0x36 => {
                    self.use_seg = self.seg(Seg::Ss);
                    self.seg_override = true;
                }
                // LOCK: accepted, no effect.
                0xF0 => {}
                0xF3 => self.rep = RepPrefix::Repe,
                0xF2 => self.rep = RepPrefix::Repne,
                _ => break byte,
            }
        };

        self.total_exec += 1;
        self.dispatch(bus, opcode)
    }

    fn apply8(&mut self, family: u8, a: u8, b: u8) -> u8 {
        let fl = &mut self.flags;
        match family {
            0 => alu::add8(fl, a, b),
            1 => alu::or8(fl, a, b),
            2 => alu::adc8(fl, a, b),
            3 => alu::sbb8(fl, a, b),
            4 => alu::and8(fl, a, b),
            5 => alu::sub8(fl, a, b),
            6 => alu::xor8(fl, a, b),
            _ => {
                alu::sub8(fl, a, b);
                a
            }
        }
    }

    fn apply16(&mut self, family: u8, a: u16, b: u16) -> u16 {
        let fl = &mut self.flags;
        match family {
            0 => alu::add16(fl, a, b),
            1 => alu::or16(fl, a, b),
            2 => alu::adc16(fl, a, b),
            3 => alu::sbb16(fl, a, b),
            4 => alu::and16(fl, a, b),
            5 => alu::sub16(fl, a, b),
            6 => alu::xor16(fl, a, b),
            _ => {
                alu::sub16(fl, a, b);
                a
            }
        }
    }

    /// The eight basic ALU families across their six addressing forms
    /// (opcodes 0x00-0x3D, skipping the segment push/pop and BCD slots).
    fn exec_alu_block<B: Bus>(&mut self, bus: &mut B, opcode: u8) {
        let family = (opcode >> 3) & 7;
        match opcode & 7 {
            0 => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm8(bus, &m);
                let b = self.regs.get8(m.reg);
                let r = self.apply8(family, a, b);
                if family != 7 {
                    self.writerm8(bus, &m, r);
                }
            }
            1 => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm16(bus, &m);
                let b = self.regs.get16(m.reg);
                let r = self.apply16(family, a, b);
                if family != 7 {
                    self.writerm16(bus, &m, r);
                }
            }
            2 => {
                let m = self.fetch_modrm(bus);
                let a = self.regs.get8(m.reg);
                let b = self.readrm8(bus, &m);
                let r = self.apply8(family, a, b);
                if family != 7 {
                    self.regs.set8(m.reg, r);
                }
            }
            3 => {
                let m = self.fetch_modrm(bus);
                let a = self.regs.get16(m.reg);
                let b = self.readrm16(bus, &m);
                let r = self.apply16(family, a, b);
                if family != 7 {
                    self.regs.set16(m.reg, r);
                }
            }
            4 => {
                let a = self.regs.al();
                let b = self.fetch8(bus);
                let r = self.apply8(family, a, b);
                if family != 7 {
                    self.regs.set_al(r);
                }
            }
            _ => {
                let a = self.regs.ax();
                let b = self.fetch16(bus);
                let r = self.apply16(family, a, b);
                if family != 7 {
                    self.regs.set_ax(r);
                }
            }
        }
    }

    fn jcc<B: Bus>(&mut self, bus: &mut B, cond: bool) {
        let disp = signext(self.fetch8(bus));
        if cond {
            self.ip = self.ip.wrapping_add(disp);
        }
    }

    fn pop_seg<B: Bus>(&mut self, bus: &mut B, seg: Seg) {
        let sel = self.pop(bus);
        if self.protected_mode {
            self.load_descriptor(bus, seg, sel);
        }
        self.segs[seg as usize] = sel;
    }

    fn dispatch<B: Bus>(&mut self, bus: &mut B, opcode: u8) -> u32 {
        match opcode {
            0x00..=0x05
            | 0x08..=0x0D
            | 0x10..=0x15
            | 0x18..=0x1D
            | 0x20..=0x25
            | 0x28..=0x2D
            | 0x30..=0x35
            | 0x38..=0x3D => self.exec_alu_block(bus, opcode),

            0x06 => {
                let v = self.seg(Seg::Es);
                self.push(bus, v);
            }
            0x07 => self.pop_seg(bus, Seg::Es),
            0x0E => {
                let v = self.seg(Seg::Cs);
                self.push(bus, v);
            }
            0x0F => self.exec_0f(bus),
            0x16 => {
                let v = self.seg(Seg::Ss);
                self.push(bus, v);
            }
            0x17 => self.pop_seg(bus, Seg::Ss),
            0x1E => {
                let v = self.seg(Seg::Ds);
                self.push(bus, v);
            }
            0x1F => self.pop_seg(bus, Seg::Ds),

            0x27 => {
                // DAA
                let old_al = self.regs.al();
                if (self.regs.al() & 0x0F) > 9 || self.flags.af {
                    let sum = self.regs.al() as u16 + 0x06;
                    self.regs.set_al(sum as u8);
                    if sum & 0xFF00 != 0 {
                        self.flags.cf = true;
                    }
                    if (sum & 0x000F) < (old_al & 0x0F) as u16 {
                        self.flags.af = true;
                    }
                }
                if (self.regs.al() & 0xF0) > 0x90 || self.flags.cf {
                    let sum = self.regs.al() as u16 + 0x60;
                    self.regs.set_al(sum as u8);
                    self.flags.cf = sum & 0xFF00 != 0;
                }
                alu::szp8(&mut self.flags, self.regs.al());
            }
            0x2F => {
                // DAS
                let old_al = self.regs.al();
                if (self.regs.al() & 0x0F) > 9 || self.flags.af {
                    let diff = (self.regs.al() as u16).wrapping_sub(0x06);
                    self.regs.set_al(diff as u8);
                    if diff & 0xFF00 != 0 {
                        self.flags.cf = true;
                    }
                    if (diff & 0x000F) >= (old_al & 0x0F) as u16 {
                        self.flags.af = true;
                    }
                }
                if (self.regs.al() & 0xF0) > 0x90 || self.flags.cf {
                    let diff = (self.regs.al() as u16).wrapping_sub(0x60);
                    self.regs.set_al(diff as u8);
                    self.flags.cf = diff & 0xFF00 != 0;
                }
                alu::szp8(&mut self.flags, self.regs.al());
            }
            0x37 => {
                // AAA
                if (self.regs.al() & 0x0F) > 9 || self.flags.af {
                    self.regs.set_ax(self.regs.ax().wrapping_add(0x106));
                    self.flags.af = true;
                    self.flags.cf = true;
                } else {
                    self.flags.af = false;
                    self.flags.cf = false;
                }
                self.regs.set_al(self.regs.al() & 0x0F);
            }
            0x3F => {
                // AAS
                if (self.regs.al() & 0x0F) > 9 || self.flags.af {
                    self.regs.set_ax(self.regs.ax().wrapping_sub(6));
                    self.regs.set_ah(self.regs.ah().wrapping_sub(1));
                    self.flags.af = true;
                    self.flags.cf = true;
                } else {
                    self.flags.af = false;
                    self.flags.cf = false;
                }
                self.regs.set_al(self.regs.al() & 0x0F);
            }

            0x40..=0x47 => {
                let r = (opcode & 7) as usize;
                let oldcf = self.flags.cf;
                let v = alu::add16(&mut self.flags, self.regs.get16(r), 1);
                self.flags.cf = oldcf;
                self.regs.set16(r, v);
            }
            0x48..=0x4F => {
                let r = (opcode & 7) as usize;
                let oldcf = self.flags.cf;
                let v = alu::sub16(&mut self.flags, self.regs.get16(r), 1);
                self.flags.cf = oldcf;
                self.regs.set16(r, v);
            }
            0x50..=0x57 => {
                let v = self.regs.get16((opcode & 7) as usize);
                self.push(bus, v);
            }
            0x58..=0x5F => {
                let v = self.pop(bus);
                self.regs.set16((opcode & 7) as usize, v);
            }

            0x60 => {
                // PUSHA pushes the pre-instruction SP (documented 80186
                // behavior).
                let old_sp = self.regs.sp();
                for v in [
                    self.regs.ax(),
                    self.regs.cx(),
                    self.regs.dx(),
                    self.regs.bx(),
                    old_sp,
                    self.regs.bp(),
                    self.regs.si(),
                    self.regs.di(),
                ] {
                    self.push(bus, v);
                }
            }
            0x61 => {
                // POPA discards the saved SP slot.
                let di = self.pop(bus);
                self.regs.set_di(di);
                let si = self.pop(bus);
                self.regs.set_si(si);
                let bp = self.pop(bus);
                self.regs.set_bp(bp);
                self.regs.set_sp(self.regs.sp().wrapping_add(2));
                let bx = self.pop(bus);
                self.regs.set_bx(bx);
                let dx = self.pop(bus);
                self.regs.set_dx(dx);
                let cx = self.pop(bus);
                self.regs.set_cx(cx);
                let ax = self.pop(bus);
                self.regs.set_ax(ax);
            }
            0x62 => {
                // BOUND. The bounds are re-read through ea>>4 : ea&15 as a
                // segment:offset pair; kept as-is (see DESIGN.md).
                let m = self.fetch_modrm(bus);
                let mut ea = self.ea(bus, &m);
                let idx = signext32(self.regs.get16(m.reg));
                let lower = self.get_mem16(bus, (ea >> 4) as u16, (ea & 15) as u16);
                if idx < signext32(lower) {
                    self.intcall(bus, 5);
                } else {
                    ea += 2;
                    let upper = self.get_mem16(bus, (ea >> 4) as u16, (ea & 15) as u16);
                    if idx > signext32(upper) {
                        self.intcall(bus, 5);
                    }
                }
            }
            0x63 => {
                // ARPL
                if !self.protected_mode {
                    self.intcall(bus, 6);
                } else {
                    let m = self.fetch_modrm(bus);
                    let dst = self.readrm16(bus, &m);
                    let src = self.regs.get16(m.reg);
                    if src & 0xFFFC == 0 {
                        self.intcall(bus, 13);
                    } else if (dst & 3) < (src & 3) {
                        self.flags.zf = true;
                        self.writerm16(bus, &m, (dst & 0xFFFC) | (src & 3));
                    } else {
                        self.flags.zf = false;
                    }
                }
            }

            0x68 => {
                let v = self.fetch16(bus);
                self.push(bus, v);
            }
            0x69 | 0x6B => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm16(bus, &m) as i16 as i32;
                let b = if opcode == 0x69 {
                    self.fetch16(bus) as i16 as i32
                } else {
                    signext(self.fetch8(bus)) as i16 as i32
                };
                let product = a.wrapping_mul(b) as u32;
                self.regs.set16(m.reg, product as u16);
                let overflow = product & 0xFFFF_0000 != 0;
                self.flags.cf = overflow;
                self.flags.of = overflow;
            }
            0x6A => {
                let v = signext(self.fetch8(bus));
                self.push(bus, v);
            }
            0x6C => return self.exec_string(bus, StringOp::InsB),
            0x6D => return self.exec_string(bus, StringOp::InsW),
            0x6E => return self.exec_string(bus, StringOp::OutsB),
            0x6F => return self.exec_string(bus, StringOp::OutsW),

            0x70 => {
                let c = self.flags.of;
                self.jcc(bus, c);
            }
            0x71 => {
                let c = !self.flags.of;
                self.jcc(bus, c);
            }
            0x72 => {
                let c = self.flags.cf;
                self.jcc(bus, c);
            }
            0x73 => {
                let c = !self.flags.cf;
                self.jcc(bus, c);
            }
            0x74 => {
                let c = self.flags.zf;
                self.jcc(bus, c);
            }
            0x75 => {
                let c = !self.flags.zf;
                self.jcc(bus, c);
            }
            0x76 => {
                let c = self.flags.cf || self.flags.zf;
                self.jcc(bus, c);
            }
            0x77 => {
                let c = !self.flags.cf && !self.flags.zf;
                self.jcc(bus, c);
            }
            0x78 => {
                let c = self.flags.sf;
                self.jcc(bus, c);
            }
            0x79 => {
                let c = !self.flags.sf;
                self.jcc(bus, c);
            }
            0x7A => {
                let c = self.flags.pf;
                self.jcc(bus, c);
            }
            0x7B => {
                let c = !self.flags.pf;
                self.jcc(bus, c);
            }
            0x7C => {
                let c = self.flags.sf != self.flags.of;
                self.jcc(bus, c);
            }
            0x7D => {
                let c = self.flags.sf == self.flags.of;
                self.jcc(bus, c);
            }
            0x7E => {
                let c = self.flags.sf != self.flags.of || self.flags.zf;
                self.jcc(bus, c);
            }
            0x7F => {
                let c = !self.flags.zf && self.flags.sf == self.flags.of;
                self.jcc(bus, c);
            }

            0x80 | 0x82 => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm8(bus, &m);
                let b = self.fetch8(bus);
                let r = self.apply8(m.reg as u8, a, b);
                if m.reg != 7 {
                    self.writerm8(bus, &m, r);
                }
            }
            0x81 | 0x83 => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm16(bus, &m);
                let b = if opcode == 0x81 {
                    self.fetch16(bus)
                } else {
                    signext(self.fetch8(bus))
                };
                let r = self.apply16(m.reg as u8, a, b);
                if m.reg != 7 {
                    self.writerm16(bus, &m, r);
                }
            }

            0x84 => {
                let m = self.fetch_modrm(bus);
                let a = self.regs.get8(m.reg);
                let b = self.readrm8(bus, &m);
                alu::and8(&mut self.flags, a, b);
            }
            0x85 => {
                let m = self.fetch_modrm(bus);
                let a = self.regs.get16(m.reg);
                let b = self.readrm16(bus, &m);
                alu::and16(&mut self.flags, a, b);
            }
            0x86 => {
                let m = self.fetch_modrm(bus);
                let old = self.regs.get8(m.reg);
                let v = self.readrm8(bus, &m);
                self.regs.set8(m.reg, v);
                self.writerm8(bus, &m, old);
            }
            0x87 => {
                let m = self.fetch_modrm(bus);
                let old = self.regs.get16(m.reg);
                let v = self.readrm16(bus, &m);
                self.regs.set16(m.reg, v);
                self.writerm16(bus, &m, old);
            }
            0x88 => {
                let m = self.fetch_modrm(bus);
                let v = self.regs.get8(m.reg);
                self.writerm8(bus, &m, v);
            }
            0x89 => {
                let m = self.fetch_modrm(bus);
                let v = self.regs.get16(m.reg);
                self.writerm16(bus, &m, v);
            }
            0x8A => {
                let m = self.fetch_modrm(bus);
                let v = self.readrm8(bus, &m);
                self.regs.set8(m.reg, v);
            }
            0x8B => {
                let m = self.fetch_modrm(bus);
                let v = self.readrm16(bus, &m);
                self.regs.set16(m.reg, v);
            }
            0x8C => {
                let m = self.fetch_modrm(bus);
                let v = self.seg(Seg::from_index(m.reg));
                self.writerm16(bus, &m, v);
            }
            0x8D => {
                let m = self.fetch_modrm(bus);
                let ea = self.ea(bus, &m);
                let v = ea.wrapping_sub((self.use_seg as u32) << 4) as u16;
                self.regs.set16(m.reg, v);
            }
            0x8E => {
                let m = self.fetch_modrm(bus);
                let sel = self.readrm16(bus, &m);
                let seg = Seg::from_index(m.reg);
                if self.protected_mode {
                    self.load_descriptor(bus, seg, sel);
                }
                self.segs[seg as usize] = sel;
            }
            0x8F => {
                let m = self.fetch_modrm(bus);
                let v = self.pop(bus);
                self.writerm16(bus, &m, v);
            }

            0x90 => {}
            0x91..=0x97 => {
                let r = (opcode & 7) as usize;
                let t = self.regs.get16(r);
                self.regs.set16(r, self.regs.ax());
                self.regs.set_ax(t);
            }

            0x98 => {
                // CBW
                let ah = if self.regs.al() & 0x80 != 0 { 0xFF } else { 0 };
                self.regs.set_ah(ah);
            }
            0x99 => {
                // CWD
                let dx = if self.regs.ah() & 0x80 != 0 { 0xFFFF } else { 0 };
                self.regs.set_dx(dx);
            }
            0x9A => {
                // CALL far
                let new_ip = self.fetch16(bus);
                let new_cs = self.fetch16(bus);
                let cs = self.seg(Seg::Cs);
                self.push(bus, cs);
                self.push(bus, self.ip);
                self.ip = new_ip;
                self.segs[Seg::Cs as usize] = new_cs;
                if self.protected_mode {
                    self.load_descriptor(bus, Seg::Cs, new_cs);
                }
            }
            0x9B => {} // WAIT
            0x9C => {
                let flags = self.flags.to_word();
                if self.protected_mode {
                    self.push(bus, flags);
                } else {
                    self.push(bus, flags & 0x0FFF);
                }
            }
            0x9D => {
                let mut new_flags = self.pop(bus);
                let mut old_flags = self.flags.to_word();
                let cpl = self.cpl();
                let iopl = ((old_flags >> 12) & 3) as u8;
                if self.protected_mode {
                    if cpl > iopl {
                        if new_flags & 0x0200 != 0 {
                            old_flags |= 0x0200;
                        } else {
                            old_flags &= !0x0200;
                        }
                        new_flags = (new_flags & !0x0200) | (old_flags & 0x0200);
                    }
                    if cpl != 0 {
                        new_flags = (new_flags & !0x3000) | (old_flags & 0x3000);
                    }
                    new_flags &= 0x72FF;
                    new_flags |= 0x0002;
                } else {
                    new_flags &= 0x72FF;
                    new_flags |= 0xF002;
                }
                self.flags.from_word(new_flags);
            }
            0x9E => {
                let w = (self.flags.to_word() & 0xFF00) | self.regs.ah() as u16;
                self.flags.from_word(w);
            }
            0x9F => {
                let v = (self.flags.to_word() & 0xFF) as u8;
                self.regs.set_ah(v);
            }

            0xA0 => {
                let off = self.fetch16(bus);
                let v = self.get_mem8(bus, self.use_seg, off);
                self.regs.set_al(v);
            }
            0xA1 => {
                let off = self.fetch16(bus);
                let v = self.get_mem16(bus, self.use_seg, off);
                self.regs.set_ax(v);
            }
            0xA2 => {
                let off = self.fetch16(bus);
                let v = self.regs.al();
                self.put_mem8(bus, self.use_seg, off, v);
            }
            0xA3 => {
                let off = self.fetch16(bus);
                let v = self.regs.ax();
                self.put_mem16(bus, self.use_seg, off, v);
            }
            0xA4 => return self.exec_string(bus, StringOp::MovsB),
            0xA5 => return self.exec_string(bus, StringOp::MovsW),
            0xA6 => return self.exec_string(bus, StringOp::CmpsB),
            0xA7 => return self.exec_string(bus, StringOp::CmpsW),
            0xA8 => {
                let a = self.regs.al();
                let b = self.fetch8(bus);
                alu::and8(&mut self.flags, a, b);
            }
            0xA9 => {
                let a = self.regs.ax();
                let b = self.fetch16(bus);
                alu::and16(&mut self.flags, a, b);
            }
            0xAA => return self.exec_string(bus, StringOp::StosB),
            0xAB => return self.exec_string(bus, StringOp::StosW),
            0xAC => return self.exec_string(bus, StringOp::LodsB),
            0xAD => return self.exec_string(bus, StringOp::LodsW),
            0xAE => return self.exec_string(bus, StringOp::ScasB),
            0xAF => return self.exec_string(bus, StringOp::ScasW),

            0xB0..=0xB7 => {
                let v = self.fetch8(bus);
                self.regs.set8((opcode & 7) as usize, v);
            }
            0xB8..=0xBF => {
                let v = self.fetch16(bus);
                self.regs.set16((opcode & 7) as usize, v);
            }

            0xC0 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm8(bus, &m);
                let count = self.fetch8(bus);
                let r = alu::grp2_8(&mut self.flags, m.reg, val, count);
                self.writerm8(bus, &m, r);
            }
            0xC1 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm16(bus, &m);
                let count = self.fetch8(bus);
                let r = alu::grp2_16(&mut self.flags, m.reg, val, count);
                self.writerm16(bus, &m, r);
            }
            0xC2 => {
                let imm = self.get_mem16(bus, self.seg(Seg::Cs), self.ip);
                self.ip = self.pop(bus);
                self.regs.set_sp(self.regs.sp().wrapping_add(imm));
            }
            0xC3 => self.ip = self.pop(bus),
            0xC4 => {
                let m = self.fetch_modrm(bus);
                let ea = self.ea(bus, &m);
                let v = bus.read_u16(ea);
                self.regs.set16(m.reg, v);
                self.segs[Seg::Es as usize] = bus.read_u16(ea + 2);
            }
            0xC5 => {
                let m = self.fetch_modrm(bus);
                let ea = self.ea(bus, &m);
                let v = bus.read_u16(ea);
                self.regs.set16(m.reg, v);
                self.segs[Seg::Ds as usize] = bus.read_u16(ea + 2);
            }
            0xC6 => {
                let m = self.fetch_modrm(bus);
                let v = self.fetch8(bus);
                self.writerm8(bus, &m, v);
            }
            0xC7 => {
                let m = self.fetch_modrm(bus);
                let v = self.fetch16(bus);
                self.writerm16(bus, &m, v);
            }
            0xC8 => {
                // ENTER
                let stack_size = self.fetch16(bus);
                let nest_level = self.fetch8(bus);
                let bp = self.regs.bp();
                self.push(bus, bp);
                let frame_temp = self.regs.sp();
                if nest_level != 0 {
                    for _ in 1..nest_level {
                        let bp = self.regs.bp().wrapping_sub(2);
                        self.regs.set_bp(bp);
                        self.push(bus, bp);
                    }
                    self.push(bus, frame_temp);
                }
                self.regs.set_bp(frame_temp);
                self.regs.set_sp(frame_temp.wrapping_sub(stack_size));
            }
            0xC9 => {
                self.regs.set_sp(self.regs.bp());
                let bp = self.pop(bus);
                self.regs.set_bp(bp);
            }
            0xCA => {
                let imm = self.get_mem16(bus, self.seg(Seg::Cs), self.ip);
                self.ip = self.pop(bus);
                self.segs[Seg::Cs as usize] = self.pop(bus);
                self.regs.set_sp(self.regs.sp().wrapping_add(imm));
            }
            0xCB => {
                self.ip = self.pop(bus);
                self.segs[Seg::Cs as usize] = self.pop(bus);
            }
            0xCC => self.intcall(bus, 3),
            0xCD => {
                let v = self.fetch8(bus);
                self.intcall(bus, v);
            }
            0xCE => {
                if self.flags.of {
                    self.intcall(bus, 4);
                }
            }
            0xCF => {
                // IRET
                if self.protected_mode {
                    let new_ip = self.pop(bus);
                    let new_cs = self.pop(bus);
                    let new_flags = self.pop(bus);
                    let cpl = self.cpl();
                    let rpl = (new_cs & 3) as u8;
                    if rpl > cpl {
                        let new_sp = self.pop(bus);
                        let new_ss = self.pop(bus);
                        self.load_descriptor(bus, Seg::Ss, new_ss);
                        self.segs[Seg::Ss as usize] = new_ss;
                        self.regs.set_sp(new_sp);
                    }
                    self.load_descriptor(bus, Seg::Cs, new_cs);
                    self.segs[Seg::Cs as usize] = new_cs;
                    self.ip = new_ip;
                    self.flags.from_word(new_flags);
                } else {
                    self.ip = self.pop(bus);
                    self.segs[Seg::Cs as usize] = self.pop(bus);
                    let f = self.pop(bus);
                    self.flags.from_word(f);
                }
            }

            0xD0 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm8(bus, &m);
                let r = alu::grp2_8(&mut self.flags, m.reg, val, 1);
                self.writerm8(bus, &m, r);
            }
            0xD1 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm16(bus, &m);
                let r = alu::grp2_16(&mut self.flags, m.reg, val, 1);
                self.writerm16(bus, &m, r);
            }
            0xD2 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm8(bus, &m);
                let count = self.regs.cl();
                let r = alu::grp2_8(&mut self.flags, m.reg, val, count);
                self.writerm8(bus, &m, r);
            }
            0xD3 => {
                let m = self.fetch_modrm(bus);
                let val = self.readrm16(bus, &m);
                let count = self.regs.cl();
                let r = alu::grp2_16(&mut self.flags, m.reg, val, count);
                self.writerm16(bus, &m, r);
            }
            0xD4 => {
                // AAM
                let imm = self.fetch8(bus);
                if imm == 0 {
                    self.intcall(bus, 0);
                } else {
                    let al = self.regs.al();
                    self.regs.set_ah(al / imm);
                    self.regs.set_al(al % imm);
                    alu::szp16(&mut self.flags, self.regs.ax());
                }
            }
            0xD5 => {
                // AAD
                let imm = self.fetch8(bus) as u16;
                let al = (self.regs.ah() as u16 * imm + self.regs.al() as u16) as u8;
                self.regs.set_al(al);
                self.regs.set_ah(0);
                alu::szp16(&mut self.flags, al as u16);
                self.flags.sf = false;
            }
            0xD6 => {
                // SALC
                let v = if self.flags.cf { 0xFF } else { 0x00 };
                self.regs.set_al(v);
            }
            0xD7 => {
                // XLAT bypasses segmentation: always the real-mode shift.
                let addr = (self.use_seg as u32) * 16
                    + self.regs.bx() as u32
                    + self.regs.al() as u32;
                let v = bus.read_u8(addr);
                self.regs.set_al(v);
            }

            0xD8..=0xDF => {
                if self.msw & 0x0008 != 0 {
                    debug!("FPU escape with TS set, raising INT 7");
                    self.intcall(bus, 7);
                    self.ip = self.saved_ip;
                } else {
                    let m = self.fetch_modrm(bus);
                    self.exec_escape(bus, opcode, &m);
                }
            }

            0xE0 => {
                let disp = signext(self.fetch8(bus));
                self.regs.set_cx(self.regs.cx().wrapping_sub(1));
                if self.regs.cx() != 0 && !self.flags.zf {
                    self.ip = self.ip.wrapping_add(disp);
                }
            }
            0xE1 => {
                let disp = signext(self.fetch8(bus));
                self.regs.set_cx(self.regs.cx().wrapping_sub(1));
                if self.regs.cx() != 0 && self.flags.zf {
                    self.ip = self.ip.wrapping_add(disp);
                }
            }
            0xE2 => {
                let disp = signext(self.fetch8(bus));
                self.regs.set_cx(self.regs.cx().wrapping_sub(1));
                if self.regs.cx() != 0 {
                    self.ip = self.ip.wrapping_add(disp);
                }
            }
            0xE3 => {
                let disp = signext(self.fetch8(bus));
                if self.regs.cx() == 0 {
                    self.ip = self.ip.wrapping_add(disp);
                }
            }
            0xE4 => {
                let port = self.fetch8(bus) as u16;
                let v = bus.io_read_u8(port);
                self.regs.set_al(v);
            }
            0xE5 => {
                let port = self.fetch8(bus) as u16;
                let v = bus.io_read_u16(port);
                self.regs.set_ax(v);
            }
            0xE6 => {
                let port = self.fetch8(bus) as u16;
                bus.io_write_u8(port, self.regs.al());
            }
            0xE7 => {
                let port = self.fetch8(bus) as u16;
                bus.io_write_u16(port, self.regs.ax());
            }
            0xE8 => {
                let disp = self.fetch16(bus);
                self.push(bus, self.ip);
                self.ip = self.ip.wrapping_add(disp);
            }
            0xE9 => {
                let disp = self.fetch16(bus);
                self.ip = self.ip.wrapping_add(disp);
            }
            0xEA => {
                let new_ip = self.fetch16(bus);
                let new_cs = self.get_mem16(bus, self.seg(Seg::Cs), self.ip);
                self.ip = new_ip;
                self.segs[Seg::Cs as usize] = new_cs;
                if self.protected_mode {
                    self.load_descriptor(bus, Seg::Cs, new_cs);
                }
            }
            0xEB => {
                let disp = signext(self.fetch8(bus));
                self.ip = self.ip.wrapping_add(disp);
            }
            0xEC => {
                let v = bus.io_read_u8(self.regs.dx());
                self.regs.set_al(v);
            }
            0xED => {
                let v = bus.io_read_u16(self.regs.dx());
                self.regs.set_ax(v);
            }
            0xEE => bus.io_write_u8(self.regs.dx(), self.regs.al()),
            0xEF => bus.io_write_u16(self.regs.dx(), self.regs.ax()),

            0xF4 => self.halted = true,
            0xF5 => self.flags.cf = !self.flags.cf,
            0xF6 => self.exec_grp3_8(bus),
            0xF7 => self.exec_grp3_16(bus),
            0xF8 => self.flags.cf = false,
            0xF9 => self.flags.cf = true,
            0xFA => self.flags.ifl = false,
            0xFB => self.flags.ifl = true,
            0xFC => self.flags.df = false,
            0xFD => self.flags.df = true,
            0xFE => {
                let m = self.fetch_modrm(bus);
                let a = self.readrm8(bus, &m);
                let oldcf = self.flags.cf;
                let r = if m.reg == 0 {
                    alu::add8(&mut self.flags, a, 1)
                } else {
                    alu::sub8(&mut self.flags, a, 1)
                };
                self.flags.cf = oldcf;
                self.writerm8(bus, &m, r);
            }
            0xFF => self.exec_grp5(bus),

            _ => {
                // Undefined encoding (includes prefix bytes reaching dispatch
                // after an over-long prefix run).
                debug!(
                    "invalid opcode {opcode:02X} at {:04X}:{:04X}",
                    self.saved_cs, self.first_ip
                );
                self.intcall(bus, 6);
            }
        }
        1
    }

    fn exec_grp3_8<B: Bus>(&mut self, bus: &mut B) {
        let m = self.fetch_modrm(bus);
        let a = self.readrm8(bus, &m);
        match m.reg {
            0 | 1 => {
                let imm = self.fetch8(bus);
                alu::and8(&mut self.flags, a, imm);
            }
            2 => {
                let r = !a;
                alu::and8(&mut self.flags, r, r);
                self.writerm8(bus, &m, r);
            }
            3 => {
                let r = alu::sub8(&mut self.flags, 0, a);
                self.flags.cf = r != 0;
                self.writerm8(bus, &m, r);
            }
            4 => {
                // MUL: SZP come from the operand, carry/overflow from the
                // high half of the product.
                let product = a as u32 * self.regs.al() as u32;
                self.regs.set_ax(product as u16);
                alu::szp8(&mut self.flags, a);
                let high = self.regs.ah() != 0;
                self.flags.cf = high;
                self.flags.of = high;
            }
            5 => {
                let product =
                    (a as i8 as i32).wrapping_mul(self.regs.al() as i8 as i32) as u32;
                self.regs.set_ax(product as u16);
                let high = self.regs.ah() != 0;
                self.flags.cf = high;
                self.flags.of = high;
            }
            6 => match alu::div8(self.regs.ax(), a) {
                Some((quot, rem)) => {
                    self.regs.set_al(quot);
                    self.regs.set_ah(rem);
                }
                None => self.intcall(bus, 0),
            },
            _ => match alu::idiv8(self.regs.ax(), a) {
                Some((quot, rem)) => {
                    self.regs.set_al(quot);
                    self.regs.set_ah(rem);
                }
                None => self.intcall(bus, 0),
            },
        }
    }

    fn exec_grp3_16<B: Bus>(&mut self, bus: &mut B) {
        let m = self.fetch_modrm(bus);
        let a = self.readrm16(bus, &m);
        match m.reg {
            0 | 1 => {
                let imm = self.fetch16(bus);
                alu::and16(&mut self.flags, a, imm);
            }
            2 => {
                let r = !a;
                alu::and16(&mut self.flags, r, r);
                self.writerm16(bus, &m, r);
            }
            3 => {
                let r = alu::sub16(&mut self.flags, 0, a);
                self.flags.cf = r != 0;
                self.writerm16(bus, &m, r);
            }
            4 => {
                let product = a as u32 * self.regs.ax() as u32;
                self.regs.set_ax(product as u16);
                self.regs.set_dx((product >> 16) as u16);
                alu::szp16(&mut self.flags, a);
                let high = self.regs.dx() != 0;
                self.flags.cf = high;
                self.flags.of = high;
            }
            5 => {
                let product =
                    (a as i16 as i32).wrapping_mul(self.regs.ax() as i16 as i32) as u32;
                self.regs.set_ax(product as u16);
                self.regs.set_dx((product >> 16) as u16);
                let high = self.regs.dx() != 0;
                self.flags.cf = high;
                self.flags.of = high;
            }
            6 => {
                let dividend = (self.regs.dx() as u32) << 16 | self.regs.ax() as u32;
                match alu::div16(dividend, a) {
                    Some((quot, rem)) => {
                        self.regs.set_ax(quot);
                        self.regs.set_dx(rem);
                    }
                    None => self.intcall(bus, 0),
                }
            }
            _ => {
                let dividend = (self.regs.dx() as u32) << 16 | self.regs.ax() as u32;
                match alu::idiv16(dividend, a) {
                    Some((quot, rem)) => {
                        self.regs.set_ax(quot);
                        self.regs.set_dx(rem);
                    }
                    None => self.intcall(bus, 0),
                }
            }
        }
    }

    fn exec_grp5<B: Bus>(&mut self, bus: &mut B) {
        let m = self.fetch_modrm(bus);
        let val = self.readrm16(bus, &m);
        match m.reg {
            0 => {
                let oldcf = self.flags.cf;
                let r = alu::add16(&mut self.flags, val, 1);
                self.flags.cf = oldcf;
                self.writerm16(bus, &m, r);
            }
            1 => {
                let oldcf = self.flags.cf;
                let r = alu::sub16(&mut self.flags, val, 1);
                self.flags.cf = oldcf;
                self.writerm16(bus, &m, r);
            }
            2 => {
                self.push(bus, self.ip);
                self.ip = val;
            }
            3 => {
                let cs = self.seg(Seg::Cs);
                self.push(bus, cs);
                self.push(bus, self.ip);
                let ea = self.ea(bus, &m);
                self.ip = bus.read_u16(ea);
                self.segs[Seg::Cs as usize] = bus.read_u16(ea + 2);
            }
            4 => self.ip = val,
            5 => {
                let ea = self.ea(bus, &m);
                self.ip = bus.read_u16(ea);
                let new_cs = bus.read_u16(ea + 2);
                self.segs[Seg::Cs as usize] = new_cs;
                if self.protected_mode {
                    self.load_descriptor(bus, Seg::Cs, new_cs);
                }
            }
            6 => self.push(bus, val),
            _ => {}
        }
    }

    /// 0x0F: the 80286 system-instruction table.
    fn exec_0f<B: Bus>(&mut self, bus: &mut B) {
        let opcode = self.fetch8(bus);
        match opcode {
            0x00 => {
                // Group 6 is protected-mode only.
                let m = self.fetch_modrm(bus);
                if !self.protected_mode {
                    self.intcall(bus, 6);
                    return;
                }
                match m.reg {
                    0 => {
                        let v = self.ldtr;
                        self.writerm16(bus, &m, v);
                    }
                    1 => {
                        let v = self.tr;
                        self.writerm16(bus, &m, v);
                    }
                    2 => {
                        let sel = self.readrm16(bus, &m);
                        self.ldtr = sel;
                        self.load_ldtr(bus, sel);
                    }
                    3 => {
                        if self.cpl() != 0 {
                            warn!("LTR: GP(13), CPL != 0");
                            self.intcall(bus, 13);
                            return;
                        }
                        let sel = self.readrm16(bus, &m);
                        self.tr = sel;
                        self.load_tr(bus, sel);
                    }
                    4 | 5 => {
                        // VERR / VERW
                        let selector = self.readrm16(bus, &m);
                        let cpl = self.cpl();
                        self.flags.zf = false;
                        if selector != 0 {
                            if let Some((_, _, access)) = self.descriptor_info(bus, selector) {
                                let is_system = access & 0x10 == 0;
                                if !is_system {
                                    let is_code = access & 0x08 != 0;
                                    let accessible = access & 0x02 != 0;
                                    let seg_dpl = (access >> 5) & 3;
                                    let rpl = (selector & 3) as u8;
                                    if seg_dpl >= cpl && seg_dpl >= rpl {
                                        if m.reg == 4 && is_code && accessible {
                                            self.flags.zf = true;
                                        }
                                        if m.reg == 5 && !is_code && accessible {
                                            self.flags.zf = true;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    _ => {
                        warn!("unhandled group-6 encoding reg={}", m.reg);
                        self.intcall(bus, 6);
                    }
                }
            }
            0x01 => {
                // Group 7
                let m = self.fetch_modrm(bus);
                match m.reg {
                    0 => {
                        let ea = self.ea(bus, &m);
                        bus.write_u16(ea, self.gdtr.limit);
                        bus.write_u8(ea + 2, self.gdtr.base as u8);
                        bus.write_u8(ea + 3, (self.gdtr.base >> 8) as u8);
                        bus.write_u8(ea + 4, (self.gdtr.base >> 16) as u8);
                    }
                    1 => {
                        let ea = self.ea(bus, &m);
                        bus.write_u16(ea, self.idtr.limit);
                        bus.write_u8(ea + 2, self.idtr.base as u8);
                        bus.write_u8(ea + 3, (self.idtr.base >> 8) as u8);
                        bus.write_u8(ea + 4, (self.idtr.base >> 16) as u8);
                    }
                    2 => {
                        let ea = self.ea(bus, &m);
                        self.gdtr.limit = bus.read_u16(ea);
                        self.gdtr.base = bus.read_u8(ea + 2) as u32
                            | (bus.read_u8(ea + 3) as u32) << 8
                            | (bus.read_u8(ea + 4) as u32) << 16;
                    }
                    3 => {
                        let ea = self.ea(bus, &m);
                        self.idtr.limit = bus.read_u16(ea);
                        self.idtr.base = bus.read_u8(ea + 2) as u32
                            | (bus.read_u8(ea + 3) as u32) << 8
                            | (bus.read_u8(ea + 4) as u32) << 16;
                    }
                    4 => {
                        let v = self.msw;
                        self.writerm16(bus, &m, v);
                    }
                    6 => {
                        let v = self.readrm16(bus, &m);
                        self.load_msw(v);
                    }
                    _ => {
                        warn!("unhandled group-7 encoding reg={}", m.reg);
                        self.intcall(bus, 6);
                    }
                }
            }
            0x02 | 0x03 => {
                // LAR / LSL
                let m = self.fetch_modrm(bus);
                let sel = self.readrm16(bus, &m);
                let cpl = self.cpl();
                let rpl = (sel & 3) as u8;
                self.flags.zf = false;
                if let Some((_, limit, access)) = self.descriptor_info(bus, sel) {
                    let ty = access & 0x1F;
                    let dpl = (access >> 5) & 3;
                    if dpl >= cpl && dpl >= rpl {
                        let valid_type = if opcode == 0x02 {
                            !matches!(ty, 0x00 | 0x08 | 0x0A | 0x0D)
                        } else {
                            !matches!(ty, 0x00 | 0x04..=0x07 | 0x0C | 0x0E | 0x0F)
                        };
                        if valid_type {
                            self.flags.zf = true;
                            if opcode == 0x02 {
                                self.regs.set16(m.reg, (access as u16) << 8);
                            } else {
                                self.regs.set16(m.reg, limit);
                            }
                        }
                    }
                }
            }
            0x04 => {
                // STOREALL stores debug state and stops the clock; model the
                // stop only.
                self.halted = true;
            }
            0x05 => self.exec_loadall(bus),
            0x06 => self.msw &= !0x0008, // CLTS
            _ => {
                warn!("unhandled 0F opcode {opcode:02X}");
                self.intcall(bus, 6);
            }
        }
    }

    /// LOADALL: repopulate nearly all CPU state from the fixed 102-byte block
    /// at physical 0x800.
    fn exec_loadall<B: Bus>(&mut self, bus: &mut B) {
        if self.protected_mode {
            self.intcall(bus, 6);
            return;
        }

        let addr = 0x800u32;
        let read24 = |bus: &mut B, a: u32| {
            bus.read_u8(a) as u32 | (bus.read_u8(a + 1) as u32) << 8 | (bus.read_u8(a + 2) as u32) << 16
        };

        for (seg, limit_off, base_off, access_off) in [
            (Seg::Es, 0x1E, 0x1B, 0x1A),
            (Seg::Cs, 0x24, 0x21, 0x20),
            (Seg::Ss, 0x2A, 0x27, 0x26),
            (Seg::Ds, 0x30, 0x2D, 0x2C),
        ] {
            let cache = &mut self.seg_cache[seg as usize];
            cache.limit = bus.read_u16(addr + limit_off);
            cache.base = read24(bus, addr + base_off);
            cache.access = bus.read_u8(addr + access_off);
            cache.valid = true;
        }

        self.regs.set16(DI, bus.read_u16(addr + 0x32));
        self.regs.set16(SI, bus.read_u16(addr + 0x34));
        self.regs.set16(BP, bus.read_u16(addr + 0x36));
        self.regs.set16(SP, bus.read_u16(addr + 0x38));
        self.regs.set16(BX, bus.read_u16(addr + 0x3A));
        self.regs.set16(DX, bus.read_u16(addr + 0x3C));
        self.regs.set16(CX, bus.read_u16(addr + 0x3E));
        self.regs.set16(AX, bus.read_u16(addr + 0x40));

        let flags = bus.read_u16(addr + 0x42);
        self.flags.from_word(flags);
        self.ip = bus.read_u16(addr + 0x44);
        self.ldtr = bus.read_u16(addr + 0x46);
        self.tr = bus.read_u16(addr + 0x54);
        self.segs[Seg::Ds as usize] = bus.read_u16(addr + 0x48);
        self.segs[Seg::Ss as usize] = bus.read_u16(addr + 0x4A);
        self.segs[Seg::Cs as usize] = bus.read_u16(addr + 0x4C);
        self.segs[Seg::Es as usize] = bus.read_u16(addr + 0x4E);

        self.gdtr.limit = bus.read_u16(addr + 0x56);
        self.gdtr.base = read24(bus, addr + 0x58);
        self.idtr.limit = bus.read_u16(addr + 0x5C);
        self.idtr.base = read24(bus, addr + 0x5E);

        self.msw = bus.read_u16(addr + 0x66);
        if !self.protected_mode && self.msw & 1 != 0 {
            debug!("LOADALL: entering protected mode");
        }
        self.protected_mode = self.msw & 1 != 0;
    }

    /// One string-instruction transfer. Returns the number of dispatcher
    /// iterations consumed: a completed transfer counts double, and an
    /// active repetition prefix rewinds IP so the next iteration re-enters
    /// the same instruction.
    fn exec_string<B: Bus>(&mut self, bus: &mut B, op: StringOp) -> u32 {
        let rep = self.rep;
        if rep != RepPrefix::None && self.regs.cx() == 0 {
            return 1;
        }

        let width = if op.word() { 2u16 } else { 1u16 };
        let step = |v: u16, df: bool| {
            if df {
                v.wrapping_sub(width)
            } else {
                v.wrapping_add(width)
            }
        };
        let df = self.flags.df;
        let es = self.seg(Seg::Es);

        match op {
            StringOp::MovsB => {
                let v = self.get_mem8(bus, self.use_seg, self.regs.si());
                self.put_mem8(bus, es, self.regs.di(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::MovsW => {
                let v = self.get_mem16(bus, self.use_seg, self.regs.si());
                self.put_mem16(bus, es, self.regs.di(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::CmpsB => {
                let a = self.get_mem8(bus, self.use_seg, self.regs.si());
                let b = self.get_mem8(bus, es, self.regs.di());
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
                alu::sub8(&mut self.flags, a, b);
            }
            StringOp::CmpsW => {
                let a = self.get_mem16(bus, self.use_seg, self.regs.si());
                let b = self.get_mem16(bus, es, self.regs.di());
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
                alu::sub16(&mut self.flags, a, b);
            }
            StringOp::StosB => {
                let v = self.regs.al();
                self.put_mem8(bus, es, self.regs.di(), v);
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::StosW => {
                let v = self.regs.ax();
                self.put_mem16(bus, es, self.regs.di(), v);
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::LodsB => {
                let v = self.get_mem8(bus, self.use_seg, self.regs.si());
                self.regs.set_al(v);
                self.regs.set_si(step(self.regs.si(), df));
            }
            StringOp::LodsW => {
                let v = self.get_mem16(bus, self.use_seg, self.regs.si());
                self.regs.set_ax(v);
                self.regs.set_si(step(self.regs.si(), df));
            }
            StringOp::ScasB => {
                let a = self.regs.al();
                let b = self.get_mem8(bus, es, self.regs.di());
                alu::sub8(&mut self.flags, a, b);
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::ScasW => {
                let a = self.regs.ax();
                let b = self.get_mem16(bus, es, self.regs.di());
                alu::sub16(&mut self.flags, a, b);
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::InsB => {
                let v = bus.io_read_u8(self.regs.dx());
                self.put_mem8(bus, es, self.regs.di(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::InsW => {
                let v = bus.io_read_u16(self.regs.dx());
                self.put_mem16(bus, es, self.regs.di(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::OutsB => {
                let v = self.get_mem8(bus, self.use_seg, self.regs.si());
                bus.io_write_u8(self.regs.dx(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
            StringOp::OutsW => {
                let v = self.get_mem16(bus, self.use_seg, self.regs.si());
                bus.io_write_u16(self.regs.dx(), v);
                self.regs.set_si(step(self.regs.si(), df));
                self.regs.set_di(step(self.regs.di(), df));
            }
        }

        if rep != RepPrefix::None {
            self.regs.set_cx(self.regs.cx().wrapping_sub(1));
        }

        if op.compares() {
            if rep == RepPrefix::Repe && !self.flags.zf {
                return 1;
            }
            if rep == RepPrefix::Repne && self.flags.zf {
                return 1;
            }
        }

        if rep == RepPrefix::None {
            return 2;
        }

        self.ip = self.first_ip;
        2
    }
}
