//! Segment translation and the descriptor-loading protocol.
//!
//! Real mode translates with the classic linear shift, masked to 20 bits when
//! the A20 line is off. Protected mode translates through the per-segment
//! descriptor caches, which are populated lazily by segment-register loads
//! and seeded wholesale when LMSW first sets the PE bit.

use log::{debug, warn};

use crate::bus::Bus;
use crate::decode::ModRm;
use crate::state::{Cpu, Seg, BP, BX, DI, SI};

impl Cpu {
    /// 16-bit effective offset for a memory-form ModR/M.
    pub(crate) fn effective_offset(&self, m: &ModRm) -> u16 {
        let regs = &self.regs;
        let base = match (m.mode, m.rm) {
            (0, 0) => regs.get16(BX).wrapping_add(regs.get16(SI)),
            (0, 1) => regs.get16(BX).wrapping_add(regs.get16(DI)),
            (0, 2) => regs.get16(BP).wrapping_add(regs.get16(SI)),
            (0, 3) => regs.get16(BP).wrapping_add(regs.get16(DI)),
            (0, 4) => regs.get16(SI),
            (0, 5) => regs.get16(DI),
            (0, 6) => return m.disp,
            (0, _) => regs.get16(BX),
            (_, 0) => regs.get16(BX).wrapping_add(regs.get16(SI)).wrapping_add(m.disp),
            (_, 1) => regs.get16(BX).wrapping_add(regs.get16(DI)).wrapping_add(m.disp),
            (_, 2) => regs.get16(BP).wrapping_add(regs.get16(SI)).wrapping_add(m.disp),
            (_, 3) => regs.get16(BP).wrapping_add(regs.get16(DI)).wrapping_add(m.disp),
            (_, 4) => regs.get16(SI).wrapping_add(m.disp),
            (_, 5) => regs.get16(DI).wrapping_add(m.disp),
            (_, 6) => regs.get16(BP).wrapping_add(m.disp),
            (_, _) => regs.get16(BX).wrapping_add(m.disp),
        };
        base
    }

    /// Physical address of a memory-form ModR/M operand, using the segment
    /// selected by the dispatcher (`use_seg`).
    ///
    /// In protected mode this matches `use_seg` against the four segment
    /// registers and goes through the corresponding descriptor cache; when no
    /// register matches (or the cache is invalid) the result is physical 0.
    pub(crate) fn ea<B: Bus>(&mut self, bus: &B, m: &ModRm) -> u32 {
        let offset = self.effective_offset(m);
        if self.protected_mode {
            let order = [Seg::Ss, Seg::Ds, Seg::Es, Seg::Cs];
            for seg in order {
                if self.use_seg == self.segs[seg as usize] {
                    let cache = &self.seg_cache[seg as usize];
                    if cache.valid {
                        return cache.base.wrapping_add(offset as u32);
                    }
                    break;
                }
            }
            0
        } else {
            let addr = ((self.use_seg as u32) << 4).wrapping_add(offset as u32);
            if bus.a20_enabled() {
                addr
            } else {
                addr & 0x000F_FFFF
            }
        }
    }

    /// Protected-mode (selector, offset) translation through the descriptor
    /// caches. Returns `None` on no matching cache, an invalid cache, or an
    /// offset beyond the cached limit.
    fn translate_protected(&self, seg: u16, off: u16) -> Option<u32> {
        let order = [Seg::Cs, Seg::Ds, Seg::Es, Seg::Ss];
        let cache = order
            .into_iter()
            .find(|&s| seg == self.segs[s as usize])
            .map(|s| &self.seg_cache[s as usize])?;
        if !cache.valid || off > cache.limit {
            return None;
        }
        Some(cache.base.wrapping_add(off as u32))
    }

    /// (selector, offset) to 24-bit physical. A failed protected-mode
    /// translation raises general protection and yields physical 0.
    pub(crate) fn linear<B: Bus>(&mut self, bus: &mut B, seg: u16, off: u16) -> u32 {
        if self.protected_mode {
            match self.translate_protected(seg, off) {
                Some(addr) => addr,
                None => {
                    self.intcall(bus, 13);
                    0
                }
            }
        } else {
            let addr = ((seg as u32) << 4).wrapping_add(off as u32);
            if bus.a20_enabled() {
                addr
            } else {
                addr & 0x000F_FFFF
            }
        }
    }

    pub(crate) fn get_mem8<B: Bus>(&mut self, bus: &mut B, seg: u16, off: u16) -> u8 {
        let addr = self.linear(bus, seg, off);
        bus.read_u8(addr)
    }

    pub(crate) fn get_mem16<B: Bus>(&mut self, bus: &mut B, seg: u16, off: u16) -> u16 {
        let addr = self.linear(bus, seg, off);
        bus.read_u16(addr)
    }

    pub(crate) fn put_mem8<B: Bus>(&mut self, bus: &mut B, seg: u16, off: u16, val: u8) {
        let addr = self.linear(bus, seg, off);
        bus.write_u8(addr, val);
    }

    pub(crate) fn put_mem16<B: Bus>(&mut self, bus: &mut B, seg: u16, off: u16, val: u16) {
        let addr = self.linear(bus, seg, off);
        bus.write_u16(addr, val);
    }

    /// Raw descriptor lookup used by LAR/LSL/VERR/VERW and gate entry.
    /// Returns `(base, limit, access)` for a well-formed selector.
    pub(crate) fn descriptor_info<B: Bus>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Option<(u32, u16, u8)> {
        if selector & 0xFFFC == 0 {
            return None;
        }

        let (table_base, table_limit) = if selector & 0x0004 != 0 {
            if !self.ldtr_cache.valid {
                return None;
            }
            (self.ldtr_cache.base, self.ldtr_cache.limit)
        } else {
            (self.gdtr.base, self.gdtr.limit)
        };

        let index = (selector >> 3) as u32;
        if index * 8 + 7 > table_limit as u32 {
            return None;
        }

        let addr = table_base + index * 8;
        let limit = bus.read_u16(addr);
        let base = bus.read_u8(addr + 2) as u32
            | (bus.read_u8(addr + 3) as u32) << 8
            | (bus.read_u8(addr + 4) as u32) << 16;
        let access = bus.read_u8(addr + 5);
        Some((base, limit, access))
    }

    /// Load a segment register in protected mode, applying the descriptor
    /// rules: null into SS faults, null elsewhere invalidates the cache,
    /// not-present faults with vector 11, and SS/CS/DS-ES each have their own
    /// type and privilege checks.
    ///
    /// Returns whether the selector was accepted; a rejected load has already
    /// raised its fault.
    pub(crate) fn load_descriptor<B: Bus>(&mut self, bus: &mut B, seg: Seg, selector: u16) -> bool {
        let cpl = self.cpl();

        if selector & 0xFFFC == 0 {
            if seg == Seg::Ss {
                warn!("GP(13): null selector loaded into SS");
                self.intcall(bus, 13);
                return false;
            }
            self.seg_cache[seg as usize].valid = false;
            self.segs[seg as usize] = selector;
            return true;
        }

        let (table_base, table_limit) = if selector & 0x0004 != 0 {
            if !self.ldtr_cache.valid {
                warn!("GP(13): selector {selector:04X} references an invalid LDT");
                self.intcall(bus, 13);
                return false;
            }
            (self.ldtr_cache.base, self.ldtr_cache.limit)
        } else {
            (self.gdtr.base, self.gdtr.limit)
        };

        let index = (selector >> 3) as u32;
        if index * 8 + 7 > table_limit as u32 {
            warn!("GP(13): selector {selector:04X} exceeds table limit {table_limit:04X}");
            self.intcall(bus, 13);
            self.seg_cache[seg as usize].valid = false;
            return false;
        }

        let addr = table_base + index * 8;
        let access = bus.read_u8(addr + 5);
        let limit = bus.read_u16(addr);
        let base = bus.read_u8(addr + 2) as u32
            | (bus.read_u8(addr + 3) as u32) << 8
            | (bus.read_u8(addr + 4) as u32) << 16;

        let rpl = (selector & 3) as u8;
        let dpl = (access >> 5) & 3;

        if access & 0x80 == 0 {
            warn!("NP(11): segment {selector:04X} not present, access {access:02X}");
            self.intcall(bus, 11);
            return false;
        }

        match seg {
            Seg::Ss => {
                let is_writable_data = access & 0x08 == 0 && access & 0x02 != 0;
                if rpl != cpl || dpl != cpl || !is_writable_data {
                    warn!(
                        "GP(13): bad SS selector {selector:04X} (cpl={cpl} rpl={rpl} dpl={dpl} access={access:02X})"
                    );
                    self.push(bus, selector);
                    self.intcall(bus, 13);
                    return false;
                }
            }
            Seg::Cs => {
                if access & 0x08 == 0 {
                    warn!("GP(13): CS load with non-code selector {selector:04X}");
                    self.intcall(bus, 13);
                    return false;
                }
                if dpl > cpl {
                    warn!("GP(13): CS load privilege mismatch, selector {selector:04X}");
                    self.intcall(bus, 13);
                    return false;
                }
            }
            _ => {
                let is_data = access & 0x08 == 0;
                let is_readable_code = access & 0x0A == 0x0A;
                if !is_data && !is_readable_code {
                    warn!("GP(13): DS/ES load with bad segment type, selector {selector:04X}");
                    self.intcall(bus, 13);
                    return false;
                }
                if cpl > dpl || rpl > dpl {
                    warn!(
                        "GP(13): DS/ES privilege violation, selector {selector:04X} (cpl={cpl} rpl={rpl} dpl={dpl})"
                    );
                    self.intcall(bus, 13);
                    return false;
                }
            }
        }

        let cache = &mut self.seg_cache[seg as usize];
        cache.limit = limit;
        cache.base = base;
        cache.access = access;
        cache.valid = true;
        self.segs[seg as usize] = selector;
        true
    }

    /// LLDT: load the local-descriptor-table register from a GDT entry of
    /// type 0x02.
    pub(crate) fn load_ldtr<B: Bus>(&mut self, bus: &mut B, selector: u16) {
        if selector & 0xFFFC == 0 {
            self.ldtr_cache.valid = false;
            return;
        }

        if self.cpl() != 0 {
            warn!("LLDT: GP(0), CPL != 0");
            self.intcall(bus, 0);
            return;
        }

        if selector & 0xFFFC > self.gdtr.limit {
            warn!("LLDT: GP(13), selector {selector:04X} exceeds GDT limit");
            self.intcall(bus, 13);
            return;
        }

        let addr = self.gdtr.base + (selector >> 3) as u32 * 8;
        let access = bus.read_u8(addr + 5);

        if access & 0x1F != 0x02 {
            warn!("LLDT: GP(13), not an LDT descriptor (access {access:02X})");
            self.intcall(bus, 13);
            return;
        }
        if access & 0x80 == 0 {
            warn!("LLDT: NP(11), LDT descriptor not present");
            self.intcall(bus, 11);
            return;
        }

        self.ldtr_cache.limit = bus.read_u16(addr);
        self.ldtr_cache.base = bus.read_u8(addr + 2) as u32
            | (bus.read_u8(addr + 3) as u32) << 8
            | (bus.read_u8(addr + 4) as u32) << 16;
        self.ldtr_cache.access = access;
        self.ldtr_cache.valid = true;
    }

    /// LTR: load the task register from a 286 TSS descriptor (type 0x01 or
    /// 0x03), set the busy bit in the GDT slot, and snapshot the level-0
    /// stack from the TSS.
    pub(crate) fn load_tr<B: Bus>(&mut self, bus: &mut B, selector: u16) {
        if selector & 0xFFFC == 0 {
            warn!("LTR: GP(0), null selector");
            self.intcall(bus, 0);
            return;
        }

        let (table_base, table_limit) = if selector & 0x0004 != 0 {
            if !self.ldtr_cache.valid {
                warn!("LTR: GP(13), LDTR not valid");
                self.intcall(bus, 13);
                return;
            }
            (self.ldtr_cache.base, self.ldtr_cache.limit)
        } else {
            (self.gdtr.base, self.gdtr.limit)
        };

        let index = (selector >> 3) as u32;
        if index * 8 + 7 > table_limit as u32 {
            warn!("LTR: GP(13), selector exceeds table limit");
            self.intcall(bus, 13);
            return;
        }

        let addr = table_base + index * 8;
        let access = bus.read_u8(addr + 5);
        let ty = access & 0x0F;

        if ty != 0x01 && ty != 0x03 {
            warn!("LTR: GP(13), not a 286 TSS descriptor (access {access:02X})");
            self.intcall(bus, 13);
            return;
        }
        if access & 0x80 == 0 {
            warn!("LTR: NP(11), TSS descriptor not present");
            self.intcall(bus, 11);
            return;
        }

        self.tr_cache.limit = bus.read_u16(addr);
        self.tr_cache.base = bus.read_u8(addr + 2) as u32
            | (bus.read_u8(addr + 3) as u32) << 8
            | (bus.read_u8(addr + 4) as u32) << 16;
        self.tr_cache.access = access | 0x02;
        self.tr_cache.valid = true;
        self.tr = selector;
        self.tr_cache.sp0 = bus.read_u16(self.tr_cache.base + 2);
        self.tr_cache.ss0 = bus.read_u16(self.tr_cache.base + 4);

        bus.write_u8(addr + 5, access | 0x02);
    }

    /// LMSW. PE can be set but never cleared. The real-to-protected
    /// transition seeds all four descriptor caches with their real-mode
    /// equivalents so execution continues seamlessly.
    pub(crate) fn load_msw(&mut self, value: u16) {
        let mut value = value;
        if self.msw & 1 != 0 {
            value |= 1;
        }
        self.msw = (self.msw & 0xFFF0) | (value & 0x000F);

        if !self.protected_mode && self.msw & 1 != 0 {
            debug!("entering protected mode");
            self.protected_mode = true;
            for seg in [Seg::Cs, Seg::Ds, Seg::Es, Seg::Ss] {
                let cache = &mut self.seg_cache[seg as usize];
                cache.base = (self.segs[seg as usize] as u32) << 4;
                cache.limit = 0xFFFF;
                cache.access = 0x93;
                cache.valid = true;
            }
        }
    }
}
