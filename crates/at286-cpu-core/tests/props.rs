use at286_cpu_core::{Bus, Cpu, FlatTestBus, Seg};
use proptest::prelude::*;

fn setup(code: &[u8]) -> (Cpu, FlatTestBus) {
    let mut bus = FlatTestBus::new(0x20_0000);
    bus.load(0x1000, code);
    let mut cpu = Cpu::new();
    cpu.set_seg(Seg::Cs, 0x0100);
    cpu.ip = 0x0000;
    cpu.set_seg(Seg::Ss, 0x0900);
    cpu.regs.set_sp(0x1000);
    cpu.set_seg(Seg::Ds, 0x0200);
    cpu.set_seg(Seg::Es, 0x0300);
    (cpu, bus)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// PF always equals the even parity of the low result byte.
    #[test]
    fn parity_flag_matches_result_parity(a in any::<u8>(), b in any::<u8>()) {
        let (mut cpu, mut bus) = setup(&[0x00, 0xD8]); // ADD AL, BL
        cpu.regs.set_al(a);
        cpu.regs.set8(3, b); // BL
        cpu.step(&mut bus);
        let r = cpu.regs.al();
        prop_assert_eq!(cpu.flags.pf, r.count_ones() % 2 == 0);
    }

    /// add/sub are inverses at the register level, and CMP leaves operands
    /// untouched.
    #[test]
    fn cmp_does_not_write_its_destination(a in any::<u16>(), b in any::<u16>()) {
        let (mut cpu, mut bus) = setup(&[0x39, 0xD8]); // CMP AX, BX
        cpu.regs.set_ax(a);
        cpu.regs.set_bx(b);
        cpu.step(&mut bus);
        prop_assert_eq!(cpu.regs.ax(), a);
        prop_assert_eq!(cpu.regs.bx(), b);
        prop_assert_eq!(cpu.flags.zf, a == b);
        prop_assert_eq!(cpu.flags.cf, a < b);
    }

    /// push(v); pop() == v and SP is restored, for any value and any even
    /// starting SP high enough to hold the slot.
    #[test]
    fn push_pop_round_trip(v in any::<u16>(), sp in 0x10u16..0xF000) {
        let (mut cpu, mut bus) = setup(&[0x50, 0x58]); // PUSH AX; POP AX
        cpu.regs.set_ax(v);
        cpu.regs.set_sp(sp);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        prop_assert_eq!(cpu.regs.ax(), v);
        prop_assert_eq!(cpu.regs.sp(), sp);
    }

    /// FPU stack cycle: pushing any finite value and storing it back is
    /// bit-exact, and the tag word returns to all-empty.
    #[test]
    fn fpu_push_pop_bit_cycle(v in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
        // FLD qword [0x40]; FSTP qword [0x48]
        let (mut cpu, mut bus) = setup(&[0xDD, 0x06, 0x40, 0x00, 0xDD, 0x1E, 0x48, 0x00]);
        bus.load((0x0200 << 4) + 0x40, &v.to_bits().to_le_bytes());
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        let mut out = [0u8; 8];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = bus.read_u8((0x0200 << 4) + 0x48 + i as u32);
        }
        prop_assert_eq!(u64::from_le_bytes(out), v.to_bits());
        prop_assert_eq!(cpu.fpu.tw, 0xFFFF);
    }

    /// Shift counts are masked to five bits before the loop.
    #[test]
    fn shift_counts_mask_to_five_bits(v in any::<u16>(), count in 0u8..=255) {
        let run_shift = |count: u8| {
            let (mut cpu, mut bus) = setup(&[0xD3, 0xE0]); // SHL AX, CL
            cpu.regs.set_ax(v);
            cpu.regs.set8(1, count); // CL
            cpu.step(&mut bus);
            (cpu.regs.ax(), cpu.flags.cf, cpu.flags.zf)
        };
        prop_assert_eq!(run_shift(count), run_shift(count & 0x1F));
    }

    /// REP MOVSB with CX = n transfers exactly n bytes and leaves SI/DI/CX
    /// consistent.
    #[test]
    fn rep_movsb_transfers_exactly_cx_bytes(n in 0u16..32, data in proptest::collection::vec(any::<u8>(), 32)) {
        let (mut cpu, mut bus) = setup(&[0xF3, 0xA4]); // REP MOVSB
        bus.load(0x0200 << 4, &data);
        cpu.regs.set_cx(n);
        cpu.regs.set_si(0);
        cpu.regs.set_di(0);
        while cpu.ip != 0x0002 {
            cpu.step(&mut bus);
        }
        prop_assert_eq!(cpu.regs.cx(), 0);
        prop_assert_eq!(cpu.regs.si(), n);
        prop_assert_eq!(cpu.regs.di(), n);
        for i in 0..n as usize {
            prop_assert_eq!(bus.read_u8((0x0300 << 4) + i as u32), data[i]);
        }
    }

    /// Real-mode translation with A20 disabled is the 20-bit wrap of the
    /// translation with it enabled.
    #[test]
    fn a20_masks_to_twenty_bits(seg in any::<u16>(), off in any::<u16>()) {
        let linear = ((seg as u32) << 4).wrapping_add(off as u32);
        // Keep the probe byte away from the code bytes themselves.
        prop_assume!(!(0x1000..0x1002).contains(&(linear & 0xFF_FFFF)));
        prop_assume!(!(0x1000..0x1002).contains(&(linear & 0x0F_FFFF)));
        let read_at = |a20: bool| {
            let (mut cpu, mut bus) = setup(&[0xAC]); // LODSB
            bus.set_a20(a20);
            let linear = ((seg as u32) << 4).wrapping_add(off as u32);
            let masked = if a20 { linear & 0xFF_FFFF } else { linear & 0x0F_FFFF };
            bus.load(masked, &[0xA5]);
            cpu.set_seg(Seg::Ds, seg);
            cpu.regs.set_si(off);
            cpu.step(&mut bus);
            cpu.regs.al()
        };
        prop_assert_eq!(read_at(false), 0xA5);
        prop_assert_eq!(read_at(true), 0xA5);
    }
}
