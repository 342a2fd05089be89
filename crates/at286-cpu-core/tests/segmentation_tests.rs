use at286_cpu_core::{Bus, Cpu, FlatTestBus, Seg};
use pretty_assertions::assert_eq;

const GDT_BASE: u32 = 0x2000;

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

/// Write one 8-byte descriptor: base 24 bits, limit 16 bits, access byte.
fn write_descriptor(bus: &mut FlatTestBus, index: u32, base: u32, limit: u16, access: u8) {
    let addr = GDT_BASE + index * 8;
    bus.load(
        addr,
        &[
            limit as u8,
            (limit >> 8) as u8,
            base as u8,
            (base >> 8) as u8,
            (base >> 16) as u8,
            access,
            0,
            0,
        ],
    );
}

/// LGDT from a prepared pseudo-descriptor, then LMSW with PE set.
fn enter_protected_mode(cpu: &mut Cpu, bus: &mut FlatTestBus) {
    // At DS:0x100: limit, base (3 bytes used).
    bus.load(
        (0x0200 << 4) + 0x100,
        &[
            0xFF, 0x00, // limit 0x00FF
            (GDT_BASE & 0xFF) as u8,
            ((GDT_BASE >> 8) & 0xFF) as u8,
            ((GDT_BASE >> 16) & 0xFF) as u8,
        ],
    );
    // LGDT [0x0100]; MOV AX,1; LMSW AX
    bus.load(
        0x1000,
        &[
            0x0F, 0x01, 0x16, 0x00, 0x01, // LGDT [0x0100]
            0xB8, 0x01, 0x00, // MOV AX, 1
            0x0F, 0x01, 0xF0, // LMSW AX
        ],
    );
    cpu.step(bus);
    cpu.step(bus);
    cpu.step(bus);
    assert!(cpu.protected_mode);
}

#[test]
fn lmsw_seeds_descriptor_caches_from_real_mode() {
    let (mut cpu, mut bus) = setup(&[]);
    enter_protected_mode(&mut cpu, &mut bus);
    for seg in [Seg::Cs, Seg::Ds, Seg::Es, Seg::Ss] {
        let cache = cpu.seg_cache[seg as usize];
        assert!(cache.valid);
        assert_eq!(cache.base, (cpu.seg(seg) as u32) << 4);
        assert_eq!(cache.limit, 0xFFFF);
        assert_eq!(cache.access, 0x93);
    }
    assert_eq!(cpu.gdtr.base, GDT_BASE);
    assert_eq!(cpu.gdtr.limit, 0x00FF);
}

#[test]
fn lmsw_cannot_clear_protection_enable() {
    let (mut cpu, mut bus) = setup(&[]);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,0; LMSW AX
    bus.load(0x1000 + 11, &[0xB8, 0x00, 0x00, 0x0F, 0x01, 0xF0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.protected_mode);
    assert_eq!(cpu.msw & 1, 1);
}

#[test]
fn data_segment_load_populates_the_cache() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0x0FFF, 0x93);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX, 0x08; MOV DS, AX
    bus.load(0x1000 + 11, &[0xB8, 0x08, 0x00, 0x8E, 0xD8]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.seg(Seg::Ds), 0x08);
    let cache = cpu.seg_cache[Seg::Ds as usize];
    assert!(cache.valid);
    assert_eq!(cache.base, 0x050000);
    assert_eq!(cache.limit, 0x0FFF);
    assert_eq!(cache.access, 0x93);
}

#[test]
fn translation_goes_through_the_cache() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0x0FFF, 0x93);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,0x08; MOV DS,AX; MOV AL,[0x0010]
    bus.load(
        0x1000 + 11,
        &[0xB8, 0x08, 0x00, 0x8E, 0xD8, 0xA0, 0x10, 0x00],
    );
    bus.load(0x050010, &[0x42]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.regs.al(), 0x42);
}

#[test]
fn offset_beyond_cached_limit_is_general_protection() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0x000F, 0x93);
    enter_protected_mode(&mut cpu, &mut bus);
    let seen = std::rc::Rc::new(std::cell::Cell::new(false));
    let flag = seen.clone();
    cpu.register_interrupt_hook(
        13,
        Box::new(move |_cpu, _bus, _vector| {
            flag.set(true);
        }),
    );
    // MOV AX,0x08; MOV DS,AX; MOV AL,[0x0010]  (limit is 0x000F)
    bus.load(
        0x1000 + 11,
        &[0xB8, 0x08, 0x00, 0x8E, 0xD8, 0xA0, 0x10, 0x00],
    );
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(seen.get());
}

#[test]
fn null_selector_invalidates_everything_but_ss() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0xFFFF, 0x93);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,0; MOV ES,AX
    bus.load(0x1000 + 11, &[0xB8, 0x00, 0x00, 0x8E, 0xC0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(cpu.seg(Seg::Es), 0);
    assert!(!cpu.seg_cache[Seg::Es as usize].valid);
}

#[test]
fn null_ss_load_is_general_protection() {
    let (mut cpu, mut bus) = setup(&[]);
    enter_protected_mode(&mut cpu, &mut bus);
    let seen = std::rc::Rc::new(std::cell::Cell::new(false));
    let flag = seen.clone();
    cpu.register_interrupt_hook(
        13,
        Box::new(move |_cpu, _bus, _vector| {
            flag.set(true);
        }),
    );
    // MOV AX,0; MOV SS,AX
    bus.load(0x1000 + 11, &[0xB8, 0x00, 0x00, 0x8E, 0xD0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(seen.get());
}

#[test]
fn not_present_segment_raises_vector_11() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0xFFFF, 0x13); // present bit clear
    enter_protected_mode(&mut cpu, &mut bus);
    let seen = std::rc::Rc::new(std::cell::Cell::new(0u8));
    let flag = seen.clone();
    cpu.register_interrupt_hook(
        11,
        Box::new(move |_cpu, _bus, vector| {
            flag.set(vector);
        }),
    );
    bus.load(0x1000 + 11, &[0xB8, 0x08, 0x00, 0x8E, 0xC0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert_eq!(seen.get(), 11);
}

#[test]
fn lar_reads_access_rights_and_lsl_the_limit() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0x050000, 0x1234, 0x93);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,8; LAR BX,AX; LSL CX,AX
    bus.load(
        0x1000 + 11,
        &[0xB8, 0x08, 0x00, 0x0F, 0x02, 0xD8, 0x0F, 0x03, 0xC8],
    );
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.flags.zf);
    assert_eq!(cpu.regs.bx(), 0x9300);
    cpu.step(&mut bus);
    assert!(cpu.flags.zf);
    assert_eq!(cpu.regs.cx(), 0x1234);
}

#[test]
fn verr_checks_readability() {
    let (mut cpu, mut bus) = setup(&[]);
    write_descriptor(&mut bus, 1, 0, 0xFFFF, 0x9A); // readable code
    write_descriptor(&mut bus, 2, 0, 0xFFFF, 0x92); // writable data
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,0x08; VERR AX; MOV BX,...
    bus.load(0x1000 + 11, &[0xB8, 0x08, 0x00, 0x0F, 0x00, 0xE0]);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.flags.zf);

    // VERW on the code segment must fail, on the data segment succeed.
    bus.load(
        0x1000 + 17,
        &[0xB8, 0x08, 0x00, 0x0F, 0x00, 0xE8, 0xB8, 0x10, 0x00, 0x0F, 0x00, 0xE8],
    );
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(!cpu.flags.zf);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.flags.zf);
}

#[test]
fn group6_in_real_mode_is_invalid_opcode() {
    let (mut cpu, mut bus) = setup(&[0x0F, 0x00, 0xC0]); // SLDT AX in real mode
    bus.load(6 * 4, &[0x00, 0x07, 0x00, 0x00]);
    cpu.step(&mut bus);
    assert_eq!(cpu.ip, 0x0700);
    assert_eq!(cpu.seg(Seg::Cs), 0x0000);
}

#[test]
fn sgdt_stores_the_loaded_table() {
    let (mut cpu, mut bus) = setup(&[]);
    enter_protected_mode(&mut cpu, &mut bus);
    // SGDT [0x0200]
    bus.load(0x1000 + 11, &[0x0F, 0x01, 0x06, 0x00, 0x02]);
    cpu.step(&mut bus);
    let at = (0x0200u32 << 4) + 0x200;
    assert_eq!(
        u16::from_le_bytes([bus.read_u8(at), bus.read_u8(at + 1)]),
        0x00FF
    );
    let base = bus.read_u8(at + 2) as u32
        | (bus.read_u8(at + 3) as u32) << 8
        | (bus.read_u8(at + 4) as u32) << 16;
    assert_eq!(base, GDT_BASE);
}

#[test]
fn lldt_and_ltr_load_system_descriptors() {
    let (mut cpu, mut bus) = setup(&[]);
    // GDT: 1 = LDT descriptor (type 0x02), 2 = TSS (type 0x01).
    write_descriptor(&mut bus, 1, 0x060000, 0x00FF, 0x82);
    write_descriptor(&mut bus, 2, 0x070000, 0x002B, 0x81);
    // TSS: sp0 at +2, ss0 at +4.
    bus.load(0x070000, &[0x00, 0x00, 0x00, 0x20, 0x18, 0x00]);
    enter_protected_mode(&mut cpu, &mut bus);
    // MOV AX,0x08; LLDT AX; MOV AX,0x10; LTR AX
    bus.load(
        0x1000 + 11,
        &[0xB8, 0x08, 0x00, 0x0F, 0x00, 0xD0, 0xB8, 0x10, 0x00, 0x0F, 0x00, 0xD8],
    );
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.ldtr_cache.valid);
    assert_eq!(cpu.ldtr_cache.base, 0x060000);

    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.tr_cache.valid);
    assert_eq!(cpu.tr_cache.base, 0x070000);
    assert_eq!(cpu.tr_cache.sp0, 0x2000);
    assert_eq!(cpu.tr_cache.ss0, 0x0018);
    // Busy bit written back into the GDT slot.
    assert_eq!(bus.read_u8(GDT_BASE + 2 * 8 + 5) & 0x02, 0x02);
}

#[test]
fn a20_disabled_wraps_the_high_memory_mirror() {
    let (mut cpu, mut bus) = setup(&[0xAC, 0xAC]); // LODSB; LODSB
    bus.set_a20(false);
    cpu.set_seg(Seg::Ds, 0xFFFF);
    cpu.regs.set_si(0x0010);
    bus.load(0x000000, &[0x11]);
    bus.load(0x100000, &[0x99]);

    cpu.step(&mut bus);
    // (0xFFFF << 4) + 0x10 wraps to 0 with the gate off.
    assert_eq!(cpu.regs.al(), 0x11);

    bus.set_a20(true);
    cpu.regs.set_si(0x0010);
    cpu.step(&mut bus);
    assert_eq!(cpu.regs.al(), 0x99);
}

#[test]
fn loadall_repopulates_state_from_0x800() {
    let (mut cpu, mut bus) = setup(&[0x0F, 0x05]); // LOADALL
    let base = 0x800u32;
    // Register block.
    for (off, val) in [
        (0x32u32, 0x1111u16), // DI
        (0x34, 0x2222),       // SI
        (0x36, 0x3333),       // BP
        (0x38, 0x4444),       // SP
        (0x3A, 0x5555),       // BX
        (0x3C, 0x6666),       // DX
        (0x3E, 0x7777),       // CX
        (0x40, 0x8888),       // AX
        (0x42, 0x0002),       // FLAGS
        (0x44, 0x0123),       // IP
        (0x48, 0x0200),       // DS
        (0x4A, 0x0900),       // SS
        (0x4C, 0x0100),       // CS
        (0x4E, 0x0300),       // ES
        (0x66, 0xFFF0),       // MSW
    ] {
        bus.load(base + off, &val.to_le_bytes());
    }
    // CS cache so execution can continue: base 0x1000, limit 0xFFFF.
    bus.load(base + 0x24, &[0xFF, 0xFF]);
    bus.load(base + 0x21, &[0x00, 0x10, 0x00]);
    bus.load(base + 0x20, &[0x9B]);

    cpu.step(&mut bus);
    assert_eq!(cpu.regs.ax(), 0x8888);
    assert_eq!(cpu.regs.di(), 0x1111);
    assert_eq!(cpu.regs.sp(), 0x4444);
    assert_eq!(cpu.ip, 0x0123);
    assert!(!cpu.protected_mode);
    assert_eq!(cpu.seg_cache[Seg::Cs as usize].base, 0x1000);
}
