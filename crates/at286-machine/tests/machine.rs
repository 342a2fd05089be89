use at286_cpu_core::Seg;
use at286_machine::{Machine, MachineConfig};
use pretty_assertions::assert_eq;

fn machine() -> Machine {
    Machine::new(MachineConfig::default()).unwrap()
}

/// Drop real-mode code at 0x0100:0x0000 with a usable stack.
fn with_code(m: &mut Machine, code: &[u8]) {
    m.memory_mut().load(0x1000, code);
    m.cpu.set_seg(Seg::Cs, 0x0100);
    m.cpu.ip = 0x0000;
    m.cpu.set_seg(Seg::Ss, 0x0900);
    m.cpu.regs.set_sp(0x1000);
    m.cpu.set_seg(Seg::Ds, 0x0200);
    m.cpu.set_seg(Seg::Es, 0x0300);
}

#[test]
fn reset_vector_fetches_through_the_bios_rom() {
    let mut m = machine();
    // Tiny 64 KiB image whose last paragraph holds a HLT at the reset vector.
    let mut image = vec![0x90u8; 0x1_0000];
    image[0xFFF0] = 0xF4; // physical 0xFFFF0 = CS 0xF000, IP 0xFFF0
    m.load_bios(&image).unwrap();

    assert_eq!(m.cpu.seg(Seg::Cs), 0xF000);
    assert_eq!(m.cpu.ip, 0xFFF0);
    m.run_slice(1);
    assert!(m.cpu.halted);
}

#[test]
fn bios_rom_ignores_writes() {
    let mut m = machine();
    let image = vec![0xAAu8; 0x1_0000];
    m.load_bios(&image).unwrap();
    // MOV byte [0x0000], 0x55 with DS pointing into the ROM.
    with_code(&mut m, &[0xC6, 0x06, 0x00, 0x00, 0x55]);
    m.cpu.set_seg(Seg::Ds, 0xF000);
    m.run_slice(1);
    assert_eq!(m.memory_mut().read_u8(0xF0000), 0xAA);
}

#[test]
fn oversized_bios_image_is_rejected() {
    let mut m = machine();
    let image = vec![0u8; 0x10_0001];
    assert!(m.load_bios(&image).is_err());
}

#[test]
fn keyboard_reset_command_resets_the_cpu_next_slice() {
    let mut m = machine();
    // OUT 0x64, AL with AL = 0xFE.
    with_code(&mut m, &[0xB0, 0xFE, 0xE6, 0x64]);
    m.run_slice(2);

    // A20 is re-gated and the CPU is back at the reset vector on the next
    // slice boundary.
    m.run_slice(0);
    assert_eq!(m.cpu.seg(Seg::Cs), 0xF000);
    assert_eq!(m.cpu.ip, 0xFFF0);
    assert!(!m.a20().enabled());
}

#[test]
fn kbc_scancode_delivers_irq1_and_wakes_hlt() {
    let mut m = machine();
    // IVT 9 -> 0x0000:0x0500 where the handler reads port 0x60 then halts
    // again.
    m.memory_mut().load(9 * 4, &[0x00, 0x05, 0x00, 0x00]);
    m.memory_mut().load(0x0500, &[0xE4, 0x60, 0xF4]); // IN AL,0x60; HLT
    with_code(&mut m, &[0xFB, 0xF4]); // STI; HLT
    m.run_slice(2);
    assert!(m.cpu.halted);

    // Program the PIC the way the BIOS would, then inject a scancode.
    {
        let pic = m.pic();
        let mut pic = pic.borrow_mut();
        use at286_devices::io::PortIoDevice;
        pic.write_u8(0x20, 0x11);
        pic.write_u8(0x21, 0x08);
        pic.write_u8(0x21, 0x04);
        pic.write_u8(0x21, 0x01);
        pic.write_u8(0x21, 0x00);
    }
    m.keyboard().borrow_mut().send_scancode(0x1C);

    // Next slice accepts IRQ1 (vector 9), runs the handler, and AL holds the
    // scancode.
    m.run_slice(4);
    assert_eq!(m.cpu.regs.al(), 0x1C);
    assert!(m.cpu.halted);
}

#[test]
fn pit_period_raises_irq0_through_the_pic() {
    let mut m = machine();
    m.memory_mut().load(8 * 4, &[0x00, 0x06, 0x00, 0x00]);
    m.memory_mut().load(0x0600, &[0xF4]); // handler: HLT
    // STI; program PIT channel 0 to a short period; HLT.
    with_code(
        &mut m,
        &[
            0xFB, // STI
            0xB0, 0x34, 0xE6, 0x43, // MOV AL,0x34; OUT 0x43,AL
            0xB0, 0x10, 0xE6, 0x40, // MOV AL,0x10; OUT 0x40,AL (low)
            0xB0, 0x00, 0xE6, 0x40, // MOV AL,0x00; OUT 0x40,AL (high)
            0xF4, // HLT
        ],
    );
    m.run_slice(8);
    assert!(m.cpu.halted);

    m.tick_pit(0x10);
    m.run_slice(1);
    assert_eq!(m.cpu.ip, 0x0601, "woke into the IRQ0 handler and halted");
    assert!(m.cpu.halted);
}

#[test]
fn port_92_gates_a20_end_to_end() {
    let mut m = machine();
    // MOV AL,0x02; OUT 0x92,AL
    with_code(&mut m, &[0xB0, 0x02, 0xE6, 0x92]);
    assert!(!m.a20().enabled());
    m.run_slice(2);
    assert!(m.a20().enabled());

    // With the gate open, 0xFFFF:0x0010 reaches past 1 MiB.
    m.memory_mut().load(0x10_0000, &[0x42]);
    m.memory_mut().load(0x0000, &[0x24]);
    assert_eq!(m.memory_mut().read_u8(0x10_0000), 0x42);
}

#[test]
fn cmos_returns_the_configured_memory_split() {
    let mut m = machine();
    // MOV AL,0x15; OUT 0x70,AL; IN AL,0x71
    with_code(&mut m, &[0xB0, 0x15, 0xE6, 0x70, 0xE4, 0x71]);
    m.run_slice(3);
    assert_eq!(m.cpu.regs.al(), (640u16 & 0xFF) as u8);
}

#[test]
fn interrupts_wait_for_sti() {
    let mut m = machine();
    m.memory_mut().load(8 * 4, &[0x00, 0x06, 0x00, 0x00]);
    m.memory_mut().load(0x0600, &[0xF4]); // handler: HLT
    with_code(&mut m, &[0x90, 0x90]);
    m.raise_irq(0);

    // IF clear: the pending IRQ must not be taken.
    m.run_slice(1);
    assert_eq!(m.cpu.ip, 0x0001);

    m.cpu.flags.ifl = true;
    m.run_slice(1);
    assert!(m.cpu.halted, "vector 8 entered and its handler halted");
    assert_eq!(m.cpu.ip, 0x0601);
}
