//! Linear priority-level numbering shared by every layer of the controller.
//!
//! Every interrupt source is mapped onto one scale: level 0 is the NMI and
//! has the highest priority, levels 1..=15 are the hardware IRQ lines in
//! fixed priority order, and levels 16..=31 are host-internal software
//! levels with no hardware analogue. Note that the numbering is *not* the
//! IRQ numbering: the second chip's lines (IRQ8..IRQ15) outrank IRQ3..IRQ7,
//! exactly as on a real AT where the slave cascades into IRQ2.
//!
//! There is no level for IRQ2 itself. A PC's IRQ2 input is wired to IRQ9,
//! so guest traffic on the cascade bit is reported through [`IRQ9`].

/// Non-maskable interrupt, the highest priority source.
pub const NMI: u8 = 0;
/// Timer line.
pub const IRQ0: u8 = 1;
/// Keyboard line.
pub const IRQ1: u8 = 2;
/// Real-time clock line.
pub const IRQ8: u8 = 3;
/// Cascade replacement; also reached by guest traffic aimed at IRQ2.
pub const IRQ9: u8 = 4;
pub const IRQ10: u8 = 5;
pub const IRQ11: u8 = 6;
pub const IRQ12: u8 = 7;
pub const IRQ13: u8 = 8;
/// Disk line.
pub const IRQ14: u8 = 9;
pub const IRQ15: u8 = 10;
/// COM2 line.
pub const IRQ3: u8 = 11;
/// COM1 line.
pub const IRQ4: u8 = 12;
pub const IRQ5: u8 = 13;
/// Floppy line.
pub const IRQ6: u8 = 14;
pub const IRQ7: u8 = 15;

/// First host-internal software level.
pub const SOFT_BASE: u8 = 16;

/// Sentinel meaning "no interrupt active". One past the last real level.
pub const NONE: u8 = 32;

/// Number of real levels.
pub const COUNT: usize = 32;

/// Bits for the hardware IRQ levels 1..=15. The NMI and the software levels
/// are outside the guest's STI/CLI reach and never wait for a guest EOI.
pub const HW_LEVELS: u32 = 0xFFFE;

/// Bits for the levels carried by the second chip (IRQ8..IRQ15).
pub const SLAVE_LEVELS: u32 = 0x07F8;

/// Guest vector each level starts out with, before any ICW2 reprogramming.
/// Software levels have no vector until one is registered.
pub(crate) const DEFAULT_VECTORS: [u8; COUNT] = [
    0x02, 0x08, 0x09, 0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77, 0x0B,
    0x0C, 0x0D, 0x0E, 0x0F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Translates an ISA IRQ line number to its priority level.
///
/// IRQ2 maps to [`IRQ9`]; see the module docs.
pub fn level_for_irq(irq: u8) -> Option<u8> {
    const MAP: [u8; 16] = [
        IRQ0, IRQ1, IRQ9, IRQ3, IRQ4, IRQ5, IRQ6, IRQ7, IRQ8, IRQ9, IRQ10,
        IRQ11, IRQ12, IRQ13, IRQ14, IRQ15,
    ];
    MAP.get(usize::from(irq)).copied()
}

/// Translates a priority level back to its ISA IRQ line, where one exists.
pub fn irq_for_level(level: u8) -> Option<u8> {
    const MAP: [u8; 15] = [0, 1, 8, 9, 10, 11, 12, 13, 14, 15, 3, 4, 5, 6, 7];
    if (1..=15).contains(&level) {
        Some(MAP[usize::from(level) - 1])
    } else {
        None
    }
}
