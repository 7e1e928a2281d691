//! CRU register map. Indices are 32-bit word offsets.
//!
//! BAR0 carries the DMA engine and the per-link superpage FIFOs; BAR2
//! carries the slow-control block with the TTC/CTP emulator.

/// Links per card the driver will address.
pub const MAX_LINKS: u32 = 24;

/// BAR0 registers.
pub mod reg {
    /// DMA enable.
    pub const DMA_CONTROL: u32 = 0x00;
    /// Which upstream feeds the datapath; values in [`super::data_source`].
    pub const DATA_SOURCE_SELECT: u32 = 0x01;
    /// On-board data generator control; bit 0 enables.
    pub const DATA_GENERATOR_CONTROL: u32 = 0x02;
    /// Write 0x1 to reset the card, 0x2 to reset the generator counter.
    pub const RESET_CONTROL: u32 = 0x03;
    /// Packets dropped by the datapath wrapper.
    pub const DROPPED_PACKETS: u32 = 0x04;
    /// Bit 0: data taking enabled. Bits [16..28]: CRU id.
    pub const BSP_USER_CONTROL: u32 = 0x05;
    pub const FIRMWARE_DATE: u32 = 0x07;
    pub const FIRMWARE_TIME: u32 = 0x08;
    pub const FIRMWARE_GIT_HASH: u32 = 0x09;
    pub const SERIAL: u32 = 0x0a;

    /// Per-link superpage register block.
    pub const LINK_BASE: u32 = 0x40;
    pub const LINK_STRIDE: u32 = 0x8;
    /// Staged superpage bus address.
    pub const LINK_SUPERPAGE_ADDRESS_HIGH: u32 = 0x0;
    pub const LINK_SUPERPAGE_ADDRESS_LOW: u32 = 0x1;
    /// Superpage size in 8 KiB pages; the write pushes the descriptor.
    pub const LINK_SUPERPAGE_PAGES: u32 = 0x2;
    /// Cumulative count of superpages the link has filled.
    pub const LINK_SUPERPAGE_COUNT: u32 = 0x3;
    /// Size-report FIFO: bits [0..24] size in bytes, [24..32] entry index.
    /// A (dummy) write advances the FIFO to the next entry.
    pub const LINK_SUPERPAGE_SIZE: u32 = 0x4;

    pub fn link(link: u32, offset: u32) -> u32 {
        LINK_BASE + link * LINK_STRIDE + offset
    }

    /// Words the BAR0 map occupies; used to size fakes.
    pub const COUNT: u32 = LINK_BASE + super::MAX_LINKS * LINK_STRIDE;
}

/// DATA_SOURCE_SELECT values.
pub mod data_source {
    /// Real upstream over GBT.
    pub const GBT: u32 = 0x0;
    /// Internal loopback generator.
    pub const INTERNAL: u32 = 0x1;
    /// On-board DDG generator.
    pub const DDG: u32 = 0x2;
}

/// BAR2 registers: the TTC/CTP emulator block.
pub mod bar2 {
    /// Trigger run mode; values in [`super::trigger_mode`].
    pub const TTC_EMU_RUNMODE: u32 = 0x20;
    /// Bit 0 holds the emulator in reset.
    pub const TTC_EMU_CONTROL: u32 = 0x21;
    pub const TTC_EMU_BCMAX: u32 = 0x22;
    pub const TTC_EMU_HBMAX: u32 = 0x23;
    pub const TTC_EMU_PRESCALER_KEEP: u32 = 0x24;
    pub const TTC_EMU_PRESCALER_DROP: u32 = 0x25;
    pub const TTC_EMU_PHYSDIV: u32 = 0x26;
    pub const TTC_EMU_HCDIV: u32 = 0x27;
    pub const TTC_EMU_CALDIV: u32 = 0x28;
    /// Fixed bunch-crossing trigger list; one write per entry.
    pub const TTC_EMU_FBCT: u32 = 0x29;
    /// Write 1 to emit a single PHY trigger.
    pub const TTC_EMU_PHYS_TRIG: u32 = 0x2a;
    /// Write 1 to drop the emulator into idle (EOX).
    pub const TTC_EMU_IDLE: u32 = 0x2b;

    /// Words the BAR2 map occupies; used to size fakes.
    pub const COUNT: u32 = 0x40;
}

/// TTC_EMU_RUNMODE values. `Fixed`, `Hc` and `Cal` are host-side modes that
/// program a divider and then demote to `Periodic`.
pub mod trigger_mode {
    pub const MANUAL: u32 = 0x0;
    pub const PERIODIC: u32 = 0x1;
    pub const CONTINUOUS: u32 = 0x2;
}

/// Bunch crossings used by the fixed-BC trigger mode.
pub const FIXED_BC_TRIGGERS: [u32; 9] = [
    0x10, 0x14d, 0x29a, 0x3e7, 0x534, 0x681, 0x7ce, 0x91b, 0xa68,
];
