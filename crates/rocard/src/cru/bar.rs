use std::str::FromStr;

use tracing::debug;

use crate::bar::Bar;
use crate::cru::regs::{self, bar2, data_source, reg, trigger_mode};
use crate::error::{ChannelError, Result};
use crate::params::DataSource;

/// How the emulated CTP issues triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Manual,
    Periodic,
    Continuous,
    /// Triggers at a fixed list of bunch crossings.
    Fixed,
    /// Periodic heartbeat-class triggers.
    Hc,
    /// Periodic calibration-class triggers.
    Cal,
}

impl FromStr for TriggerMode {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(TriggerMode::Manual),
            "PERIODIC" => Ok(TriggerMode::Periodic),
            "CONTINUOUS" => Ok(TriggerMode::Continuous),
            "FIXED" => Ok(TriggerMode::Fixed),
            "HC" => Ok(TriggerMode::Hc),
            "CAL" => Ok(TriggerMode::Cal),
            _ => Err(ChannelError::InvalidParameter("unknown trigger mode")),
        }
    }
}

/// Parameters for the local CTP emulator on BAR2.
#[derive(Debug, Clone, Copy)]
pub struct CtpInfo {
    pub bc_max: u32,
    pub hb_drop: u32,
    pub hb_keep: u32,
    pub hb_max: u32,
    pub trigger_mode: TriggerMode,
    pub trigger_frequency: u32,
    /// Put the emulator into idle, generating an EOX.
    pub generate_eox: bool,
    /// Emit one PHY trigger and return.
    pub generate_single_trigger: bool,
}

/// CRU control surface over one mapped BAR.
///
/// DMA-facing operations (superpage push, count, size) address BAR0;
/// `emulate_ctp` requires BAR2. The caller constructs one `CruBar` per
/// mapped BAR, mirroring how the card exposes them.
pub struct CruBar {
    bar: Box<dyn Bar>,
    /// Expected next size-FIFO entry index, per link. Detects dropped or
    /// re-read entries when the PCIe bus outruns the FIFO update.
    superpage_size_index: [u32; regs::MAX_LINKS as usize],
}

impl CruBar {
    pub fn new(bar: Box<dyn Bar>) -> Self {
        CruBar {
            bar,
            superpage_size_index: [0; regs::MAX_LINKS as usize],
        }
    }

    /// Push a superpage descriptor into a link's FIFO. The address writes
    /// are buffered firmware-side; the pages write commits.
    pub fn push_superpage_descriptor(&mut self, link: u32, pages: u32, bus_address: u64) {
        self.bar.write_register(
            reg::link(link, reg::LINK_SUPERPAGE_ADDRESS_HIGH),
            (bus_address >> 32) as u32,
        );
        self.bar.write_register(
            reg::link(link, reg::LINK_SUPERPAGE_ADDRESS_LOW),
            bus_address as u32,
        );
        self.bar
            .write_register(reg::link(link, reg::LINK_SUPERPAGE_PAGES), pages);
    }

    /// Cumulative number of superpages this link has filled.
    pub fn superpage_count(&self, link: u32) -> u32 {
        self.bar
            .read_register(reg::link(link, reg::LINK_SUPERPAGE_COUNT))
    }

    /// Pop the next size report for a link, in bytes. Returns 0 on firmware
    /// that predates size reporting; callers fall back to the full
    /// superpage size.
    pub fn superpage_size(&mut self, link: u32) -> Result<u32> {
        let size_reg = reg::link(link, reg::LINK_SUPERPAGE_SIZE);
        // A dummy write advances the FIFO to the next entry.
        self.bar.write_register(size_reg, 0xbadcafe);
        let mut fifo_word = self.bar.read_register(size_reg);
        let mut size = fifo_word & 0x00ff_ffff;
        if size == 0 {
            return Ok(0);
        }
        let mut index = fifo_word >> 24;

        let expected = self.superpage_size_index[link as usize];
        // The FIFO may briefly report a stale entry if the bus outran the
        // firmware update. Bounded re-read, then give up.
        let mut retries = 1000u32;
        while index != expected {
            retries -= 1;
            if retries == 0 {
                return Err(ChannelError::ProtocolError(
                    "superpage size FIFO index never matched",
                ));
            }
            fifo_word = self.bar.read_register(size_reg);
            size = fifo_word & 0x00ff_ffff;
            index = fifo_word >> 24;
        }
        self.superpage_size_index[link as usize] = (index + 1) % 256;
        Ok(size)
    }

    pub fn reset_superpage_size_index(&mut self) {
        self.superpage_size_index = [0; regs::MAX_LINKS as usize];
    }

    /// Enable or disable the on-board data emulator (DMA + generator).
    pub fn set_data_emulator_enabled(&mut self, enabled: bool) {
        self.bar
            .write_register(reg::DMA_CONTROL, if enabled { 0x1 } else { 0x0 });
        let mut bits = self.bar.read_register(reg::DATA_GENERATOR_CONTROL);
        if enabled {
            bits |= 0x1;
        } else {
            bits &= !0x1;
        }
        self.bar.write_register(reg::DATA_GENERATOR_CONTROL, bits);
    }

    pub fn reset_data_generator_counter(&mut self) {
        self.bar.write_register(reg::RESET_CONTROL, 0x2);
    }

    pub fn reset_card(&mut self) {
        self.bar.write_register(reg::RESET_CONTROL, 0x1);
    }

    pub fn set_data_source(&mut self, source: DataSource) -> Result<()> {
        let value = match source {
            DataSource::Internal => data_source::INTERNAL,
            DataSource::Ddg => data_source::DDG,
            DataSource::Fee => data_source::GBT,
            DataSource::Diu | DataSource::Siu => {
                return Err(ChannelError::UnsupportedFeature(
                    "CRU has no DIU/SIU data sources",
                ));
            }
        };
        self.bar.write_register(reg::DATA_SOURCE_SELECT, value);
        Ok(())
    }

    pub fn enable_data_taking(&mut self) {
        self.bar.modify_register(reg::BSP_USER_CONTROL, 0, 1, 0x1);
    }

    pub fn disable_data_taking(&mut self) {
        self.bar.modify_register(reg::BSP_USER_CONTROL, 0, 1, 0x0);
    }

    pub fn dropped_packets(&self) -> u32 {
        self.bar.read_register(reg::DROPPED_PACKETS)
    }

    pub fn firmware_info(&self) -> String {
        format!(
            "{:x}-{:x}-{:x}",
            self.bar.read_register(reg::FIRMWARE_DATE),
            self.bar.read_register(reg::FIRMWARE_TIME),
            self.bar.read_register(reg::FIRMWARE_GIT_HASH),
        )
    }

    pub fn serial(&self) -> i32 {
        self.bar.read_register(reg::SERIAL) as i32
    }

    /// Drive the local CTP emulator. Requires BAR2.
    pub fn emulate_ctp(&mut self, mut info: CtpInfo) -> Result<()> {
        self.bar.assert_index(2, "CTP emulation needs BAR 2")?;

        if info.generate_eox {
            self.bar.write_register(bar2::TTC_EMU_IDLE, 0x1);
            return Ok(());
        }
        if info.generate_single_trigger {
            self.bar.write_register(bar2::TTC_EMU_PHYS_TRIG, 0x1);
            return Ok(());
        }

        // Hold the emulator in reset while reprogramming it.
        self.bar.write_register(bar2::TTC_EMU_CONTROL, 0x1);

        match info.trigger_mode {
            TriggerMode::Periodic => {
                self.bar
                    .write_register(bar2::TTC_EMU_PHYSDIV, info.trigger_frequency);
                self.bar.write_register(bar2::TTC_EMU_HCDIV, 5);
                self.bar.write_register(bar2::TTC_EMU_CALDIV, 5);
            }
            TriggerMode::Hc => {
                info.trigger_mode = TriggerMode::Periodic;
                self.bar.write_register(bar2::TTC_EMU_PHYSDIV, 5);
                self.bar
                    .write_register(bar2::TTC_EMU_HCDIV, info.trigger_frequency);
                self.bar.write_register(bar2::TTC_EMU_CALDIV, 5);
            }
            TriggerMode::Cal => {
                info.trigger_mode = TriggerMode::Periodic;
                self.bar.write_register(bar2::TTC_EMU_PHYSDIV, 5);
                self.bar.write_register(bar2::TTC_EMU_HCDIV, 5);
                self.bar
                    .write_register(bar2::TTC_EMU_CALDIV, info.trigger_frequency);
            }
            TriggerMode::Fixed => {
                info.trigger_mode = TriggerMode::Periodic;
                // PHYS stays slow enough that only the fixed BC list fires.
                self.bar.write_register(bar2::TTC_EMU_PHYSDIV, 5);
                for bc in regs::FIXED_BC_TRIGGERS {
                    self.bar.write_register(bar2::TTC_EMU_FBCT, bc);
                }
            }
            TriggerMode::Manual | TriggerMode::Continuous => {}
        }

        let mode = match info.trigger_mode {
            TriggerMode::Manual => trigger_mode::MANUAL,
            TriggerMode::Continuous => trigger_mode::CONTINUOUS,
            _ => trigger_mode::PERIODIC,
        };
        self.bar.write_register(bar2::TTC_EMU_RUNMODE, mode);

        self.bar.write_register(bar2::TTC_EMU_BCMAX, info.bc_max);
        self.bar.write_register(bar2::TTC_EMU_HBMAX, info.hb_max);
        self.bar
            .write_register(bar2::TTC_EMU_PRESCALER_KEEP, info.hb_keep);
        self.bar
            .write_register(bar2::TTC_EMU_PRESCALER_DROP, info.hb_drop);

        debug!(?info, "CTP emulator programmed");
        self.bar.write_register(bar2::TTC_EMU_CONTROL, 0x0);
        Ok(())
    }
}
