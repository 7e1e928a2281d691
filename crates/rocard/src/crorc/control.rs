use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bar::Bar;
use crate::crorc::regs::{control, ddl, fee, link, loopback, pattern_code, reg};
use crate::error::{ChannelError, Result};
use crate::params::GeneratorPattern;
use crate::timing::Timing;

/// Pending-response sentinel in the DIU/SIU status registers.
const STATUS_PENDING: u32 = u32::MAX;

/// Link configuration established by the version probe. Carried through the
/// reset and arm sequences because the poll budget depends on how fast this
/// host can hammer the BAR.
#[derive(Debug, Clone, Copy)]
pub struct DiuConfig {
    pub diu_version: u32,
    /// How many register reads fit in a microsecond on this host.
    pub pci_loop_per_usec: u64,
}

impl DiuConfig {
    fn response_budget(&self) -> u64 {
        ddl::RESPONSE_TIME * self.pci_loop_per_usec
    }
}

/// The CRORC register protocol: reset levels, DDL link commands, loopback
/// selection, data generator and receiver control, free-FIFO descriptor
/// pushes.
///
/// Every operation is a precise register sequence with bounded
/// poll-and-timeout semantics; nothing here blocks unboundedly.
pub struct Crorc {
    bar: Box<dyn Bar>,
    timing: Box<dyn Timing>,
}

impl Crorc {
    pub fn new(bar: Box<dyn Bar>, timing: Box<dyn Timing>) -> Self {
        Crorc { bar, timing }
    }

    /// Protocol settle pause; also used by the channel's start sequence.
    pub fn settle(&self, duration: Duration) {
        self.timing.settle(duration);
    }

    pub fn firmware_info(&self) -> String {
        format!("{:x}", self.bar.read_register(reg::FIRMWARE))
    }

    pub fn serial(&self) -> i32 {
        self.bar.read_register(reg::SERIAL) as i32
    }

    /// Probe the DIU version and calibrate the poll budget.
    pub fn init_diu_version(&mut self) -> Result<DiuConfig> {
        let diu_version = self.bar.read_register(reg::DIU_VERSION);

        // Time a burst of register reads so link timeouts scale with the
        // actual BAR access latency of this host.
        const PROBE_READS: u32 = 100;
        let start = Instant::now();
        for _ in 0..PROBE_READS {
            self.bar.read_register(reg::DIU_VERSION);
        }
        let elapsed_us = start.elapsed().as_micros().max(1) as u64;
        let pci_loop_per_usec = (PROBE_READS as u64 / elapsed_us).max(1);

        debug!(diu_version, pci_loop_per_usec, "DIU version probe");
        Ok(DiuConfig {
            diu_version,
            pci_loop_per_usec,
        })
    }

    /// Issue a reset command and wait for the card to come back.
    pub fn reset_command(&mut self, bits: u32, cfg: &DiuConfig) -> Result<()> {
        debug!(bits = format_args!("{bits:#x}"), "reset command");
        self.bar.write_register(reg::RESET, bits);
        self.poll(reg::CONTROL, cfg.response_budget(), |v| {
            v & control::RESET_IN_PROGRESS == 0
        })
        .map_err(|_| ChannelError::LinkTimeout("card did not come out of reset"))?;
        Ok(())
    }

    /// Send a reset through the optical link instead of the card core.
    pub fn arm_ddl(&mut self, bits: u32, cfg: &DiuConfig) -> Result<()> {
        use crate::crorc::regs::reset;
        if bits & reset::SIU != 0 {
            self.siu_command(ddl::SRST, cfg)?;
        }
        if bits & reset::DIU != 0 {
            self.diu_command(ddl::SRST, cfg)?;
        }
        if bits & reset::RORC != 0 {
            self.reset_command(reset::RORC, cfg)?;
        }
        Ok(())
    }

    pub fn set_loopback_off(&mut self) {
        self.bar.write_register(reg::LOOPBACK, 0);
    }

    pub fn set_loopback_on(&mut self) {
        self.bar.write_register(reg::LOOPBACK, loopback::INTERNAL);
    }

    pub fn set_diu_loopback(&mut self, cfg: &DiuConfig) -> Result<()> {
        self.bar.write_register(reg::LOOPBACK, loopback::DIU);
        self.diu_command(ddl::IFLOOP, cfg)?;
        Ok(())
    }

    pub fn set_siu_loopback(&mut self, cfg: &DiuConfig) -> Result<()> {
        self.bar.write_register(reg::LOOPBACK, loopback::SIU);
        self.siu_command(ddl::IFLOOP, cfg)?;
        Ok(())
    }

    /// Fail with `LinkDown` unless the DIU reports link up within budget.
    pub fn assert_link_up(&mut self, cfg: &DiuConfig) -> Result<()> {
        self.poll(reg::LINK_STATUS, cfg.response_budget(), |v| {
            v & link::DIU_UP != 0
        })
        .map_err(|_| ChannelError::LinkDown("DIU link did not come up"))?;
        Ok(())
    }

    /// Send a DDL command to the DIU and wait for its status word.
    pub fn diu_command(&mut self, command: u32, cfg: &DiuConfig) -> Result<u32> {
        self.link_command(reg::DIU_COMMAND, reg::DIU_STATUS, command, cfg)
            .map_err(|_| ChannelError::LinkTimeout("DIU did not answer"))
    }

    /// Send a DDL command to the SIU and wait for its status word.
    pub fn siu_command(&mut self, command: u32, cfg: &DiuConfig) -> Result<u32> {
        self.link_command(reg::SIU_COMMAND, reg::SIU_STATUS, command, cfg)
            .map_err(|_| ChannelError::LinkTimeout("SIU did not answer"))
    }

    /// Read-and-clear the DIU interface status word.
    pub fn read_diu_status(&mut self, cfg: &DiuConfig) -> Result<u32> {
        self.diu_command(ddl::RAND_CIFST, cfg)
    }

    /// Read-and-clear the SIU interface status word.
    pub fn read_siu_status(&mut self, cfg: &DiuConfig) -> Result<u32> {
        self.siu_command(ddl::RAND_CIFST, cfg)
    }

    /// Point the card's completion writes at the Ready FIFO and enable the
    /// data receiver.
    pub fn start_data_receiver(&mut self, fifo_bus_address: u64) {
        self.bar
            .write_register(reg::READY_FIFO_ADDRESS_HIGH, (fifo_bus_address >> 32) as u32);
        self.bar
            .write_register(reg::READY_FIFO_ADDRESS_LOW, fifo_bus_address as u32);
        self.bar
            .modify_register(reg::CONTROL, 0, 1, control::DATA_RECEIVER_ON);
    }

    pub fn stop_data_receiver(&mut self) {
        self.bar.modify_register(reg::CONTROL, 0, 1, 0);
    }

    pub fn arm_data_generator(&mut self, pattern: GeneratorPattern, page_size: u64) {
        let code = match pattern {
            GeneratorPattern::Incremental => pattern_code::INCREMENTAL,
            GeneratorPattern::Alternating => pattern_code::ALTERNATING,
            GeneratorPattern::Constant => pattern_code::CONSTANT,
            GeneratorPattern::Random => pattern_code::RANDOM,
        };
        self.bar
            .write_register(reg::GENERATOR_EVENT_LENGTH, (page_size / 4) as u32);
        self.bar.write_register(reg::GENERATOR_PATTERN, code);
    }

    pub fn start_data_generator(&mut self) {
        self.bar.write_register(reg::GENERATOR_CONTROL, 1);
    }

    pub fn stop_data_generator(&mut self) {
        self.bar.write_register(reg::GENERATOR_CONTROL, 0);
    }

    /// Send the FEE start handshake (RDYRX or STBRD) through the SIU.
    pub fn start_trigger(&mut self, cfg: &DiuConfig, command: u32) -> Result<()> {
        self.siu_command(command, cfg)?;
        Ok(())
    }

    /// Send EOBTR to the FEE.
    pub fn stop_trigger(&mut self, cfg: &DiuConfig) -> Result<()> {
        self.siu_command(fee::EOBTR, cfg)?;
        Ok(())
    }

    /// Push one descriptor into the firmware's Rx free FIFO.
    ///
    /// The address writes are staged; the `(words << 8) | slot` write
    /// commits the descriptor. `write_register` carries the release fence
    /// that publishes any preceding buffer writes.
    pub fn push_rx_free_fifo(&mut self, bus_address: u64, words: u32, slot: usize) -> Result<()> {
        if words >= 1 << 24 {
            return Err(ChannelError::InvalidParameter(
                "superpage too large for a free-FIFO descriptor",
            ));
        }
        self.bar
            .write_register(reg::FREE_FIFO_ADDRESS_HIGH, (bus_address >> 32) as u32);
        self.bar
            .write_register(reg::FREE_FIFO_ADDRESS_LOW, bus_address as u32);
        self.bar
            .write_register(reg::FREE_FIFO_PUSH, (words << 8) | slot as u32);
        Ok(())
    }

    /// The free FIFO must be empty right after a FF reset; anything else
    /// means the card and driver disagree about in-flight descriptors.
    pub fn assert_free_fifo_empty(&mut self) -> Result<()> {
        let occupancy = self.bar.read_register(reg::FREE_FIFO_OCCUPANCY);
        if occupancy != 0 {
            warn!(occupancy, "free FIFO not empty after reset");
            return Err(ChannelError::ProtocolError("free FIFO not empty after reset"));
        }
        Ok(())
    }

    fn link_command(
        &mut self,
        command_reg: u32,
        status_reg: u32,
        command: u32,
        cfg: &DiuConfig,
    ) -> Result<u32> {
        // Re-arm the status register so we observe this command's response,
        // not a stale one.
        self.bar.write_register(status_reg, STATUS_PENDING);
        self.bar.write_register(command_reg, command);
        let status = self.poll(status_reg, cfg.response_budget(), |v| v != STATUS_PENDING)?;
        Ok(status)
    }

    /// Busy-poll a register until `done` accepts its value, for at most
    /// `budget` iterations, napping a microsecond every so often to stay
    /// off the bus.
    fn poll(&self, register: u32, budget: u64, done: impl Fn(u32) -> bool) -> Result<u32> {
        for i in 0..budget.max(1) {
            let value = self.bar.read_register(register);
            if done(value) {
                return Ok(value);
            }
            if i % 1024 == 1023 {
                std::thread::sleep(Duration::from_micros(1));
            } else {
                std::hint::spin_loop();
            }
        }
        Err(ChannelError::LinkTimeout("register poll expired"))
    }
}
