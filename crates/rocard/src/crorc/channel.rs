use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::BufferProvider;
use crate::channel::ChannelState;
use crate::crorc::control::{Crorc, DiuConfig};
use crate::crorc::regs::{ddl, fee, reset};
use crate::error::{ChannelError, Result};
use crate::fifo::{ArrivalStatus, ReadyFifo, READY_FIFO_CAPACITY};
use crate::lock::ChannelLock;
use crate::params::{DataSource, GeneratorPattern, Parameters, ResetLevel};
use crate::superpage::Superpage;

/// The CRORC accepts exactly one descriptor per Ready-FIFO slot, so the
/// transfer queue is bounded by the ring.
pub const TRANSFER_QUEUE_CAPACITY: usize = READY_FIFO_CAPACITY;
pub const READY_QUEUE_CAPACITY: usize = READY_FIFO_CAPACITY;

/// The CRORC emits fixed 8 KiB DMA pages.
pub const DMA_PAGE_SIZE: u64 = 8 * 1024;

/// Settling pause mandated by the DDL reset and arm protocol.
const SETTLE: Duration = Duration::from_millis(100);

/// DMA channel engine for one CRORC channel.
///
/// Owns the card control surface, the Ready FIFO and the channel lock. All
/// methods are non-blocking (apart from the bounded reset/arm sequences) and
/// must be called from a single driver thread.
pub struct CrorcDmaChannel {
    control: Crorc,
    fifo: ReadyFifo,
    buffer: Box<dyn BufferProvider>,
    _lock: ChannelLock,

    state: ChannelState,
    transfer_queue: VecDeque<Superpage>,
    ready_queue: VecDeque<Superpage>,

    /// Next Ready-FIFO slot the firmware will fill.
    free_front: usize,
    /// Next Ready-FIFO slot the engine will inspect.
    free_back: usize,
    /// Descriptors currently in flight: `(front - back) mod R`.
    free_size: usize,

    page_size: u64,
    data_source: DataSource,
    generator_pattern: GeneratorPattern,
    generator_enabled: bool,
    rdyrx: bool,
    stbrd: bool,
    diu_config: Option<DiuConfig>,
}

impl CrorcDmaChannel {
    pub fn new(
        params: &Parameters,
        mut control: Crorc,
        fifo: ReadyFifo,
        buffer: Box<dyn BufferProvider>,
        lock: ChannelLock,
    ) -> Result<Self> {
        if params.dma_page_size != DMA_PAGE_SIZE {
            return Err(ChannelError::InvalidParameter(
                "CRORC only supports the 8 KiB DMA page size",
            ));
        }
        if params.data_source == DataSource::Ddg {
            return Err(ChannelError::UnsupportedFeature(
                "CRORC has no DDG data source",
            ));
        }
        if buffer.size() < params.dma_page_size {
            return Err(ChannelError::BufferTooSmall {
                size: buffer.size(),
                required: params.dma_page_size,
            });
        }

        // A real front-end drives the data; the internal generator covers
        // every other source.
        let generator_enabled = params.data_source != DataSource::Fee;
        let stbrd = !generator_enabled && params.stbrd_enabled;
        let rdyrx = !generator_enabled && !stbrd;

        let diu_config = control.init_diu_version()?;

        let mut channel = CrorcDmaChannel {
            control,
            fifo,
            buffer,
            _lock: lock,
            state: ChannelState::Stopped,
            transfer_queue: VecDeque::with_capacity(TRANSFER_QUEUE_CAPACITY),
            ready_queue: VecDeque::with_capacity(READY_QUEUE_CAPACITY),
            free_front: 0,
            free_back: 0,
            free_size: 0,
            page_size: params.dma_page_size,
            data_source: params.data_source,
            generator_pattern: params.generator_pattern,
            generator_enabled,
            rdyrx,
            stbrd,
            diu_config: Some(diu_config),
        };

        // Resetting at least the card channel on construction keeps us from
        // inheriting descriptors a crashed predecessor left in flight.
        channel.reset_channel(ResetLevel::Internal)?;
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn start_dma(&mut self) -> Result<()> {
        if self.state != ChannelState::Stopped {
            return Err(ChannelError::InvalidState("startDma requires Stopped"));
        }

        let cfg = self.control.init_diu_version()?;
        self.diu_config = Some(cfg);

        // Arm the DDL according to the data source.
        let level = match self.data_source {
            DataSource::Siu | DataSource::Fee => ResetLevel::InternalDiuSiu,
            DataSource::Diu => ResetLevel::InternalDiu,
            _ => ResetLevel::Internal,
        };
        self.arm_ddl(level)?;

        self.control.start_data_receiver(self.fifo.bus_address());

        self.fifo.reset();
        self.transfer_queue.clear();
        self.ready_queue.clear();
        self.free_front = 0;
        self.free_back = 0;
        self.free_size = 0;

        self.state = ChannelState::PendingStart;
        info!("DMA start deferred until superpages are pushed");
        Ok(())
    }

    /// Stop the generator or trigger and the data receiver. Idempotent; any
    /// partially filled superpage is simply not surfaced.
    pub fn stop_dma(&mut self) -> Result<()> {
        if self.state == ChannelState::Stopped {
            return Ok(());
        }
        let cfg = self.config()?;

        if self.generator_enabled {
            self.control.stop_data_generator();
        } else if self.state == ChannelState::Running && (self.rdyrx || self.stbrd) {
            // EOBTR to the FEE; only meaningful once the trigger was sent.
            self.control.stop_trigger(&cfg)?;
        }
        self.control.stop_data_receiver();

        self.state = ChannelState::Stopped;
        info!("DMA stopped");
        Ok(())
    }

    /// Reset the channel to the given level. Valid from `Stopped` and
    /// `Faulted`; this is the recovery path out of `Faulted`.
    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if matches!(self.state, ChannelState::PendingStart | ChannelState::Running) {
            return Err(ChannelError::InvalidState("stop DMA before resetting"));
        }

        // A FEE source needs the full optical chain back in a known state.
        let level = if self.data_source == DataSource::Fee {
            level.max(ResetLevel::InternalDiuSiu)
        } else {
            level
        };

        let cfg = self.control.init_diu_version()?;
        self.diu_config = Some(cfg);

        match level {
            ResetLevel::None => {}
            ResetLevel::Internal => {
                debug!("resetting CRORC, free FIFO, internal FIFOs and counters");
                self.control.reset_command(
                    reset::RORC | reset::FF | reset::FIFOS | reset::ERROR | reset::COUNTERS,
                    &cfg,
                )?;
            }
            ResetLevel::InternalDiu => {
                debug!("resetting CRORC and DIU");
                self.control.reset_command(reset::RORC | reset::DIU, &cfg)?;
            }
            ResetLevel::InternalDiuSiu => {
                debug!("resetting CRORC, DIU and SIU");
                self.control.set_loopback_off();
                self.control.settle(SETTLE);

                self.control.reset_command(reset::DIU, &cfg)?;
                self.control.settle(SETTLE);

                self.control.reset_command(reset::SIU, &cfg)?;
                self.control.settle(SETTLE);

                let status = self.control.read_diu_status(&cfg)?;
                if ddl::is_no_signal(status) {
                    return Err(ChannelError::LinkDown(
                        "SIU in no-signal state (fiber probably not connected)",
                    ));
                }
                // The SIU may legitimately be slow to answer right after its
                // reset; a timeout here is reported but does not abort.
                if let Err(err) = self.control.read_siu_status(&cfg) {
                    warn!(%err, "SIU status read after reset timed out");
                }
            }
        }

        if !self.transfer_queue.is_empty() {
            warn!(
                discarded = self.transfer_queue.len(),
                "reset discarded in-flight superpages"
            );
        }
        self.fifo.reset();
        self.transfer_queue.clear();
        self.ready_queue.clear();
        self.free_front = 0;
        self.free_back = 0;
        self.free_size = 0;
        self.state = ChannelState::Stopped;
        Ok(())
    }

    /// Hand a superpage to the firmware. Non-blocking; fails with
    /// `QueueFull` when either the transfer queue or the descriptor ring is
    /// at capacity, without side effects.
    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        if self.state == ChannelState::Faulted {
            return Err(ChannelError::InvalidState("channel faulted; reset required"));
        }
        self.check_superpage(&superpage)?;

        if self.transfer_queue.len() >= TRANSFER_QUEUE_CAPACITY {
            return Err(ChannelError::QueueFull);
        }
        if self.free_size >= READY_FIFO_CAPACITY {
            return Err(ChannelError::QueueFull);
        }

        let bus_address = self.buffer.bus_address(superpage.offset, superpage.size)?;
        let words = (superpage.size / 4) as u32;
        self.control
            .push_rx_free_fifo(bus_address, words, self.free_front)?;
        self.free_size += 1;
        self.free_front = (self.free_front + 1) % READY_FIFO_CAPACITY;

        self.transfer_queue.push_back(Superpage::new(
            superpage.offset,
            superpage.size,
        ));
        Ok(())
    }

    /// Drive the channel forward: perform the deferred DMA start once work
    /// is pending, then move completed superpages from the transfer queue to
    /// the ready queue. Must be called regularly; idempotent.
    pub fn fill_superpages(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Stopped => {
                return Err(ChannelError::InvalidState("DMA not started"));
            }
            ChannelState::Faulted => {
                return Err(ChannelError::InvalidState("channel faulted; reset required"));
            }
            ChannelState::PendingStart => {
                if self.transfer_queue.is_empty() {
                    // Still waiting for enough superpages to start DMA.
                    return Ok(());
                }
                self.start_pending_dma()?;
            }
            ChannelState::Running => {}
        }

        while self.free_size > 0 && self.ready_queue.len() < READY_QUEUE_CAPACITY {
            match self.fifo.probe(self.free_back) {
                // Completion is strictly in order: if this slot hasn't
                // arrived, later ones must not be consumed either.
                ArrivalStatus::NoneArrived | ArrivalStatus::PartArrived => break,
                ArrivalStatus::WholeArrived => {
                    let words = self.fifo.length_of(self.free_back);
                    self.fifo.clear(self.free_back);
                    self.free_size -= 1;
                    self.free_back = (self.free_back + 1) % READY_FIFO_CAPACITY;

                    let mut superpage = self
                        .transfer_queue
                        .pop_front()
                        .ok_or(ChannelError::ProtocolError(
                            "completion without a queued superpage",
                        ))?;
                    superpage.received = u64::from(words) * 4;
                    superpage.ready = true;
                    self.ready_queue.push_back(superpage);
                }
                ArrivalStatus::Error { status } => {
                    let length = self.fifo.length_of(self.free_back);
                    self.state = ChannelState::Faulted;
                    return Err(ChannelError::DataArrival {
                        index: self.free_back,
                        status,
                        length,
                    });
                }
            }
        }
        Ok(())
    }

    /// Front of the ready queue without removing it.
    pub fn get_superpage(&self) -> Result<Superpage> {
        self.ready_queue.front().copied().ok_or(ChannelError::Empty)
    }

    /// Remove and return the front of the ready queue.
    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        self.ready_queue.pop_front().ok_or(ChannelError::Empty)
    }

    pub fn transfer_queue_available(&self) -> usize {
        TRANSFER_QUEUE_CAPACITY - self.transfer_queue.len()
    }

    pub fn ready_queue_size(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn is_transfer_queue_empty(&self) -> bool {
        self.transfer_queue.is_empty()
    }

    pub fn is_ready_queue_full(&self) -> bool {
        self.ready_queue.len() == READY_QUEUE_CAPACITY
    }

    /// Filled superpages awaiting pop.
    pub fn superpage_queue_count(&self) -> usize {
        self.ready_queue.len()
    }

    /// Superpages the client may still push.
    pub fn superpage_queue_available(&self) -> usize {
        self.transfer_queue_available()
    }

    pub fn dropped_packets(&self) -> Option<u32> {
        // The CRORC firmware keeps no dropped-packet counter.
        None
    }

    pub fn firmware_info(&self) -> String {
        self.control.firmware_info()
    }

    pub fn serial(&self) -> i32 {
        self.control.serial()
    }

    fn check_superpage(&self, superpage: &Superpage) -> Result<()> {
        if superpage.size == 0 || superpage.size % self.page_size != 0 {
            return Err(ChannelError::InvalidParameter(
                "superpage size must be a non-zero multiple of the DMA page size",
            ));
        }
        if superpage.offset % self.page_size != 0 {
            return Err(ChannelError::InvalidParameter(
                "superpage offset must be DMA-page aligned",
            ));
        }
        let end = superpage
            .offset
            .checked_add(superpage.size)
            .ok_or(ChannelError::InvalidParameter("superpage region overflows"))?;
        if end > self.buffer.size() {
            return Err(ChannelError::BufferTooSmall {
                size: self.buffer.size(),
                required: end,
            });
        }
        Ok(())
    }

    /// The deferred DMA start: arm the generator or send the FEE trigger,
    /// now that the firmware has descriptors to fill.
    fn start_pending_dma(&mut self) -> Result<()> {
        let cfg = self.config()?;
        info!("starting pending DMA");

        if self.generator_enabled {
            self.start_data_generator(&cfg)?;
        } else if self.rdyrx || self.stbrd {
            // Clear SIU/DIU status before handing control to the FEE.
            self.control.assert_link_up(&cfg)?;
            self.control.siu_command(ddl::RAND_CIFST, &cfg)?;
            self.control.diu_command(ddl::RAND_CIFST, &cfg)?;

            let command = if self.rdyrx { fee::RDYRX } else { fee::STBRD };
            self.control.start_trigger(&cfg, command)?;
        }

        self.control.settle(SETTLE);
        self.state = ChannelState::Running;
        info!("DMA started");
        Ok(())
    }

    fn start_data_generator(&mut self, cfg: &DiuConfig) -> Result<()> {
        self.control
            .arm_data_generator(self.generator_pattern, self.page_size);

        match self.data_source {
            DataSource::Internal => {
                self.control.set_loopback_on();
                self.control.settle(SETTLE);
            }
            DataSource::Siu => {
                self.control.set_siu_loopback(cfg)?;
                self.control.settle(SETTLE);
                self.control.assert_link_up(cfg)?;
                self.control.siu_command(ddl::RAND_CIFST, cfg)?;
                self.control.diu_command(ddl::RAND_CIFST, cfg)?;
            }
            DataSource::Diu => {
                self.control.set_diu_loopback(cfg)?;
                self.control.settle(SETTLE);
                self.control.diu_command(ddl::RAND_CIFST, cfg)?;
            }
            _ => {}
        }

        self.control.start_data_generator();
        Ok(())
    }

    fn config(&self) -> Result<DiuConfig> {
        self.diu_config
            .ok_or(ChannelError::InvalidState("link not probed yet"))
    }

    /// Arm the DDL chain for `start_dma`, cascading resets outward.
    fn arm_ddl(&mut self, level: ResetLevel) -> Result<()> {
        if level == ResetLevel::None {
            return Ok(());
        }
        let cfg = self.config()?;

        self.control.reset_command(reset::RORC, &cfg)?;

        if self.data_source.is_external() && level != ResetLevel::Internal {
            self.control.arm_ddl(reset::DIU, &cfg)?;

            if level == ResetLevel::InternalDiuSiu && self.data_source != DataSource::Diu {
                // The SIU wants a quiet link before its reset.
                self.control.settle(SETTLE);
                self.control.arm_ddl(reset::SIU, &cfg)?;
                self.control.arm_ddl(reset::DIU, &cfg)?;
            }

            self.control.arm_ddl(reset::RORC, &cfg)?;
            self.control.settle(SETTLE);

            if level == ResetLevel::InternalDiuSiu && self.data_source != DataSource::Diu {
                self.control.assert_link_up(&cfg)?;
                self.control.siu_command(ddl::RAND_CIFST, &cfg)?;
            }

            self.control.diu_command(ddl::RAND_CIFST, &cfg)?;
            self.control.settle(SETTLE);
        }

        self.control.reset_command(reset::FF, &cfg)?;
        // Give the card time to clear the free FIFO before checking it.
        self.control.settle(SETTLE);
        self.control.assert_free_fifo_empty()?;
        self.control.settle(SETTLE);
        Ok(())
    }
}
