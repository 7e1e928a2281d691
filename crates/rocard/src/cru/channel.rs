use std::collections::VecDeque;

use tracing::info;

use crate::buffer::BufferProvider;
use crate::channel::ChannelState;
use crate::cru::bar::CruBar;
use crate::cru::regs::MAX_LINKS;
use crate::error::{ChannelError, Result};
use crate::lock::ChannelLock;
use crate::params::{DataSource, Parameters, ResetLevel};
use crate::superpage::Superpage;

/// Depth of each link's firmware superpage FIFO; also the global transfer
/// queue bound.
pub const TRANSFER_QUEUE_CAPACITY: usize = 128;
pub const READY_QUEUE_CAPACITY: usize = 128;

/// The CRU counts superpage sizes in 8 KiB pages; configurable DMA page
/// sizes must be multiples of this unit.
pub const PAGE_UNIT: u64 = 8 * 1024;

/// DMA channel engine for one CRU endpoint.
///
/// Superpages are distributed round-robin over the enabled links and
/// completions are drained in the same round-robin order, so pops equal
/// pushes globally. A link that is behind stalls the drain; completions
/// never overtake.
pub struct CruDmaChannel {
    bar: CruBar,
    buffer: Box<dyn BufferProvider>,
    _lock: ChannelLock,

    state: ChannelState,
    /// In-flight superpages with the link each was pushed to.
    transfer_queue: VecDeque<(u32, Superpage)>,
    ready_queue: VecDeque<Superpage>,

    links: Vec<u32>,
    /// Next link to push to (round-robin index).
    next_link: usize,
    /// Per-link count of completions the engine has consumed; compared
    /// against the firmware's cumulative superpage count.
    consumed: [u32; MAX_LINKS as usize],

    page_size: u64,
    data_source: DataSource,
}

impl CruDmaChannel {
    pub fn new(
        params: &Parameters,
        bar: CruBar,
        buffer: Box<dyn BufferProvider>,
        lock: ChannelLock,
    ) -> Result<Self> {
        if params.dma_page_size == 0 || params.dma_page_size % PAGE_UNIT != 0 {
            return Err(ChannelError::InvalidParameter(
                "CRU DMA page size must be a multiple of 8 KiB",
            ));
        }
        if matches!(params.data_source, DataSource::Diu | DataSource::Siu) {
            return Err(ChannelError::UnsupportedFeature(
                "CRU has no DIU/SIU data sources",
            ));
        }
        if params.link_mask.is_empty() {
            return Err(ChannelError::InvalidParameter("link mask is empty"));
        }
        if params.link_mask.iter().any(|&l| l >= MAX_LINKS) {
            return Err(ChannelError::InvalidParameter("link number out of range"));
        }
        if buffer.size() < params.dma_page_size {
            return Err(ChannelError::BufferTooSmall {
                size: buffer.size(),
                required: params.dma_page_size,
            });
        }

        Ok(CruDmaChannel {
            bar,
            buffer,
            _lock: lock,
            state: ChannelState::Stopped,
            transfer_queue: VecDeque::with_capacity(TRANSFER_QUEUE_CAPACITY),
            ready_queue: VecDeque::with_capacity(READY_QUEUE_CAPACITY),
            links: params.link_mask.clone(),
            next_link: 0,
            consumed: [0; MAX_LINKS as usize],
            page_size: params.dma_page_size,
            data_source: params.data_source,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn start_dma(&mut self) -> Result<()> {
        if self.state != ChannelState::Stopped {
            return Err(ChannelError::InvalidState("startDma requires Stopped"));
        }

        self.bar.set_data_source(self.data_source)?;
        // Make sure nothing streams before descriptors exist.
        self.bar.set_data_emulator_enabled(false);
        self.bar.disable_data_taking();
        self.bar.reset_data_generator_counter();

        self.transfer_queue.clear();
        self.ready_queue.clear();
        self.next_link = 0;
        // The firmware's superpage counts are cumulative; snapshot them so
        // a restart doesn't mistake old completions for new ones.
        for &link in &self.links {
            self.consumed[link as usize] = self.bar.superpage_count(link);
        }

        self.state = ChannelState::PendingStart;
        info!("DMA start deferred until superpages are pushed");
        Ok(())
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        if self.state == ChannelState::Stopped {
            return Ok(());
        }
        self.bar.set_data_emulator_enabled(false);
        self.bar.disable_data_taking();
        self.state = ChannelState::Stopped;
        info!("DMA stopped");
        Ok(())
    }

    /// Reset the card. The CRU has no DIU/SIU chain, so every level above
    /// `None` maps to the card-internal reset.
    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        if matches!(self.state, ChannelState::PendingStart | ChannelState::Running) {
            return Err(ChannelError::InvalidState("stop DMA before resetting"));
        }
        if level == ResetLevel::None {
            return Ok(());
        }

        self.bar.reset_card();
        self.bar.reset_data_generator_counter();
        self.bar.reset_superpage_size_index();

        self.transfer_queue.clear();
        self.ready_queue.clear();
        self.next_link = 0;
        self.consumed = [0; MAX_LINKS as usize];
        self.state = ChannelState::Stopped;
        Ok(())
    }

    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        if self.state == ChannelState::Faulted {
            return Err(ChannelError::InvalidState("channel faulted; reset required"));
        }
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
        if self.transfer_queue.len() >= TRANSFER_QUEUE_CAPACITY {
            return Err(ChannelError::QueueFull);
        }

        let bus_address = self.buffer.bus_address(superpage.offset, superpage.size)?;
        let pages = (superpage.size / PAGE_UNIT) as u32;
        let link = self.links[self.next_link];
        self.bar.push_superpage_descriptor(link, pages, bus_address);
        self.next_link = (self.next_link + 1) % self.links.len();

        self.transfer_queue
            .push_back((link, Superpage::new(superpage.offset, superpage.size)));
        Ok(())
    }

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
                    return Ok(());
                }
                self.start_pending_dma();
            }
            ChannelState::Running => {}
        }

        while self.ready_queue.len() < READY_QUEUE_CAPACITY {
            let Some(&(link, _)) = self.transfer_queue.front() else {
                break;
            };
            let completed = self.bar.superpage_count(link);
            if completed <= self.consumed[link as usize] {
                // Head of the queue hasn't completed; later superpages on
                // other links must not overtake it.
                break;
            }

            let reported = match self.bar.superpage_size(link) {
                Ok(size) => size,
                Err(err) => {
                    self.state = ChannelState::Faulted;
                    return Err(err);
                }
            };

            let (_, mut superpage) = self
                .transfer_queue
                .pop_front()
                .expect("front checked above");
            self.consumed[link as usize] += 1;
            // Firmware that predates size reporting returns 0: the link
            // always fills whole superpages there.
            superpage.received = if reported == 0 {
                superpage.size
            } else {
                u64::from(reported)
            };
            superpage.ready = true;
            self.ready_queue.push_back(superpage);
        }
        Ok(())
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        self.ready_queue.front().copied().ok_or(ChannelError::Empty)
    }

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

    pub fn superpage_queue_count(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn superpage_queue_available(&self) -> usize {
        self.transfer_queue_available()
    }

    pub fn dropped_packets(&self) -> Option<u32> {
        Some(self.bar.dropped_packets())
    }

    pub fn firmware_info(&self) -> String {
        self.bar.firmware_info()
    }

    pub fn serial(&self) -> i32 {
        self.bar.serial()
    }

    fn start_pending_dma(&mut self) {
        info!("starting pending DMA");
        if matches!(self.data_source, DataSource::Internal | DataSource::Ddg) {
            self.bar.set_data_emulator_enabled(true);
        }
        self.bar.enable_data_taking();
        self.state = ChannelState::Running;
        info!("DMA started");
    }
}
