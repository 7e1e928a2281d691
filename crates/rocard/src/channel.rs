use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bar::Bar;
use crate::buffer::{BufferProvider, DmaRegion};
use crate::crorc::{Crorc, CrorcDmaChannel};
use crate::cru::{CruBar, CruDmaChannel};
use crate::error::Result;
use crate::fifo::{ReadyFifo, READY_FIFO_CAPACITY};
use crate::lock::ChannelLock;
use crate::params::{CardType, Parameters, ResetLevel};
use crate::paths::ChannelPaths;
use crate::superpage::Superpage;
use crate::timing::{HostTiming, Timing};

/// Lifecycle of a DMA channel.
///
/// ```text
/// Stopped --start_dma--> PendingStart --first push+fill--> Running
/// Running --stop_dma--> Stopped
/// Running --arrival error--> Faulted --reset_channel--> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Stopped,
    /// `start_dma` ran, but the generator/trigger start is deferred until
    /// the firmware has at least one descriptor to fill.
    PendingStart,
    Running,
    /// A descriptor reported an arrival error; only `stop_dma` and
    /// `reset_channel` are accepted.
    Faulted,
}

/// Everything the engine needs injected: the mapped BAR, the DMA buffer,
/// the descriptor-ring backing and the timing hook. PCI probing and buffer
/// allocation live with the caller.
pub struct ChannelResources {
    pub bar0: Box<dyn Bar>,
    /// DMA-coherent backing for the descriptor ring (CRORC). Allocated
    /// process-locally when absent, which is only correct together with an
    /// identity bus mapping (IOMMU or the in-process card models).
    pub fifo_region: Option<DmaRegion>,
    pub buffer: Box<dyn BufferProvider>,
    pub timing: Box<dyn Timing>,
    /// Cooperative cancellation flag, shared with the client's loop.
    pub stop_flag: Arc<AtomicBool>,
}

impl ChannelResources {
    pub fn new(bar0: Box<dyn Bar>, buffer: Box<dyn BufferProvider>) -> Self {
        ChannelResources {
            bar0,
            fifo_region: None,
            buffer,
            timing: Box::new(HostTiming),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fifo_region(mut self, region: DmaRegion) -> Self {
        self.fifo_region = Some(region);
        self
    }

    pub fn timing(mut self, timing: Box<dyn Timing>) -> Self {
        self.timing = timing;
        self
    }

    pub fn stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = flag;
        self
    }
}

enum CardChannel {
    Crorc(CrorcDmaChannel),
    Cru(CruDmaChannel),
}

/// A DMA channel of either card family behind one contract.
///
/// The family is known when the parameters are parsed, so dispatch happens
/// exactly once, here, at construction.
///
/// All methods must be called from a single driver thread and return
/// promptly; there is no hidden internal thread. Typical clients run a
/// pusher and a reader thread and funnel both through the driver thread via
/// two single-producer/single-consumer queues of buffer offsets (one free,
/// one ready), napping a few microseconds when both run dry.
pub struct DmaChannel {
    inner: CardChannel,
    stop_flag: Arc<AtomicBool>,
}

impl DmaChannel {
    /// Acquire the channel lock and construct the family engine.
    pub fn new(params: &Parameters, resources: ChannelResources) -> Result<Self> {
        let paths = ChannelPaths::new(&params.state_dir, &params.card_id, params.channel_number);
        let lock = ChannelLock::acquire(&paths.lock())?;
        let stop_flag = resources.stop_flag;

        let inner = match params.card_type {
            CardType::Crorc => {
                let control = Crorc::new(resources.bar0, resources.timing);
                let region = resources
                    .fifo_region
                    .unwrap_or_else(|| DmaRegion::allocate(READY_FIFO_CAPACITY * 8));
                let fifo = ReadyFifo::new(region)?;
                CardChannel::Crorc(CrorcDmaChannel::new(
                    params,
                    control,
                    fifo,
                    resources.buffer,
                    lock,
                )?)
            }
            CardType::Cru => {
                let bar = CruBar::new(resources.bar0);
                CardChannel::Cru(CruDmaChannel::new(params, bar, resources.buffer, lock)?)
            }
        };
        Ok(DmaChannel { inner, stop_flag })
    }

    pub fn card_type(&self) -> CardType {
        match &self.inner {
            CardChannel::Crorc(_) => CardType::Crorc,
            CardChannel::Cru(_) => CardType::Cru,
        }
    }

    /// Has the injected cancellation token been raised? Client loops are
    /// expected to drain and `stop_dma` after observing this.
    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ChannelState {
        match &self.inner {
            CardChannel::Crorc(c) => c.state(),
            CardChannel::Cru(c) => c.state(),
        }
    }

    pub fn start_dma(&mut self) -> Result<()> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.start_dma(),
            CardChannel::Cru(c) => c.start_dma(),
        }
    }

    pub fn stop_dma(&mut self) -> Result<()> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.stop_dma(),
            CardChannel::Cru(c) => c.stop_dma(),
        }
    }

    pub fn reset_channel(&mut self, level: ResetLevel) -> Result<()> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.reset_channel(level),
            CardChannel::Cru(c) => c.reset_channel(level),
        }
    }

    pub fn push_superpage(&mut self, superpage: Superpage) -> Result<()> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.push_superpage(superpage),
            CardChannel::Cru(c) => c.push_superpage(superpage),
        }
    }

    pub fn fill_superpages(&mut self) -> Result<()> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.fill_superpages(),
            CardChannel::Cru(c) => c.fill_superpages(),
        }
    }

    pub fn get_superpage(&self) -> Result<Superpage> {
        match &self.inner {
            CardChannel::Crorc(c) => c.get_superpage(),
            CardChannel::Cru(c) => c.get_superpage(),
        }
    }

    pub fn pop_superpage(&mut self) -> Result<Superpage> {
        match &mut self.inner {
            CardChannel::Crorc(c) => c.pop_superpage(),
            CardChannel::Cru(c) => c.pop_superpage(),
        }
    }

    pub fn transfer_queue_available(&self) -> usize {
        match &self.inner {
            CardChannel::Crorc(c) => c.transfer_queue_available(),
            CardChannel::Cru(c) => c.transfer_queue_available(),
        }
    }

    pub fn ready_queue_size(&self) -> usize {
        match &self.inner {
            CardChannel::Crorc(c) => c.ready_queue_size(),
            CardChannel::Cru(c) => c.ready_queue_size(),
        }
    }

    pub fn is_transfer_queue_empty(&self) -> bool {
        match &self.inner {
            CardChannel::Crorc(c) => c.is_transfer_queue_empty(),
            CardChannel::Cru(c) => c.is_transfer_queue_empty(),
        }
    }

    pub fn is_ready_queue_full(&self) -> bool {
        match &self.inner {
            CardChannel::Crorc(c) => c.is_ready_queue_full(),
            CardChannel::Cru(c) => c.is_ready_queue_full(),
        }
    }

    pub fn superpage_queue_count(&self) -> usize {
        match &self.inner {
            CardChannel::Crorc(c) => c.superpage_queue_count(),
            CardChannel::Cru(c) => c.superpage_queue_count(),
        }
    }

    pub fn superpage_queue_available(&self) -> usize {
        match &self.inner {
            CardChannel::Crorc(c) => c.superpage_queue_available(),
            CardChannel::Cru(c) => c.superpage_queue_available(),
        }
    }

    pub fn dropped_packets(&self) -> Option<u32> {
        match &self.inner {
            CardChannel::Crorc(c) => c.dropped_packets(),
            CardChannel::Cru(c) => c.dropped_packets(),
        }
    }

    pub fn firmware_info(&self) -> String {
        match &self.inner {
            CardChannel::Crorc(c) => c.firmware_info(),
            CardChannel::Cru(c) => c.firmware_info(),
        }
    }

    pub fn serial(&self) -> i32 {
        match &self.inner {
            CardChannel::Crorc(c) => c.serial(),
            CardChannel::Cru(c) => c.serial(),
        }
    }
}
