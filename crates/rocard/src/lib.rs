//! Host-side driver core for two families of PCIe readout cards (CRORC and
//! CRU) that stream detector data into user-space memory via DMA.
//!
//! The heart of the crate is the per-channel DMA engine: it owns a large
//! pinned buffer shared with the card, hands regions of it ("superpages") to
//! the firmware for filling, watches per-descriptor completion records, and
//! returns filled regions to the reading application under strict FIFO
//! ordering and backpressure rules. Around the engine sits the card-specific
//! control surface (BAR register access, reset sequences, data-generator and
//! trigger arming) that the engine drives.
//!
//! The crate deliberately does *not* probe PCI or allocate hugepages. The
//! caller injects:
//!
//! - [`Bar`]: 32-bit register access for a mapped BAR
//! - [`BufferProvider`]: the big DMA buffer plus its scatter/gather table
//! - [`DmaRegion`]: a small DMA-coherent allocation for the descriptor ring
//! - [`Timing`]: the settle/pause hook the link reset protocols require
//!
//! [`sim`] contains in-process register-level card models that satisfy these
//! seams, used by the test suite and the benchmark's loopback mode.
//!
//! All engine methods are non-blocking and must be called from a single
//! driver thread; see [`channel::DmaChannel`] for the recommended two-thread
//! client pattern built on top.

mod bar;
mod buffer;
mod channel;
mod error;
mod fifo;
mod lock;
mod params;
mod paths;
mod superpage;
mod timing;

pub mod crorc;
pub mod cru;
pub mod pattern;
pub mod sim;

pub use bar::{Bar, MappedBar};
pub use buffer::{BufferProvider, DmaRegion, ExternalBuffer, OwnedBuffer, ScatterGatherEntry};
pub use channel::{ChannelResources, ChannelState, DmaChannel};
pub use error::{ChannelError, Result};
pub use fifo::{ArrivalStatus, ReadyFifo, READY_FIFO_CAPACITY};
pub use lock::ChannelLock;
pub use params::{
    CardId, CardType, DataSource, GeneratorPattern, Parameters, ReadoutMode, ResetLevel,
};
pub use paths::ChannelPaths;
pub use superpage::Superpage;
pub use timing::{HostTiming, Timing};
