//! CRU: the Common Readout Unit card family.
//!
//! The CRU streams data over GBT links into per-link superpage FIFOs; the
//! host learns about completions from count/size registers rather than a
//! memory-resident descriptor ring. BAR2 carries the slow-control surface,
//! including a local CTP emulator for self-triggered tests.

mod bar;
mod channel;
pub mod regs;

pub use bar::{CruBar, CtpInfo, TriggerMode};
pub use channel::{CruDmaChannel, PAGE_UNIT, READY_QUEUE_CAPACITY, TRANSFER_QUEUE_CAPACITY};
