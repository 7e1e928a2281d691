//! CRORC: the C-RORC readout card family.
//!
//! The CRORC moves data over optical DDL links (DIU downstream, SIU
//! upstream) in fixed 8 KiB DMA pages. [`Crorc`] is the register-level
//! control surface; [`CrorcDmaChannel`] is the channel engine built on it.

mod channel;
mod control;
pub mod regs;

pub use channel::{CrorcDmaChannel, DMA_PAGE_SIZE, READY_QUEUE_CAPACITY, TRANSFER_QUEUE_CAPACITY};
pub use control::{Crorc, DiuConfig};
