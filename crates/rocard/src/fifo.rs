use std::sync::atomic::{fence, Ordering};

use crate::buffer::DmaRegion;
use crate::error::{ChannelError, Result};

/// Number of descriptor slots in the Ready FIFO. One slot per in-flight
/// superpage; this bounds the transfer queue.
pub const READY_FIFO_CAPACITY: usize = 128;

/// Completion-status sentinel in the low byte of a slot's status word:
/// "whole data transmission status word written". A whole arrival with
/// internal loopback also carries the event length in the upper status
/// bits (e.g. 0x400082 for a 4 KiB event).
pub const DTSW: u32 = 0x82;

const SLOT_BYTES: usize = 8;
const EMPTY: i32 = -1;

/// What the firmware has written into a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalStatus {
    /// Slot untouched since it was cleared.
    NoneArrived,
    /// Transfer started but the completion word is not in yet.
    PartArrived,
    /// Transfer complete; length is valid.
    WholeArrived,
    /// Error bit set, or the status word is unrecognized.
    Error { status: u32 },
}

/// The firmware-visible descriptor ring ("Ready FIFO").
///
/// A fixed ring of `{length, status}` records in DMA-coherent memory. The
/// card writes completion records; the engine consumes slots in strict
/// circular order and clears them back to empty. The ring must live in a
/// plain (non-hugepage) allocation: hugepage-backed files can silently
/// mis-size an allocation this small.
pub struct ReadyFifo {
    region: DmaRegion,
}

impl ReadyFifo {
    pub fn new(region: DmaRegion) -> Result<Self> {
        if region.size() < READY_FIFO_CAPACITY * SLOT_BYTES {
            return Err(ChannelError::BufferTooSmall {
                size: region.size() as u64,
                required: (READY_FIFO_CAPACITY * SLOT_BYTES) as u64,
            });
        }
        let fifo = ReadyFifo { region };
        fifo.reset();
        Ok(fifo)
    }

    /// Bus address the data receiver is pointed at.
    pub fn bus_address(&self) -> u64 {
        self.region.bus_address()
    }

    /// Clear every slot to empty.
    pub fn reset(&self) {
        for slot in 0..READY_FIFO_CAPACITY {
            self.clear(slot);
        }
    }

    /// Clear one slot back to empty after its completion was consumed.
    pub fn clear(&self, slot: usize) {
        unsafe {
            self.length_ptr(slot).write_volatile(EMPTY);
            self.status_ptr(slot).write_volatile(EMPTY);
        }
    }

    /// Inspect a slot's completion status.
    pub fn probe(&self, slot: usize) -> ArrivalStatus {
        let status = unsafe { self.status_ptr(slot).read_volatile() };
        match status {
            EMPTY => ArrivalStatus::NoneArrived,
            0 => ArrivalStatus::PartArrived,
            _ => {
                let status = status as u32;
                if status & 0xff == DTSW && status & (1 << 31) == 0 {
                    // The length read that follows must observe the card's
                    // writes that preceded the status word.
                    fence(Ordering::Acquire);
                    ArrivalStatus::WholeArrived
                } else {
                    ArrivalStatus::Error { status }
                }
            }
        }
    }

    /// Transfer length of a completed slot, in 32-bit words.
    pub fn length_of(&self, slot: usize) -> u32 {
        let length = unsafe { self.length_ptr(slot).read_volatile() };
        length as u32
    }

    fn length_ptr(&self, slot: usize) -> *mut i32 {
        assert!(slot < READY_FIFO_CAPACITY);
        (self.region.user_address() + slot * SLOT_BYTES) as *mut i32
    }

    fn status_ptr(&self, slot: usize) -> *mut i32 {
        assert!(slot < READY_FIFO_CAPACITY);
        (self.region.user_address() + slot * SLOT_BYTES + 4) as *mut i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo() -> ReadyFifo {
        ReadyFifo::new(DmaRegion::allocate(READY_FIFO_CAPACITY * SLOT_BYTES)).unwrap()
    }

    fn write_slot(fifo: &ReadyFifo, slot: usize, length: i32, status: i32) {
        unsafe {
            fifo.length_ptr(slot).write_volatile(length);
            fifo.status_ptr(slot).write_volatile(status);
        }
    }

    #[test]
    fn fresh_ring_reports_none_arrived() {
        let fifo = fifo();
        for slot in 0..READY_FIFO_CAPACITY {
            assert_eq!(fifo.probe(slot), ArrivalStatus::NoneArrived);
        }
    }

    #[test]
    fn whole_arrival_and_length() {
        let fifo = fifo();
        // 4 KiB event: 1024 words, length echoed in the upper status bits.
        write_slot(&fifo, 3, 1024, 0x0040_0082u32 as i32);
        assert_eq!(fifo.probe(3), ArrivalStatus::WholeArrived);
        assert_eq!(fifo.length_of(3), 1024);
        fifo.clear(3);
        assert_eq!(fifo.probe(3), ArrivalStatus::NoneArrived);
    }

    #[test]
    fn partial_and_error_statuses() {
        let fifo = fifo();
        write_slot(&fifo, 0, 0, 0);
        assert_eq!(fifo.probe(0), ArrivalStatus::PartArrived);

        let with_error_bit = (1u32 << 31) | DTSW;
        write_slot(&fifo, 1, 16, with_error_bit as i32);
        assert_eq!(
            fifo.probe(1),
            ArrivalStatus::Error {
                status: with_error_bit
            }
        );

        // Unrecognized low byte is also a hard error.
        write_slot(&fifo, 2, 16, 0x47);
        assert_eq!(fifo.probe(2), ArrivalStatus::Error { status: 0x47 });
    }

    #[test]
    fn undersized_region_is_rejected() {
        assert!(ReadyFifo::new(DmaRegion::allocate(64)).is_err());
    }
}
