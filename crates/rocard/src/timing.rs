use std::time::Duration;

/// Settle/pause hook used by the link reset and arm protocols.
///
/// The 100 ms pauses after loopback, DIU and SIU resets are protocol
/// requirements, not optimizations. On hardware they must really elapse;
/// tests substitute a recorder so the sequences can be asserted without
/// waiting wall-clock time.
pub trait Timing: Send {
    fn settle(&self, duration: Duration);
}

/// Real pauses via `std::thread::sleep`.
#[derive(Debug, Default)]
pub struct HostTiming;

impl Timing for HostTiming {
    fn settle(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
