/// A client-owned region inside the big DMA buffer.
///
/// A superpage is created by the client, handed to the engine with
/// `push_superpage`, filled by the card, and returned through
/// `pop_superpage`. At any point in time it is owned by exactly one of:
/// the client, the transfer queue, or the ready queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Superpage {
    /// Byte offset from the buffer base. Must satisfy card alignment.
    pub offset: u64,
    /// Size in bytes; a multiple of the card's DMA page size.
    pub size: u64,
    /// Bytes written by the card so far. Zero until completion.
    pub received: u64,
    /// Set when the card has reported the transfer complete.
    pub ready: bool,
}

impl Superpage {
    pub fn new(offset: u64, size: u64) -> Self {
        Superpage {
            offset,
            size,
            received: 0,
            ready: false,
        }
    }

    /// The card reported this superpage complete.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// The card filled the entire superpage.
    pub fn is_filled(&self) -> bool {
        self.received == self.size
    }
}
