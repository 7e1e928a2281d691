use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Errors returned by the channel engine and the card control surface.
///
/// Validation errors are returned synchronously by the offending call.
/// [`ChannelError::DataArrival`] is raised from `fill_superpages` and
/// promotes the engine to the `Faulted` state, from which only `stop_dma`
/// and `reset_channel` are accepted.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("buffer too small: {size} bytes, need at least {required}")]
    BufferTooSmall { size: u64, required: u64 },

    #[error("queue full")]
    QueueFull,

    #[error("queue empty")]
    Empty,

    #[error("invalid channel state: {0}")]
    InvalidState(&'static str),

    #[error("channel lock held by live process {pid}")]
    LockBusy { pid: u32 },

    #[error("channel lock was stale and could not be reclaimed")]
    LockStale,

    #[error("link timeout: {0}")]
    LinkTimeout(&'static str),

    #[error("link down: {0}")]
    LinkDown(&'static str),

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("data arrival error in descriptor {index}: status 0x{status:08x} length {length}")]
    DataArrival {
        index: usize,
        status: u32,
        length: u32,
    },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}
