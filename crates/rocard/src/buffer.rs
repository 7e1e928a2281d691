use crate::error::{ChannelError, Result};

/// One entry of a buffer's scatter/gather table: a run of the buffer that is
/// contiguous in bus-address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterGatherEntry {
    /// Byte offset of this run from the buffer base.
    pub offset: u64,
    /// Bus address of the first byte of the run.
    pub bus_address: u64,
    /// Length of the run in bytes.
    pub size: u64,
}

/// The big DMA buffer, as the engine sees it.
///
/// The provider owns (or at least outlives) a contiguous, pinned,
/// DMA-mappable region and describes how its user-space offsets map to bus
/// addresses. A buffer backed by 1 GiB hugepages is typically a single
/// entry; 2 MiB hugepages produce many.
pub trait BufferProvider: Send {
    /// User-space address of the buffer base.
    fn user_address(&self) -> usize;

    /// Total buffer size in bytes.
    fn size(&self) -> u64;

    /// Ordered scatter/gather table covering the whole buffer.
    fn scatter_gather(&self) -> &[ScatterGatherEntry];

    /// Translate a buffer region to a bus address.
    ///
    /// The region must lie entirely inside one scatter/gather entry: bus
    /// contiguity across entry boundaries is not guaranteed unless an IOMMU
    /// provides it, so straddling superpages are rejected at push time.
    fn bus_address(&self, offset: u64, len: u64) -> Result<u64> {
        let end = offset
            .checked_add(len)
            .ok_or(ChannelError::InvalidParameter("superpage region overflows"))?;
        if end > self.size() {
            return Err(ChannelError::BufferTooSmall {
                size: self.size(),
                required: end,
            });
        }
        for entry in self.scatter_gather() {
            if offset >= entry.offset && offset < entry.offset + entry.size {
                if end > entry.offset + entry.size {
                    return Err(ChannelError::InvalidParameter(
                        "superpage straddles a scatter-gather boundary",
                    ));
                }
                return Ok(entry.bus_address + (offset - entry.offset));
            }
        }
        Err(ChannelError::InvalidParameter(
            "offset not covered by the scatter-gather table",
        ))
    }
}

/// A small DMA-coherent allocation, used for the descriptor ring.
///
/// Descriptor rings must not live in hugepage-backed storage (a hugepage
/// mount can silently mis-size small files), so this is a separate, plain
/// allocation. For in-process use the bus address equals the user address;
/// for hardware the region comes from the injected allocator via
/// [`DmaRegion::external`].
pub struct DmaRegion {
    user: usize,
    bus: u64,
    size: usize,
    _backing: Option<Box<[u8]>>,
}

impl DmaRegion {
    /// Allocate a process-local region with an identity bus mapping.
    pub fn allocate(size: usize) -> Self {
        let backing = vec![0u8; size].into_boxed_slice();
        let user = backing.as_ptr() as usize;
        DmaRegion {
            user,
            bus: user as u64,
            size,
            _backing: Some(backing),
        }
    }

    /// Wrap a region mapped and bus-registered by an external allocator.
    ///
    /// # Safety
    ///
    /// `user` must point to at least `size` bytes that stay mapped for the
    /// lifetime of the region, and `bus` must be the matching bus address.
    pub unsafe fn external(user: usize, bus: u64, size: usize) -> Self {
        DmaRegion {
            user,
            bus,
            size,
            _backing: None,
        }
    }

    pub fn user_address(&self) -> usize {
        self.user
    }

    pub fn bus_address(&self) -> u64 {
        self.bus
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

// The backing allocation is never aliased through &self; consumers go
// through raw-pointer volatile access.
unsafe impl Send for DmaRegion {}

/// Heap-backed buffer with an identity bus mapping, for tests and the
/// in-process loopback benchmark.
pub struct OwnedBuffer {
    backing: Box<[u8]>,
    sgl: Vec<ScatterGatherEntry>,
}

impl OwnedBuffer {
    pub fn new(size: usize) -> Self {
        Self::with_segment_size(size, size)
    }

    /// Split the identity mapping into `segment`-sized scatter/gather
    /// entries, mimicking a hugepage-backed buffer of that page size.
    pub fn with_segment_size(size: usize, segment: usize) -> Self {
        assert!(segment > 0);
        let backing = vec![0u8; size].into_boxed_slice();
        let base = backing.as_ptr() as u64;
        let mut sgl = Vec::new();
        let mut offset = 0usize;
        while offset < size {
            let len = segment.min(size - offset);
            sgl.push(ScatterGatherEntry {
                offset: offset as u64,
                bus_address: base + offset as u64,
                size: len as u64,
            });
            offset += len;
        }
        OwnedBuffer { backing, sgl }
    }
}

unsafe impl Send for OwnedBuffer {}

impl BufferProvider for OwnedBuffer {
    fn user_address(&self) -> usize {
        self.backing.as_ptr() as usize
    }

    fn size(&self) -> u64 {
        self.backing.len() as u64
    }

    fn scatter_gather(&self) -> &[ScatterGatherEntry] {
        &self.sgl
    }
}

/// A buffer mapped and registered by an external allocator (hugepage file,
/// IOMMU-mapped memory, ...).
pub struct ExternalBuffer {
    user: usize,
    size: u64,
    sgl: Vec<ScatterGatherEntry>,
}

impl ExternalBuffer {
    /// # Safety
    ///
    /// `user` must point to `size` mapped bytes that outlive the buffer, and
    /// `sgl` must describe their true bus layout.
    pub unsafe fn new(user: usize, size: u64, sgl: Vec<ScatterGatherEntry>) -> Self {
        ExternalBuffer { user, size, sgl }
    }
}

unsafe impl Send for ExternalBuffer {}

impl BufferProvider for ExternalBuffer {
    fn user_address(&self) -> usize {
        self.user
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn scatter_gather(&self) -> &[ScatterGatherEntry] {
        &self.sgl
    }
}
