//! Shared test rig: a channel engine wired to an in-process card model,
//! with a recorded timing hook and a throwaway state directory.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tempfile::TempDir;

use rocard::sim::{RecordedTiming, SimCrorc, SimCru};
use rocard::{
    BufferProvider, CardId, CardType, ChannelResources, DmaChannel, DmaRegion, OwnedBuffer,
    Parameters, READY_FIFO_CAPACITY,
};

pub struct CrorcRig {
    pub channel: DmaChannel,
    pub sim: SimCrorc,
    pub timing: RecordedTiming,
    pub buffer_base: usize,
    pub stop_flag: Arc<AtomicBool>,
    _state_dir: TempDir,
}

pub fn crorc_rig(buffer_size: usize, configure: impl FnOnce(Parameters) -> Parameters) -> CrorcRig {
    let state_dir = TempDir::new().unwrap();
    let params = configure(
        Parameters::new(CardId::PciAddress("07:00.0".into()), CardType::Crorc, 0)
            .state_dir(state_dir.path().to_path_buf()),
    );

    let sim = SimCrorc::new();
    let timing = RecordedTiming::new();
    let buffer = OwnedBuffer::new(buffer_size);
    let buffer_base = buffer.user_address();
    let stop_flag = Arc::new(AtomicBool::new(false));

    let resources = ChannelResources::new(sim.bar(), Box::new(buffer))
        .fifo_region(DmaRegion::allocate(READY_FIFO_CAPACITY * 8))
        .timing(Box::new(timing.clone()))
        .stop_flag(stop_flag.clone());
    let channel = DmaChannel::new(&params, resources).unwrap();

    CrorcRig {
        channel,
        sim,
        timing,
        buffer_base,
        stop_flag,
        _state_dir: state_dir,
    }
}

pub struct CruRig {
    pub channel: DmaChannel,
    pub sim: SimCru,
    pub buffer_base: usize,
    _state_dir: TempDir,
}

pub fn cru_rig(buffer_size: usize, configure: impl FnOnce(Parameters) -> Parameters) -> CruRig {
    let state_dir = TempDir::new().unwrap();
    let params = configure(
        Parameters::new(CardId::PciAddress("3b:00.0".into()), CardType::Cru, 0)
            .state_dir(state_dir.path().to_path_buf()),
    );

    let sim = SimCru::new();
    sim.set_pattern(params.generator_pattern);
    sim.set_page_size(params.dma_page_size);
    let buffer = OwnedBuffer::new(buffer_size);
    let buffer_base = buffer.user_address();

    let resources = ChannelResources::new(sim.bar0(), Box::new(buffer));
    let channel = DmaChannel::new(&params, resources).unwrap();

    CruRig {
        channel,
        sim,
        buffer_base,
        _state_dir: state_dir,
    }
}

/// Read one DMA page as words from the shared buffer.
///
/// Safe while the engine isn't handing the page to the card, which the
/// tests guarantee by only reading popped superpages.
pub fn read_page(buffer_base: usize, offset: u64, page_size: u64, page: u64) -> Vec<u32> {
    let address = buffer_base + offset as usize + (page * page_size) as usize;
    let words = (page_size / 4) as usize;
    let slice = unsafe { std::slice::from_raw_parts(address as *const u32, words) };
    slice.to_vec()
}
