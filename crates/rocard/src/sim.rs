//! In-process register-level models of the two card families.
//!
//! These are not simulations of the silicon; they model exactly the
//! register protocol the driver speaks, the way the engine observes it:
//! descriptor pushes, pattern-filled pages, completion records, link
//! command/status handshakes. The test suite and the benchmark's loopback
//! mode drive the real engine against them through the ordinary [`Bar`]
//! seam.
//!
//! Bus addresses are interpreted as user addresses (identity mapping), so
//! the models only work with [`crate::OwnedBuffer`] and
//! [`crate::DmaRegion::allocate`]-backed rings.
//!
//! Fault injection covers the recovery paths: arrival-error bits, held and
//! partial completions, a dead optical link, a silent SIU.

use std::collections::VecDeque;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bar::Bar;
use crate::crorc::regs::{control, ddl, fee, link, reg, reset};
use crate::cru::regs as cru;
use crate::fifo::DTSW;
use crate::params::{CardType, GeneratorPattern};
use crate::pattern::expected_word;
use crate::timing::Timing;

/// A [`Timing`] hook that records requested settles instead of sleeping.
#[derive(Clone, Default)]
pub struct RecordedTiming {
    settles: Arc<Mutex<Vec<Duration>>>,
}

impl RecordedTiming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle pauses requested so far, in request order.
    pub fn settles(&self) -> Vec<Duration> {
        self.settles.lock().unwrap().clone()
    }
}

impl Timing for RecordedTiming {
    fn settle(&self, duration: Duration) {
        self.settles.lock().unwrap().push(duration);
    }
}

// ---------------------------------------------------------------------------
// CRORC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct FreeFifoDescriptor {
    bus: u64,
    words: u32,
    slot: usize,
    /// Monotonic push sequence number, the unit fault injection addresses.
    seq: usize,
}

struct CrorcState {
    regs: Vec<u32>,
    ready_fifo_bus: u64,
    generator_on: bool,
    trigger_on: bool,
    pattern: GeneratorPattern,
    page_words: usize,
    event_counter: u32,
    pending: VecDeque<FreeFifoDescriptor>,
    pushed: usize,
    held: Vec<FreeFifoDescriptor>,
    hold_seqs: Vec<usize>,
    error_seqs: Vec<usize>,
    partial_seqs: Vec<usize>,
    link_down: bool,
    no_signal: bool,
    siu_silent: bool,
}

impl CrorcState {
    fn new() -> Self {
        let mut regs = vec![0u32; reg::COUNT as usize];
        regs[reg::DIU_STATUS as usize] = u32::MAX;
        regs[reg::SIU_STATUS as usize] = u32::MAX;
        regs[reg::DIU_VERSION as usize] = 0x0002_0314;
        regs[reg::FIRMWARE as usize] = 0x00c0_ffee;
        regs[reg::SERIAL as usize] = 1042;
        CrorcState {
            regs,
            ready_fifo_bus: 0,
            generator_on: false,
            trigger_on: false,
            pattern: GeneratorPattern::Incremental,
            page_words: 2048,
            event_counter: 0,
            pending: VecDeque::new(),
            pushed: 0,
            held: Vec::new(),
            hold_seqs: Vec::new(),
            error_seqs: Vec::new(),
            partial_seqs: Vec::new(),
            link_down: false,
            no_signal: false,
            siu_silent: false,
        }
    }

    fn receiver_on(&self) -> bool {
        self.regs[reg::CONTROL as usize] & control::DATA_RECEIVER_ON != 0
    }

    fn read(&self, index: u32) -> u32 {
        match index {
            reg::LINK_STATUS => {
                if self.link_down {
                    0
                } else {
                    link::DIU_UP | link::SIU_UP
                }
            }
            reg::FREE_FIFO_OCCUPANCY => self.pending.len() as u32,
            _ => self.regs[index as usize],
        }
    }

    fn write(&mut self, index: u32, value: u32) {
        match index {
            reg::RESET => {
                if value & (reset::FF | reset::FIFOS) != 0 {
                    self.pending.clear();
                    self.held.clear();
                }
                if value & reset::COUNTERS != 0 {
                    self.event_counter = 0;
                }
                // Resets complete instantly here; RESET_IN_PROGRESS never
                // shows up, so the driver's poll passes on the first read.
            }
            reg::DIU_COMMAND => {
                if !self.link_down {
                    let response = if self.no_signal && value == ddl::RAND_CIFST {
                        0x6 << 15
                    } else {
                        0x1
                    };
                    self.regs[reg::DIU_STATUS as usize] = response;
                }
            }
            reg::SIU_COMMAND => {
                if !self.link_down && !self.siu_silent {
                    match value {
                        fee::RDYRX | fee::STBRD => {
                            self.trigger_on = true;
                            self.service();
                        }
                        fee::EOBTR => self.trigger_on = false,
                        _ => {}
                    }
                    self.regs[reg::SIU_STATUS as usize] = 0x1;
                }
            }
            reg::READY_FIFO_ADDRESS_HIGH => {
                self.ready_fifo_bus = (self.ready_fifo_bus & 0xffff_ffff) | (u64::from(value) << 32);
                self.regs[index as usize] = value;
            }
            reg::READY_FIFO_ADDRESS_LOW => {
                self.ready_fifo_bus = (self.ready_fifo_bus & !0xffff_ffff) | u64::from(value);
                self.regs[index as usize] = value;
            }
            reg::GENERATOR_EVENT_LENGTH => {
                self.page_words = value.max(1) as usize;
                self.regs[index as usize] = value;
            }
            reg::GENERATOR_PATTERN => {
                use crate::crorc::regs::pattern_code;
                self.pattern = match value {
                    pattern_code::ALTERNATING => GeneratorPattern::Alternating,
                    pattern_code::CONSTANT => GeneratorPattern::Constant,
                    pattern_code::RANDOM => GeneratorPattern::Random,
                    _ => GeneratorPattern::Incremental,
                };
                self.regs[index as usize] = value;
            }
            reg::GENERATOR_CONTROL => {
                self.generator_on = value & 0x1 != 0;
                self.regs[index as usize] = value;
                self.service();
            }
            reg::FREE_FIFO_PUSH => {
                let high = self.regs[reg::FREE_FIFO_ADDRESS_HIGH as usize];
                let low = self.regs[reg::FREE_FIFO_ADDRESS_LOW as usize];
                let descriptor = FreeFifoDescriptor {
                    bus: (u64::from(high) << 32) | u64::from(low),
                    words: value >> 8,
                    slot: (value & 0xff) as usize,
                    seq: self.pushed,
                };
                self.pushed += 1;
                self.pending.push_back(descriptor);
                self.service();
            }
            _ => self.regs[index as usize] = value,
        }
    }

    /// Fill whatever the firmware would fill right now.
    fn service(&mut self) {
        if !self.receiver_on() || !(self.generator_on || self.trigger_on) {
            return;
        }
        while let Some(descriptor) = self.pending.pop_front() {
            if self.hold_seqs.contains(&descriptor.seq) {
                self.held.push(descriptor);
                continue;
            }
            self.complete(descriptor);
        }
    }

    fn release_held(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.hold_seqs.clear();
        for descriptor in held {
            self.complete(descriptor);
        }
    }

    fn complete(&mut self, descriptor: FreeFifoDescriptor) {
        let pages = (descriptor.words as usize) / self.page_words;
        for page in 0..pages {
            let base = descriptor.bus as usize + page * self.page_words * 4;
            for word in 0..self.page_words {
                let value = expected_word(
                    CardType::Crorc,
                    self.pattern,
                    self.event_counter,
                    word,
                )
                .unwrap_or(0);
                unsafe { ((base + word * 4) as *mut u32).write_volatile(value) };
            }
            self.event_counter = self.event_counter.wrapping_add(1);
        }

        let length_ptr = (self.ready_fifo_bus as usize + descriptor.slot * 8) as *mut i32;
        let status_ptr = (self.ready_fifo_bus as usize + descriptor.slot * 8 + 4) as *mut i32;

        let status = if self.partial_seqs.contains(&descriptor.seq) {
            0
        } else {
            let mut status = ((descriptor.words << 12) & 0x7fff_f000) | DTSW;
            if self.error_seqs.contains(&descriptor.seq) {
                status |= 1 << 31;
            }
            status
        };

        unsafe {
            length_ptr.write_volatile(descriptor.words as i32);
            // Data and length must be visible before the status word that
            // publishes them, mirroring the card's write ordering.
            fence(Ordering::Release);
            status_ptr.write_volatile(status as i32);
        }
    }
}

/// Handle to an in-process CRORC. Clones share the card.
#[derive(Clone)]
pub struct SimCrorc {
    state: Arc<Mutex<CrorcState>>,
}

impl Default for SimCrorc {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCrorc {
    pub fn new() -> Self {
        SimCrorc {
            state: Arc::new(Mutex::new(CrorcState::new())),
        }
    }

    /// BAR0 accessor wired to this card.
    pub fn bar(&self) -> Box<dyn Bar> {
        Box::new(SimCrorcBar {
            state: self.state.clone(),
        })
    }

    pub fn generator_started(&self) -> bool {
        self.state.lock().unwrap().generator_on
    }

    pub fn trigger_started(&self) -> bool {
        self.state.lock().unwrap().trigger_on
    }

    /// Pages generated so far.
    pub fn event_count(&self) -> u32 {
        self.state.lock().unwrap().event_counter
    }

    /// Don't complete the nth pushed descriptor until released.
    pub fn hold_descriptor(&self, seq: usize) {
        self.state.lock().unwrap().hold_seqs.push(seq);
    }

    pub fn release_held(&self) {
        self.state.lock().unwrap().release_held();
    }

    /// Set the error bit on the nth pushed descriptor's completion.
    pub fn inject_error_on(&self, seq: usize) {
        self.state.lock().unwrap().error_seqs.push(seq);
    }

    /// Leave the nth pushed descriptor's status at "partial arrival".
    pub fn inject_partial_on(&self, seq: usize) {
        self.state.lock().unwrap().partial_seqs.push(seq);
    }

    /// Stop answering link commands entirely.
    pub fn set_link_down(&self, down: bool) {
        self.state.lock().unwrap().link_down = down;
    }

    /// Report the "no signal" status pattern on DIU status reads.
    pub fn set_no_signal(&self, no_signal: bool) {
        self.state.lock().unwrap().no_signal = no_signal;
    }

    /// The SIU stops answering; DIU still does.
    pub fn set_siu_silent(&self, silent: bool) {
        self.state.lock().unwrap().siu_silent = silent;
    }
}

struct SimCrorcBar {
    state: Arc<Mutex<CrorcState>>,
}

impl Bar for SimCrorcBar {
    fn index(&self) -> u32 {
        0
    }

    fn read_register(&self, index: u32) -> u32 {
        self.state.lock().unwrap().read(index)
    }

    fn write_register(&mut self, index: u32, value: u32) {
        self.state.lock().unwrap().write(index, value);
    }
}

// ---------------------------------------------------------------------------
// CRU
// ---------------------------------------------------------------------------

struct CruState {
    bar0: Vec<u32>,
    bar2: Vec<u32>,
    staged_high: Vec<u32>,
    staged_low: Vec<u32>,
    pending: Vec<VecDeque<(u64, u32)>>,
    completed: Vec<u32>,
    size_fifo: Vec<VecDeque<u32>>,
    size_visible: Vec<u32>,
    size_index: Vec<u32>,
    held_links: Vec<u32>,
    pattern: GeneratorPattern,
    page_words: usize,
    event_counter: u32,
}

impl CruState {
    fn new() -> Self {
        let links = cru::MAX_LINKS as usize;
        let mut bar0 = vec![0u32; cru::reg::COUNT as usize];
        bar0[cru::reg::FIRMWARE_DATE as usize] = 0x2024_0608;
        bar0[cru::reg::FIRMWARE_TIME as usize] = 0x0017_3000;
        bar0[cru::reg::FIRMWARE_GIT_HASH as usize] = 0x5afe_c0de;
        bar0[cru::reg::SERIAL as usize] = 2077;
        CruState {
            bar0,
            bar2: vec![0u32; cru::bar2::COUNT as usize],
            staged_high: vec![0; links],
            staged_low: vec![0; links],
            pending: vec![VecDeque::new(); links],
            completed: vec![0; links],
            size_fifo: vec![VecDeque::new(); links],
            size_visible: vec![0; links],
            size_index: vec![0; links],
            held_links: Vec::new(),
            pattern: GeneratorPattern::Incremental,
            page_words: 2048,
            event_counter: 0,
        }
    }

    fn emulator_on(&self) -> bool {
        self.bar0[cru::reg::DMA_CONTROL as usize] & 0x1 != 0
            && self.bar0[cru::reg::DATA_GENERATOR_CONTROL as usize] & 0x1 != 0
    }

    fn data_taking(&self) -> bool {
        self.bar0[cru::reg::BSP_USER_CONTROL as usize] & 0x1 != 0
    }

    fn read_bar0(&self, index: u32) -> u32 {
        if index >= cru::reg::LINK_BASE {
            let link = ((index - cru::reg::LINK_BASE) / cru::reg::LINK_STRIDE) as usize;
            let offset = (index - cru::reg::LINK_BASE) % cru::reg::LINK_STRIDE;
            return match offset {
                cru::reg::LINK_SUPERPAGE_COUNT => self.completed[link],
                cru::reg::LINK_SUPERPAGE_SIZE => self.size_visible[link],
                _ => self.bar0[index as usize],
            };
        }
        self.bar0[index as usize]
    }

    fn write_bar0(&mut self, index: u32, value: u32) {
        if index >= cru::reg::LINK_BASE {
            let link = ((index - cru::reg::LINK_BASE) / cru::reg::LINK_STRIDE) as usize;
            let offset = (index - cru::reg::LINK_BASE) % cru::reg::LINK_STRIDE;
            match offset {
                cru::reg::LINK_SUPERPAGE_ADDRESS_HIGH => self.staged_high[link] = value,
                cru::reg::LINK_SUPERPAGE_ADDRESS_LOW => self.staged_low[link] = value,
                cru::reg::LINK_SUPERPAGE_PAGES => {
                    let bus =
                        (u64::from(self.staged_high[link]) << 32) | u64::from(self.staged_low[link]);
                    self.pending[link].push_back((bus, value));
                    self.service_link(link);
                }
                cru::reg::LINK_SUPERPAGE_SIZE => {
                    // Dummy write: advance the size FIFO to the next entry.
                    self.size_visible[link] = self.size_fifo[link].pop_front().unwrap_or(0);
                }
                _ => self.bar0[index as usize] = value,
            }
            return;
        }

        match index {
            cru::reg::RESET_CONTROL => {
                if value & 0x1 != 0 {
                    let links = cru::MAX_LINKS as usize;
                    self.pending = vec![VecDeque::new(); links];
                    self.completed = vec![0; links];
                    self.size_fifo = vec![VecDeque::new(); links];
                    self.size_visible = vec![0; links];
                    self.size_index = vec![0; links];
                    self.event_counter = 0;
                }
                if value & 0x2 != 0 {
                    self.event_counter = 0;
                }
            }
            _ => {
                self.bar0[index as usize] = value;
                self.service_all();
            }
        }
    }

    fn service_all(&mut self) {
        for link in 0..cru::MAX_LINKS as usize {
            self.service_link(link);
        }
    }

    fn service_link(&mut self, link: usize) {
        if !self.emulator_on() || !self.data_taking() || self.held_links.contains(&(link as u32)) {
            return;
        }
        while let Some((bus, pages)) = self.pending[link].pop_front() {
            let bytes = u64::from(pages) * 8192;
            let total_words = (bytes / 4) as usize;
            let dma_pages = total_words / self.page_words;
            for page in 0..dma_pages {
                let base = bus as usize + page * self.page_words * 4;
                for word in 0..self.page_words {
                    if let Some(value) =
                        expected_word(CardType::Cru, self.pattern, self.event_counter, word)
                    {
                        unsafe { ((base + word * 4) as *mut u32).write_volatile(value) };
                    }
                }
                self.event_counter = self.event_counter.wrapping_add(1);
            }
            fence(Ordering::Release);
            self.completed[link] += 1;
            let index = self.size_index[link];
            self.size_fifo[link].push_back((bytes as u32 & 0x00ff_ffff) | (index << 24));
            self.size_index[link] = (index + 1) % 256;
        }
    }
}

/// Handle to an in-process CRU. Clones share the card.
#[derive(Clone)]
pub struct SimCru {
    state: Arc<Mutex<CruState>>,
}

impl Default for SimCru {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCru {
    pub fn new() -> Self {
        SimCru {
            state: Arc::new(Mutex::new(CruState::new())),
        }
    }

    pub fn bar0(&self) -> Box<dyn Bar> {
        Box::new(SimCruBar {
            state: self.state.clone(),
            index: 0,
        })
    }

    pub fn bar2(&self) -> Box<dyn Bar> {
        Box::new(SimCruBar {
            state: self.state.clone(),
            index: 2,
        })
    }

    pub fn set_pattern(&self, pattern: GeneratorPattern) {
        self.state.lock().unwrap().pattern = pattern;
    }

    /// DMA page size the emulator fills with, in bytes.
    pub fn set_page_size(&self, bytes: u64) {
        self.state.lock().unwrap().page_words = (bytes / 4).max(1) as usize;
    }

    pub fn emulator_enabled(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.emulator_on() && state.data_taking()
    }

    pub fn event_count(&self) -> u32 {
        self.state.lock().unwrap().event_counter
    }

    /// Park a link: pushed superpages queue up but never complete.
    pub fn hold_link(&self, link: u32) {
        self.state.lock().unwrap().held_links.push(link);
    }

    pub fn release_link(&self, link: u32) {
        let mut state = self.state.lock().unwrap();
        state.held_links.retain(|&l| l != link);
        state.service_link(link as usize);
    }

    pub fn set_dropped_packets(&self, dropped: u32) {
        self.state.lock().unwrap().bar0[cru::reg::DROPPED_PACKETS as usize] = dropped;
    }
}

struct SimCruBar {
    state: Arc<Mutex<CruState>>,
    index: u32,
}

impl Bar for SimCruBar {
    fn index(&self) -> u32 {
        self.index
    }

    fn read_register(&self, index: u32) -> u32 {
        let state = self.state.lock().unwrap();
        if self.index == 2 {
            state.bar2[index as usize]
        } else {
            state.read_bar0(index)
        }
    }

    fn write_register(&mut self, index: u32, value: u32) {
        let mut state = self.state.lock().unwrap();
        if self.index == 2 {
            state.bar2[index as usize] = value;
        } else {
            state.write_bar0(index, value);
        }
    }
}
