//! CRORC engine scenarios: loopback streaming, backpressure, in-order
//! completion, fault promotion and the reset cascade.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{crorc_rig, read_page};
use rocard::pattern::{check_page, counter_from_page};
use rocard::{
    CardType, ChannelError, ChannelState, DataSource, GeneratorPattern, ResetLevel, Superpage,
};

const PAGE: u64 = 8 * 1024;

#[test]
fn single_superpage_internal_loopback_incremental() {
    // 2 MiB buffer, one 1 MiB superpage of 128 pages.
    let mut rig = crorc_rig(2 * 1024 * 1024, |p| p);
    let superpage_size = 1024 * 1024;

    rig.channel.start_dma().unwrap();
    rig.channel
        .push_superpage(Superpage::new(0, superpage_size))
        .unwrap();

    while rig.channel.superpage_queue_count() == 0 {
        rig.channel.fill_superpages().unwrap();
    }

    let superpage = rig.channel.pop_superpage().unwrap();
    assert!(superpage.is_ready());
    assert!(superpage.is_filled());
    assert_eq!(superpage.received, superpage_size);

    // Word 0 of each page carries the event counter, incrementing by one
    // per page.
    for page in 0..superpage_size / PAGE {
        let words = read_page(rig.buffer_base, superpage.offset, PAGE, page);
        assert_eq!(counter_from_page(CardType::Crorc, words[0]), page as u32);
        check_page(
            CardType::Crorc,
            GeneratorPattern::Incremental,
            page as u32,
            &words,
        )
        .unwrap();
    }

    rig.channel.stop_dma().unwrap();
}

#[test]
fn backpressure_queue_full_has_no_side_effects() {
    // One-page superpages; buffer has room for more than the queue bound.
    let mut rig = crorc_rig(256 * PAGE as usize, |p| p);
    rig.channel.start_dma().unwrap();

    let capacity = rig.channel.transfer_queue_available();
    for i in 0..capacity {
        rig.channel
            .push_superpage(Superpage::new(i as u64 * PAGE, PAGE))
            .unwrap();
    }
    assert_eq!(rig.channel.transfer_queue_available(), 0);

    let overflow = Superpage::new(capacity as u64 * PAGE, PAGE);
    assert!(matches!(
        rig.channel.push_superpage(overflow),
        Err(ChannelError::QueueFull)
    ));
    // No side effects: the bound didn't move.
    assert_eq!(rig.channel.transfer_queue_available(), 0);

    rig.channel.fill_superpages().unwrap();
    rig.channel.pop_superpage().unwrap();
    rig.channel.push_superpage(overflow).unwrap();

    rig.channel.stop_dma().unwrap();
}

#[test]
fn deferred_start_waits_for_first_push() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    rig.channel.start_dma().unwrap();
    assert_eq!(rig.channel.state(), ChannelState::PendingStart);

    // No superpages yet: fill must not start the generator.
    rig.channel.fill_superpages().unwrap();
    assert!(!rig.sim.generator_started());
    assert_eq!(rig.channel.state(), ChannelState::PendingStart);

    // The push alone must not start it either.
    rig.channel
        .push_superpage(Superpage::new(0, PAGE))
        .unwrap();
    assert!(!rig.sim.generator_started());

    rig.channel.fill_superpages().unwrap();
    assert!(rig.sim.generator_started());
    assert_eq!(rig.channel.state(), ChannelState::Running);
}

#[test]
fn strict_in_order_completion_guard() {
    // Slots [Whole, None, Whole]: exactly one superpage may complete.
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    rig.sim.hold_descriptor(1);

    rig.channel.start_dma().unwrap();
    for i in 0..3u64 {
        rig.channel
            .push_superpage(Superpage::new(i * PAGE, PAGE))
            .unwrap();
    }
    rig.channel.fill_superpages().unwrap();
    assert_eq!(rig.channel.superpage_queue_count(), 1);
    assert_eq!(rig.channel.pop_superpage().unwrap().offset, 0);

    // Once the held slot arrives, the remaining two drain in order.
    rig.sim.release_held();
    rig.channel.fill_superpages().unwrap();
    assert_eq!(rig.channel.superpage_queue_count(), 2);
    assert_eq!(rig.channel.pop_superpage().unwrap().offset, PAGE);
    assert_eq!(rig.channel.pop_superpage().unwrap().offset, 2 * PAGE);
}

#[test]
fn arrival_error_promotes_to_faulted_and_blocks_admissions() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    rig.sim.inject_error_on(0);

    rig.channel.start_dma().unwrap();
    rig.channel
        .push_superpage(Superpage::new(0, PAGE))
        .unwrap();

    match rig.channel.fill_superpages() {
        Err(ChannelError::DataArrival { index, status, .. }) => {
            assert_eq!(index, 0);
            assert_ne!(status & (1 << 31), 0);
        }
        other => panic!("expected DataArrival, got {other:?}"),
    }
    assert_eq!(rig.channel.state(), ChannelState::Faulted);

    assert!(matches!(
        rig.channel.push_superpage(Superpage::new(PAGE, PAGE)),
        Err(ChannelError::InvalidState(_))
    ));
    assert!(rig.channel.fill_superpages().is_err());

    // Recovery: reset, then a fresh run works.
    rig.channel.reset_channel(ResetLevel::Internal).unwrap();
    assert_eq!(rig.channel.state(), ChannelState::Stopped);
    rig.channel.start_dma().unwrap();
    rig.channel
        .push_superpage(Superpage::new(0, PAGE))
        .unwrap();
    while rig.channel.superpage_queue_count() == 0 {
        rig.channel.fill_superpages().unwrap();
    }
    rig.channel.stop_dma().unwrap();
}

#[test]
fn reset_cascade_settles_between_diu_and_siu() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p.data_source(DataSource::Siu));

    let before = rig.timing.settles().len();
    rig.channel
        .reset_channel(ResetLevel::InternalDiuSiu)
        .unwrap();
    let settles = rig.timing.settles()[before..].to_vec();

    // Loopback off, DIU reset, SIU reset: a 100 ms settle after each.
    assert!(settles.len() >= 3, "expected at least 3 settles, got {settles:?}");
    for settle in &settles[..3] {
        assert_eq!(*settle, Duration::from_millis(100));
    }

    // The channel is usable afterwards.
    rig.channel.start_dma().unwrap();
    rig.channel
        .push_superpage(Superpage::new(0, PAGE))
        .unwrap();
    while rig.channel.superpage_queue_count() == 0 {
        rig.channel.fill_superpages().unwrap();
    }
    rig.channel.stop_dma().unwrap();
}

#[test]
fn reset_is_idempotent() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    for level in [
        ResetLevel::None,
        ResetLevel::Internal,
        ResetLevel::InternalDiu,
        ResetLevel::InternalDiuSiu,
    ] {
        rig.channel.reset_channel(level).unwrap();
        rig.channel.reset_channel(level).unwrap();
        assert_eq!(rig.channel.state(), ChannelState::Stopped);
    }

    rig.channel.start_dma().unwrap();
    rig.channel
        .push_superpage(Superpage::new(0, PAGE))
        .unwrap();
    while rig.channel.superpage_queue_count() == 0 {
        rig.channel.fill_superpages().unwrap();
    }
}

#[test]
fn no_signal_fails_siu_reset_with_link_down() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p.data_source(DataSource::Siu));
    rig.sim.set_no_signal(true);
    assert!(matches!(
        rig.channel.reset_channel(ResetLevel::InternalDiuSiu),
        Err(ChannelError::LinkDown(_))
    ));
}

#[test]
fn silent_siu_after_reset_warns_but_does_not_abort() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p.data_source(DataSource::Siu));
    rig.sim.set_siu_silent(true);
    // The DIU answers and reports signal; the SIU status read times out,
    // which is reported but tolerated.
    rig.channel
        .reset_channel(ResetLevel::InternalDiuSiu)
        .unwrap();
    assert_eq!(rig.channel.state(), ChannelState::Stopped);
}

#[test]
fn mid_stream_stop_drains_cleanly() {
    // A long run interrupted by the cancellation token: everything pushed
    // before the interrupt is drained and popped.
    let mut rig = crorc_rig(64 * PAGE as usize, |p| p);
    rig.channel.start_dma().unwrap();

    let superpages = 100u64;
    let interrupt_at = 43u64;
    let mut pushed = 0u64;
    let mut popped = 0u64;
    let mut free: std::collections::VecDeque<u64> = (0..64).map(|i| i * PAGE).collect();

    while popped < superpages {
        if rig.channel.stop_requested() {
            break;
        }
        if popped >= interrupt_at {
            rig.stop_flag
                .store(true, std::sync::atomic::Ordering::Relaxed);
        }

        rig.channel.fill_superpages().unwrap();
        while pushed < superpages && rig.channel.superpage_queue_available() > 0 {
            let Some(offset) = free.pop_front() else {
                break;
            };
            rig.channel
                .push_superpage(Superpage::new(offset, PAGE))
                .unwrap();
            pushed += 1;
        }
        while rig.channel.superpage_queue_count() > 0 {
            free.push_back(rig.channel.pop_superpage().unwrap().offset);
            popped += 1;
        }
    }

    // Drain what was in flight at the interrupt.
    loop {
        rig.channel.fill_superpages().unwrap();
        if rig.channel.superpage_queue_count() == 0 && rig.channel.is_transfer_queue_empty() {
            break;
        }
        while rig.channel.superpage_queue_count() > 0 {
            rig.channel.pop_superpage().unwrap();
            popped += 1;
        }
    }
    rig.channel.stop_dma().unwrap();

    assert_eq!(popped, pushed);
    assert!(popped >= interrupt_at);
}

#[test]
fn stop_dma_is_idempotent() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    rig.channel.start_dma().unwrap();
    rig.channel.stop_dma().unwrap();
    rig.channel.stop_dma().unwrap();
    assert_eq!(rig.channel.state(), ChannelState::Stopped);
}

#[test]
fn invalid_superpages_are_rejected() {
    let mut rig = crorc_rig(16 * PAGE as usize, |p| p);
    rig.channel.start_dma().unwrap();

    // Not a page multiple.
    assert!(matches!(
        rig.channel.push_superpage(Superpage::new(0, PAGE + 4)),
        Err(ChannelError::InvalidParameter(_))
    ));
    // Outside the buffer.
    assert!(matches!(
        rig.channel.push_superpage(Superpage::new(15 * PAGE, 2 * PAGE)),
        Err(ChannelError::BufferTooSmall { .. })
    ));
    // Unaligned offset.
    assert!(matches!(
        rig.channel.push_superpage(Superpage::new(4, PAGE)),
        Err(ChannelError::InvalidParameter(_))
    ));
}

#[test]
fn ddg_source_is_rejected_on_crorc() {
    let state_dir = tempfile::TempDir::new().unwrap();
    let params = rocard::Parameters::new(
        rocard::CardId::PciAddress("07:00.0".into()),
        CardType::Crorc,
        0,
    )
    .state_dir(state_dir.path().to_path_buf())
    .data_source(DataSource::Ddg);

    let sim = rocard::sim::SimCrorc::new();
    let resources = rocard::ChannelResources::new(
        sim.bar(),
        Box::new(rocard::OwnedBuffer::new(16 * PAGE as usize)),
    );
    assert!(matches!(
        rocard::DmaChannel::new(&params, resources),
        Err(ChannelError::UnsupportedFeature(_))
    ));
}

#[test]
fn channel_lock_excludes_second_open() {
    let state_dir = tempfile::TempDir::new().unwrap();
    let params = rocard::Parameters::new(
        rocard::CardId::PciAddress("07:00.0".into()),
        CardType::Crorc,
        0,
    )
    .state_dir(state_dir.path().to_path_buf());

    let sim = rocard::sim::SimCrorc::new();
    let first = rocard::DmaChannel::new(
        &params,
        rocard::ChannelResources::new(
            sim.bar(),
            Box::new(rocard::OwnedBuffer::new(16 * PAGE as usize)),
        ),
    )
    .unwrap();

    let second = rocard::DmaChannel::new(
        &params,
        rocard::ChannelResources::new(
            sim.bar(),
            Box::new(rocard::OwnedBuffer::new(16 * PAGE as usize)),
        ),
    );
    assert!(matches!(second, Err(ChannelError::LockBusy { .. })));

    drop(first);
    let third = rocard::DmaChannel::new(
        &params,
        rocard::ChannelResources::new(
            sim.bar(),
            Box::new(rocard::OwnedBuffer::new(16 * PAGE as usize)),
        ),
    );
    assert!(third.is_ok());
}
