//! CRU engine scenarios: loopback streaming, per-link ordering, and the
//! CTP emulator register block.

mod common;

use pretty_assertions::assert_eq;

use common::{cru_rig, read_page};
use rocard::cru::regs::bar2;
use rocard::cru::{CruBar, CtpInfo, TriggerMode};
use rocard::pattern::{check_page, counter_from_page};
use rocard::sim::SimCru;
use rocard::{CardType, ChannelError, ChannelState, GeneratorPattern, Superpage};

const PAGE: u64 = 8 * 1024;

#[test]
fn loopback_stream_with_incremental_pattern() {
    let mut rig = cru_rig(2 * 1024 * 1024, |p| p);
    let superpage_size = 256 * 1024;

    rig.channel.start_dma().unwrap();
    assert_eq!(rig.channel.state(), ChannelState::PendingStart);
    assert!(!rig.sim.emulator_enabled());

    for i in 0..4u64 {
        rig.channel
            .push_superpage(Superpage::new(i * superpage_size, superpage_size))
            .unwrap();
    }
    // Deferred start: the emulator comes up on the first fill that sees
    // pending work.
    rig.channel.fill_superpages().unwrap();
    assert!(rig.sim.emulator_enabled());
    assert_eq!(rig.channel.state(), ChannelState::Running);

    while rig.channel.superpage_queue_count() < 4 {
        rig.channel.fill_superpages().unwrap();
    }

    let mut counter = 0u32;
    for i in 0..4u64 {
        let superpage = rig.channel.pop_superpage().unwrap();
        assert_eq!(superpage.offset, i * superpage_size);
        assert_eq!(superpage.received, superpage_size);
        for page in 0..superpage_size / PAGE {
            let words = read_page(rig.buffer_base, superpage.offset, PAGE, page);
            assert_eq!(counter_from_page(CardType::Cru, words[0]), counter);
            check_page(CardType::Cru, GeneratorPattern::Incremental, counter, &words).unwrap();
            counter += 1;
        }
    }

    rig.channel.stop_dma().unwrap();
    assert!(!rig.sim.emulator_enabled());
}

#[test]
fn multi_link_completions_never_overtake_push_order() {
    let mut rig = cru_rig(1024 * 1024, |p| p.link_mask(vec![0, 1]));
    rig.sim.hold_link(1);

    rig.channel.start_dma().unwrap();
    // Round-robin push: offsets 0,1,2,3 land on links 0,1,0,1.
    for i in 0..4u64 {
        rig.channel
            .push_superpage(Superpage::new(i * PAGE, PAGE))
            .unwrap();
    }
    rig.channel.fill_superpages().unwrap();

    // Link 0 finished its superpages, but the head of the queue after the
    // first is on the held link: exactly one may surface.
    assert_eq!(rig.channel.superpage_queue_count(), 1);
    assert_eq!(rig.channel.pop_superpage().unwrap().offset, 0);

    rig.sim.release_link(1);
    rig.channel.fill_superpages().unwrap();
    assert_eq!(rig.channel.superpage_queue_count(), 3);
    for i in 1..4u64 {
        assert_eq!(rig.channel.pop_superpage().unwrap().offset, i * PAGE);
    }
}

#[test]
fn superpage_sizes_are_validated_per_link() {
    let mut rig = cru_rig(1024 * 1024, |p| p);
    rig.channel.start_dma().unwrap();

    for i in 0..8u64 {
        rig.channel
            .push_superpage(Superpage::new(i * 2 * PAGE, 2 * PAGE))
            .unwrap();
    }
    while rig.channel.superpage_queue_count() < 8 {
        rig.channel.fill_superpages().unwrap();
    }
    for _ in 0..8 {
        let superpage = rig.channel.pop_superpage().unwrap();
        assert_eq!(superpage.received, 2 * PAGE);
        assert!(superpage.is_filled());
    }
}

#[test]
fn dropped_packet_counter_is_surfaced() {
    let rig = cru_rig(64 * 1024, |p| p);
    rig.sim.set_dropped_packets(7);
    assert_eq!(rig.channel.dropped_packets(), Some(7));
}

#[test]
fn diu_sources_are_rejected_on_cru() {
    let state_dir = tempfile::TempDir::new().unwrap();
    let params = rocard::Parameters::new(
        rocard::CardId::PciAddress("3b:00.0".into()),
        CardType::Cru,
        0,
    )
    .state_dir(state_dir.path().to_path_buf())
    .data_source(rocard::DataSource::Siu);

    let sim = SimCru::new();
    let resources =
        rocard::ChannelResources::new(sim.bar0(), Box::new(rocard::OwnedBuffer::new(64 * 1024)));
    assert!(matches!(
        rocard::DmaChannel::new(&params, resources),
        Err(ChannelError::UnsupportedFeature(_))
    ));
}

#[test]
fn ctp_emulator_writes_the_documented_tuple() {
    let sim = SimCru::new();
    let mut bar = CruBar::new(sim.bar2());

    bar.emulate_ctp(CtpInfo {
        bc_max: 3560,
        hb_drop: 15000,
        hb_keep: 15000,
        hb_max: 8,
        trigger_mode: TriggerMode::Continuous,
        trigger_frequency: 8,
        generate_eox: false,
        generate_single_trigger: false,
    })
    .unwrap();

    let readback = sim.bar2();
    assert_eq!(readback.read_register(bar2::TTC_EMU_RUNMODE), 0x2);
    assert_eq!(readback.read_register(bar2::TTC_EMU_BCMAX), 3560);
    assert_eq!(readback.read_register(bar2::TTC_EMU_HBMAX), 8);
    assert_eq!(readback.read_register(bar2::TTC_EMU_PRESCALER_KEEP), 15000);
    assert_eq!(readback.read_register(bar2::TTC_EMU_PRESCALER_DROP), 15000);
    // The emulator was released from reset at the end of programming.
    assert_eq!(readback.read_register(bar2::TTC_EMU_CONTROL), 0x0);

    // Programming again with the same parameters reproduces the block.
    let mut bar = CruBar::new(sim.bar2());
    bar.emulate_ctp(CtpInfo {
        bc_max: 3560,
        hb_drop: 15000,
        hb_keep: 15000,
        hb_max: 8,
        trigger_mode: TriggerMode::Continuous,
        trigger_frequency: 8,
        generate_eox: false,
        generate_single_trigger: false,
    })
    .unwrap();
    let readback = sim.bar2();
    assert_eq!(readback.read_register(bar2::TTC_EMU_RUNMODE), 0x2);
    assert_eq!(readback.read_register(bar2::TTC_EMU_BCMAX), 3560);
}

#[test]
fn hc_and_cal_modes_demote_to_periodic_after_programming_their_divider() {
    let sim = SimCru::new();
    let mut bar = CruBar::new(sim.bar2());
    bar.emulate_ctp(CtpInfo {
        bc_max: 3560,
        hb_drop: 15000,
        hb_keep: 15000,
        hb_max: 8,
        trigger_mode: TriggerMode::Hc,
        trigger_frequency: 42,
        generate_eox: false,
        generate_single_trigger: false,
    })
    .unwrap();

    let readback = sim.bar2();
    assert_eq!(readback.read_register(bar2::TTC_EMU_RUNMODE), 0x1);
    assert_eq!(readback.read_register(bar2::TTC_EMU_HCDIV), 42);
    assert_eq!(readback.read_register(bar2::TTC_EMU_PHYSDIV), 5);
}

#[test]
fn ctp_emulator_requires_bar2() {
    let sim = SimCru::new();
    let mut bar = CruBar::new(sim.bar0());
    let err = bar.emulate_ctp(CtpInfo {
        bc_max: 3560,
        hb_drop: 15000,
        hb_keep: 15000,
        hb_max: 8,
        trigger_mode: TriggerMode::Periodic,
        trigger_frequency: 8,
        generate_eox: false,
        generate_single_trigger: false,
    });
    assert!(matches!(err, Err(ChannelError::InvalidParameter(_))));
}

#[test]
fn eox_and_single_trigger_short_circuit() {
    let sim = SimCru::new();
    let mut bar = CruBar::new(sim.bar2());

    bar.emulate_ctp(CtpInfo {
        bc_max: 1,
        hb_drop: 1,
        hb_keep: 1,
        hb_max: 1,
        trigger_mode: TriggerMode::Periodic,
        trigger_frequency: 1,
        generate_eox: true,
        generate_single_trigger: false,
    })
    .unwrap();
    let readback = sim.bar2();
    assert_eq!(readback.read_register(bar2::TTC_EMU_IDLE), 0x1);
    // Idle mode doesn't reprogram the trigger block.
    assert_eq!(readback.read_register(bar2::TTC_EMU_BCMAX), 0);

    bar.emulate_ctp(CtpInfo {
        bc_max: 1,
        hb_drop: 1,
        hb_keep: 1,
        hb_max: 1,
        trigger_mode: TriggerMode::Periodic,
        trigger_frequency: 1,
        generate_eox: false,
        generate_single_trigger: true,
    })
    .unwrap();
    assert_eq!(readback.read_register(bar2::TTC_EMU_PHYS_TRIG), 0x1);
}
