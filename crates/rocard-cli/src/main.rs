//! Command-line tools built on the `rocard` channel engine.
//!
//! Both subcommands drive the in-process card models from `rocard::sim` in
//! internal-loopback mode: they exercise the full engine (deferred start,
//! descriptor accounting, ordering, backpressure, pattern checking) without
//! requiring a mapped PCI device. Wiring a real card means substituting a
//! `MappedBar` and an externally allocated buffer for the sim resources.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use rocard::cru::{CruBar, CtpInfo, TriggerMode};
use rocard::pattern::{check_page, counter_from_page, PatternMismatch};
use rocard::sim::{SimCrorc, SimCru};
use rocard::{
    BufferProvider, CardId, CardType, ChannelResources, DmaChannel, DmaRegion, GeneratorPattern,
    OwnedBuffer, Parameters, ReadoutMode, ResetLevel, Superpage,
};

/// Value the page-reset option writes back into consumed pages.
const PAGE_RESET_VALUE: u32 = 0xcccc_cccc;
/// At most this many data errors are recorded in detail.
const MAX_RECORDED_ERRORS: usize = 1000;
/// Where the recorded errors go.
const READOUT_ERRORS_PATH: &str = "readout_errors.txt";
/// Nap when the loop had nothing to do.
const IDLE_NAP: Duration = Duration::from_micros(10);

#[derive(Debug, Parser)]
#[command(name = "rocard", about = "Readout-card DMA tools (in-process loopback)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream superpages through a DMA channel and measure throughput.
    DmaBench(DmaBenchArgs),
    /// Program the CTP emulator on a CRU BAR2 and read the result back.
    CtpEmulator(CtpEmulatorArgs),
}

#[derive(Debug, Parser)]
struct DmaBenchArgs {
    /// Card family to drive: crorc or cru.
    #[arg(long, default_value = "crorc")]
    card: String,

    /// Card id, used for the channel lock and state file names.
    #[arg(long, default_value = "42:00.0")]
    id: String,

    /// DMA channel number.
    #[arg(long, default_value_t = 0)]
    channel: u32,

    /// Pages to transfer (suffixes k/M/G, Ki/Mi/Gi). 0 means infinite.
    #[arg(long, default_value = "10k")]
    pages: String,

    /// Buffer size in bytes (suffixes accepted).
    #[arg(long, default_value = "10Mi")]
    buffer_size: String,

    /// Superpage size in bytes; must divide the buffer and be a multiple of
    /// the DMA page size.
    #[arg(long, default_value = "1Mi")]
    superpage_size: String,

    /// DMA page size in bytes (fixed at 8Ki on the CRORC).
    #[arg(long, default_value = "8Ki")]
    dma_page_size: String,

    /// Reset the channel during initialization.
    #[arg(long)]
    reset: bool,

    /// Write read-out pages to readout_data.txt as ASCII words.
    #[arg(long)]
    to_file_ascii: bool,

    /// Write raw read-out pages to readout_data.bin.
    #[arg(long)]
    to_file_bin: bool,

    /// Skip data error checking.
    #[arg(long)]
    no_errorcheck: bool,

    /// Generator pattern: INCREMENTAL, ALTERNATING, CONSTANT or RANDOM.
    #[arg(long, default_value = "INCREMENTAL")]
    pattern: String,

    /// Readout mode (CONTINUOUS).
    #[arg(long)]
    readout_mode: Option<String>,

    /// Don't resync the expected event counter after a data error.
    #[arg(long)]
    no_resync: bool,

    /// Reset pages to a known value after readout (slow).
    #[arg(long)]
    page_reset: bool,

    /// Randomly pause the readout loop to exercise backpressure.
    #[arg(long)]
    random_pause: bool,

    /// Remove the channel's state files when the benchmark completes.
    #[arg(long)]
    rm_pages_file: bool,

    /// Raise the stop flag after this many seconds and drain, as a SIGINT
    /// stand-in for unattended runs.
    #[arg(long)]
    duration: Option<u64>,
}

#[derive(Debug, Parser)]
struct CtpEmulatorArgs {
    /// Maximum bunch-crossing value.
    #[arg(long, default_value_t = 3560)]
    bcmax: u32,

    /// Maximum heartbeat value.
    #[arg(long, default_value_t = 8)]
    hbmax: u32,

    /// Heartbeats to drop.
    #[arg(long, default_value_t = 15000)]
    hbdrop: u32,

    /// Heartbeats to keep.
    #[arg(long, default_value_t = 15000)]
    hbkeep: u32,

    /// Trigger mode: manual, periodic, continuous, fixed, hc or cal.
    #[arg(long, default_value = "periodic")]
    trigger_mode: String,

    /// Physics trigger frequency.
    #[arg(long, default_value_t = 8)]
    trigger_freq: u32,

    /// Generate an EOX trigger (emulator idle mode).
    #[arg(long)]
    eox: bool,

    /// Generate a single PHY trigger.
    #[arg(long)]
    single_trigger: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::DmaBench(args) => dma_bench(&args),
        Command::CtpEmulator(args) => ctp_emulator(&args),
    }
}

/// Parse "10k", "2Mi", "1Gi" style sizes.
fn parse_size(input: &str) -> Result<u64> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("bad size value: {input:?}"))?;
    let multiplier: u64 = match suffix {
        "" => 1,
        "k" | "K" => 1000,
        "M" => 1000 * 1000,
        "G" => 1000 * 1000 * 1000,
        "Ki" => 1024,
        "Mi" => 1024 * 1024,
        "Gi" => 1024 * 1024 * 1024,
        _ => bail!("bad size suffix: {input:?}"),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("size overflows: {input:?}"))
}

fn parse_card(input: &str) -> Result<CardType> {
    match input.to_ascii_lowercase().as_str() {
        "crorc" => Ok(CardType::Crorc),
        "cru" => Ok(CardType::Cru),
        other => bail!("unknown card family: {other:?}"),
    }
}

/// Cheap xorshift for the random-pause option; no statistical needs here.
struct Pauses {
    state: u64,
    next_at: Instant,
    length: Duration,
}

impl Pauses {
    fn new() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
            | 0x9e37_79b9;
        Pauses {
            state: seed,
            next_at: Instant::now(),
            length: Duration::from_millis(1),
        }
    }

    fn next(&mut self, lo: u64, hi: u64) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        lo + self.state % (hi - lo)
    }

    fn pause_if_needed(&mut self) {
        if Instant::now() >= self.next_at {
            std::thread::sleep(self.length);
            self.next_at = Instant::now() + Duration::from_millis(self.next(10, 2000));
            self.length = Duration::from_millis(self.next(1, 500));
        }
    }
}

struct ErrorLog {
    count: u64,
    recorded: String,
}

impl ErrorLog {
    fn add(&mut self, event: i64, counter: u32, mismatch: &PatternMismatch) {
        self.count += 1;
        if (self.count as usize) <= MAX_RECORDED_ERRORS {
            self.recorded.push_str(&format!(
                "event:{} i:{} cnt:{} exp:0x{:x} val:0x{:x}\n",
                event, mismatch.word, counter, mismatch.expected, mismatch.actual
            ));
        }
    }
}

fn dma_bench(args: &DmaBenchArgs) -> Result<()> {
    let card_type = parse_card(&args.card)?;
    let pattern: GeneratorPattern = args
        .pattern
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let max_pages = parse_size(&args.pages)?;
    let buffer_size = parse_size(&args.buffer_size)?;
    let superpage_size = parse_size(&args.superpage_size)?;
    let page_size = parse_size(&args.dma_page_size)?;

    if args.to_file_ascii && args.to_file_bin {
        bail!("file output can't be both ASCII and binary");
    }
    if superpage_size == 0 || superpage_size % page_size != 0 {
        bail!("superpage size must be a multiple of the DMA page size");
    }
    if buffer_size < superpage_size {
        bail!("buffer size smaller than superpage size");
    }
    if !args.no_errorcheck && pattern == GeneratorPattern::Random {
        bail!("the RANDOM pattern has no checker; pass --no-errorcheck");
    }

    let mut params = Parameters::new(
        CardId::PciAddress(args.id.clone()),
        card_type,
        args.channel,
    )
    .dma_page_size(page_size)
    .generator_pattern(pattern);
    if let Some(mode) = &args.readout_mode {
        let mode: ReadoutMode = mode.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
        params = params.readout_mode(mode);
    }

    let buffer = OwnedBuffer::new(buffer_size as usize);
    let buffer_base = buffer.user_address();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let resources = match card_type {
        CardType::Crorc => {
            let sim = SimCrorc::new();
            ChannelResources::new(sim.bar(), Box::new(buffer))
                .fifo_region(DmaRegion::allocate(rocard::READY_FIFO_CAPACITY * 8))
        }
        CardType::Cru => {
            let sim = SimCru::new();
            sim.set_pattern(pattern);
            sim.set_page_size(page_size);
            ChannelResources::new(sim.bar0(), Box::new(buffer))
        }
    }
    .stop_flag(stop_flag.clone());

    let mut channel =
        DmaChannel::new(&params, resources).context("failed to open the DMA channel")?;
    info!(
        firmware = %channel.firmware_info(),
        serial = channel.serial(),
        "channel open"
    );

    if args.reset {
        info!("resetting channel");
        channel.reset_channel(ResetLevel::Internal)?;
    }

    if let Some(seconds) = args.duration {
        let flag = stop_flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            flag.store(true, Ordering::Relaxed);
        });
    }

    let mut readout_stream: Option<BufWriter<File>> = if args.to_file_ascii {
        Some(BufWriter::new(File::create("readout_data.txt")?))
    } else if args.to_file_bin {
        Some(BufWriter::new(File::create("readout_data.bin")?))
    } else {
        None
    };

    let max_superpages = buffer_size / superpage_size;
    let pages_per_superpage = superpage_size / page_size;
    let infinite = max_pages == 0;
    info!(buffer_size, superpage_size, page_size, max_superpages, "starting benchmark");

    let mut free_queue: VecDeque<u64> = (0..max_superpages).map(|i| i * superpage_size).collect();

    channel.start_dma()?;

    let mut pauses = Pauses::new();
    let mut errors = ErrorLog {
        count: 0,
        recorded: String::new(),
    };
    let mut pushed_pages: u64 = 0;
    let mut readout_pages: u64 = 0;
    let mut expected_counter: i64 = -1;
    let started = Instant::now();
    let mut faulted = None;

    loop {
        if channel.stop_requested() {
            info!("stop requested; draining");
            break;
        }
        if !infinite && readout_pages >= max_pages {
            break;
        }
        if args.random_pause {
            pauses.pause_if_needed();
        }

        if let Err(err) = channel.fill_superpages() {
            faulted = Some(err);
            break;
        }

        // Keep the driver's queue filled.
        let mut idle = true;
        while channel.superpage_queue_available() > 0
            && (infinite || pushed_pages < max_pages)
        {
            let Some(offset) = free_queue.pop_front() else {
                break;
            };
            channel.push_superpage(Superpage::new(offset, superpage_size))?;
            pushed_pages += pages_per_superpage;
            idle = false;
        }

        // Read out filled superpages.
        while channel.superpage_queue_count() > 0 {
            let superpage = channel.pop_superpage()?;
            let pages = superpage.received / page_size;
            for page in 0..pages {
                let address = buffer_base as u64 + superpage.offset + page * page_size;
                readout_page(
                    card_type,
                    pattern,
                    args,
                    address as usize,
                    page_size as usize,
                    readout_pages as i64,
                    &mut expected_counter,
                    &mut errors,
                    readout_stream.as_mut(),
                )?;
                readout_pages += 1;
            }
            free_queue.push_back(superpage.offset);
            idle = false;
        }

        if idle {
            std::thread::sleep(IDLE_NAP);
        }
    }

    // Pop whatever was pushed in excess before stopping.
    let drain_deadline = Instant::now() + Duration::from_millis(10);
    let mut excess = 0u64;
    while Instant::now() < drain_deadline {
        let _ = channel.fill_superpages();
        if channel.superpage_queue_count() > 0 {
            let superpage = channel.pop_superpage()?;
            excess += superpage.received / page_size;
        }
    }
    if excess > 0 {
        info!(excess, "popped excess pages");
    }

    channel.stop_dma()?;
    let elapsed = started.elapsed();

    if let Some(stream) = readout_stream.as_mut() {
        stream.flush()?;
    }
    if !args.no_errorcheck {
        std::fs::write(READOUT_ERRORS_PATH, &errors.recorded)?;
        if errors.count > 0 {
            warn!(errors = errors.count, "data errors recorded to {READOUT_ERRORS_PATH}");
        }
    }

    print_stats(elapsed, readout_pages, page_size, args.no_errorcheck, errors.count);

    if args.rm_pages_file {
        // The loopback benchmark keeps its buffer in memory; only the
        // channel state files exist on disk, and the lock is removed on
        // drop. Nothing further to do here.
    }

    if let Some(err) = faulted {
        bail!("engine fault: {err}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn readout_page(
    card_type: CardType,
    pattern: GeneratorPattern,
    args: &DmaBenchArgs,
    address: usize,
    page_size: usize,
    event: i64,
    expected_counter: &mut i64,
    errors: &mut ErrorLog,
    stream: Option<&mut BufWriter<File>>,
) -> Result<()> {
    let words = page_size / 4;
    // The engine guarantees the card is done with this page; the raw view
    // is ours until the offset is pushed again.
    let page: &[u32] = unsafe { std::slice::from_raw_parts(address as *const u32, words) };

    if let Some(stream) = stream {
        if args.to_file_ascii {
            writeln!(stream, "Event #{event}")?;
            for chunk in page.chunks(8) {
                for word in chunk {
                    write!(stream, "{word} ")?;
                }
                writeln!(stream)?;
            }
            writeln!(stream)?;
        } else {
            let bytes: &[u8] =
                unsafe { std::slice::from_raw_parts(address as *const u8, page_size) };
            stream.write_all(bytes)?;
        }
    }

    if !args.no_errorcheck {
        if *expected_counter < 0 {
            *expected_counter = i64::from(counter_from_page(card_type, page[0]));
        }
        let counter = *expected_counter as u32;
        if let Err(mismatch) = check_page(card_type, pattern, counter, page) {
            errors.add(event, counter, &mismatch);
            if !args.no_resync {
                *expected_counter = i64::from(counter_from_page(card_type, page[0]));
            }
        }
        *expected_counter += 1;
    }

    if args.page_reset {
        let page: &mut [u32] =
            unsafe { std::slice::from_raw_parts_mut(address as *mut u32, words) };
        page.fill(PAGE_RESET_VALUE);
    }

    Ok(())
}

fn print_stats(elapsed: Duration, pages: u64, page_size: u64, no_errorcheck: bool, errors: u64) {
    let seconds = elapsed.as_secs_f64();
    let bytes = pages as f64 * page_size as f64;
    let gb = bytes / 1e9;
    println!();
    println!("  {:<10}  {:.3}", "Seconds", seconds);
    println!("  {:<10}  {}", "Pages", pages);
    if bytes > 0.0 {
        println!("  {:<10}  {}", "Bytes", bytes);
        println!("  {:<10}  {:.3}", "GB", gb);
        println!("  {:<10}  {:.3}", "GB/s", gb / seconds);
        println!("  {:<10}  {:.3}", "Gb/s", gb * 8.0 / seconds);
    }
    if no_errorcheck {
        println!("  {:<10}  n/a", "Errors");
    } else {
        println!("  {:<10}  {}", "Errors", errors);
    }
    println!();
}

fn ctp_emulator(args: &CtpEmulatorArgs) -> Result<()> {
    let trigger_mode: TriggerMode = args
        .trigger_mode
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let sim = SimCru::new();
    let mut bar2 = CruBar::new(sim.bar2());
    bar2.emulate_ctp(CtpInfo {
        bc_max: args.bcmax,
        hb_drop: args.hbdrop,
        hb_keep: args.hbkeep,
        hb_max: args.hbmax,
        trigger_mode,
        trigger_frequency: args.trigger_freq,
        generate_eox: args.eox,
        generate_single_trigger: args.single_trigger,
    })?;

    // Read the programmed block back through the same BAR.
    use rocard::cru::regs::bar2 as regs;
    let readback = sim.bar2();
    println!("CTP emulator programmed:");
    println!("  runmode    {:#x}", readback.read_register(regs::TTC_EMU_RUNMODE));
    println!("  bcmax      {}", readback.read_register(regs::TTC_EMU_BCMAX));
    println!("  hbmax      {}", readback.read_register(regs::TTC_EMU_HBMAX));
    println!("  hbkeep     {}", readback.read_register(regs::TTC_EMU_PRESCALER_KEEP));
    println!("  hbdrop     {}", readback.read_register(regs::TTC_EMU_PRESCALER_DROP));
    println!("  physdiv    {}", readback.read_register(regs::TTC_EMU_PHYSDIV));
    println!("  hcdiv      {}", readback.read_register(regs::TTC_EMU_HCDIV));
    println!("  caldiv     {}", readback.read_register(regs::TTC_EMU_CALDIV));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("10k").unwrap(), 10_000);
        assert_eq!(parse_size("2Mi").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert!(parse_size("12Q").is_err());
    }
}
