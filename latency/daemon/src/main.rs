//! txrx-latency - timestamped test-frame sender and receiver
//!
//! Paces Ethernet test frames onto a link at wall-clock aligned intervals
//! and measures their path on the receiving host.
//!
//! ## Usage
//!
//! ```bash
//! # Send 10000 frames, one per millisecond, with a histogram of send jitter
//! sudo ./txrx-latency tx eth0 --interval-usec 1000 --count 10000 --histogram
//!
//! # Receive and print one JSON record per frame
//! sudo ./txrx-latency rx eth1
//!
//! # Receive quietly, publishing measurements to socket clients
//! sudo ./txrx-latency rx eth1 -q --socket /tmp/rx_result.socket
//!
//! # Change the frame size of a running sender
//! printf 'size=256' | nc -U /tmp/tx_cmd_msg.socket
//!
//! # Dump the sender histogram
//! kill -USR1 $(pidof txrx-latency)
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, thread, time::Duration};
use tokio::{
    signal,
    signal::unix::{signal as unix_signal, SignalKind},
    task::JoinHandle,
};
use txrx_common::{
    parse_mac, DEFAULT_INTERVAL_USEC, HISTOGRAM_VALUES_MAX, MAX_FRAME_SIZE, MIN_FRAME_SIZE,
};
use txrx_latency::{
    control, hwts, rt, socket::format_mac, status, ExporterType, JsonExporter, PacerSettings,
    PacketSocket, PacingLoop, PrometheusExporter, ReceiveLoop, ReceiveSummary, ReceiverSettings,
    RecordExporter, ResultRecord, SharedConfig, StatisticsReport, StatusPublisher, Tee,
};

/// Receive timeout so the receiver notices shutdown while the link is idle
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Precision packet pacing and latency measurement
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transmit timestamped test frames
    Tx(TxArgs),
    /// Receive test frames and report measurements
    Rx(RxArgs),
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Also write records (json) or final statistics (prometheus) to this file
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Output format for the file given with --output
    #[clap(short, long, value_enum, default_value = "json")]
    format: ExporterType,

    /// Histogram ceiling in microseconds (default 1000 when given without value)
    #[clap(long, num_args = 0..=1, default_missing_value = "1000")]
    histogram: Option<usize>,
}

#[derive(Args, Debug)]
struct TxArgs {
    /// Network device to send on
    device: String,

    /// Destination MAC address
    #[clap(short, long, default_value = "ff:ff:ff:ff:ff:ff")]
    destination: String,

    /// Interval between frames in microseconds
    #[clap(short, long, default_value_t = DEFAULT_INTERVAL_USEC)]
    interval_usec: u32,

    /// Send offset after each interval boundary in microseconds
    #[clap(long, default_value_t = 0)]
    offset_usec: u16,

    /// Number of frames to send (0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    count: u32,

    /// Frame size in bytes
    #[clap(short, long, default_value_t = MIN_FRAME_SIZE)]
    size: usize,

    /// Stream identifier
    #[clap(long, default_value_t = 0)]
    stream_id: u8,

    /// Carry only the interval-start timestamp
    #[clap(long)]
    small: bool,

    /// SCHED_FIFO priority of the pacing thread
    #[clap(long, default_value_t = 99)]
    prio: i32,

    /// Socket priority (SO_PRIORITY) for outgoing frames
    #[clap(long)]
    queue_prio: Option<i32>,

    /// Do not lock memory
    #[clap(long)]
    no_memlock: bool,

    /// Control socket path
    #[clap(long, default_value = "/tmp/tx_cmd_msg.socket")]
    control_socket: PathBuf,

    #[clap(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct RxArgs {
    /// Network device to receive on
    device: String,

    /// Number of frames to receive (0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    count: u32,

    /// Ethertype to capture (0x0808 test frames, 0x3 all)
    #[clap(short, long, default_value = "0x0808", value_parser = parse_ethertype)]
    ethertype: u16,

    /// Hardware receive filter (HWTSTAMP_FILTER_*)
    #[clap(long, default_value = "HWTSTAMP_FILTER_ALL")]
    rx_filter: String,

    /// SCHED_FIFO priority of the receive thread
    #[clap(long)]
    prio: Option<i32>,

    /// Suppress per-frame records on stdout
    #[clap(short, long)]
    quiet: bool,

    /// Also publish measurements to clients of this Unix-domain socket
    #[clap(long)]
    socket: Option<PathBuf>,

    #[clap(flatten)]
    output: OutputArgs,
}

fn parse_ethertype(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid ethertype '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.command {
        Command::Tx(args) => args.output.verbose,
        Command::Rx(args) => args.output.verbose,
    };

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    match cli.command {
        Command::Tx(args) => run_tx(args).await,
        Command::Rx(args) => run_rx(args).await,
    }
}

async fn run_tx(args: TxArgs) -> Result<()> {
    if args.interval_usec == 0 {
        anyhow::bail!("Interval must be >= 1 us");
    }
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&args.size) {
        anyhow::bail!(
            "Unsupported frame size {} (must be {}..={})",
            args.size,
            MIN_FRAME_SIZE,
            MAX_FRAME_SIZE
        );
    }
    let destination = parse_mac(&args.destination)
        .with_context(|| format!("Invalid destination MAC: {}", args.destination))?;
    let prometheus = prometheus_exporter(&args.output, "tx")?;

    info!("Starting transmitter...");
    info!("   Device: {}", args.device);
    info!("   Destination: {}", format_mac(&destination));
    info!("   Interval: {} us (offset {} us)", args.interval_usec, args.offset_usec);
    info!("   Frame size: {} bytes{}", args.size, if args.small { " (small)" } else { "" });
    info!(
        "   Count: {}",
        if args.count == 0 {
            "infinite".to_string()
        } else {
            args.count.to_string()
        }
    );

    let socket = PacketSocket::open(&args.device, 0)?;
    if let Err(e) = socket.configure_hardware_timestamping(hwts::HWTSTAMP_FILTER_ALL) {
        warn!("{:#}; transmit stamps will be software only", e);
    }
    socket.enable_kernel_timestamping()?;
    if let Some(prio) = args.queue_prio {
        socket.set_priority(prio)?;
    }

    let config = Arc::new(SharedConfig::new(args.interval_usec, args.size));
    let listener = control::bind(&args.control_socket)?;
    let control_task = tokio::spawn(control::serve(listener, Arc::clone(&config)));
    let signal_task = spawn_signal_handler(Arc::clone(&config))?;

    let histogram = args.output.histogram.map(|n| n.min(HISTOGRAM_VALUES_MAX));
    let settings = PacerSettings {
        destination,
        stream_id: args.stream_id,
        offset_usec: args.offset_usec,
        count: (args.count > 0).then_some(args.count),
        small: args.small,
        verbose: args.output.verbose,
        histogram_usec: histogram.unwrap_or(0),
    };
    let mut exporter = json_exporter(&args.output, false)?;

    let prio = args.prio;
    let memlock = !args.no_memlock;
    let thread_config = Arc::clone(&config);
    let handle = thread::Builder::new()
        .name("pacer".to_string())
        .spawn(move || -> Result<(StatisticsReport, u32)> {
            rt::set_fifo_priority(prio);
            let _lock = memlock.then(rt::MemoryLock::acquire);
            let _latency = rt::LatencyTarget::acquire();

            let mut pacer = PacingLoop::new(socket, thread_config, settings);
            let report = pacer.run(&mut exporter)?;
            if histogram.is_some() {
                exporter.export(&ResultRecord::Histogram(report.clone()))?;
                exporter.flush()?;
            }
            Ok((report, pacer.sent()))
        })
        .context("Failed to spawn pacing thread")?;

    let (report, sent) = join_worker(handle).await?;

    config.request_shutdown();
    control_task.abort();
    signal_task.abort();
    std::fs::remove_file(&args.control_socket).ok();

    if let Some(prometheus) = prometheus {
        prometheus.export_statistics(&report)?;
        info!("Statistics written to {:?}", args.output.output);
    }

    print_tx_summary(&report, sent);
    Ok(())
}

async fn run_rx(args: RxArgs) -> Result<()> {
    let rx_filter = hwts::rx_filter_by_name(&args.rx_filter).with_context(|| {
        let names: Vec<&str> = hwts::RX_FILTERS.iter().map(|(name, _)| *name).collect();
        format!(
            "Unknown rx filter {}; valid filters are: {}",
            args.rx_filter,
            names.join(", ")
        )
    })?;
    let prometheus = prometheus_exporter(&args.output, "rx")?;

    info!("Starting receiver...");
    info!("   Device: {}", args.device);
    info!("   Ethertype: 0x{:04x}", args.ethertype);
    info!("   RX filter: {}", args.rx_filter);
    if let Some(path) = &args.socket {
        info!("   Status socket: {:?}", path);
    }

    let socket = PacketSocket::open(&args.device, args.ethertype)?;
    socket.configure_hardware_timestamping(rx_filter)?;
    socket.enable_kernel_timestamping()?;
    socket.set_recv_timeout(RECV_TIMEOUT)?;

    let config = Arc::new(SharedConfig::new(DEFAULT_INTERVAL_USEC, MIN_FRAME_SIZE));
    let signal_task = spawn_signal_handler(Arc::clone(&config))?;

    let histogram = args.output.histogram.map(|n| n.min(HISTOGRAM_VALUES_MAX));
    let settings = ReceiverSettings {
        count: (args.count > 0).then_some(args.count),
        filter_destination: true,
        histogram_usec: histogram.unwrap_or(0),
    };
    let (status_task, publisher) = match &args.socket {
        Some(path) => {
            let listener = status::bind(path)?;
            let publisher = StatusPublisher::new();
            let task = tokio::spawn(status::serve(listener, publisher.clone()));
            (Some(task), Some(publisher))
        }
        None => (None, None),
    };
    let mut exporter = Tee(json_exporter(&args.output, args.quiet)?, publisher);

    let prio = args.prio;
    let thread_config = Arc::clone(&config);
    let handle = thread::Builder::new()
        .name("receiver".to_string())
        .spawn(move || -> Result<ReceiveSummary> {
            if let Some(prio) = prio {
                rt::set_fifo_priority(prio);
            }

            let mut receiver = ReceiveLoop::new(socket, thread_config, settings);
            let summary = receiver.run(&mut exporter)?;
            if histogram.is_some() {
                exporter.export(&ResultRecord::Histogram(summary.statistics.clone()))?;
                exporter.flush()?;
            }
            Ok(summary)
        })
        .context("Failed to spawn receive thread")?;

    let summary = join_worker(handle).await?;

    config.request_shutdown();
    signal_task.abort();
    if let Some(task) = status_task {
        task.abort();
    }
    if let Some(path) = &args.socket {
        std::fs::remove_file(path).ok();
    }

    if let Some(prometheus) = prometheus {
        prometheus.export_statistics(&summary.statistics)?;
        info!("Statistics written to {:?}", args.output.output);
    }

    print_rx_summary(&summary);
    Ok(())
}

fn json_exporter(output: &OutputArgs, quiet: bool) -> Result<JsonExporter> {
    let file = match output.format {
        ExporterType::Json => output.output.clone(),
        ExporterType::Prometheus => None,
    };
    JsonExporter::new(file, quiet)
}

fn prometheus_exporter(output: &OutputArgs, direction: &'static str) -> Result<Option<PrometheusExporter>> {
    match (output.format, &output.output) {
        (ExporterType::Prometheus, Some(path)) => Ok(Some(PrometheusExporter::new(path.clone(), direction))),
        (ExporterType::Prometheus, None) => anyhow::bail!("--format prometheus requires --output"),
        (ExporterType::Json, _) => Ok(None),
    }
}

/// Wait for a loop thread without blocking the runtime
async fn join_worker<T: Send + 'static>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .context("Failed to join worker")?
        .map_err(|_| anyhow::anyhow!("Worker thread panicked"))?
}

/// SIGINT/SIGTERM request shutdown; SIGUSR1 requests a histogram dump
fn spawn_signal_handler(config: Arc<SharedConfig>) -> Result<JoinHandle<()>> {
    let mut terminate = unix_signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut user1 = unix_signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Interrupted, shutting down...");
                    config.request_shutdown();
                    break;
                }
                _ = terminate.recv() => {
                    info!("Terminated, shutting down...");
                    config.request_shutdown();
                    break;
                }
                _ = user1.recv() => {
                    config.request_dump();
                }
            }
        }
    }))
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        txrx-latency - Precision Packet            ║
║          Pacing and Latency Measurement           ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_statistics(stats: &StatisticsReport) {
    info!("  Samples:            {}", stats.count);
    info!("  Outliers:           {}", stats.outliers);
    info!("  Deviation (us):     min {} / max {}", stats.min, stats.max);
    info!("  Jitter RMS (ns):    {:>10}", stats.rms_nsec);
    info!("  Jitter max (ns):    {:>10}", stats.max_nsec);
}

fn print_tx_summary(stats: &StatisticsReport, sent: u32) {
    info!("");
    info!("============================================");
    info!("             Transmit Summary");
    info!("============================================");
    info!("");
    info!("  Frames sent:        {}", sent);
    print_statistics(stats);
    info!("");
    info!("============================================");
}

fn print_rx_summary(summary: &ReceiveSummary) {
    info!("");
    info!("============================================");
    info!("             Receive Summary");
    info!("============================================");
    info!("");
    info!("  Frames received:    {}", summary.frames);
    info!("  Measurements:       {}", summary.measurements);
    info!("  Active streams:     {}", summary.active_streams);
    info!("  Sequence errors:    {}", summary.sequence_errors);
    info!("  Dropped frames:     {}", summary.dropped);
    info!("  Ignored frames:     {}", summary.ignored);
    print_statistics(&summary.statistics);
    info!("");
    info!("============================================");
}
