//! # Fanout Sender Daemon
//!
//! Multicasts the files named on the command line as Fanout products and
//! serves retransmission until every receiver is done (or deadlines
//! expire), then prints a stats summary and exits.
//!
//! ## Usage
//!
//! ```bash
//! # Send two files at 100 Mbps to the default group
//! fanout-sender --rate-bps 100000000 data/a.grib2 data/b.grib2
//!
//! # Wait for three receivers to connect before sending
//! fanout-sender --wait-receivers 3 data/*.bin
//!
//! # Load endpoint settings from a TOML file
//! fanout-sender --config sender.toml data/a.bin
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use fanout_transport::{ProductOutcome, Sender, SenderConfig};

#[derive(Debug, Parser)]
#[command(name = "fanout-sender", about = "Fanout multicast sender daemon")]
struct Args {
    /// TOML file with a full sender configuration; flags below are
    /// ignored when set (except --wait-receivers and --deadline-fraction).
    #[arg(long)]
    config: Option<PathBuf>,

    /// IPv4 multicast group address.
    #[arg(long, default_value = "239.0.0.1")]
    group: Ipv4Addr,

    /// Multicast UDP port.
    #[arg(long, default_value_t = 5001)]
    port: u16,

    /// TCP back-channel port (0 picks an ephemeral port).
    #[arg(long, default_value_t = 5002)]
    back_channel_port: u16,

    /// Interface address to multicast from.
    #[arg(long, default_value = "0.0.0.0")]
    interface: Ipv4Addr,

    /// Shaped multicast rate in bits per second.
    #[arg(long, default_value_t = 100_000_000.0)]
    rate_bps: f64,

    /// Retransmission-deadline fraction per product (0 = minimum window).
    #[arg(long, default_value_t = 0.5)]
    deadline_fraction: f64,

    /// Multicast TTL.
    #[arg(long, default_value_t = 1)]
    ttl: u8,

    /// Block until this many receivers have connected before sending.
    #[arg(long, default_value_t = 0)]
    wait_receivers: usize,

    /// Files to send, in order.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SenderConfig {
            multicast_addr: args.group,
            multicast_port: args.port,
            back_channel_port: args.back_channel_port,
            interface_ip: args.interface,
            send_rate_bps: args.rate_bps,
            retx_deadline_fraction: args.deadline_fraction,
            ttl: args.ttl,
            ..Default::default()
        },
    };

    tracing::info!(
        group = %config.multicast_addr,
        port = config.multicast_port,
        rate_bps = config.send_rate_bps,
        files = args.files.len(),
        "fanout-sender starting"
    );

    let mut sender = Sender::new(config)?;
    let completions = sender.completions();
    tracing::info!(back_channel = %sender.back_channel_addr(), "back-channel listening");

    if args.wait_receivers > 0 {
        tracing::info!(want = args.wait_receivers, "waiting for receivers");
        while sender.receiver_count() < args.wait_receivers {
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    let mut outstanding = 0usize;
    for path in &args.files {
        let start = Instant::now();
        let product_id = sender
            .send_file(path, args.deadline_fraction)
            .with_context(|| format!("sending {}", path.display()))?;
        tracing::info!(
            product_id,
            file = %path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "product multicast"
        );
        outstanding += 1;
    }

    // Products complete as receivers acknowledge repair or deadlines pass;
    // the periodic sweep catches receivers that never ask for anything.
    while outstanding > 0 {
        match completions.recv_timeout(Duration::from_millis(500)) {
            Ok(done) => {
                match done.outcome {
                    ProductOutcome::Completed => {
                        tracing::info!(product_id = done.product_id, "product completed")
                    }
                    ProductOutcome::Expired => {
                        tracing::warn!(product_id = done.product_id, "product expired")
                    }
                }
                outstanding -= 1;
            }
            Err(_) => sender.sweep_expired(),
        }
    }

    let stats = sender.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    sender.stop();
    Ok(())
}
