//! # Fanout Receiver Daemon
//!
//! Joins the multicast group, assembles incoming products into a
//! directory, and logs every product lifecycle event until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Receive into ./incoming from the default group
//! fanout-receiver --sender-host 10.0.0.2 --output-dir incoming
//!
//! # Simulate 5% packet loss to exercise the repair path
//! fanout-receiver --sender-host 10.0.0.2 --loss-per-mille 50
//!
//! # Load endpoint settings from a TOML file
//! fanout-receiver --config receiver.toml
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use fanout_transport::{BatchedNotifier, ProductEvent, Receiver, ReceiverConfig};

#[derive(Debug, Parser)]
#[command(name = "fanout-receiver", about = "Fanout multicast receiver daemon")]
struct Args {
    /// TOML file with a full receiver configuration; flags below are
    /// ignored when set.
    #[arg(long)]
    config: Option<PathBuf>,

    /// IPv4 multicast group address.
    #[arg(long, default_value = "239.0.0.1")]
    group: Ipv4Addr,

    /// Multicast UDP port.
    #[arg(long, default_value_t = 5001)]
    port: u16,

    /// Host of the sender's back-channel server.
    #[arg(long, default_value = "127.0.0.1")]
    sender_host: String,

    /// Port of the sender's back-channel server.
    #[arg(long, default_value_t = 5002)]
    sender_port: u16,

    /// Interface address for the IGMP join.
    #[arg(long, default_value = "0.0.0.0")]
    interface: Ipv4Addr,

    /// Directory products are written into.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Simulated DATA loss in per mille (testing aid).
    #[arg(long, default_value_t = 0)]
    loss_per_mille: u16,
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
        None => ReceiverConfig {
            multicast_addr: args.group,
            multicast_port: args.port,
            sender_host: args.sender_host.clone(),
            sender_port: args.sender_port,
            interface_ip: args.interface,
            simulated_loss_per_mille: args.loss_per_mille,
            receive_dir: args.output_dir.clone(),
            ..Default::default()
        },
    };

    std::fs::create_dir_all(&config.receive_dir)
        .with_context(|| format!("creating {}", config.receive_dir.display()))?;

    tracing::info!(
        group = %config.multicast_addr,
        port = config.multicast_port,
        sender = %format_args!("{}:{}", config.sender_host, config.sender_port),
        output = %config.receive_dir.display(),
        "fanout-receiver starting"
    );

    let notifier = BatchedNotifier::new();
    let events = notifier.events();
    let mut receiver = Receiver::start(config, Box::new(notifier))?;

    // ── Graceful shutdown ───────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    while running.load(Ordering::SeqCst) && receiver.is_running() {
        match events.remove_no_wait() {
            Some(ProductEvent::Begin(bop)) => {
                tracing::info!(
                    product_id = bop.product_id,
                    size = bop.size,
                    name = %bop.name,
                    "product starting"
                );
            }
            Some(ProductEvent::Complete(eop)) => {
                tracing::info!(
                    product_id = eop.product_id,
                    size = eop.size,
                    retx_packets = eop.retx_packets,
                    elapsed_ms = eop.elapsed.as_millis() as u64,
                    path = %eop.path.as_deref().unwrap_or_else(|| std::path::Path::new("-")).display(),
                    "product delivered"
                );
            }
            Some(ProductEvent::Missed(product_id)) => {
                tracing::warn!(product_id, "product missed");
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }

    tracing::info!("shutting down");
    receiver.stop();
    println!("{}", serde_json::to_string_pretty(&receiver.stats())?);
    Ok(())
}
