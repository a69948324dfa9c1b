//! # Integration tests: Sender ↔ Receiver over loopback multicast
//!
//! These tests run the full vertical stack — BOF/DATA/EOF multicast, gap
//! detection, back-channel repair, deadline handling — over real sockets
//! on 127.0.0.1. Every test uses its own multicast group and port so the
//! suite can run in parallel.

use bytes::Bytes;
use crossbeam_channel as channel;
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use std::net::Ipv4Addr;
use std::time::Duration;

use fanout_transport::{
    BopInfo, BopResponse, EopInfo, NotifierMode, ProductNotifier, ProductOutcome, Receiver,
    ReceiverConfig, Sender, SenderConfig,
};

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Helpers ────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Event {
    Bop(BopInfo),
    Eop(EopInfo),
    Missed(u32),
}

/// Notifier that streams every callback into a channel; products listed in
/// `ignore` are refused at BOF.
struct TestNotifier {
    tx: channel::Sender<Event>,
    ignore: Vec<u32>,
}

impl TestNotifier {
    fn new(ignore: Vec<u32>) -> (Self, channel::Receiver<Event>) {
        let (tx, rx) = channel::unbounded();
        (TestNotifier { tx, ignore }, rx)
    }
}

impl ProductNotifier for TestNotifier {
    fn on_bop(&mut self, bop: &BopInfo) -> BopResponse {
        let _ = self.tx.send(Event::Bop(bop.clone()));
        if self.ignore.contains(&bop.product_id) {
            BopResponse::Ignore
        } else {
            BopResponse::Default
        }
    }

    fn on_eop(&mut self, eop: EopInfo) {
        let _ = self.tx.send(Event::Eop(eop));
    }

    fn on_missed(&mut self, product_id: u32) {
        let _ = self.tx.send(Event::Missed(product_id));
    }
}

fn sender_config(group: Ipv4Addr, port: u16, rate_bps: f64, fraction: f64) -> SenderConfig {
    SenderConfig {
        multicast_addr: group,
        multicast_port: port,
        back_channel_port: 0,
        interface_ip: LOCALHOST,
        send_rate_bps: rate_bps,
        retx_deadline_fraction: fraction,
        ..Default::default()
    }
}

fn receiver_config(group: Ipv4Addr, port: u16, sender: &Sender) -> ReceiverConfig {
    ReceiverConfig {
        multicast_addr: group,
        multicast_port: port,
        sender_host: "127.0.0.1".into(),
        sender_port: sender.back_channel_addr().port(),
        interface_ip: LOCALHOST,
        ..Default::default()
    }
}

/// Block until the sender's acceptor has registered `n` connections, so a
/// following `send_*` snapshots the receiver into its unfinished set.
fn wait_for_receivers(sender: &Sender, n: usize) {
    let deadline = std::time::Instant::now() + EVENT_TIMEOUT;
    while sender.receiver_count() < n {
        assert!(
            std::time::Instant::now() < deadline,
            "receivers never connected"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_eop(rx: &channel::Receiver<Event>, product_id: u32) -> EopInfo {
    loop {
        match rx.recv_timeout(EVENT_TIMEOUT).expect("event before timeout") {
            Event::Eop(eop) if eop.product_id == product_id => return eop,
            Event::Missed(id) if id == product_id => panic!("product {id} missed"),
            _ => continue,
        }
    }
}

fn pseudorandom_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random::<u8>()).collect()
}

// ─── Lossless memory product ────────────────────────────────────────────────

#[test]
fn lossless_memory_product_is_byte_exact() {
    let group = Ipv4Addr::new(239, 89, 90, 1);
    let mut sender = Sender::new(sender_config(group, 47101, 100_000_000.0, 50.0)).unwrap();
    let completions = sender.completions();

    let (notifier, events) = TestNotifier::new(vec![]);
    let mut receiver = Receiver::start(receiver_config(group, 47101, &sender), Box::new(notifier))
        .unwrap();
    wait_for_receivers(&sender, 1);

    // [0, 1, ..., 255] repeated 4096 times: 1 MiB.
    let payload: Vec<u8> = (0..=255u8).cycle().take(1 << 20).collect();
    let expected = payload.clone();

    let product_id = sender.send_memory(Bytes::from(payload)).unwrap();

    let eop = wait_for_eop(&events, product_id);
    assert_eq!(eop.size, 1 << 20);
    let delivered = eop.data.expect("memory product carries its bytes");
    assert_eq!(delivered.len(), expected.len());
    assert_eq!(&delivered[..], &expected[..]);

    let done = completions.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(done.product_id, product_id);
    assert_eq!(done.outcome, ProductOutcome::Completed);

    let stats = receiver.stats();
    assert_eq!(stats.products_received, 1);
    assert!(stats.mcast_packets + stats.retx_packets >= 727); // ceil(1 MiB / 1444)

    receiver.stop();
    sender.stop();
}

// ─── Lossy file product ─────────────────────────────────────────────────────

#[test]
fn lossy_file_product_reconstructs_byte_exact() {
    let group = Ipv4Addr::new(239, 89, 90, 2);
    let mut sender = Sender::new(sender_config(group, 47102, 100_000_000.0, 50.0)).unwrap();

    let src_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("payload.bin");
    let contents = pseudorandom_bytes(0xC0FFEE, 2 << 20);
    std::fs::write(&src_path, &contents).unwrap();

    let (notifier, events) = TestNotifier::new(vec![]);
    let cfg = ReceiverConfig {
        simulated_loss_per_mille: 50,
        receive_dir: recv_dir.path().to_path_buf(),
        ..receiver_config(group, 47102, &sender)
    };
    let mut receiver = Receiver::start(cfg, Box::new(notifier)).unwrap();
    wait_for_receivers(&sender, 1);

    let product_id = sender.send_file(&src_path, 50.0).unwrap();

    let eop = wait_for_eop(&events, product_id);
    assert_eq!(eop.size as usize, contents.len());
    let out_path = eop.path.expect("file product carries its path");
    assert_eq!(out_path, recv_dir.path().join("payload.bin"));
    assert_eq!(std::fs::read(&out_path).unwrap(), contents);

    // 50 per mille over ~1454 packets makes a lossless run vanishingly
    // unlikely; the repair path must have carried real traffic.
    let stats = receiver.stats();
    assert!(stats.simulated_drops > 0);
    assert!(stats.retx_bytes > 0);
    assert_eq!(stats.products_received, 1);
    assert_eq!(stats.products_failed, 0);

    receiver.stop();
    sender.stop();
}

// ─── Deadline expiry ────────────────────────────────────────────────────────

#[test]
fn deadline_expiry_is_signalled_as_missed() {
    let group = Ipv4Addr::new(239, 89, 90, 3);
    // Fraction 0 forces the minimum retransmission window; 256 KiB at
    // 20 Mbps multicasts for ~100 ms, so the window is already shut when
    // the first post-EOF repair request lands.
    let mut sender = Sender::new(sender_config(group, 47103, 20_000_000.0, 0.0)).unwrap();
    let completions = sender.completions();

    let (notifier, events) = TestNotifier::new(vec![]);
    let cfg = ReceiverConfig {
        // Drop every DATA packet: the product can only be repaired, and
        // repair is exactly what the deadline forbids.
        simulated_loss_per_mille: 1000,
        ..receiver_config(group, 47103, &sender)
    };
    let mut receiver = Receiver::start(cfg, Box::new(notifier)).unwrap();
    wait_for_receivers(&sender, 1);

    let product_id = sender.send_memory(Bytes::from(vec![0x5A; 256 << 10])).unwrap();

    loop {
        match events.recv_timeout(EVENT_TIMEOUT).expect("event before timeout") {
            Event::Missed(id) => {
                assert_eq!(id, product_id);
                break;
            }
            Event::Eop(eop) => panic!("product {} should not complete", eop.product_id),
            Event::Bop(_) => continue,
        }
    }

    let done = completions.recv_timeout(EVENT_TIMEOUT).unwrap();
    assert_eq!(done.product_id, product_id);
    assert_eq!(done.outcome, ProductOutcome::Expired);

    let stats = receiver.stats();
    assert_eq!(stats.products_failed, 1);
    assert_eq!(stats.products_received, 0);

    receiver.stop();
    sender.stop();
}

// ─── Ignore at BOF ──────────────────────────────────────────────────────────

#[test]
fn ignored_product_is_discarded_without_notification() {
    let group = Ipv4Addr::new(239, 89, 90, 4);
    let mut sender = Sender::new(sender_config(group, 47104, 100_000_000.0, 50.0)).unwrap();
    let completions = sender.completions();

    let first = sender.next_product_id();
    let (notifier, events) = TestNotifier::new(vec![first]);
    let cfg = ReceiverConfig {
        notifier_mode: NotifierMode::PerProduct,
        ..receiver_config(group, 47104, &sender)
    };
    let mut receiver = Receiver::start(cfg, Box::new(notifier)).unwrap();
    wait_for_receivers(&sender, 1);

    let ignored = sender.send_memory(Bytes::from(vec![1u8; 64 << 10])).unwrap();
    assert_eq!(ignored, first);
    let wanted = sender.send_memory(Bytes::from(vec![2u8; 64 << 10])).unwrap();

    // The wanted product completes normally.
    let eop = wait_for_eop(&events, wanted);
    assert_eq!(eop.data.unwrap(), Bytes::from(vec![2u8; 64 << 10]));

    // Both products finish on the sender: the ignored one still gets its
    // RETRANS_END from the receiver.
    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let done = completions.recv_timeout(EVENT_TIMEOUT).unwrap();
        outcomes.push((done.product_id, done.outcome));
    }
    assert!(outcomes.contains(&(ignored, ProductOutcome::Completed)));
    assert!(outcomes.contains(&(wanted, ProductOutcome::Completed)));

    // No EOP and no missed ever surfaced for the ignored product.
    while let Ok(event) = events.try_recv() {
        match event {
            Event::Eop(eop) => assert_ne!(eop.product_id, ignored),
            Event::Missed(id) => assert_ne!(id, ignored),
            Event::Bop(_) => {}
        }
    }
    assert_eq!(receiver.stats().products_started, 1);

    receiver.stop();
    sender.stop();
}

// ─── Ordering across products ───────────────────────────────────────────────

#[test]
fn bops_arrive_in_product_order_and_all_terminate() {
    let group = Ipv4Addr::new(239, 89, 90, 5);
    let mut sender = Sender::new(sender_config(group, 47105, 100_000_000.0, 50.0)).unwrap();

    let (notifier, events) = TestNotifier::new(vec![]);
    let mut receiver = Receiver::start(receiver_config(group, 47105, &sender), Box::new(notifier))
        .unwrap();
    wait_for_receivers(&sender, 1);

    let mut sent = Vec::new();
    for i in 0..5u8 {
        let payload = Bytes::from(vec![i; 100_000]);
        sent.push(sender.send_memory(payload).unwrap());
    }

    let mut bops = Vec::new();
    let mut eops = Vec::new();
    while eops.len() < sent.len() {
        match events.recv_timeout(EVENT_TIMEOUT).expect("event before timeout") {
            Event::Bop(bop) => bops.push(bop.product_id),
            Event::Eop(eop) => eops.push(eop.product_id),
            Event::Missed(id) => panic!("product {id} missed"),
        }
    }

    // BOFs are observed in product-id order even though completions may
    // interleave.
    assert_eq!(bops, sent);
    let mut eops_sorted = eops.clone();
    eops_sorted.sort_unstable();
    assert_eq!(eops_sorted, sent);

    receiver.stop();
    sender.stop();
}

// ─── Back-channel reconnect ─────────────────────────────────────────────────

#[test]
fn receiver_reconnects_after_back_channel_drop() {
    let group = Ipv4Addr::new(239, 89, 90, 6);
    let mut sender = Sender::new(sender_config(group, 47106, 100_000_000.0, 50.0)).unwrap();

    let (notifier, events) = TestNotifier::new(vec![]);
    let mut receiver = Receiver::start(receiver_config(group, 47106, &sender), Box::new(notifier))
        .unwrap();
    wait_for_receivers(&sender, 1);

    let first = sender.send_memory(Bytes::from(vec![7u8; 64 << 10])).unwrap();
    wait_for_eop(&events, first);

    // Kill every back-channel connection; the receiver's reconnect loop
    // re-establishes against the still-running acceptor.
    sender.disconnect_receivers();
    std::thread::sleep(Duration::from_millis(600));
    assert!(receiver.is_running());

    let second = sender.send_memory(Bytes::from(vec![8u8; 64 << 10])).unwrap();
    let eop = wait_for_eop(&events, second);
    assert_eq!(eop.data.unwrap(), Bytes::from(vec![8u8; 64 << 10]));

    receiver.stop();
    sender.stop();
}
