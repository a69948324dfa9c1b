//! # Sender Core
//!
//! The multicast engine and its retransmission service. `send_memory` /
//! `send_file` run on the caller's thread: they announce the product
//! (BOF), stream DATA packets through the rate shaper, and close with an
//! EOF. Repair runs on per-connection worker threads: a TCP acceptor
//! hands each receiver connection to a dedicated worker that serves
//! RETRANS_REQ ranges, paced by the same shaper, until the receiver
//! signals RETRANS_END or the product's deadline closes the window.
//!
//! ## Threads
//!
//! - caller thread: `send_*`, BOF → DATA → EOF emission
//! - acceptor thread: accepts back-channel connections forever
//! - one retransmission worker per connection, owning that connection
//!
//! Product metadata is released when every connection in the product's
//! unfinished set has signalled RETRANS_END, or when the deadline has
//! elapsed — whichever comes first. Either way the application hears
//! about it exactly once on the completion channel.

use bytes::{Bytes, BytesMut};
use crossbeam_channel as channel;
use quanta::Instant;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SenderConfig;
use crate::error::{Result, TransportError};
use crate::net::{self, McastChannel};
use crate::pacing::RateShaper;
use crate::stats::SenderStats;
use crate::store::{ProductBacking, ProductMeta, ProductStore};
use crate::wire::{flags, Announcement, AnnounceKind, PacketHeader, RetransRequest, HEADER_LEN};

/// Floor for the retransmission window. A deadline fraction of zero means
/// the window is exactly this long.
pub const MIN_RETX_TIMEOUT: Duration = Duration::from_millis(10);

/// Per-packet link overhead charged against the rate shaper:
/// 14 Ethernet + 20 IPv4 + 8 UDP.
const LINK_OVERHEAD_LEN: usize = 42;

/// File products are streamed through a bounded read window of this many
/// packets' worth of bytes, so arbitrarily large files never sit in memory.
const FILE_WINDOW_CHUNKS: usize = 4096;

/// How the sender finished with a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductOutcome {
    /// Every live back-channel connection acknowledged repair completion.
    Completed,
    /// The retransmission deadline elapsed first.
    Expired,
}

/// Completion event: the product's backing bytes may be reclaimed.
#[derive(Debug, Clone, Copy)]
pub struct ProductDone {
    pub product_id: u32,
    pub outcome: ProductOutcome,
}

// ─── Connection Registry ────────────────────────────────────────────────────

/// One accepted back-channel connection. The owning worker reads from its
/// private clone of the stream; every writer goes through the mutex, so a
/// deadline sweep can interleave control frames with worker traffic.
struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl Connection {
    fn send_frame(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        net::write_frame(&mut stream, header, body)
    }

    fn shutdown(&self) {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[derive(Default)]
struct Connections {
    inner: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl Connections {
    fn register(&self, stream: TcpStream, peer: SocketAddr) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection {
            id,
            peer,
            stream: Mutex::new(stream),
        });
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(id, conn.clone());
        conn
    }

    fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&id);
    }

    fn get(&self, id: u64) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(&id).cloned()
    }

    fn ids(&self) -> HashSet<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.keys().copied().collect()
    }

    fn all(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values().cloned().collect()
    }

    fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    fn shutdown_all(&self) {
        for conn in self.all() {
            conn.shutdown();
        }
    }
}

// ─── Sender ─────────────────────────────────────────────────────────────────

/// The multicast sender endpoint.
pub struct Sender {
    cfg: SenderConfig,
    mcast: McastChannel,
    shaper: Arc<RateShaper>,
    store: Arc<ProductStore>,
    conns: Arc<Connections>,
    next_product_id: AtomicU32,
    started_at: Instant,
    stats: Arc<Mutex<SenderStats>>,
    done_tx: channel::Sender<ProductDone>,
    done_rx: channel::Receiver<ProductDone>,
    running: Arc<AtomicBool>,
    back_channel_addr: SocketAddr,
    acceptor: Option<thread::JoinHandle<()>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl Sender {
    /// Validate the config, open the multicast socket, bind the
    /// back-channel server and start accepting receivers.
    pub fn new(cfg: SenderConfig) -> Result<Self> {
        cfg.validate()?;

        let mcast = McastChannel::sender(
            cfg.multicast_addr,
            cfg.multicast_port,
            cfg.interface_ip,
            cfg.ttl,
        )
        .map_err(TransportError::from_socket)?;

        let listener = TcpListener::bind((cfg.interface_ip, cfg.back_channel_port))
            .map_err(TransportError::from_socket)?;
        let back_channel_addr = listener.local_addr().map_err(TransportError::from_socket)?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::from_socket)?;

        let shaper = Arc::new(RateShaper::new(cfg.send_rate_bps));
        let store = Arc::new(ProductStore::new());
        let conns = Arc::new(Connections::default());
        let stats = Arc::new(Mutex::new(SenderStats::default()));
        let (done_tx, done_rx) = channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let workers = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let ctx = WorkerCtx {
                conns: conns.clone(),
                store: store.clone(),
                shaper: shaper.clone(),
                stats: stats.clone(),
                done_tx: done_tx.clone(),
                running: running.clone(),
                max_data_len: cfg.max_data_len(),
            };
            let workers = workers.clone();
            thread::Builder::new()
                .name("fanout-accept".into())
                .spawn(move || run_acceptor(listener, ctx, workers))
                .map_err(TransportError::from_socket)?
        };

        info!(
            group = %cfg.multicast_addr,
            port = cfg.multicast_port,
            back_channel = %back_channel_addr,
            rate_bps = cfg.send_rate_bps,
            "sender started"
        );

        Ok(Sender {
            next_product_id: AtomicU32::new(cfg.initial_product_id),
            cfg,
            mcast,
            shaper,
            store,
            conns,
            started_at: Instant::now(),
            stats,
            done_tx,
            done_rx,
            running,
            back_channel_addr,
            acceptor: Some(acceptor),
            workers,
        })
    }

    /// Actual back-channel address (resolves an ephemeral port request).
    pub fn back_channel_addr(&self) -> SocketAddr {
        self.back_channel_addr
    }

    /// Number of currently connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.conns.len()
    }

    /// Product index the next `send_*` call will use.
    pub fn next_product_id(&self) -> u32 {
        self.next_product_id.load(Ordering::Relaxed)
    }

    /// Completion events; one per product, after which its backing bytes
    /// may be reclaimed.
    pub fn completions(&self) -> channel::Receiver<ProductDone> {
        self.done_rx.clone()
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> SenderStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Adjust the shaped multicast rate on the fly.
    pub fn set_send_rate(&self, rate_bps: f64) {
        self.shaper.set_rate(rate_bps);
    }

    /// Multicast an in-memory product. Returns its product index once it
    /// has been fully multicast (repair acknowledgement comes later via
    /// the completion channel).
    pub fn send_memory(&self, data: Bytes) -> Result<u32> {
        self.sweep_expired();
        let size = length_as_u32(data.len() as u64)?;
        let product_id = self.next_product_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.begin_product(
            product_id,
            size,
            String::new(),
            ProductBacking::Memory(data.clone()),
        );

        self.emit_bof(product_id, AnnounceKind::MemoryTransferStart, size, "")?;
        let start = Instant::now();
        let packets = self.stream_slice(product_id, 0, &data)?;
        self.emit_eof(product_id)?;
        self.finish_multicast(product_id, size, packets, start, self.cfg.retx_deadline_fraction);

        if snapshot.is_empty() {
            self.release_product(product_id, ProductOutcome::Completed);
        }
        Ok(product_id)
    }

    /// Multicast a file product. `deadline_fraction` scales the
    /// retransmission window relative to the multicast duration; zero
    /// means the minimum window.
    pub fn send_file(&self, path: &Path, deadline_fraction: f64) -> Result<u32> {
        self.sweep_expired();
        let meta = std::fs::metadata(path).map_err(TransportError::BackingIoFatal)?;
        let size = length_as_u32(meta.len())?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let product_id = self.next_product_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.begin_product(
            product_id,
            size,
            name.clone(),
            ProductBacking::File(path.to_path_buf()),
        );

        self.emit_bof(product_id, AnnounceKind::FileTransferStart, size, &name)?;
        let start = Instant::now();

        let file = File::open(path).map_err(TransportError::BackingIoFatal)?;
        let window_len = FILE_WINDOW_CHUNKS * self.cfg.max_data_len();
        let mut window = vec![0u8; window_len];
        let mut offset = 0u32;
        let mut packets = 0u64;
        while (offset as u64) < meta.len() {
            let want = ((meta.len() - offset as u64) as usize).min(window_len);
            file.read_exact_at(&mut window[..want], offset as u64)
                .map_err(TransportError::BackingIoFatal)?;
            packets += self.stream_slice(product_id, offset, &window[..want])?;
            offset += want as u32;
        }

        self.emit_eof(product_id)?;
        self.finish_multicast(product_id, size, packets, start, deadline_fraction);

        if snapshot.is_empty() {
            self.release_product(product_id, ProductOutcome::Completed);
        }
        Ok(product_id)
    }

    /// Release every product whose deadline has elapsed, telling the
    /// receivers that never finished to give up on it.
    pub fn sweep_expired(&self) {
        for (product_id, remaining) in self.store.expired_products() {
            for conn_id in remaining {
                if let Some(conn) = self.conns.get(conn_id) {
                    let header = PacketHeader::control(product_id, flags::RETRANS_TIMEOUT);
                    if let Err(e) = conn.send_frame(&header, &[]) {
                        debug!(conn = conn_id, product_id, error = %e, "timeout notify failed");
                    }
                }
            }
            self.release_product(product_id, ProductOutcome::Expired);
        }
    }

    // ── operator commands ───────────────────────────────────────────────

    /// Ask every receiver to reset its history statistics.
    pub fn broadcast_reset_stats(&self) {
        self.send_command_all(AnnounceKind::ResetStats, "");
    }

    /// Ask every receiver to report its history statistics; the reports
    /// arrive on the back-channel and are logged by the workers.
    pub fn collect_receiver_stats(&self) {
        self.send_command_all(AnnounceKind::CollectStats, "");
    }

    /// Set the simulated loss rate (per mille) on every receiver.
    pub fn set_receiver_loss_rate(&self, per_mille: u16) {
        self.send_command_all(AnnounceKind::SetLossRate, &per_mille.to_string());
    }

    /// Forward an operator command string to every receiver.
    pub fn execute_on_receivers(&self, command: &str) {
        self.send_command_all(AnnounceKind::ExecuteCommand, command);
    }

    /// Drop every back-channel connection. Receivers reconnect on their
    /// own; products they were holding up complete immediately.
    pub fn disconnect_receivers(&self) {
        self.conns.shutdown_all();
    }

    /// Stop accepting, drop every connection and join all threads.
    /// Idempotent; also runs on drop.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.sweep_expired();
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        self.conns.shutdown_all();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        info!("sender stopped");
    }

    // ── internals ───────────────────────────────────────────────────────

    /// Allocate metadata with the current connection set snapshot and an
    /// open-ended deadline (fixed up once multicast completes).
    fn begin_product(
        &self,
        product_id: u32,
        size: u32,
        name: String,
        backing: ProductBacking,
    ) -> HashSet<u64> {
        let snapshot = self.conns.ids();
        self.store.insert(ProductMeta {
            product_id,
            size,
            name,
            backing,
            mcast_start: Instant::now(),
            deadline: Duration::MAX,
            unfinished: snapshot.clone(),
            stats: Default::default(),
        });
        debug!(product_id, size, receivers = snapshot.len(), "product announced");
        snapshot
    }

    fn emit_bof(&self, product_id: u32, kind: AnnounceKind, size: u32, name: &str) -> Result<()> {
        let body = Announcement::new(
            kind,
            product_id,
            size,
            name,
            self.started_at.elapsed().as_secs_f64(),
        )
        .to_bytes();
        let packet = crate::wire::build_packet(&PacketHeader::bof(product_id), &body);
        self.mcast
            .send_packet(&packet)
            .map_err(TransportError::from_socket)?;
        Ok(())
    }

    fn emit_eof(&self, product_id: u32) -> Result<()> {
        let packet = PacketHeader::eof(product_id).to_bytes();
        self.mcast
            .send_packet(&packet)
            .map_err(TransportError::from_socket)?;
        Ok(())
    }

    /// Multicast `data` as DATA packets whose sequence numbers start at
    /// byte offset `base`. Returns the packet count.
    fn stream_slice(&self, product_id: u32, base: u32, data: &[u8]) -> Result<u64> {
        let max_data_len = self.cfg.max_data_len();
        let mut frame = BytesMut::with_capacity(HEADER_LEN + max_data_len);
        let mut offset = 0usize;
        let mut packets = 0u64;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(max_data_len);
            self.shaper
                .retrieve(LINK_OVERHEAD_LEN + HEADER_LEN + chunk);
            frame.clear();
            PacketHeader::data(product_id, base + offset as u32, chunk as u32).encode(&mut frame);
            frame.extend_from_slice(&data[offset..offset + chunk]);
            self.mcast
                .send_packet(&frame)
                .map_err(TransportError::from_socket)?;
            offset += chunk;
            packets += 1;
        }
        Ok(packets)
    }

    /// Record multicast-phase stats and arm the retransmission deadline.
    fn finish_multicast(
        &self,
        product_id: u32,
        size: u32,
        packets: u64,
        start: Instant,
        deadline_fraction: f64,
    ) {
        let elapsed = start.elapsed();
        let deadline = retx_deadline(size, self.cfg.send_rate_bps, deadline_fraction, elapsed);
        self.store.with_mut(product_id, |m| {
            m.stats.mcast_packets = packets;
            m.stats.mcast_bytes = size as u64;
            m.stats.mcast_secs = elapsed.as_secs_f64();
            m.deadline = deadline;
        });
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.products_sent += 1;
        stats.packets_sent += packets;
        stats.bytes_sent += size as u64;
        debug!(product_id, packets, ?deadline, "multicast phase complete");
    }

    fn release_product(&self, product_id: u32, outcome: ProductOutcome) {
        release_product(
            &self.store,
            &self.stats,
            &self.done_tx,
            product_id,
            outcome,
        );
    }

    fn send_command_all(&self, kind: AnnounceKind, text: &str) {
        let product_id = self.next_product_id.load(Ordering::Relaxed);
        let body = Announcement::new(
            kind,
            product_id,
            text.len() as u32,
            text,
            self.started_at.elapsed().as_secs_f64(),
        )
        .to_bytes();
        let header = PacketHeader {
            product_id,
            seq: 0,
            data_len: body.len() as u32,
            flags: flags::SENDER_MSG_EXP,
        };
        for conn in self.conns.all() {
            if let Err(e) = conn.send_frame(&header, &body) {
                warn!(conn = conn.id, peer = %conn.peer, error = %e, "command send failed");
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deadline for a product's retransmission window. A non-positive
/// fraction forces the minimum window; otherwise the window scales with
/// the (nominal) multicast duration.
fn retx_deadline(size: u32, rate_bps: f64, fraction: f64, measured: Duration) -> Duration {
    if fraction <= 0.0 {
        return MIN_RETX_TIMEOUT;
    }
    let duration = if rate_bps > 0.0 {
        Duration::from_secs_f64(size as f64 * 8.0 / rate_bps)
    } else {
        measured
    };
    MIN_RETX_TIMEOUT.max(duration.mul_f64(1.0 + fraction))
}

fn length_as_u32(len: u64) -> Result<u32> {
    u32::try_from(len).map_err(|_| TransportError::ProductTooLarge(len))
}

// ─── Acceptor & Retransmission Workers ──────────────────────────────────────

/// Everything a retransmission worker needs, cloneable per connection.
#[derive(Clone)]
struct WorkerCtx {
    conns: Arc<Connections>,
    store: Arc<ProductStore>,
    shaper: Arc<RateShaper>,
    stats: Arc<Mutex<SenderStats>>,
    done_tx: channel::Sender<ProductDone>,
    running: Arc<AtomicBool>,
    max_data_len: usize,
}

fn run_acceptor(
    listener: TcpListener,
    ctx: WorkerCtx,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
) {
    while ctx.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "set_nodelay failed");
                }
                let read_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(%peer, error = %e, "could not clone accepted stream");
                        continue;
                    }
                };
                let conn = ctx.conns.register(stream, peer);
                info!(conn = conn.id, %peer, "receiver connected");
                let ctx = ctx.clone();
                let spawn = thread::Builder::new()
                    .name(format!("fanout-retx-{}", conn.id))
                    .spawn(move || run_retx_worker(conn, read_stream, ctx));
                match spawn {
                    Ok(handle) => {
                        let mut workers = workers.lock().unwrap_or_else(|e| e.into_inner());
                        workers.push(handle);
                    }
                    Err(e) => warn!(%peer, error = %e, "could not spawn retx worker"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

/// Serve one back-channel connection until it dies or the sender stops.
fn run_retx_worker(conn: Arc<Connection>, mut read_stream: TcpStream, ctx: WorkerCtx) {
    // Both caches are worker-local: product data is read-only, so there is
    // nothing to coordinate with other workers.
    let mut fd_cache: HashMap<u32, File> = HashMap::new();
    let mut timed_out: HashSet<u32> = HashSet::new();

    loop {
        let header = match net::read_header(&mut read_stream) {
            Ok(h) => h,
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                debug!(conn = conn.id, peer = %conn.peer, error = %e, "back-channel closed");
                break;
            }
        };

        let outcome = if header.has(flags::RETRANS_REQ) {
            handle_retrans_req(&conn, &mut read_stream, &ctx, &mut fd_cache, &mut timed_out, &header)
        } else if header.has(flags::RETRANS_END) {
            handle_retrans_end(&conn, &ctx, &mut fd_cache, &mut timed_out, header.product_id)
        } else if header.has(flags::HISTORY_STATS) {
            match net::read_body(&mut read_stream, header.data_len) {
                Ok(body) => {
                    info!(conn = conn.id, peer = %conn.peer, report = %String::from_utf8_lossy(&body),
                        "receiver history report");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            // Unknown control traffic: stay framed, ignore the content.
            net::skip_body(&mut read_stream, header.data_len)
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                debug!(conn = conn.id, error = %e, "worker terminating");
                break;
            }
        }
    }

    // The connection is gone: it can no longer hold up any product.
    ctx.conns.remove(conn.id);
    for product_id in ctx.store.drop_connection(conn.id) {
        release_product(
            &ctx.store,
            &ctx.stats,
            &ctx.done_tx,
            product_id,
            ProductOutcome::Completed,
        );
    }
    info!(conn = conn.id, peer = %conn.peer, "receiver disconnected");
}

enum ServeSource {
    Memory(Bytes),
    File(std::path::PathBuf),
}

fn handle_retrans_req(
    conn: &Arc<Connection>,
    read_stream: &mut TcpStream,
    ctx: &WorkerCtx,
    fd_cache: &mut HashMap<u32, File>,
    timed_out: &mut HashSet<u32>,
    header: &PacketHeader,
) -> Result<()> {
    let body = net::read_body(read_stream, header.data_len)?;
    let req = match RetransRequest::decode(&mut body.freeze()) {
        Ok(req) => req,
        Err(e) => {
            warn!(conn = conn.id, error = %e, "bad retransmission request");
            return Ok(());
        }
    };

    let looked_up = ctx.store.with(req.product_id, |m| {
        let source = match &m.backing {
            ProductBacking::Memory(data) => ServeSource::Memory(data.clone()),
            ProductBacking::File(path) => ServeSource::File(path.clone()),
        };
        (m.expired(), m.size, source)
    });
    let Some((expired, size, source)) = looked_up else {
        debug!(conn = conn.id, product_id = req.product_id, "request for unknown product");
        return Ok(());
    };

    if expired {
        if timed_out.insert(req.product_id) {
            let header = PacketHeader::control(req.product_id, flags::RETRANS_TIMEOUT);
            conn.send_frame(&header, &[])?;
            debug!(conn = conn.id, product_id = req.product_id, "deadline elapsed, told receiver");
        }
        fd_cache.remove(&req.product_id);
        if ctx.store.remove_finished_receiver(req.product_id, conn.id) == Some(true) {
            release_product(
                &ctx.store,
                &ctx.stats,
                &ctx.done_tx,
                req.product_id,
                ProductOutcome::Expired,
            );
        }
        return Ok(());
    }

    // Clamp the requested range to the product.
    let start = req.seq.min(size);
    let end = req.seq.saturating_add(req.data_len).min(size);
    let mut offset = start;
    let mut packets = 0u64;
    let mut scratch = vec![0u8; ctx.max_data_len];

    while offset < end {
        let chunk = ((end - offset) as usize).min(ctx.max_data_len);
        let payload: &[u8] = match &source {
            ServeSource::Memory(data) => &data[offset as usize..offset as usize + chunk],
            ServeSource::File(path) => {
                if !fd_cache.contains_key(&req.product_id) {
                    match File::open(path) {
                        Ok(f) => {
                            fd_cache.insert(req.product_id, f);
                        }
                        Err(e) => {
                            warn!(product_id = req.product_id, error = %e, "backing file unreadable");
                            return Ok(());
                        }
                    }
                }
                let file = &fd_cache[&req.product_id];
                if let Err(e) = file.read_exact_at(&mut scratch[..chunk], offset as u64) {
                    warn!(product_id = req.product_id, offset, error = %e, "backing file read failed");
                    return Ok(());
                }
                &scratch[..chunk]
            }
        };

        // Repair traffic is paced by the same shaper as multicast.
        ctx.shaper
            .retrieve(LINK_OVERHEAD_LEN + HEADER_LEN + chunk);
        let hdr = PacketHeader::retrans_data(req.product_id, offset, chunk as u32);
        conn.send_frame(&hdr, payload)?;
        offset += chunk as u32;
        packets += 1;
    }

    let bytes = (end - start) as u64;
    ctx.store.with_mut(req.product_id, |m| {
        m.stats.retx_packets += packets;
        m.stats.retx_bytes += bytes;
    });
    {
        let mut stats = ctx.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.retrans_packets += packets;
        stats.retrans_bytes += bytes;
    }
    Ok(())
}

fn handle_retrans_end(
    conn: &Arc<Connection>,
    ctx: &WorkerCtx,
    fd_cache: &mut HashMap<u32, File>,
    timed_out: &mut HashSet<u32>,
    product_id: u32,
) -> Result<()> {
    // Echo the END so the receiver knows everything before it has been
    // served (TCP ordering makes the echo a barrier).
    conn.send_frame(&PacketHeader::control(product_id, flags::RETRANS_END), &[])?;
    fd_cache.remove(&product_id);
    timed_out.remove(&product_id);
    if ctx.store.remove_finished_receiver(product_id, conn.id) == Some(true) {
        release_product(
            &ctx.store,
            &ctx.stats,
            &ctx.done_tx,
            product_id,
            ProductOutcome::Completed,
        );
    }
    Ok(())
}

/// Erase a product and publish its completion exactly once.
fn release_product(
    store: &ProductStore,
    stats: &Mutex<SenderStats>,
    done_tx: &channel::Sender<ProductDone>,
    product_id: u32,
    outcome: ProductOutcome,
) {
    if store.erase(product_id).is_some() {
        {
            let mut stats = stats.lock().unwrap_or_else(|e| e.into_inner());
            match outcome {
                ProductOutcome::Completed => stats.products_completed += 1,
                ProductOutcome::Expired => stats.products_expired += 1,
            }
        }
        debug!(product_id, ?outcome, "product released");
        let _ = done_tx.send(ProductDone {
            product_id,
            outcome,
        });
    }
}
