//! # Receiver Core
//!
//! One read-loop thread multiplexes the multicast socket and the TCP
//! back-channel with `poll(2)`, assembling products and detecting gaps;
//! one request thread drains the repair queue onto the back-channel. All
//! notifier callbacks run on the read-loop thread.
//!
//! ## Assembly model
//!
//! The multicast path writes sequentially and tracks `current_offset`; a
//! DATA packet beyond that offset reveals a gap, which is queued as a
//! retransmission request while the write position jumps forward. Repair
//! data arrives over TCP and is written positionally through a duplicated
//! handle, so it can never disturb the sequential position. Late and
//! duplicate packets are discarded without rewinding.
//!
//! The sender's RETRANS_END echo is the completion barrier: TCP ordering
//! guarantees every repair byte requested before the END has arrived by
//! the time the echo does.

use bytes::Bytes;
use quanta::Instant;
use rand::RngExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{NotifierMode, ReceiverConfig};
use crate::error::{Result, TransportError};
use crate::net::{self, McastChannel};
use crate::notify::{BopInfo, BopResponse, EopInfo, ProductDest, ProductKind, ProductNotifier};
use crate::queue::RequestQueue;
use crate::stats::{ProductTransferStats, ReceiverStats};
use crate::wire::{
    flags, Announcement, AnnounceKind, PacketHeader, RetransRequest, RETRANS_REQ_BODY_LEN,
};

/// Poll granularity of the read loop; bounds how quickly `stop()` lands.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Back-channel reconnect policy.
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Receive buffer for one multicast datagram.
const RECV_BUF_LEN: usize = 65_536;

// ─── Repair Requests ────────────────────────────────────────────────────────

/// Entry on the queue between the read loop and the request thread.
#[derive(Debug, Clone, Copy)]
enum RepairRequest {
    /// A missing byte range to re-request.
    Range(RetransRequest),
    /// End-of-requests sentinel for one product.
    End { product_id: u32 },
}

// ─── Back-Channel Handle ────────────────────────────────────────────────────

/// Shared writable handle to the back-channel. The read loop owns its own
/// clone of the stream for reading; writers (the request thread and the
/// command replies on the read thread) serialize through the mutex.
struct BackChannel {
    stream: Mutex<TcpStream>,
}

impl BackChannel {
    fn new(stream: TcpStream) -> Self {
        BackChannel {
            stream: Mutex::new(stream),
        }
    }

    fn send_frame(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        net::write_frame(&mut stream, header, body)
    }

    fn replace(&self, new_stream: TcpStream) {
        let mut stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        *stream = new_stream;
    }

    fn clone_for_read(&self) -> Result<TcpStream> {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        stream.try_clone().map_err(TransportError::from_socket)
    }
}

// ─── Product Assembly State ─────────────────────────────────────────────────

enum Dest {
    /// Sequential handle for the multicast path plus a lazily duplicated
    /// handle for positional repair writes.
    File {
        seq: File,
        retx: Option<File>,
        path: Option<PathBuf>,
    },
    Memory(Vec<u8>),
    /// Product is being drained unwritten.
    Ignored,
}

struct ProductStatus {
    size: u32,
    name: String,
    kind: ProductKind,
    dest: Dest,
    current_offset: u32,
    mcast_done: bool,
    failed: bool,
    started: Instant,
    stats: ProductTransferStats,
}

impl ProductStatus {
    fn is_ignored(&self) -> bool {
        matches!(self.dest, Dest::Ignored)
    }
}

/// Apply one multicast DATA payload to a product: detect gaps, advance the
/// sequential offset, never rewind.
fn apply_mcast_data(
    product_id: u32,
    status: &mut ProductStatus,
    seq: u32,
    payload: &[u8],
    queue: &RequestQueue<RepairRequest>,
) -> Result<()> {
    let data_len = payload.len() as u32;
    if u64::from(seq) + u64::from(data_len) > u64::from(status.size) {
        return Err(TransportError::MalformedHeader("data beyond product size"));
    }
    if seq < status.current_offset {
        // Late or duplicate packet: the bytes are already accounted for.
        return Ok(());
    }
    if seq > status.current_offset {
        let gap = RetransRequest {
            product_id,
            seq: status.current_offset,
            data_len: seq - status.current_offset,
        };
        debug!(product_id, start = gap.seq, len = gap.data_len, "gap detected");
        let _ = queue.add(RepairRequest::Range(gap));
        if let Dest::File { seq: handle, .. } = &mut status.dest {
            handle
                .seek(SeekFrom::Start(u64::from(seq)))
                .map_err(TransportError::BackingIoFatal)?;
        }
    }
    match &mut status.dest {
        Dest::File { seq: handle, .. } => {
            handle
                .write_all(payload)
                .map_err(TransportError::BackingIoFatal)?;
        }
        Dest::Memory(buf) => {
            buf[seq as usize..seq as usize + payload.len()].copy_from_slice(payload);
        }
        Dest::Ignored => {}
    }
    status.current_offset = seq + data_len;
    status.stats.mcast_packets += 1;
    status.stats.mcast_bytes += u64::from(data_len);
    Ok(())
}

/// Apply one repair payload through the positional path.
fn apply_retx_data(
    status: &mut ProductStatus,
    seq: u32,
    payload: &[u8],
) -> Result<()> {
    if u64::from(seq) + payload.len() as u64 > u64::from(status.size) {
        return Err(TransportError::MalformedHeader("repair beyond product size"));
    }
    match &mut status.dest {
        Dest::File { seq: seq_handle, retx, .. } => {
            if retx.is_none() {
                *retx = Some(
                    seq_handle
                        .try_clone()
                        .map_err(TransportError::BackingIoFatal)?,
                );
            }
            retx.as_ref()
                .expect("just initialised")
                .write_all_at(payload, u64::from(seq))
                .map_err(TransportError::BackingIoFatal)?;
        }
        Dest::Memory(buf) => {
            buf[seq as usize..seq as usize + payload.len()].copy_from_slice(payload);
        }
        Dest::Ignored => {}
    }
    status.stats.retx_packets += 1;
    status.stats.retx_bytes += payload.len() as u64;
    Ok(())
}

/// Keep announced file names inside the receive directory.
fn sanitize_name(name: &str, product_id: u32) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| n != "." && n != "..")
        .unwrap_or_else(|| format!("product-{product_id}"))
}

// ─── Receiver ───────────────────────────────────────────────────────────────

/// The receiving endpoint. Construction joins the multicast group,
/// connects the back-channel and starts both service threads.
pub struct Receiver {
    running: Arc<AtomicBool>,
    queue: Arc<RequestQueue<RepairRequest>>,
    stats: Arc<Mutex<ReceiverStats>>,
    loss: Arc<AtomicU32>,
    read_handle: Option<thread::JoinHandle<()>>,
    req_handle: Option<thread::JoinHandle<()>>,
}

impl Receiver {
    pub fn start(cfg: ReceiverConfig, notifier: Box<dyn ProductNotifier>) -> Result<Self> {
        cfg.validate()?;

        let mcast = McastChannel::receiver(cfg.multicast_addr, cfg.multicast_port, cfg.interface_ip)
            .map_err(TransportError::from_socket)?;
        let stream = net::connect_back_channel(&cfg.sender_host, cfg.sender_port)?;
        let back = Arc::new(BackChannel::new(stream));
        let read_stream = back.clone_for_read()?;

        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(RequestQueue::new());
        let stats = Arc::new(Mutex::new(ReceiverStats::default()));
        let loss = Arc::new(AtomicU32::new(u32::from(cfg.simulated_loss_per_mille)));

        info!(
            group = %cfg.multicast_addr,
            port = cfg.multicast_port,
            sender = %format_args!("{}:{}", cfg.sender_host, cfg.sender_port),
            mode = ?cfg.notifier_mode,
            "receiver started"
        );

        let req_handle = {
            let queue = queue.clone();
            let back = back.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("fanout-request".into())
                .spawn(move || run_request_thread(queue, back, running))
                .map_err(TransportError::from_socket)?
        };

        let read_handle = {
            let mut read_loop = ReadLoop {
                cfg,
                mcast,
                back,
                read_stream,
                notifier,
                products: HashMap::new(),
                read_ahead: None,
                queue: queue.clone(),
                stats: stats.clone(),
                loss: loss.clone(),
                running: running.clone(),
            };
            thread::Builder::new()
                .name("fanout-recv".into())
                .spawn(move || read_loop.run())
                .map_err(TransportError::from_socket)?
        };

        Ok(Receiver {
            running,
            queue,
            stats,
            loss,
            read_handle: Some(read_handle),
            req_handle: Some(req_handle),
        })
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Change the simulated DATA loss rate (per mille) at runtime.
    pub fn set_simulated_loss(&self, per_mille: u16) {
        self.loss
            .store(u32::from(per_mille.min(1000)), Ordering::Relaxed);
    }

    /// True while both service threads are alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop both threads and join them. Idempotent. Must run on a normal
    /// thread, never from a signal handler.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            // Another caller is (or was) already stopping; still join.
        }
        self.queue.cancel();
        if let Some(handle) = self.read_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.req_handle.take() {
            let _ = handle.join();
        }
        info!("receiver stopped");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Request Thread ─────────────────────────────────────────────────────────

/// Peek-send-remove loop: an entry leaves the queue only after its frame
/// made it onto the wire, so transient back-channel failures lose nothing.
fn run_request_thread(
    queue: Arc<RequestQueue<RepairRequest>>,
    back: Arc<BackChannel>,
    running: Arc<AtomicBool>,
) {
    loop {
        let request = match queue.peek_wait() {
            Ok(req) => req,
            Err(_) => break, // cancelled
        };
        let (header, body) = match request {
            RepairRequest::Range(req) => (
                PacketHeader {
                    product_id: req.product_id,
                    seq: 0,
                    data_len: RETRANS_REQ_BODY_LEN as u32,
                    flags: flags::RETRANS_REQ,
                },
                req.to_bytes(),
            ),
            RepairRequest::End { product_id } => {
                (PacketHeader::control(product_id, flags::RETRANS_END), Bytes::new())
            }
        };
        match back.send_frame(&header, &body) {
            Ok(()) => {
                queue.remove_no_wait();
            }
            Err(e) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                debug!(error = %e, "request send failed; will retry");
                thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
}

// ─── Read Loop ──────────────────────────────────────────────────────────────

struct ReadLoop {
    cfg: ReceiverConfig,
    mcast: McastChannel,
    back: Arc<BackChannel>,
    read_stream: TcpStream,
    notifier: Box<dyn ProductNotifier>,
    products: HashMap<u32, ProductStatus>,
    /// Capacity-one stash for a DATA packet whose BOF has not arrived yet.
    read_ahead: Option<(PacketHeader, Bytes)>,
    queue: Arc<RequestQueue<RepairRequest>>,
    stats: Arc<Mutex<ReceiverStats>>,
    loss: Arc<AtomicU32>,
    running: Arc<AtomicBool>,
}

impl ReadLoop {
    fn run(&mut self) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        while self.running.load(Ordering::Relaxed) {
            let ready = net::poll2(
                self.mcast.as_raw_fd(),
                self.read_stream.as_raw_fd(),
                POLL_TICK,
            );
            let (mcast_ready, back_ready) = match ready {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "poll failed; read loop terminating");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            };
            if mcast_ready {
                self.handle_multicast_packet(&mut buf);
            }
            if back_ready {
                if let Err(e) = self.handle_unicast_packet() {
                    if !e.is_transient() {
                        warn!(error = %e, "back-channel failed");
                        if !self.reconnect() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // ── multicast path ──────────────────────────────────────────────────

    fn handle_multicast_packet(&mut self, buf: &mut [u8]) {
        let n = match self.mcast.recv_packet(buf) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "multicast recv failed");
                return;
            }
        };
        let mut slice = &buf[..n];
        let header = match PacketHeader::decode(&mut slice) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, len = n, "dropping malformed multicast packet");
                return;
            }
        };
        if slice.len() < header.data_len as usize {
            debug!(?header, "dropping truncated multicast packet");
            return;
        }
        let payload = &slice[..header.data_len as usize];

        if header.has(flags::BOF) {
            match Announcement::decode(&mut &payload[..]) {
                Ok(ann) => self.handle_bof(ann),
                Err(e) => debug!(error = %e, "dropping malformed announcement"),
            }
        } else if header.has(flags::EOF) {
            self.handle_eof(header.product_id);
        } else if header.is_data() {
            self.handle_data(&header, payload);
        } else {
            debug!(?header, "unexpected control flags on multicast; dropped");
        }
    }

    fn handle_bof(&mut self, ann: Announcement) {
        let kind = match ann.kind {
            AnnounceKind::MemoryTransferStart => ProductKind::Memory,
            AnnounceKind::FileTransferStart => ProductKind::File,
            _ => return, // command kinds never arrive as BOFs
        };
        let product_id = ann.product_id;
        if self.products.contains_key(&product_id) {
            debug!(product_id, "duplicate BOF ignored");
            return;
        }

        let info = BopInfo {
            product_id,
            size: ann.size,
            name: ann.text.clone(),
            kind,
            timestamp: ann.timestamp,
        };
        let response = self.notifier.on_bop(&info);
        // In batched mode the receiver owns allocation; the notifier's
        // answer is advisory only.
        let response = match self.cfg.notifier_mode {
            NotifierMode::Batched => BopResponse::Default,
            NotifierMode::PerProduct => response,
        };

        let dest = match response {
            BopResponse::Ignore => {
                debug!(product_id, "product ignored at BOF");
                Dest::Ignored
            }
            BopResponse::Accept(ProductDest::File(file)) => Dest::File {
                seq: file,
                retx: None,
                path: None,
            },
            BopResponse::Accept(ProductDest::Memory(mut vec)) => {
                vec.resize(ann.size as usize, 0);
                Dest::Memory(vec)
            }
            BopResponse::Default => match kind {
                ProductKind::Memory => Dest::Memory(vec![0u8; ann.size as usize]),
                ProductKind::File => {
                    let path = self
                        .cfg
                        .receive_dir
                        .join(sanitize_name(&ann.text, product_id));
                    match OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&path)
                    {
                        Ok(file) => Dest::File {
                            seq: file,
                            retx: None,
                            path: Some(path),
                        },
                        Err(e) => {
                            warn!(product_id, path = %path.display(), error = %e,
                                "cannot create backing file; product missed");
                            self.notifier.on_missed(product_id);
                            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                            stats.products_started += 1;
                            stats.products_failed += 1;
                            drop(stats);
                            self.products.insert(
                                product_id,
                                ProductStatus {
                                    size: ann.size,
                                    name: ann.text,
                                    kind,
                                    dest: Dest::Ignored,
                                    current_offset: 0,
                                    mcast_done: false,
                                    failed: true,
                                    started: Instant::now(),
                                    stats: ProductTransferStats::default(),
                                },
                            );
                            return;
                        }
                    }
                }
            },
        };

        let accepted = !matches!(dest, Dest::Ignored);
        let mut status = ProductStatus {
            size: ann.size,
            name: ann.text,
            kind,
            dest,
            current_offset: 0,
            mcast_done: false,
            failed: false,
            started: Instant::now(),
            stats: ProductTransferStats::default(),
        };
        if accepted {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.products_started += 1;
        }
        debug!(product_id, size = status.size, accepted, "product starting");

        // A DATA packet may have outrun its BOF; commit the stashed one.
        if let Some((stashed_header, stashed_payload)) = self.read_ahead.take() {
            if stashed_header.product_id == product_id && !status.is_ignored() {
                if let Err(e) = apply_mcast_data(
                    product_id,
                    &mut status,
                    stashed_header.seq,
                    &stashed_payload,
                    &self.queue,
                ) {
                    self.fail_product_inline(product_id, &mut status, &e);
                }
            }
            // A stale stash for some other product is dropped: its BOF is
            // never coming now that a newer product has started.
        }

        self.products.insert(product_id, status);
    }

    fn handle_data(&mut self, header: &PacketHeader, payload: &[u8]) {
        let product_id = header.product_id;
        let Some(status) = self.products.get_mut(&product_id) else {
            // BOF not seen (yet). Keep at most one packet for it.
            if self.read_ahead.is_none() {
                self.read_ahead = Some((*header, Bytes::copy_from_slice(payload)));
            }
            return;
        };
        if status.failed {
            return;
        }

        // Synthetic loss gate, DATA only — never applied to control packets.
        let loss = self.loss.load(Ordering::Relaxed);
        if loss > 0 && u32::from(rand::rng().random_range(0..1000u16)) < loss {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.simulated_drops += 1;
            return;
        }

        if status.is_ignored() {
            // Drain without writing and without requesting repair.
            status.current_offset = status.current_offset.max(
                header.seq.saturating_add(header.data_len),
            );
            return;
        }

        let duplicate = header.seq < status.current_offset;
        match apply_mcast_data(product_id, status, header.seq, payload, &self.queue) {
            Ok(()) => {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                if duplicate {
                    stats.duplicates += 1;
                } else {
                    stats.mcast_packets += 1;
                    stats.mcast_bytes += u64::from(header.data_len);
                }
            }
            Err(TransportError::MalformedHeader(reason)) => {
                debug!(product_id, reason, "dropping invalid DATA packet");
            }
            Err(e) => {
                let mut status = self
                    .products
                    .remove(&product_id)
                    .expect("present above");
                self.fail_product_inline(product_id, &mut status, &e);
                self.products.insert(product_id, status);
            }
        }
    }

    fn handle_eof(&mut self, product_id: u32) {
        if let Some(status) = self.products.get_mut(&product_id) {
            status.mcast_done = true;
            status.stats.mcast_secs = status.started.elapsed().as_secs_f64();

            if status.is_ignored() {
                // DISCARDED: nothing was written, nothing is notified.
                let failed = status.failed;
                self.products.remove(&product_id);
                let _ = self.queue.add(RepairRequest::End { product_id });
                debug!(product_id, failed, "ignored product discarded at EOF");
                return;
            }
            if !status.failed && status.current_offset < status.size {
                let gap = RetransRequest {
                    product_id,
                    seq: status.current_offset,
                    data_len: status.size - status.current_offset,
                };
                debug!(product_id, start = gap.seq, len = gap.data_len, "terminal gap");
                let _ = self.queue.add(RepairRequest::Range(gap));
            }
        }
        // Always close the request stream for this product, even if its
        // BOF never arrived: the sender's echo releases this receiver.
        let _ = self.queue.add(RepairRequest::End { product_id });
    }

    // ── back-channel path ───────────────────────────────────────────────

    fn handle_unicast_packet(&mut self) -> Result<()> {
        let header = net::read_header(&mut self.read_stream)?;

        if header.has(flags::SENDER_MSG_EXP) {
            let body = net::read_body(&mut self.read_stream, header.data_len)?;
            match Announcement::decode(&mut body.freeze()) {
                Ok(ann) => self.handle_command(ann),
                Err(e) => debug!(error = %e, "malformed sender message"),
            }
            Ok(())
        } else if header.has(flags::RETRANS_DATA) {
            let body = net::read_body(&mut self.read_stream, header.data_len)?;
            self.handle_retx_data(&header, &body);
            Ok(())
        } else if header.has(flags::RETRANS_END) {
            self.finish_product(header.product_id);
            Ok(())
        } else if header.has(flags::RETRANS_TIMEOUT) {
            self.abandon_product(header.product_id);
            Ok(())
        } else {
            net::skip_body(&mut self.read_stream, header.data_len)
        }
    }

    fn handle_retx_data(&mut self, header: &PacketHeader, payload: &[u8]) {
        let Some(status) = self.products.get_mut(&header.product_id) else {
            debug!(product_id = header.product_id, "repair for unknown product");
            return;
        };
        if status.failed || status.is_ignored() {
            return;
        }
        match apply_retx_data(status, header.seq, payload) {
            Ok(()) => {
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.retx_packets += 1;
                stats.retx_bytes += payload.len() as u64;
            }
            Err(TransportError::MalformedHeader(reason)) => {
                debug!(product_id = header.product_id, reason, "dropping invalid repair");
            }
            Err(e) => {
                let product_id = header.product_id;
                let mut status = self
                    .products
                    .remove(&product_id)
                    .expect("present above");
                self.fail_product_inline(product_id, &mut status, &e);
                self.products.insert(product_id, status);
            }
        }
    }

    /// RETRANS_END echo from the sender: every repair byte we asked for
    /// has arrived. The product reaches its terminal state here.
    fn finish_product(&mut self, product_id: u32) {
        let Some(mut status) = self.products.remove(&product_id) else {
            debug!(product_id, "RETRANS_END for unknown product");
            return;
        };
        if status.failed || status.is_ignored() {
            // Missed (or discarded) was already signalled; nothing more.
            return;
        }
        let elapsed = status.started.elapsed();
        let data = match &mut status.dest {
            Dest::Memory(buf) => Some(Bytes::from(std::mem::take(buf))),
            Dest::File { .. } => None,
            Dest::Ignored => None,
        };
        let path = match &status.dest {
            Dest::File { path, .. } => path.clone(),
            _ => None,
        };
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.products_received += 1;
            stats.record_product(product_id, status.size, &status.stats, true);
        }
        info!(
            product_id,
            kind = ?status.kind,
            size = status.size,
            retx_packets = status.stats.retx_packets,
            elapsed_ms = elapsed.as_millis() as u64,
            "product complete"
        );
        self.notifier.on_eop(EopInfo {
            product_id,
            size: status.size,
            name: status.name.clone(),
            elapsed,
            retx_packets: status.stats.retx_packets,
            retx_bytes: status.stats.retx_bytes,
            data,
            path,
        });
        // File handles close as `status` drops here.
    }

    /// RETRANS_TIMEOUT: the sender abandoned the product.
    fn abandon_product(&mut self, product_id: u32) {
        let Some(status) = self.products.remove(&product_id) else {
            debug!(product_id, "RETRANS_TIMEOUT for unknown product");
            return;
        };
        if status.failed {
            return; // missed already notified
        }
        warn!(product_id, offset = status.current_offset, size = status.size,
            mcast_done = status.mcast_done, "product abandoned by sender");
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.products_failed += 1;
            stats.record_product(product_id, status.size, &status.stats, false);
        }
        self.notifier.on_missed(product_id);
    }

    /// A backing write failed: the product is done for, but its entry
    /// stays so the rest of its traffic drains quietly.
    fn fail_product_inline(
        &mut self,
        product_id: u32,
        status: &mut ProductStatus,
        err: &TransportError,
    ) {
        error!(product_id, error = %err, "backing write failed; product missed");
        status.failed = true;
        status.dest = Dest::Ignored;
        {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.products_failed += 1;
            stats.record_product(product_id, status.size, &status.stats, false);
        }
        self.notifier.on_missed(product_id);
    }

    // ── operator commands ───────────────────────────────────────────────

    fn handle_command(&mut self, ann: Announcement) {
        match ann.kind {
            AnnounceKind::ResetStats => {
                info!("resetting history statistics");
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.reset();
            }
            AnnounceKind::SetLossRate => match ann.text.trim().parse::<u16>() {
                Ok(rate) if rate <= 1000 => {
                    info!(per_mille = rate, "simulated loss rate set by sender");
                    self.loss.store(u32::from(rate), Ordering::Relaxed);
                }
                _ => warn!(text = %ann.text, "bad loss-rate command"),
            },
            AnnounceKind::CollectStats => {
                let report = {
                    let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                    stats.history_report()
                };
                let header = PacketHeader {
                    product_id: 0,
                    seq: 0,
                    data_len: report.len() as u32,
                    flags: flags::HISTORY_STATS,
                };
                if let Err(e) = self.back.send_frame(&header, report.as_bytes()) {
                    warn!(error = %e, "history report send failed");
                }
            }
            AnnounceKind::ExecuteCommand => {
                // Operator commands are logged, never executed.
                warn!(command = %ann.text, "ignoring operator command");
            }
            AnnounceKind::MemoryTransferStart | AnnounceKind::FileTransferStart => {
                debug!("transfer announcement on back-channel ignored");
            }
        }
    }

    // ── reconnect ───────────────────────────────────────────────────────

    /// Bounded back-channel reconnect. In-flight accepted products are
    /// declared missed — their repair path is gone.
    fn reconnect(&mut self) -> bool {
        for attempt in 1..=RECONNECT_ATTEMPTS {
            if !self.running.load(Ordering::Relaxed) {
                return false;
            }
            info!(attempt, "reconnecting back-channel");
            match net::connect_back_channel(&self.cfg.sender_host, self.cfg.sender_port) {
                Ok(stream) => {
                    self.back.replace(stream);
                    match self.back.clone_for_read() {
                        Ok(read_stream) => self.read_stream = read_stream,
                        Err(e) => {
                            warn!(error = %e, "clone of reconnected stream failed");
                            continue;
                        }
                    }
                    info!("back-channel reconnected");
                    self.fail_in_flight();
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect failed");
                    thread::sleep(RECONNECT_BACKOFF * attempt);
                }
            }
        }
        error!("back-channel lost for good; receiver terminating");
        self.running.store(false, Ordering::SeqCst);
        false
    }

    fn fail_in_flight(&mut self) {
        let pending: Vec<u32> = self.products.keys().copied().collect();
        for product_id in pending {
            let Some(status) = self.products.remove(&product_id) else {
                continue;
            };
            if !status.failed && !status.is_ignored() {
                warn!(product_id, "in-flight product missed across reconnect");
                let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
                stats.products_failed += 1;
                stats.record_product(product_id, status.size, &status.stats, false);
                drop(stats);
                self.notifier.on_missed(product_id);
            }
        }
    }
}
