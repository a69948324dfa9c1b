//! # Notifier Boundary
//!
//! The application-facing callback surface: one capability set
//! {`on_bop`, `on_eop`, `on_missed`} used by both notification
//! disciplines. The two modes differ only in whether `on_bop` may supply
//! the destination — in batched mode the receiver allocates and the
//! response is advisory, in per-product mode the response decides
//! accept/ignore.
//!
//! Callbacks run on the receiver's read-loop thread. They may block
//! transiently but must not block indefinitely: nothing else drains the
//! sockets while a callback runs.

use bytes::Bytes;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::queue::RequestQueue;

/// What a BOF announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductKind {
    Memory,
    File,
}

/// Beginning-of-product descriptor handed to `on_bop`.
#[derive(Debug, Clone)]
pub struct BopInfo {
    pub product_id: u32,
    /// Declared product size in bytes.
    pub size: u32,
    /// Product name from the announcement (file name for file products).
    pub name: String,
    pub kind: ProductKind,
    /// Sender-side announcement timestamp, seconds since sender start.
    pub timestamp: f64,
}

/// Where an accepted product's bytes should be assembled.
pub enum ProductDest {
    /// A caller-opened writable file.
    File(File),
    /// A caller-owned buffer; it is grown to the product size and handed
    /// back in the end-of-product descriptor.
    Memory(Vec<u8>),
}

/// The notifier's answer to a BOP.
pub enum BopResponse {
    /// Let the receiver allocate (batched behaviour).
    Default,
    /// Assemble into the supplied destination.
    Accept(ProductDest),
    /// Skip this product entirely: its data is drained unwritten and no
    /// end-of-product notification follows.
    Ignore,
}

/// End-of-product descriptor handed to `on_eop`.
#[derive(Debug, Clone)]
pub struct EopInfo {
    pub product_id: u32,
    pub size: u32,
    pub name: String,
    /// Start of multicast to completion of repair.
    pub elapsed: Duration,
    pub retx_packets: u64,
    pub retx_bytes: u64,
    /// Assembled bytes for memory products; `None` for file products.
    pub data: Option<Bytes>,
    /// Path written for receiver-allocated file products.
    pub path: Option<PathBuf>,
}

/// Application callbacks. All three have no-op defaults so a notifier can
/// implement only what it cares about.
pub trait ProductNotifier: Send {
    /// A product is starting. The return value is honoured in per-product
    /// mode; batched receivers treat everything but `Ignore` as `Default`.
    fn on_bop(&mut self, _bop: &BopInfo) -> BopResponse {
        BopResponse::Default
    }

    /// A product completed; exactly one of `on_eop`/`on_missed` fires per
    /// accepted product.
    fn on_eop(&mut self, _eop: EopInfo) {}

    /// The product was abandoned (sender deadline, or a fatal local
    /// write error).
    fn on_missed(&mut self, _product_id: u32) {}
}

// ─── Batched Notifier ───────────────────────────────────────────────────────

/// Product lifecycle events as seen by a batched application.
#[derive(Debug, Clone)]
pub enum ProductEvent {
    Begin(BopInfo),
    Complete(EopInfo),
    Missed(u32),
}

/// The batched discipline: storage is receiver-allocated and events are
/// queued for the application to drain asynchronously.
pub struct BatchedNotifier {
    events: Arc<RequestQueue<ProductEvent>>,
}

impl BatchedNotifier {
    pub fn new() -> Self {
        BatchedNotifier {
            events: Arc::new(RequestQueue::new()),
        }
    }

    /// Queue handle for the application side. `peek_wait`/`remove_no_wait`
    /// to consume; the queue is cancelled when the receiver stops.
    pub fn events(&self) -> Arc<RequestQueue<ProductEvent>> {
        self.events.clone()
    }
}

impl Default for BatchedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductNotifier for BatchedNotifier {
    fn on_bop(&mut self, bop: &BopInfo) -> BopResponse {
        let _ = self.events.add(ProductEvent::Begin(bop.clone()));
        BopResponse::Default
    }

    fn on_eop(&mut self, eop: EopInfo) {
        let _ = self.events.add(ProductEvent::Complete(eop));
    }

    fn on_missed(&mut self, product_id: u32) {
        let _ = self.events.add(ProductEvent::Missed(product_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_notifier_queues_events_in_order() {
        let mut notifier = BatchedNotifier::new();
        let events = notifier.events();

        let bop = BopInfo {
            product_id: 1,
            size: 10,
            name: "a".into(),
            kind: ProductKind::Memory,
            timestamp: 0.0,
        };
        assert!(matches!(notifier.on_bop(&bop), BopResponse::Default));
        notifier.on_missed(1);

        assert!(matches!(
            events.remove_no_wait(),
            Some(ProductEvent::Begin(b)) if b.product_id == 1
        ));
        assert!(matches!(
            events.remove_no_wait(),
            Some(ProductEvent::Missed(1))
        ));
        assert!(events.remove_no_wait().is_none());
    }
}
