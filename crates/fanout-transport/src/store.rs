//! # Product Metadata Store (sender side)
//!
//! Table of in-flight products, shared between the multicast path and the
//! retransmission workers. Guarded by a reader-writer lock: reads for
//! lookup, writes only for map insert/erase and unfinished-receiver set
//! mutation. The lock is never held across I/O — callers copy what they
//! need out of the closure and do file work outside.

use bytes::Bytes;
use quanta::Instant;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::stats::ProductTransferStats;

/// Where a product's bytes live for retransmission.
#[derive(Debug, Clone)]
pub enum ProductBacking {
    /// In-memory product; retransmission slices this buffer.
    Memory(Bytes),
    /// File product; workers open and cache their own descriptors.
    File(PathBuf),
}

/// Sender-side metadata for one in-flight product.
#[derive(Debug)]
pub struct ProductMeta {
    pub product_id: u32,
    /// Product size in bytes.
    pub size: u32,
    /// Product name as announced in the BOF.
    pub name: String,
    pub backing: ProductBacking,
    /// When multicast of this product began.
    pub mcast_start: Instant,
    /// Retransmission deadline, relative to `mcast_start`.
    pub deadline: Duration,
    /// Back-channel connections that have not yet signalled RETRANS_END.
    pub unfinished: HashSet<u64>,
    pub stats: ProductTransferStats,
}

impl ProductMeta {
    /// True once the retransmission window has closed.
    pub fn expired(&self) -> bool {
        self.mcast_start.elapsed() > self.deadline
    }
}

/// `product_id → metadata`, reader-writer locked.
#[derive(Default)]
pub struct ProductStore {
    map: RwLock<HashMap<u32, ProductMeta>>,
}

impl ProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: ProductMeta) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(meta.product_id, meta);
    }

    /// Run `f` against a product under the read lock.
    pub fn with<R>(&self, product_id: u32, f: impl FnOnce(&ProductMeta) -> R) -> Option<R> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(&product_id).map(f)
    }

    /// Run `f` against a product under the write lock (stats updates).
    pub fn with_mut<R>(&self, product_id: u32, f: impl FnOnce(&mut ProductMeta) -> R) -> Option<R> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.get_mut(&product_id).map(f)
    }

    /// Remove a product, returning its metadata so the caller can finish
    /// teardown (and run any close) outside the lock.
    pub fn erase(&self, product_id: u32) -> Option<ProductMeta> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&product_id)
    }

    /// Drop `conn` from the product's unfinished-receiver set.
    ///
    /// Returns `None` if the product is unknown, otherwise whether the set
    /// is now empty — in which case the caller must erase the product
    /// (outside this call, so teardown happens off the lock).
    pub fn remove_finished_receiver(&self, product_id: u32, conn: u64) -> Option<bool> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        let meta = map.get_mut(&product_id)?;
        meta.unfinished.remove(&conn);
        Some(meta.unfinished.is_empty())
    }

    /// Drop `conn` from every product (the connection died). Returns the
    /// products whose unfinished set became empty as a result.
    pub fn drop_connection(&self, conn: u64) -> Vec<u32> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        let mut done = Vec::new();
        for meta in map.values_mut() {
            if meta.unfinished.remove(&conn) && meta.unfinished.is_empty() {
                done.push(meta.product_id);
            }
        }
        done
    }

    /// Snapshot of products past their deadline: `(product_id, remaining
    /// unfinished connections)`.
    pub fn expired_products(&self) -> Vec<(u32, Vec<u64>)> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.values()
            .filter(|m| m.expired())
            .map(|m| (m.product_id, m.unfinished.iter().copied().collect()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(product_id: u32, conns: &[u64], deadline: Duration) -> ProductMeta {
        ProductMeta {
            product_id,
            size: 1024,
            name: format!("p{product_id}"),
            backing: ProductBacking::Memory(Bytes::from_static(b"abcd")),
            mcast_start: Instant::now(),
            deadline,
            unfinished: conns.iter().copied().collect(),
            stats: ProductTransferStats::default(),
        }
    }

    #[test]
    fn insert_lookup_erase() {
        let store = ProductStore::new();
        store.insert(meta(1, &[10], Duration::from_secs(60)));
        assert_eq!(store.with(1, |m| m.size), Some(1024));
        assert!(store.with(2, |m| m.size).is_none());
        let removed = store.erase(1).unwrap();
        assert_eq!(removed.product_id, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn finished_receivers_empty_the_set() {
        let store = ProductStore::new();
        store.insert(meta(5, &[10, 11], Duration::from_secs(60)));
        assert_eq!(store.remove_finished_receiver(5, 10), Some(false));
        assert_eq!(store.remove_finished_receiver(5, 11), Some(true));
        assert_eq!(store.remove_finished_receiver(6, 10), None);
    }

    #[test]
    fn dead_connection_leaves_every_product() {
        let store = ProductStore::new();
        store.insert(meta(1, &[10, 11], Duration::from_secs(60)));
        store.insert(meta(2, &[10], Duration::from_secs(60)));
        let done = store.drop_connection(10);
        // Product 2 had only the dead connection outstanding.
        assert_eq!(done, vec![2]);
        assert_eq!(store.with(1, |m| m.unfinished.len()), Some(1));
    }

    #[test]
    fn deadline_expiry_is_observable() {
        let store = ProductStore::new();
        store.insert(meta(9, &[10], Duration::from_millis(5)));
        assert!(store.expired_products().is_empty());
        std::thread::sleep(Duration::from_millis(20));
        let expired = store.expired_products();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 9);
        assert_eq!(expired[0].1, vec![10]);
    }
}
