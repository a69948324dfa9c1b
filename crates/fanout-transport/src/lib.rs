//! # fanout-transport
//!
//! Fanout reliable multicast transport.
//!
//! One sender multicasts byte products — memory blobs or files — to many
//! receivers over UDP at a shaped rate. Each receiver detects loss by
//! offset arithmetic and repairs it over its own TCP back-channel; a
//! product is either delivered byte-exact or declared missed once the
//! sender's per-product deadline closes the repair window.
//!
//! ## Crate structure
//!
//! - [`wire`] — packet header and control-message codec
//! - [`pacing`] — token-bucket rate shaper
//! - [`net`] — multicast channel and back-channel plumbing
//! - [`queue`] — cancellable request queue
//! - [`store`] — sender-side product metadata store
//! - [`sender`] — multicast engine + retransmission workers
//! - [`receiver`] — read loop, gap detection, product assembly
//! - [`notify`] — application notification boundary
//! - [`stats`] — per-product and aggregate statistics
//! - [`config`] — endpoint configuration
//! - [`error`] — error taxonomy

pub mod config;
pub mod error;
pub mod net;
pub mod notify;
pub mod pacing;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod stats;
pub mod store;
pub mod wire;

pub use config::{NotifierMode, ReceiverConfig, SenderConfig};
pub use error::{Result, TransportError};
pub use notify::{
    BatchedNotifier, BopInfo, BopResponse, EopInfo, ProductDest, ProductEvent, ProductKind,
    ProductNotifier,
};
pub use receiver::Receiver;
pub use sender::{ProductDone, ProductOutcome, Sender};
