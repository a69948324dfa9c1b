//! # Fanout Wire Format
//!
//! Fixed-size packet header plus the control-message bodies that ride in
//! the data region of flagged packets.
//!
//! ## Packet Header (fixed 16 bytes, network byte order)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Product Index (32)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Sequence Number = byte offset (32)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Data Length (32)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Flags (32)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The sequence number of a DATA or RETRANS_DATA packet is the byte
//! offset of its payload within the product, so assembly is pure offset
//! arithmetic and duplicates are harmless.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{Result, TransportError};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Default maximum on-wire packet length (header + payload). Chosen to
/// avoid IP fragmentation on standard-MTU Ethernet paths.
pub const DEFAULT_PACKET_LEN: usize = 1460;

/// Payload capacity of a default-MTU packet.
pub const DEFAULT_DATA_LEN: usize = DEFAULT_PACKET_LEN - HEADER_LEN;

/// Fixed width of the announcement text field (product name or command).
pub const ANNOUNCE_TEXT_LEN: usize = 256;

/// Encoded announcement body size: kind + product_id + size + text + timestamp.
pub const ANNOUNCE_BODY_LEN: usize = 4 + 4 + 4 + ANNOUNCE_TEXT_LEN + 8;

/// Encoded retransmission-request body size.
pub const RETRANS_REQ_BODY_LEN: usize = 12;

// ─── Flags ──────────────────────────────────────────────────────────────────

/// Header flag bits. `DATA` is the zero value; all others are distinct bits.
pub mod flags {
    /// Plain multicast data packet.
    pub const DATA: u32 = 0x0000;
    /// Beginning-of-product announcement.
    pub const BOF: u32 = 0x0001;
    /// End-of-product marker.
    pub const EOF: u32 = 0x0002;
    /// Operator/command message from the sender.
    pub const SENDER_MSG_EXP: u32 = 0x0004;
    /// Retransmission request (receiver → sender).
    pub const RETRANS_REQ: u32 = 0x0008;
    /// Retransmitted data (sender → receiver).
    pub const RETRANS_DATA: u32 = 0x0010;
    /// Retransmission-complete signal, sent both directions.
    pub const RETRANS_END: u32 = 0x0020;
    /// Product abandoned at the sender; receiver must give up on it.
    pub const RETRANS_TIMEOUT: u32 = 0x0040;
    /// Request for a re-announcement of a product's BOF.
    pub const BOF_REQ: u32 = 0x0080;
    /// History-statistics report (receiver → sender).
    pub const HISTORY_STATS: u32 = 0x0100;

    /// Union of every defined bit. Anything outside is malformed.
    pub const KNOWN_MASK: u32 = BOF
        | EOF
        | SENDER_MSG_EXP
        | RETRANS_REQ
        | RETRANS_DATA
        | RETRANS_END
        | RETRANS_TIMEOUT
        | BOF_REQ
        | HISTORY_STATS;
}

// ─── Packet Header ──────────────────────────────────────────────────────────

/// Decoded packet header — present on every Fanout packet, multicast or
/// back-channel.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Index of the product this packet belongs to.
    pub product_id: u32,
    /// Byte offset of the payload within the product.
    pub seq: u32,
    /// Payload length in bytes (after the header).
    pub data_len: u32,
    /// Flag bits, see [`flags`].
    pub flags: u32,
}

impl PacketHeader {
    /// Encode into a buffer; writes exactly [`HEADER_LEN`] bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.product_id);
        buf.put_u32(self.seq);
        buf.put_u32(self.data_len);
        buf.put_u32(self.flags);
    }

    /// Decode a header, validating the flag set.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(TransportError::MalformedHeader("short header"));
        }
        let product_id = buf.get_u32();
        let seq = buf.get_u32();
        let data_len = buf.get_u32();
        let raw_flags = buf.get_u32();
        if raw_flags & !flags::KNOWN_MASK != 0 {
            return Err(TransportError::MalformedHeader("unknown flag bits"));
        }
        Ok(PacketHeader {
            product_id,
            seq,
            data_len,
            flags: raw_flags,
        })
    }

    /// Serialize into a fresh 16-byte buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// A multicast DATA header for a payload at byte offset `seq`.
    pub fn data(product_id: u32, seq: u32, data_len: u32) -> Self {
        PacketHeader {
            product_id,
            seq,
            data_len,
            flags: flags::DATA,
        }
    }

    /// A BOF header; the announcement body follows.
    pub fn bof(product_id: u32) -> Self {
        PacketHeader {
            product_id,
            seq: 0,
            data_len: ANNOUNCE_BODY_LEN as u32,
            flags: flags::BOF,
        }
    }

    /// An EOF header; no body.
    pub fn eof(product_id: u32) -> Self {
        PacketHeader {
            product_id,
            seq: 0,
            data_len: 0,
            flags: flags::EOF,
        }
    }

    /// A retransmitted-data header for a payload at byte offset `seq`.
    pub fn retrans_data(product_id: u32, seq: u32, data_len: u32) -> Self {
        PacketHeader {
            product_id,
            seq,
            data_len,
            flags: flags::RETRANS_DATA,
        }
    }

    /// A bodyless control header (RETRANS_END, RETRANS_TIMEOUT, BOF_REQ).
    pub fn control(product_id: u32, flag: u32) -> Self {
        PacketHeader {
            product_id,
            seq: 0,
            data_len: 0,
            flags: flag,
        }
    }

    /// True for a plain DATA packet (the zero flag value).
    pub fn is_data(&self) -> bool {
        self.flags == flags::DATA
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHeader")
            .field("product_id", &self.product_id)
            .field("seq", &self.seq)
            .field("data_len", &self.data_len)
            .field("flags", &format_args!("{:#06x}", self.flags))
            .finish()
    }
}

// ─── Announcement Kind ──────────────────────────────────────────────────────

/// Discriminant carried in announcement bodies: what a BOF announces, or
/// which operator command a SENDER_MSG_EXP carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AnnounceKind {
    /// BOF of a memory-to-memory product.
    MemoryTransferStart = 3,
    /// BOF of a file product.
    FileTransferStart = 5,
    /// Ask the receiver to report its history statistics.
    CollectStats = 13,
    /// Operator command text for the receiver.
    ExecuteCommand = 14,
    /// Reset the receiver's history statistics.
    ResetStats = 15,
    /// Set the receiver's simulated loss rate (per mille, in text).
    SetLossRate = 16,
}

impl AnnounceKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            3 => Some(AnnounceKind::MemoryTransferStart),
            5 => Some(AnnounceKind::FileTransferStart),
            13 => Some(AnnounceKind::CollectStats),
            14 => Some(AnnounceKind::ExecuteCommand),
            15 => Some(AnnounceKind::ResetStats),
            16 => Some(AnnounceKind::SetLossRate),
            _ => None,
        }
    }
}

// ─── Announcement Body ──────────────────────────────────────────────────────

/// Body of BOF packets and of back-channel SENDER_MSG_EXP packets.
///
/// The text field is fixed at [`ANNOUNCE_TEXT_LEN`] bytes on the wire,
/// NUL-padded; it carries the product name for BOFs and the command
/// argument for operator messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub kind: AnnounceKind,
    pub product_id: u32,
    /// Product size in bytes (BOF) or argument length (commands).
    pub size: u32,
    pub text: String,
    /// Sender-side timestamp, seconds since the sender started.
    pub timestamp: f64,
}

impl Announcement {
    pub fn new(kind: AnnounceKind, product_id: u32, size: u32, text: &str, timestamp: f64) -> Self {
        Announcement {
            kind,
            product_id,
            size,
            text: text.to_owned(),
            timestamp,
        }
    }

    /// Encode into a buffer; writes exactly [`ANNOUNCE_BODY_LEN`] bytes.
    /// Text longer than the field is truncated at a char boundary.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.kind as u32);
        buf.put_u32(self.product_id);
        buf.put_u32(self.size);
        let mut text = self.text.as_bytes();
        if text.len() > ANNOUNCE_TEXT_LEN {
            let mut end = ANNOUNCE_TEXT_LEN;
            while !self.text.is_char_boundary(end) {
                end -= 1;
            }
            text = &text[..end];
        }
        buf.put_slice(text);
        buf.put_bytes(0, ANNOUNCE_TEXT_LEN - text.len());
        buf.put_f64(self.timestamp);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < ANNOUNCE_BODY_LEN {
            return Err(TransportError::MalformedHeader("short announcement"));
        }
        let kind = AnnounceKind::from_u32(buf.get_u32())
            .ok_or(TransportError::MalformedHeader("unknown announcement kind"))?;
        let product_id = buf.get_u32();
        let size = buf.get_u32();
        let mut text_raw = [0u8; ANNOUNCE_TEXT_LEN];
        buf.copy_to_slice(&mut text_raw);
        let end = text_raw.iter().position(|&b| b == 0).unwrap_or(ANNOUNCE_TEXT_LEN);
        let text = std::str::from_utf8(&text_raw[..end])
            .map_err(|_| TransportError::MalformedHeader("announcement text not utf-8"))?
            .to_owned();
        let timestamp = buf.get_f64();
        Ok(Announcement {
            kind,
            product_id,
            size,
            text,
            timestamp,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ANNOUNCE_BODY_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

// ─── Retransmission Request ─────────────────────────────────────────────────

/// Body of a RETRANS_REQ packet: a half-open byte range the receiver is
/// missing from one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransRequest {
    pub product_id: u32,
    /// First missing byte offset.
    pub seq: u32,
    /// Length of the missing range in bytes.
    pub data_len: u32,
}

impl RetransRequest {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.product_id);
        buf.put_u32(self.seq);
        buf.put_u32(self.data_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RETRANS_REQ_BODY_LEN {
            return Err(TransportError::MalformedHeader("short retrans request"));
        }
        Ok(RetransRequest {
            product_id: buf.get_u32(),
            seq: buf.get_u32(),
            data_len: buf.get_u32(),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RETRANS_REQ_BODY_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

// ─── Packet Assembly ────────────────────────────────────────────────────────

/// Serialize a header and body into one contiguous datagram/frame.
pub fn build_packet(header: &PacketHeader, body: &[u8]) -> Bytes {
    debug_assert_eq!(header.data_len as usize, body.len());
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let hdr = PacketHeader::data(7, 1444 * 3, 1444);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = PacketHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, hdr);
        assert!(decoded.is_data());
    }

    #[test]
    fn header_rejects_short_buffer() {
        let mut buf = Bytes::from_static(&[0u8; HEADER_LEN - 1]);
        assert!(matches!(
            PacketHeader::decode(&mut buf),
            Err(TransportError::MalformedHeader(_))
        ));
    }

    #[test]
    fn header_rejects_unknown_flags() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0x8000); // outside KNOWN_MASK
        assert!(matches!(
            PacketHeader::decode(&mut buf.freeze()),
            Err(TransportError::MalformedHeader(_))
        ));
    }

    #[test]
    fn all_flag_bits_are_distinct() {
        let bits = [
            flags::BOF,
            flags::EOF,
            flags::SENDER_MSG_EXP,
            flags::RETRANS_REQ,
            flags::RETRANS_DATA,
            flags::RETRANS_END,
            flags::RETRANS_TIMEOUT,
            flags::BOF_REQ,
            flags::HISTORY_STATS,
        ];
        let mut seen = 0u32;
        for b in bits {
            assert_eq!(b.count_ones(), 1, "{b:#x} is not a single bit");
            assert_eq!(seen & b, 0, "{b:#x} overlaps another flag");
            seen |= b;
        }
        assert_eq!(seen, flags::KNOWN_MASK);
        assert_eq!(flags::DATA, 0);
    }

    #[test]
    fn announcement_roundtrip() {
        let ann = Announcement::new(
            AnnounceKind::FileTransferStart,
            42,
            1_048_576,
            "surface_obs_20260801.grib2",
            12.75,
        );
        let bytes = ann.to_bytes();
        assert_eq!(bytes.len(), ANNOUNCE_BODY_LEN);
        let decoded = Announcement::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, ann);
    }

    #[test]
    fn announcement_truncates_oversized_text() {
        let long = "x".repeat(ANNOUNCE_TEXT_LEN + 40);
        let ann = Announcement::new(AnnounceKind::ExecuteCommand, 0, 0, &long, 0.0);
        let bytes = ann.to_bytes();
        assert_eq!(bytes.len(), ANNOUNCE_BODY_LEN);
        let decoded = Announcement::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded.text.len(), ANNOUNCE_TEXT_LEN);
    }

    #[test]
    fn announcement_rejects_unknown_kind() {
        let ann = Announcement::new(AnnounceKind::ResetStats, 1, 0, "", 0.0);
        let mut raw = BytesMut::from(&ann.to_bytes()[..]);
        raw[0..4].copy_from_slice(&999u32.to_be_bytes());
        assert!(matches!(
            Announcement::decode(&mut raw.freeze()),
            Err(TransportError::MalformedHeader(_))
        ));
    }

    #[test]
    fn retrans_request_roundtrip() {
        let req = RetransRequest {
            product_id: 9,
            seq: 28_880,
            data_len: 4_332,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), RETRANS_REQ_BODY_LEN);
        assert_eq!(RetransRequest::decode(&mut bytes.clone()).unwrap(), req);
    }

    #[test]
    fn build_packet_concatenates() {
        let hdr = PacketHeader::data(3, 0, 5);
        let pkt = build_packet(&hdr, b"hello");
        assert_eq!(pkt.len(), HEADER_LEN + 5);
        let mut buf = pkt.clone();
        let decoded = PacketHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(&buf[..], b"hello");
    }
}
