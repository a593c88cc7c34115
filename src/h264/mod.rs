//! H.264 NAL units and RFC 3984 RTP payload structuring.
//!
//! This module converts between H.264 Network Abstraction Layer Units
//! (NALUs) and RTP payloads per RFC 3984 (superseded by RFC 6184, same
//! wire format):
//!
//! - [`packer::Packer`] — NALUs → RTP packets, with FU-A fragmentation
//!   and optional STAP-A aggregation.
//! - [`unpacker::Unpacker`] — RTP packets → decodable frames (sequences
//!   of NALUs grouped by access unit), with parameter-set tracking and
//!   keyframe detection.
//! - [`aggregator::FuaAggregator`] / [`splitter::StapASplitter`] — the
//!   per-packet-type helpers the unpacker dispatches to.
//!
//! ## Payload byte layout
//!
//! ```text
//! NAL header:    [F|NRI|Type]                         (1 byte)
//! FU indicator:  [F|NRI|Type=28]                      (1 byte)
//! FU header:     [S|E|R|NAL_Type]                     (1 byte)
//! STAP-A:        [NAL header Type=24] ([size:2][NALU bytes])*
//! ```

pub mod aggregator;
pub mod packer;
pub mod splitter;
pub mod unpacker;

use bytes::Bytes;

/// Coded slice of a non-IDR picture.
pub const NAL_TYPE_NON_IDR: u8 = 1;
/// Coded slice of an IDR picture (keyframe).
pub const NAL_TYPE_IDR: u8 = 5;
/// Sequence parameter set.
pub const NAL_TYPE_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_TYPE_PPS: u8 = 8;
/// Single-time aggregation packet type A (RFC 3984 §5.7).
pub const NAL_TYPE_STAP_A: u8 = 24;
/// Fragmentation unit type A (RFC 3984 §5.8).
pub const NAL_TYPE_FU_A: u8 = 28;

/// Build a NAL header byte from its NRI and type fields.
pub(crate) fn nal_header_byte(nri: u8, nal_type: u8) -> u8 {
    ((nri & 0x3) << 5) | (nal_type & 0x1f)
}

/// One H.264 Network Abstraction Layer Unit.
///
/// Wraps a reference-counted byte buffer whose first byte is the NAL
/// header (`[F|NRI|Type]`). A `NalUnit` is passed along queues with a
/// single owner at a time; clones share the underlying buffer.
///
/// The buffer must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    data: Bytes,
}

impl NalUnit {
    /// Wrap an existing buffer. `data` must hold at least the NAL header byte.
    pub fn new(data: Bytes) -> Self {
        debug_assert!(!data.is_empty(), "NAL unit must carry a header byte");
        Self { data }
    }

    /// Build a NALU from header fields and payload, reconstructing the
    /// header byte as `(NRI << 5) | type`.
    pub fn from_header_fields(nri: u8, nal_type: u8, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(1 + payload.len());
        data.push(nal_header_byte(nri, nal_type));
        data.extend_from_slice(payload);
        Self { data: data.into() }
    }

    /// 5-bit NAL unit type.
    pub fn nal_type(&self) -> u8 {
        self.data[0] & 0x1f
    }

    /// 2-bit nal_ref_idc (reference importance).
    pub fn nri(&self) -> u8 {
        (self.data[0] >> 5) & 0x3
    }

    /// Everything after the NAL header byte, as a zero-copy slice.
    pub fn payload(&self) -> Bytes {
        self.data.slice(1..)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}
