//! RTP packet model and fixed-header handling (RFC 3550 §5.1).

use bytes::Bytes;
use rand::RngExt;

use crate::error::{MediaError, Result, RtpParseErrorKind};

/// RTP fixed-header state shared by packetizers (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// It manages:
/// - **Sequence number**: 16-bit, wrapping — incremented on every packet.
/// - **Timestamp**: caller-supplied per access unit, constant across all
///   packets of that unit.
/// - **SSRC**: randomly generated per RFC 3550 §8.1 to avoid collisions.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0 on
/// the write path.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

impl RtpHeader {
    /// Create a new RTP header state with explicit SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: 0,
        }
    }

    /// Create with a random SSRC.
    ///
    /// Per RFC 3550 §8.1, the SSRC should be chosen randomly to minimize
    /// the probability of collisions between independent sessions.
    pub fn with_random_ssrc(pt: u8) -> Self {
        let ssrc = rand::rng().random::<u32>();
        Self::new(pt, ssrc)
    }

    /// Current sequence number (used for the next [`stamp`](Self::stamp) call).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Build an [`RtpPacket`] around `payload` and advance the sequence number.
    ///
    /// The `marker` bit (RFC 3550 §5.1) signals the last packet of a frame.
    /// For H.264, it is set on the last RTP packet of an access unit
    /// (RFC 6184 §5.1).
    pub fn stamp(&mut self, timestamp: u32, marker: bool, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            sequence: self.sequence,
            timestamp,
            marker,
            payload,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

/// One RTP packet: fixed-header fields plus the payload bytes.
///
/// Invariant: the marker bit is set exactly on the last packet of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Serialize to wire format: 12-byte fixed header followed by the payload.
    pub fn serialize(&self, pt: u8, ssrc: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.push(2 << 6);
        out.push(((self.marker as u8) << 7) | (pt & 0x7f));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&ssrc.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a wire-format RTP packet.
    ///
    /// CSRC entries and a header extension, if present, are skipped so that
    /// `payload` starts at the actual media bytes. The payload is a
    /// zero-copy slice of `data`.
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < 12 {
            return Err(MediaError::RtpParse {
                kind: RtpParseErrorKind::TooShort,
            });
        }
        if data[0] >> 6 != 2 {
            return Err(MediaError::RtpParse {
                kind: RtpParseErrorKind::UnsupportedVersion,
            });
        }
        let csrc_count = (data[0] & 0x0f) as usize;
        let has_extension = data[0] & 0x10 != 0;
        let marker = data[1] & 0x80 != 0;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

        let mut offset = 12 + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(MediaError::RtpParse {
                    kind: RtpParseErrorKind::TooShort,
                });
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }
        if data.len() < offset {
            return Err(MediaError::RtpParse {
                kind: RtpParseErrorKind::TooShort,
            });
        }

        Ok(Self {
            sequence,
            timestamp,
            marker,
            payload: data.slice(offset..),
        })
    }
}
