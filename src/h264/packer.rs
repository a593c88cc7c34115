//! RTP packer for H.264 NAL units (RFC 3984).

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::{NAL_TYPE_FU_A, NAL_TYPE_STAP_A, NalUnit, nal_header_byte};
use crate::rtp::{RtpHeader, RtpPacket};

/// Default maximum RTP payload size in bytes.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1400;

/// RFC 3984 packetization mode, negotiated once per session.
///
/// Changing the mode after streaming has started is undefined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketizationMode {
    /// One NALU per packet; oversized NALUs are FU-A fragmented.
    #[default]
    SingleNalUnit,
    /// Small consecutive NALUs may be aggregated into STAP-A packets.
    NonInterleaved,
}

/// Turns a sequence of NALUs into RTP payload packets.
///
/// Per access unit (all NALUs sharing one caller-supplied timestamp):
///
/// - NALUs no larger than the maximum payload size are sent unmodified
///   as Single NAL Unit packets (RFC 3984 §5.6).
/// - Larger NALUs are split into FU-A fragments (§5.8), each carrying a
///   FU indicator (NRI from the original NAL, type 28) and a FU header
///   (start/end bits plus the original 5-bit type).
/// - In non-interleaved mode with STAP-A enabled, consecutive small
///   NALUs are opportunistically merged into STAP-A aggregates (§5.7).
///
/// The marker bit is set only on the packet carrying the final
/// fragment/aggregate of the access unit; the sequence number increments
/// per packet.
#[derive(Debug)]
pub struct Packer {
    header: RtpHeader,
    mode: PacketizationMode,
    stap_a_enabled: bool,
    max_payload_size: usize,
}

impl Packer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mode: PacketizationMode::default(),
            stap_a_enabled: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            mode: PacketizationMode::default(),
            stap_a_enabled: false,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn set_mode(&mut self, mode: PacketizationMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> PacketizationMode {
        self.mode
    }

    /// Allow STAP-A aggregation in non-interleaved mode.
    ///
    /// Disabled by default: some phones don't decode STAP-A packets.
    pub fn enable_stap_a(&mut self, enabled: bool) {
        self.stap_a_enabled = enabled;
    }

    pub fn stap_a_enabled(&self) -> bool {
        self.stap_a_enabled
    }

    pub fn set_max_payload_size(&mut self, size: usize) {
        self.max_payload_size = size;
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Current sequence number (used for the next packet).
    pub fn sequence(&self) -> u16 {
        self.header.sequence()
    }

    /// Pack one access unit: drain `nalus` into RTP packets pushed onto
    /// `rtp_out`, all stamped with `timestamp`.
    pub fn pack(
        &mut self,
        nalus: &mut VecDeque<NalUnit>,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
    ) {
        match self.mode {
            PacketizationMode::SingleNalUnit => self.pack_single_nal_unit(nalus, rtp_out, timestamp),
            PacketizationMode::NonInterleaved => {
                self.pack_non_interleaved(nalus, rtp_out, timestamp)
            }
        }
    }

    fn pack_single_nal_unit(
        &mut self,
        nalus: &mut VecDeque<NalUnit>,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
    ) {
        while let Some(nalu) = nalus.pop_front() {
            let end = nalus.is_empty();
            if nalu.len() > self.max_payload_size {
                self.fragment_and_send(rtp_out, timestamp, nalu, end);
            } else {
                self.send(rtp_out, timestamp, nalu.into_bytes(), end);
            }
        }
    }

    fn pack_non_interleaved(
        &mut self,
        nalus: &mut VecDeque<NalUnit>,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
    ) {
        let mut pending: Vec<NalUnit> = Vec::new();
        // payload bytes the aggregate would occupy: STAP-A header byte
        // plus a 2-byte size prefix per unit
        let mut pending_size = 0usize;

        while let Some(nalu) = nalus.pop_front() {
            let end = nalus.is_empty();
            let size = nalu.len();

            if self.stap_a_enabled {
                if !pending.is_empty() {
                    if pending_size + size < self.max_payload_size - 2 {
                        pending_size += size + 2;
                        pending.push(nalu);
                        continue;
                    }
                    self.flush_pending(rtp_out, timestamp, &mut pending, false);
                    pending_size = 0;
                }
                if size < self.max_payload_size / 2 {
                    // try to aggregate with the next unit
                    pending_size = size + 3;
                    pending.push(nalu);
                } else if size > self.max_payload_size {
                    self.fragment_and_send(rtp_out, timestamp, nalu, end);
                } else {
                    self.send(rtp_out, timestamp, nalu.into_bytes(), end);
                }
            } else if size > self.max_payload_size {
                self.fragment_and_send(rtp_out, timestamp, nalu, end);
            } else {
                self.send(rtp_out, timestamp, nalu.into_bytes(), end);
            }
        }

        if !pending.is_empty() {
            self.flush_pending(rtp_out, timestamp, &mut pending, true);
        }
    }

    /// Send the pending aggregate: raw when it holds a single NALU,
    /// as a STAP-A packet otherwise.
    fn flush_pending(
        &mut self,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
        pending: &mut Vec<NalUnit>,
        marker: bool,
    ) {
        if pending.len() == 1 {
            let nalu = pending.remove(0);
            self.send(rtp_out, timestamp, nalu.into_bytes(), marker);
            return;
        }

        // STAP-A NRI is the maximum of the aggregated units (RFC 3984 §5.7)
        let nri = pending.iter().map(NalUnit::nri).max().unwrap_or(0);
        let total: usize = pending.iter().map(|n| 2 + n.len()).sum();
        let mut payload = BytesMut::with_capacity(1 + total);
        payload.put_u8(nal_header_byte(nri, NAL_TYPE_STAP_A));
        for nalu in pending.drain(..) {
            payload.put_u16(nalu.len() as u16);
            payload.extend_from_slice(nalu.as_bytes());
        }
        tracing::trace!(bytes = payload.len(), "sending STAP-A aggregate");
        self.send(rtp_out, timestamp, payload.freeze(), marker);
    }

    /// FU-A fragmentation (RFC 3984 §5.8).
    fn fragment_and_send(
        &mut self,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
        nalu: NalUnit,
        marker_on_last: bool,
    ) {
        let fu_indicator = nal_header_byte(nalu.nri(), NAL_TYPE_FU_A);
        let nal_type = nalu.nal_type();
        let payload = nalu.payload();

        let max_fragment = self.max_payload_size - 2; // FU indicator + FU header
        let mut offset = 0usize;
        let mut first = true;
        let mut fragments = 0usize;

        while offset < payload.len() {
            let remaining = payload.len() - offset;
            let last = remaining <= max_fragment;
            let chunk_size = max_fragment.min(remaining);

            // FU header: S=start, E=end, R=0, Type=original NAL type
            let start_bit = if first { 0x80 } else { 0x00 };
            let end_bit = if last { 0x40 } else { 0x00 };
            let fu_header = start_bit | end_bit | nal_type;

            let mut packet = BytesMut::with_capacity(2 + chunk_size);
            packet.put_u8(fu_indicator);
            packet.put_u8(fu_header);
            packet.extend_from_slice(&payload[offset..offset + chunk_size]);

            self.send(rtp_out, timestamp, packet.freeze(), marker_on_last && last);

            offset += chunk_size;
            first = false;
            fragments += 1;
        }

        tracing::trace!(nal_type, nal_size = payload.len() + 1, fragments, "FU-A fragmented NAL unit");
    }

    fn send(
        &mut self,
        rtp_out: &mut VecDeque<RtpPacket>,
        timestamp: u32,
        payload: Bytes,
        marker: bool,
    ) {
        rtp_out.push_back(self.header.stamp(timestamp, marker, payload));
    }
}
