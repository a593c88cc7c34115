//! RTP unpacker / frame reassembler for H.264 (RFC 3984).

use std::collections::VecDeque;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use base64::prelude::{BASE64_STANDARD, Engine as _};
use bytes::Bytes;

use super::aggregator::{FeedResult, FuaAggregator};
use super::splitter::StapASplitter;
use super::{NAL_TYPE_FU_A, NAL_TYPE_IDR, NAL_TYPE_NON_IDR, NAL_TYPE_PPS, NAL_TYPE_SPS, NAL_TYPE_STAP_A, NalUnit};
use crate::error::{MediaError, Result};
use crate::rtp::RtpPacket;

/// Sentinel for "no timestamp seen yet"; an arbitrary value that a first
/// packet is unlikely to carry, so the initial packet never triggers a
/// spurious timestamp-change flush.
const LAST_TS_INIT: u32 = 0x943F_EA43;

/// Per-call result bitmask of [`Unpacker::unpack`].
///
/// Recomputed on every call; never persisted by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct UnpackerStatus(u32);

impl UnpackerStatus {
    /// A complete frame was pushed to the output queue.
    pub const FRAME_AVAILABLE: Self = Self(1 << 0);
    /// The emitted frame lost packets or had a broken fragment sequence.
    pub const FRAME_CORRUPTED: Self = Self(1 << 1);
    /// The emitted frame is a keyframe (IDR present, or the I-slice heuristic).
    pub const IS_KEY_FRAME: Self = Self(1 << 2);
    /// An SPS with new content was received.
    pub const NEW_SPS: Self = Self(1 << 3);
    /// A PPS with new content was received.
    pub const NEW_PPS: Self = Self(1 << 4);
    /// The emitted frame contains an SPS.
    pub const HAS_SPS: Self = Self(1 << 5);
    /// The emitted frame contains a PPS.
    pub const HAS_PPS: Self = Self(1 << 6);
    /// The emitted frame contains an IDR slice.
    pub const HAS_IDR: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for UnpackerStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for UnpackerStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for UnpackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(UnpackerStatus, &str); 8] = [
            (UnpackerStatus::FRAME_AVAILABLE, "FRAME_AVAILABLE"),
            (UnpackerStatus::FRAME_CORRUPTED, "FRAME_CORRUPTED"),
            (UnpackerStatus::IS_KEY_FRAME, "IS_KEY_FRAME"),
            (UnpackerStatus::NEW_SPS, "NEW_SPS"),
            (UnpackerStatus::NEW_PPS, "NEW_PPS"),
            (UnpackerStatus::HAS_SPS, "HAS_SPS"),
            (UnpackerStatus::HAS_PPS, "HAS_PPS"),
            (UnpackerStatus::HAS_IDR, "HAS_IDR"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

/// Reconstructs decodable frames from RTP packets carrying H.264 payloads.
///
/// Packets must be fed in sequence-number order; there is no jitter buffer
/// here. Sequence gaps are detected against an internal reference counter
/// and flag the frame as corrupted, but processing continues (best-effort
/// resynchronization). Corrupted frames are still emitted — the downstream
/// decoder decides whether to discard them.
///
/// A frame is emitted on the marker bit, or when the timestamp changes
/// with NALUs still accumulated (guard against a missed marker).
///
/// SPS/PPS NALUs are tracked as they pass through: content changes raise
/// [`NEW_SPS`](UnpackerStatus::NEW_SPS)/[`NEW_PPS`](UnpackerStatus::NEW_PPS),
/// byte-identical repeats raise nothing. Out-of-band parameter sets can be
/// injected and are prepended to the next keyframe's output.
///
/// Callers must serialize access to one instance (single-producer,
/// single-consumer per session); there is no internal locking.
#[derive(Debug, Default)]
pub struct Unpacker {
    frame: VecDeque<NalUnit>,
    pending: UnpackerStatus,
    last_ts: u32,
    ref_seq: u16,
    ref_seq_initialized: bool,
    aggregator: FuaAggregator,
    splitter: StapASplitter,
    oob_sps: Option<NalUnit>,
    oob_pps: Option<NalUnit>,
    last_sps: Option<NalUnit>,
    last_pps: Option<NalUnit>,
}

impl Unpacker {
    pub fn new() -> Self {
        Self {
            last_ts: LAST_TS_INIT,
            ..Self::default()
        }
    }

    /// Inject out-of-band SPS/PPS (e.g. from SDP).
    ///
    /// They are prepended to the next keyframe's output, and serve as the
    /// negotiated sets until replaced by in-band parameter sets.
    pub fn set_out_of_band_parameter_sets(&mut self, sps: NalUnit, pps: NalUnit) {
        self.oob_sps = Some(sps);
        self.oob_pps = Some(pps);
    }

    /// Inject out-of-band SPS/PPS from an SDP `sprop-parameter-sets`
    /// attribute value: two base64-encoded NALUs separated by a comma
    /// (RFC 6184 §8.1).
    pub fn set_out_of_band_from_sprop(&mut self, sprop: &str) -> Result<()> {
        let (sps_b64, pps_b64) = sprop
            .split_once(',')
            .ok_or(MediaError::InvalidSprop("expected two comma-separated sets"))?;
        let sps = BASE64_STANDARD
            .decode(sps_b64.trim())
            .map_err(|_| MediaError::InvalidSprop("bad base64 in SPS"))?;
        let pps = BASE64_STANDARD
            .decode(pps_b64.trim())
            .map_err(|_| MediaError::InvalidSprop("bad base64 in PPS"))?;
        if sps.is_empty() || pps.is_empty() {
            return Err(MediaError::InvalidSprop("empty parameter set"));
        }
        self.set_out_of_band_parameter_sets(
            NalUnit::new(Bytes::from(sps)),
            NalUnit::new(Bytes::from(pps)),
        );
        Ok(())
    }

    /// Process one RTP packet; completed frames are appended to `out` as
    /// sequences of NAL units.
    pub fn unpack(&mut self, packet: &RtpPacket, out: &mut VecDeque<NalUnit>) -> UnpackerStatus {
        let mut ret = UnpackerStatus::empty();

        if packet.payload.is_empty() {
            tracing::warn!(seq = packet.sequence, "empty RTP payload");
            self.pending |= UnpackerStatus::FRAME_CORRUPTED;
            return ret;
        }
        let nalu = NalUnit::new(packet.payload.clone());

        // A new frame is arriving: if the previous frame's marker bit was
        // missed, output the accumulated NALUs now. Skipped while a FU-A
        // series is open (workaround for buggy fragmenting senders).
        if self.last_ts != packet.timestamp {
            self.last_ts = packet.timestamp;
            if !self.aggregator.is_aggregating() && !self.frame.is_empty() {
                tracing::debug!("frame received without marker");
                ret = self.output_frame(out, UnpackerStatus::FRAME_AVAILABLE);
            }
        }

        if self.ref_seq_initialized {
            self.ref_seq = self.ref_seq.wrapping_add(1);
            if self.ref_seq != packet.sequence {
                tracing::debug!(
                    expected = self.ref_seq,
                    got = packet.sequence,
                    "sequence discontinuity detected"
                );
                self.pending |= UnpackerStatus::FRAME_CORRUPTED;
                self.ref_seq = packet.sequence;
                self.aggregator.reset();
            }
        } else {
            self.ref_seq_initialized = true;
            self.ref_seq = packet.sequence;
        }

        match nalu.nal_type() {
            NAL_TYPE_FU_A => match self.aggregator.feed(nalu) {
                FeedResult::Complete(whole) => self.store_nal(whole),
                FeedResult::Aggregating => {}
                FeedResult::Corrupted => {
                    self.pending |= UnpackerStatus::FRAME_CORRUPTED;
                }
            },
            NAL_TYPE_STAP_A => {
                self.splitter.feed(nalu);
                while let Some(sub) = self.splitter.nalus().pop_front() {
                    self.store_nal(sub);
                }
            }
            _ => self.store_nal(nalu),
        }

        if packet.marker {
            self.last_ts = packet.timestamp;
            ret |= self.output_frame(out, UnpackerStatus::FRAME_AVAILABLE);
        }

        ret
    }

    /// Queue a reassembled NALU, intercepting parameter sets.
    fn store_nal(&mut self, nal: NalUnit) {
        match nal.nal_type() {
            NAL_TYPE_SPS => {
                if update_parameter_set(&mut self.last_sps, &nal) {
                    tracing::debug!(bytes = nal.len(), "new SPS received");
                    self.pending |= UnpackerStatus::NEW_SPS;
                }
            }
            NAL_TYPE_PPS => {
                if update_parameter_set(&mut self.last_pps, &nal) {
                    tracing::debug!(bytes = nal.len(), "new PPS received");
                    self.pending |= UnpackerStatus::NEW_PPS;
                }
            }
            _ => {}
        }
        self.frame.push_back(nal);
    }

    /// Transfer the reassembly queue to `out`, computing frame flags, and
    /// clear internal per-frame state.
    fn output_frame(&mut self, out: &mut VecDeque<NalUnit>, flags: UnpackerStatus) -> UnpackerStatus {
        let mut res = self.pending | flags;

        for nalu in &self.frame {
            match nalu.nal_type() {
                NAL_TYPE_IDR => {
                    res |= UnpackerStatus::HAS_IDR | UnpackerStatus::IS_KEY_FRAME;
                }
                NAL_TYPE_SPS => res |= UnpackerStatus::HAS_SPS,
                NAL_TYPE_PPS => res |= UnpackerStatus::HAS_PPS,
                _ => {}
            }
        }
        if !res.contains(UnpackerStatus::HAS_IDR) {
            // Heuristic for encoders that send key pictures without the IDR
            // NAL type: slice_type 7 declares every slice of the picture an
            // I slice, and with first_mb_in_slice == 0 the slice header's
            // first byte is 0x88. Not a guaranteed keyframe detector.
            let unique_i_slice = self
                .frame
                .iter()
                .any(|n| n.nal_type() == NAL_TYPE_NON_IDR && n.payload().first() == Some(&0x88));
            if unique_i_slice {
                tracing::debug!("I frame without IDR slice detected");
                res |= UnpackerStatus::IS_KEY_FRAME;
            }
        }

        if res.contains(UnpackerStatus::IS_KEY_FRAME) {
            if let (Some(sps), Some(pps)) = (self.oob_sps.take(), self.oob_pps.take()) {
                tracing::debug!("prepending out-of-band SPS/PPS to keyframe");
                out.push_back(sps);
                out.push_back(pps);
                res |= UnpackerStatus::HAS_SPS | UnpackerStatus::HAS_PPS;
            }
        }

        out.append(&mut self.frame);
        self.pending = UnpackerStatus::empty();
        res
    }
}

/// Replace `stored` when `new` carries different content.
///
/// Returns true when the parameter set is genuinely new (no stored copy,
/// or byte-for-byte different); identical repeats are suppressed.
fn update_parameter_set(stored: &mut Option<NalUnit>, new: &NalUnit) -> bool {
    match stored {
        Some(old) if old.as_bytes() == new.as_bytes() => false,
        _ => {
            *stored = Some(new.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::nal_header_byte;

    fn packet(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            sequence: seq,
            timestamp: ts,
            marker,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn single_nal_frame_on_marker() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let status = u.unpack(&packet(0, 1000, true, &[0x65, 0xAA]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(status.contains(UnpackerStatus::IS_KEY_FRAME));
        assert!(status.contains(UnpackerStatus::HAS_IDR));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), &[0x65, 0xAA]);
    }

    #[test]
    fn accumulates_until_marker() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let status = u.unpack(&packet(0, 1000, false, &[0x67, 0x42]), &mut out);
        assert!(status.is_empty());
        assert!(out.is_empty());
        let status = u.unpack(&packet(1, 1000, true, &[0x65, 0xAA]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(status.contains(UnpackerStatus::HAS_SPS));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn timestamp_change_flushes_missed_marker_frame() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        u.unpack(&packet(0, 1000, false, &[0x61, 0x10]), &mut out);
        assert!(out.is_empty());
        // next frame starts; previous frame had no marker
        let status = u.unpack(&packet(1, 2000, true, &[0x61, 0x20]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn sequence_gap_marks_frame_corrupted() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        u.unpack(&packet(0, 1000, false, &[0x61, 0x10]), &mut out);
        let status = u.unpack(&packet(5, 1000, true, &[0x61, 0x20]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(status.contains(UnpackerStatus::FRAME_CORRUPTED));
        // corrupted frame is still emitted
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn corruption_flag_not_sticky_across_frames() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        u.unpack(&packet(0, 1000, false, &[0x61, 0x10]), &mut out);
        let status = u.unpack(&packet(5, 1000, true, &[0x61, 0x20]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_CORRUPTED));
        out.clear();
        let status = u.unpack(&packet(6, 2000, true, &[0x61, 0x30]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(!status.contains(UnpackerStatus::FRAME_CORRUPTED));
    }

    #[test]
    fn fua_fragments_reassembled() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let indicator = nal_header_byte(3, NAL_TYPE_FU_A);
        u.unpack(&packet(0, 1000, false, &[indicator, 0x80 | NAL_TYPE_IDR, 0x01]), &mut out);
        u.unpack(&packet(1, 1000, false, &[indicator, NAL_TYPE_IDR, 0x02]), &mut out);
        let status = u.unpack(
            &packet(2, 1000, true, &[indicator, 0x40 | NAL_TYPE_IDR, 0x03]),
            &mut out,
        );
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(status.contains(UnpackerStatus::IS_KEY_FRAME));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_bytes(), &[0x65, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn stap_a_expanded_into_sub_units() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let mut payload = vec![nal_header_byte(3, NAL_TYPE_STAP_A)];
        payload.extend_from_slice(&[0x00, 0x02, 0x67, 0x42]);
        payload.extend_from_slice(&[0x00, 0x02, 0x68, 0xCE]);
        let status = u.unpack(&packet(0, 1000, true, &payload), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(status.contains(UnpackerStatus::HAS_SPS));
        assert!(status.contains(UnpackerStatus::HAS_PPS));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_bytes(), &[0x67, 0x42]);
        assert_eq!(out[1].as_bytes(), &[0x68, 0xCE]);
    }

    #[test]
    fn new_sps_raised_once_per_content_change() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let s1 = u.unpack(&packet(0, 1000, true, &[0x67, 0x42, 0x00]), &mut out);
        assert!(s1.contains(UnpackerStatus::NEW_SPS));
        // identical repeat: no duplicate raise
        let s2 = u.unpack(&packet(1, 2000, true, &[0x67, 0x42, 0x00]), &mut out);
        assert!(!s2.contains(UnpackerStatus::NEW_SPS));
        assert!(s2.contains(UnpackerStatus::HAS_SPS));
        // byte-distinct SPS: raised again
        let s3 = u.unpack(&packet(2, 3000, true, &[0x67, 0x42, 0x01]), &mut out);
        assert!(s3.contains(UnpackerStatus::NEW_SPS));
    }

    #[test]
    fn unique_i_slice_heuristic_tags_keyframe() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let status = u.unpack(&packet(0, 1000, true, &[0x61, 0x88, 0x00]), &mut out);
        assert!(status.contains(UnpackerStatus::IS_KEY_FRAME));
        assert!(!status.contains(UnpackerStatus::HAS_IDR));
    }

    #[test]
    fn non_i_slice_not_tagged_keyframe() {
        let mut u = Unpacker::new();
        let mut out = VecDeque::new();
        let status = u.unpack(&packet(0, 1000, true, &[0x61, 0x9A, 0x00]), &mut out);
        assert!(status.contains(UnpackerStatus::FRAME_AVAILABLE));
        assert!(!status.contains(UnpackerStatus::IS_KEY_FRAME));
    }

    #[test]
    fn out_of_band_sets_prepended_to_keyframe() {
        let mut u = Unpacker::new();
        u.set_out_of_band_parameter_sets(
            NalUnit::new(Bytes::from_static(&[0x67, 0x42])),
            NalUnit::new(Bytes::from_static(&[0x68, 0xCE])),
        );
        let mut out = VecDeque::new();
        // non-keyframe first: sets stay stored
        u.unpack(&packet(0, 1000, true, &[0x61, 0x00]), &mut out);
        assert_eq!(out.len(), 1);
        out.clear();
        let status = u.unpack(&packet(1, 2000, true, &[0x65, 0xAA]), &mut out);
        assert!(status.contains(UnpackerStatus::HAS_SPS));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_bytes(), &[0x67, 0x42]);
        assert_eq!(out[1].as_bytes(), &[0x68, 0xCE]);
        assert_eq!(out[2].as_bytes(), &[0x65, 0xAA]);
        // consumed: the next keyframe gets only its own NALUs
        out.clear();
        u.unpack(&packet(2, 3000, true, &[0x65, 0xBB]), &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn sprop_parameter_sets_parsed() {
        let mut u = Unpacker::new();
        u.set_out_of_band_from_sprop("Z0IAHg==,aM44gA==").unwrap();
        assert!(u.oob_sps.is_some());
        assert_eq!(u.oob_sps.as_ref().unwrap().nal_type(), NAL_TYPE_SPS);
        assert_eq!(u.oob_pps.as_ref().unwrap().nal_type(), NAL_TYPE_PPS);
    }

    #[test]
    fn sprop_without_comma_rejected() {
        let mut u = Unpacker::new();
        assert!(u.set_out_of_band_from_sprop("Z0IAHg==").is_err());
    }

    #[test]
    fn status_debug_lists_flags() {
        let status = UnpackerStatus::FRAME_AVAILABLE | UnpackerStatus::IS_KEY_FRAME;
        let s = format!("{status:?}");
        assert!(s.contains("FRAME_AVAILABLE"));
        assert!(s.contains("IS_KEY_FRAME"));
    }
}
