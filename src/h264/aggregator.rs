//! FU-A fragment aggregation (RFC 3984 §5.8).

use bytes::{BufMut, BytesMut};

use super::{NAL_TYPE_FU_A, NalUnit, nal_header_byte};

/// Outcome of feeding one FU-A fragment to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// Fragment accepted, NALU not complete yet.
    Aggregating,
    /// End fragment received: the reconstructed NALU.
    Complete(NalUnit),
    /// Fragment sequence was broken; any partial buffer was dropped.
    ///
    /// A start fragment arriving while a previous series is still open
    /// drops the stale series but begins accumulating the new one, so a
    /// later end fragment can still complete it (best-effort resync).
    Corrupted,
}

/// Merges FU-A fragments back into whole NAL units.
///
/// On a start fragment the original NAL header byte is reconstructed from
/// the FU indicator's NRI and the FU header's type field, and accumulation
/// begins. Middle fragments append their payload; the end fragment emits
/// the reconstructed NALU and clears state.
#[derive(Debug, Default)]
pub struct FuaAggregator {
    buf: Option<BytesMut>,
    nal_type: u8,
}

impl FuaAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one FU-A fragment.
    pub fn feed(&mut self, fragment: NalUnit) -> FeedResult {
        if fragment.nal_type() != NAL_TYPE_FU_A || fragment.len() < 2 {
            tracing::warn!(
                nal_type = fragment.nal_type(),
                len = fragment.len(),
                "non-FU-A unit fed to aggregator"
            );
            self.reset();
            return FeedResult::Corrupted;
        }

        let bytes = fragment.as_bytes();
        let fu_header = bytes[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let orig_type = fu_header & 0x1f;
        let mut corrupted = false;

        if start {
            if self.buf.is_some() {
                tracing::warn!("FU-A start received while a previous series is unfinished");
                corrupted = true;
            }
            let mut buf = BytesMut::with_capacity(fragment.len());
            buf.put_u8(nal_header_byte(fragment.nri(), orig_type));
            buf.extend_from_slice(&bytes[2..]);
            self.buf = Some(buf);
            self.nal_type = orig_type;
        } else {
            match self.buf.as_mut() {
                Some(buf) if orig_type == self.nal_type => {
                    buf.extend_from_slice(&bytes[2..]);
                }
                Some(_) => {
                    tracing::warn!(
                        expected = self.nal_type,
                        got = orig_type,
                        "FU-A type changed mid-series"
                    );
                    self.reset();
                    return FeedResult::Corrupted;
                }
                None => {
                    tracing::warn!("FU-A continuation without a start fragment");
                    return FeedResult::Corrupted;
                }
            }
        }

        if corrupted {
            FeedResult::Corrupted
        } else if end {
            match self.buf.take() {
                Some(buf) => FeedResult::Complete(NalUnit::new(buf.freeze())),
                None => FeedResult::Corrupted,
            }
        } else {
            FeedResult::Aggregating
        }
    }

    /// Whether a partial aggregation is in progress.
    pub fn is_aggregating(&self) -> bool {
        self.buf.is_some()
    }

    /// Discard any partial state without emitting (used on re-sync).
    pub fn reset(&mut self) {
        self.buf = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::NAL_TYPE_IDR;

    fn fragment(start: bool, end: bool, nal_type: u8, payload: &[u8]) -> NalUnit {
        let fu_header = ((start as u8) << 7) | ((end as u8) << 6) | nal_type;
        let mut data = vec![nal_header_byte(3, NAL_TYPE_FU_A), fu_header];
        data.extend_from_slice(payload);
        NalUnit::new(data.into())
    }

    #[test]
    fn three_fragment_series() {
        let mut agg = FuaAggregator::new();
        assert_eq!(
            agg.feed(fragment(true, false, NAL_TYPE_IDR, &[0x01, 0x02])),
            FeedResult::Aggregating
        );
        assert!(agg.is_aggregating());
        assert_eq!(
            agg.feed(fragment(false, false, NAL_TYPE_IDR, &[0x03])),
            FeedResult::Aggregating
        );
        let out = agg.feed(fragment(false, true, NAL_TYPE_IDR, &[0x04]));
        let FeedResult::Complete(nalu) = out else {
            panic!("expected completed NALU, got {out:?}");
        };
        assert_eq!(nalu.as_bytes(), &[0x65, 0x01, 0x02, 0x03, 0x04]);
        assert!(!agg.is_aggregating());
    }

    #[test]
    fn single_fragment_with_both_bits() {
        let mut agg = FuaAggregator::new();
        let out = agg.feed(fragment(true, true, NAL_TYPE_IDR, &[0xAA]));
        let FeedResult::Complete(nalu) = out else {
            panic!("expected completed NALU");
        };
        assert_eq!(nalu.as_bytes(), &[0x65, 0xAA]);
    }

    #[test]
    fn continuation_without_start_is_corrupted() {
        let mut agg = FuaAggregator::new();
        assert_eq!(
            agg.feed(fragment(false, false, NAL_TYPE_IDR, &[0x01])),
            FeedResult::Corrupted
        );
        assert!(!agg.is_aggregating());
    }

    #[test]
    fn start_while_open_drops_stale_series() {
        let mut agg = FuaAggregator::new();
        agg.feed(fragment(true, false, NAL_TYPE_IDR, &[0x01]));
        assert_eq!(
            agg.feed(fragment(true, false, NAL_TYPE_IDR, &[0x10])),
            FeedResult::Corrupted
        );
        // the new series is still usable
        let out = agg.feed(fragment(false, true, NAL_TYPE_IDR, &[0x11]));
        let FeedResult::Complete(nalu) = out else {
            panic!("expected completed NALU");
        };
        assert_eq!(nalu.as_bytes(), &[0x65, 0x10, 0x11]);
    }

    #[test]
    fn type_change_mid_series_is_corrupted() {
        let mut agg = FuaAggregator::new();
        agg.feed(fragment(true, false, NAL_TYPE_IDR, &[0x01]));
        assert_eq!(
            agg.feed(fragment(false, true, 1, &[0x02])),
            FeedResult::Corrupted
        );
        assert!(!agg.is_aggregating());
    }

    #[test]
    fn non_fua_input_rejected() {
        let mut agg = FuaAggregator::new();
        let raw = NalUnit::new(vec![0x65, 0xAA].into());
        assert_eq!(agg.feed(raw), FeedResult::Corrupted);
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut agg = FuaAggregator::new();
        agg.feed(fragment(true, false, NAL_TYPE_IDR, &[0x01]));
        agg.reset();
        assert!(!agg.is_aggregating());
    }
}
