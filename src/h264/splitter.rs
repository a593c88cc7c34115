//! STAP-A aggregate splitting (RFC 3984 §5.7).

use std::collections::VecDeque;

use super::{NAL_TYPE_STAP_A, NalUnit};

/// Splits STAP-A aggregates into their component NAL units.
///
/// The STAP-A payload is a list of `[2-byte big-endian size][NALU bytes]`
/// entries following the STAP-A NAL header byte. Each extracted unit is an
/// independently owned [`NalUnit`] (a zero-copy slice of the aggregate's
/// buffer); the aggregate itself is released after extraction.
#[derive(Debug, Default)]
pub struct StapASplitter {
    nalus: VecDeque<NalUnit>,
}

impl StapASplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the sub-units of `stap` into the internal queue.
    pub fn feed(&mut self, stap: NalUnit) {
        if stap.nal_type() != NAL_TYPE_STAP_A {
            tracing::warn!(
                nal_type = stap.nal_type(),
                "non-STAP-A unit fed to splitter"
            );
            return;
        }

        let payload = stap.payload();
        let mut offset = 0usize;
        while payload.len() - offset >= 2 {
            let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if size == 0 || offset + size > payload.len() {
                tracing::warn!(
                    size,
                    remaining = payload.len() - offset,
                    "truncated STAP-A entry, stopping extraction"
                );
                break;
            }
            self.nalus
                .push_back(NalUnit::new(payload.slice(offset..offset + size)));
            offset += size;
        }
    }

    /// Queue of extracted NAL units, drained by the caller.
    pub fn nalus(&mut self) -> &mut VecDeque<NalUnit> {
        &mut self.nalus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::nal_header_byte;

    fn stap_a(units: &[&[u8]]) -> NalUnit {
        let mut data = vec![nal_header_byte(3, NAL_TYPE_STAP_A)];
        for unit in units {
            data.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            data.extend_from_slice(unit);
        }
        NalUnit::new(data.into())
    }

    #[test]
    fn splits_two_units() {
        let mut splitter = StapASplitter::new();
        splitter.feed(stap_a(&[&[0x67, 0x42], &[0x68, 0xCE, 0x38]]));
        let nalus = splitter.nalus();
        assert_eq!(nalus.len(), 2);
        assert_eq!(nalus[0].as_bytes(), &[0x67, 0x42]);
        assert_eq!(nalus[1].as_bytes(), &[0x68, 0xCE, 0x38]);
    }

    #[test]
    fn truncated_entry_stops_extraction() {
        let mut splitter = StapASplitter::new();
        // first entry valid, second declares 10 bytes but carries 1
        let mut data = vec![nal_header_byte(0, NAL_TYPE_STAP_A)];
        data.extend_from_slice(&[0x00, 0x02, 0x67, 0x42]);
        data.extend_from_slice(&[0x00, 0x0A, 0x68]);
        splitter.feed(NalUnit::new(data.into()));
        assert_eq!(splitter.nalus().len(), 1);
    }

    #[test]
    fn non_stap_input_ignored() {
        let mut splitter = StapASplitter::new();
        splitter.feed(NalUnit::new(vec![0x65, 0xAA].into()));
        assert!(splitter.nalus().is_empty());
    }

    #[test]
    fn empty_payload_yields_nothing() {
        let mut splitter = StapASplitter::new();
        splitter.feed(NalUnit::new(vec![nal_header_byte(0, NAL_TYPE_STAP_A)].into()));
        assert!(splitter.nalus().is_empty());
    }
}
