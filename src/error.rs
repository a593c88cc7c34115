//! Error types for the media processing library.

use std::fmt;

/// Errors that can occur in the media processing library.
///
/// Variants map to specific failure modes across the crate:
///
/// - **Configuration**: [`UnsupportedSampleRate`](Self::UnsupportedSampleRate),
///   [`InvalidPort`](Self::InvalidPort), [`Unsupported`](Self::Unsupported) —
///   rejected at the control-method boundary; prior configuration is retained.
/// - **Parsing**: [`RtpParse`](Self::RtpParse),
///   [`InvalidSprop`](Self::InvalidSprop).
///
/// Protocol-level corruption (missing fragments, sequence gaps) is *not* an
/// error: it is reported through
/// [`UnpackerStatus`](crate::h264::unpacker::UnpackerStatus) flags and
/// processing continues.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Sample rate is not an integer multiple of 8000 Hz.
    #[error("unsupported sample rate: {0} Hz (must be a multiple of 8000)")]
    UnsupportedSampleRate(u32),

    /// Port number is outside the mixer's fixed channel table.
    #[error("invalid port number {port} (mixer has {max} ports)")]
    InvalidPort { port: usize, max: usize },

    /// Control operation accepted by the interface but not implemented.
    #[error("not implemented: {0}")]
    Unsupported(&'static str),

    /// Failed to parse an RTP packet (RFC 3550 §5.1).
    #[error("RTP parse error: {kind}")]
    RtpParse { kind: RtpParseErrorKind },

    /// Malformed `sprop-parameter-sets` string (RFC 6184 §8.1).
    #[error("invalid sprop-parameter-sets: {0}")]
    InvalidSprop(&'static str),
}

/// Specific kind of RTP parse failure.
#[derive(Debug)]
pub enum RtpParseErrorKind {
    /// Input shorter than the fixed header plus declared CSRC/extension data.
    TooShort,
    /// RTP version field is not 2.
    UnsupportedVersion,
}

impl fmt::Display for RtpParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "packet too short"),
            Self::UnsupportedVersion => write!(f, "unsupported RTP version"),
        }
    }
}

/// Convenience alias for `Result<T, MediaError>`.
pub type Result<T> = std::result::Result<T, MediaError>;
