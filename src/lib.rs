//! RTP media plumbing for real-time pipelines: an RFC 3984 H.264
//! packetizer/depacketizer and a tick-driven PCM audio mixing engine.

pub mod error;
pub mod h264;
pub mod mixer;
pub mod rtp;

pub use error::{MediaError, Result};
pub use h264::packer::{Packer, PacketizationMode};
pub use h264::unpacker::{Unpacker, UnpackerStatus};
pub use h264::NalUnit;
pub use mixer::AudioMixer;
pub use rtp::{RtpHeader, RtpPacket};
