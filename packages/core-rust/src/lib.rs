//! `PulseHA` Core: cluster configuration document, member model, wire schemas.

pub mod clock;
pub mod config;
pub mod messages;
pub mod types;

pub use clock::{elapsed_secs, ClockSource, ManualClock, SystemClock};
pub use config::{ClusterConfig, ConfigError, Node, PulseSettings};
pub use messages::{decode, encode, CodecError, ErrorCode};
pub use types::{
    format_rfc1123, parse_rfc1123, LogLevel, MemberRecord, MemberStatus, ZERO_TIMESTAMP,
};
