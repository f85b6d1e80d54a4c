//! Exclusive-ownership publishing over the shared-memory bus
//!
//! Every redundant publisher instance writes to the same logical channel,
//! stamping each unit with its instance id and strength. The bus itself
//! (iceoryx2 publish-subscribe) has no ownership QoS, so arbitration is an
//! explicit contract carried in the unit header: subscribers track which
//! publishers are live — observed emitting within the liveliness timeout —
//! and deliver only units from the highest-strength live instance. When the
//! owner goes silent past its timeout, ownership passes to the next
//! strongest survivor.

pub mod ownership;
pub mod publisher;
pub mod subscriber;

use std::time::Duration;

use iceoryx2::prelude::*;

pub use ownership::{OwnerTable, PublisherId};
pub use publisher::OwnershipPublisher;
pub use subscriber::{ChannelSubscriber, ReceivedUnit};

/// Flag bit marking a unit that starts with a keyframe
pub const FLAG_KEYFRAME: u32 = 1;

/// Largest access unit a publisher loans up front; the allocation strategy
/// grows the shared segment when a keyframe exceeds it.
pub const INITIAL_MAX_UNIT_BYTES: usize = 512 * 1024;

/// Identity of one publisher instance on a shared channel.
///
/// `strength` must be unique across the redundant publishers of one channel;
/// equal strengths are rejected at startup rather than arbitrated.
#[derive(Debug, Clone)]
pub struct OwnershipIdentity {
    pub channel_name: String,
    pub strength: i32,
    pub liveliness_timeout: Duration,
}

/// One encoded access unit as produced by the pipeline's publish sink.
///
/// `sequence` increases monotonically per publisher instance and resets on
/// process restart; subscribers must not assume monotonicity across a
/// failover.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub sequence: u64,
    pub keyframe: bool,
    pub pts_ns: Option<u64>,
    pub data: Vec<u8>,
}

/// Fixed-layout user header travelling with every unit on the bus.
#[derive(Debug, Default, Clone, Copy, ZeroCopySend)]
#[repr(C)]
pub struct UnitHeader {
    /// Random per-process instance id, distinguishing restarted publishers
    pub publisher_id: [u8; 16],
    /// Ownership strength of the emitting instance
    pub strength: i32,
    /// Per-instance monotonic sequence number
    pub sequence: u64,
    /// Presentation timestamp in nanoseconds (u64::MAX when unknown)
    pub pts_ns: u64,
    /// Bit 0: keyframe
    pub flags: u32,
}

/// Error type for channel setup
#[derive(Debug, thiserror::Error)]
pub enum PublishInitError {
    #[error("failed to create bus node: {0}")]
    Node(String),

    #[error("invalid channel name {0:?}: {1}")]
    ChannelName(String, String),

    #[error("failed to open channel service: {0}")]
    Service(String),

    #[error("failed to create bus port: {0}")]
    Port(String),

    #[error(
        "another live publisher on this channel already uses strength {strength}; \
         strengths must be unique for deterministic ownership"
    )]
    StrengthConflict { strength: i32 },
}

/// Error type for per-unit publish and receive operations
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to loan {size} bytes from the bus: {message}")]
    Loan { size: usize, message: String },

    #[error("failed to send unit {sequence}: {message}")]
    Send { sequence: u64, message: String },

    #[error("failed to receive from the bus: {0}")]
    Receive(String),
}
