//! Real-time channel connection management.
//!
//! This crate owns the join/publish/subscribe lifecycle of one broadcast
//! session, keeps it alive across network drops and credential expiry,
//! and exposes the transport behind traits so it can be driven by the
//! in-process loopback implementation in tests and demos.

mod client;
mod connection;
mod error;
mod loopback;
mod machine;
mod manager;

pub use client::{
    CredentialProvider, DisconnectReason, LinkState, LocalTracks, MediaDevices, MediaKind,
    RemoteTrack, RtcClient, TransportEvent,
};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use error::ConnectionError;
pub use loopback::{
    LoopbackClient, LoopbackCredentials, LoopbackHub, LoopbackTrack, SyntheticDevices,
    SyntheticTracks,
};
pub use machine::{Action, ConnectionMachine, Input};
pub use manager::{
    ConnectionDeps, ConnectionEvent, ConnectionManager, ConnectionOptions, ViewerCountCallback,
};

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Maximum rejoin attempts after an unexpected disconnect.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base rejoin delay in milliseconds.
pub const BASE_RECONNECT_DELAY_MS: u64 = 1000;

/// Upper bound on the rejoin delay in milliseconds.
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Consecutive in-place renewal failures before a full rejoin.
pub const MAX_RENEW_FAILURES: u32 = 2;

/// Upper bound for a single join attempt in milliseconds.
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 15_000;

/// Capacity of the transport event broadcast channel.
pub const TRANSPORT_EVENT_CAPACITY: usize = 64;
