//! Error taxonomy for the session core.
//!
//! Every failure that crosses the worker boundary is one of these kinds;
//! the bridge turns them into `on_error` callbacks rather than letting
//! them escape into the worker runtime.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error for every core operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("characteristic error: {0}")]
    Characteristic(#[from] CharacteristicError),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

impl CoreError {
    /// Stable kind label, used by sinks that route errors without
    /// matching on the full enum.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scan(_) => "ScanError",
            Self::Connection(_) => "ConnectionError",
            Self::Pairing(_) => "PairingError",
            Self::Characteristic(_) => "CharacteristicError",
            Self::Bridge(_) => "BridgeError",
        }
    }

    /// True when the link to the peripheral died mid-operation. The
    /// session reacts by running its normal teardown path.
    pub(crate) fn is_transport_loss(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::Lost(_)))
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("bluetooth radio unavailable")]
    RadioUnavailable,

    #[error("bluetooth permission denied by the platform")]
    PermissionDenied,

    #[error("scanning is unavailable while a connection is active")]
    Busy,

    #[error("discovery round failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection attempt timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("link lost: {0}")]
    Lost(String),

    #[error("a connection is already active")]
    Busy,

    #[error("no device connected")]
    NotConnected,
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("the radio stack does not expose bonding control")]
    Unsupported,

    #[error("pairing rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CharacteristicError {
    #[error("characteristic {0} is not readable")]
    NotReadable(Uuid),

    #[error("characteristic {0} is not writable")]
    NotWritable(Uuid),

    // Expected outcome of a native subscription attempt; the channel
    // falls back to polling instead of surfacing it.
    #[error("characteristic {0} does not support notifications")]
    NotifyUnsupported(Uuid),

    #[error("characteristic {0} is not part of the discovered services")]
    Unknown(Uuid),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("worker context is no longer running")]
    WorkerGone,

    #[error("operation panicked on the worker context")]
    TaskPanicked,

    #[error("failed to start worker thread: {0}")]
    Spawn(String),
}
