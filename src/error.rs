//! Error types for the fleet controller

use thiserror::Error;

/// Result type for controller operations
pub type WcsResult<T> = Result<T, WcsError>;

/// Error types for the traffic and mission coordination engine
#[derive(Error, Debug)]
pub enum WcsError {
    /// External collaborator unreachable (transport, PLC, AMR endpoint)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A lock is held by another owner. Callers treat this as a control
    /// signal, not a failure.
    #[error("Lock held by {owner} on {key}")]
    LockHeld { key: String, owner: String },

    /// Physical sensor disagrees with cached state
    #[error("Drift detected: {0}")]
    Drift(String),

    /// Bad input at an ingress boundary; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// No path between the requested nodes
    #[error("No path from {from} to {to} on floor {floor}")]
    NoPath { from: String, to: String, floor: u32 },

    /// Node not present in the floor graph
    #[error("Node {0} not found")]
    NodeNotFound(String),

    /// Vehicle unknown to the state cache
    #[error("Vehicle {0} not found")]
    VehicleNotFound(String),

    /// Task record missing
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// Lifter tower unknown
    #[error("Lifter {0} not found")]
    LifterNotFound(String),

    /// A channel peer has shut down
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// An external call exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Map catalog could not be loaded; fatal at startup
    #[error("Map load failed: {0}")]
    MapLoad(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for WcsError {
    fn from(err: std::io::Error) -> Self {
        WcsError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for WcsError {
    fn from(err: serde_json::Error) -> Self {
        WcsError::Validation(format!("JSON error: {}", err))
    }
}
