//! Error taxonomy for the command channel.
//!
//! Configuration errors fail fast before any I/O. Connection errors are
//! reported to the client-side caller with enough detail to tell a stopped
//! agent from a wrong endpoint name or a hijacked socket. Everything else is
//! transport I/O or a framing problem.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::properties::IpcType;

/// Errors raised by endpoint validation, property resolution, and transports.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("invalid endpoint name {0:?}: must be non-empty and contain no '/', '\\', '.', NUL or newline")]
    InvalidEndpointName(String),

    #[error("unknown IPC type '{0}' (expected socket, unix-socket or winpipe)")]
    UnknownIpcType(String),

    #[error("no properties provider handles IPC type {0}")]
    NoProvider(IpcType),

    #[error("{count} properties providers claim IPC type {ipc_type}")]
    AmbiguousProvider { ipc_type: IpcType, count: usize },

    #[error("malformed IPC properties in {}: {reason}", path.display())]
    MalformedProperties { path: PathBuf, reason: String },

    #[error("{0} transport is not available on this platform")]
    Unsupported(IpcType),

    #[error("rendezvous point {} does not exist; is the agent running?", .0.display())]
    RendezvousMissing(PathBuf),

    #[error("endpoint '{name}' does not exist at {location}")]
    EndpointMissing { name: String, location: String },

    #[error("{} is owned by uid {actual}, expected uid {expected}", path.display())]
    OwnershipMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("receiver '{0}' is already registered")]
    DuplicateReceiver(String),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IpcError {
    /// Whether this error stems from configuration and must not be retried.
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidEndpointName(_)
                | Self::UnknownIpcType(_)
                | Self::NoProvider(_)
                | Self::AmbiguousProvider { .. }
                | Self::MalformedProperties { .. }
                | Self::Unsupported(_)
                | Self::DuplicateReceiver(_)
        )
    }

    /// Whether this error describes a failed connection attempt.
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::RendezvousMissing(_) | Self::EndpointMissing { .. } | Self::OwnershipMismatch { .. }
        )
    }
}
