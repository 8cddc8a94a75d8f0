//! Error types for the egress gateway
//!
//! Errors fall into five groups with different handling:
//! - connectivity (`Transport`, `Rpc`, `StreamClosed`): the sync client
//!   reconnects after a fixed delay
//! - malformed input (`InvalidFact`, `Parse`): the entry is skipped with a warning
//! - kernel (`Kernel`, `Netlink`): recorded as the pass's last error, retried with backoff
//! - dataplane (`NoDesiredState`): nothing to program yet; the pass fails and is retried
//! - startup (`LinkNotFound`, `NoDefaultRoute`, `Config`): fatal to the daemon

use egress_types::ParseError;
use thiserror::Error;

/// Errors that can occur in the egress gateway
#[derive(Debug, Error)]
pub enum EgressError {
    /// Netlink socket or message encoding failure
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// The kernel rejected an operation with an errno
    #[error("{op} failed: {}", os_error(.errno))]
    Kernel { op: &'static str, errno: i32 },

    /// Interface lookup failed
    #[error("Interface not found: {0}")]
    LinkNotFound(String),

    /// No IPv4 default route with a gateway in the main table
    #[error("No default route found")]
    NoDefaultRoute,

    /// Dialing the control plane failed
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The control plane returned a gRPC status
    #[error("RPC error: {0}")]
    Rpc(#[from] tonic::Status),

    /// The control-plane stream ended cleanly
    #[error("Sync stream closed by peer")]
    StreamClosed,

    /// A routing fact was missing required fields
    #[error("Invalid routing fact: {0}")]
    InvalidFact(String),

    /// A retry ran before any snapshot produced a desired dataplane
    #[error("No desired dataplane state computed yet")]
    NoDesiredState,

    /// Address parsing failed
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EgressError {
    /// Returns true when the kernel reported that the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EgressError::Kernel { errno, .. } if *errno == libc::ENOENT)
    }
}

fn os_error(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Result type alias for egress gateway operations
pub type Result<T> = std::result::Result<T, EgressError>;
