//! Address types for the egress gateway route synchronizer.
//!
//! This crate provides the small set of network primitives shared between
//! the control-plane facts and the kernel objects derived from them:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`IpPrefix`]: normalised IP network prefixes (CIDR notation)
//! - [`parse_cidr`]: CIDR parsing that also keeps the address as written

mod ip;
mod mac;

pub use ip::{parse_cidr, IpPrefix};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),
}
