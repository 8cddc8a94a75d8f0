//! Link-layer addresses for remote nodes.
//!
//! Every node's VTEP MAC is derived from its name rather than learned, so the
//! same node always maps to the same address on every gateway and across
//! restarts.

use egress_types::MacAddress;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default)]
pub struct MacBuilder;

impl MacBuilder {
    /// First six bytes of SHA-256(name), marked locally administered unicast.
    pub fn generate(&self, node_name: &str) -> MacAddress {
        let digest = Sha256::digest(node_name.as_bytes());
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&digest[..6]);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        MacAddress::new(bytes)
    }
}
