//! IP prefix type with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The stored address is always the network address: host bits are cleared
/// on construction, so `10.0.1.7/24` and `10.0.1.0/24` compare equal. Use
/// [`parse_cidr`] when the address as written is also needed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    network: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix, masking off host bits.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = max_prefix_len(&address);
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        Ok(IpPrefix {
            network: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// Creates a host prefix (/32 or /128) for a single address.
    pub fn host(address: IpAddr) -> Self {
        IpPrefix {
            network: address,
            prefix_len: max_prefix_len(&address),
        }
    }

    /// Returns the network address of this prefix.
    pub const fn network(&self) -> IpAddr {
        self.network
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.network.is_ipv4()
    }

    /// Returns true for 0.0.0.0/0 and ::/0.
    pub const fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns true if `address` falls inside this prefix.
    pub fn contains(&self, address: IpAddr) -> bool {
        if address.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(address, self.prefix_len) == self.network
    }
}

fn max_prefix_len(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(address: IpAddr, prefix_len: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = match prefix_len {
                0 => 0,
                len => bits & (u32::MAX << (32 - u32::from(len))),
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = match prefix_len {
                0 => 0,
                len => bits & (u128::MAX << (128 - u32::from(len))),
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

/// Parses CIDR text, returning the address as written alongside the
/// normalised prefix.
///
/// `"10.0.5.1/24"` yields `(10.0.5.1, 10.0.5.0/24)`.
pub fn parse_cidr(s: &str) -> Result<(IpAddr, IpPrefix), ParseError> {
    let (addr_str, len_str) = s
        .trim()
        .rsplit_once('/')
        .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

    let address: IpAddr = addr_str
        .parse()
        .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
    let prefix_len: u8 = len_str
        .parse()
        .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

    Ok((address, IpPrefix::new(address, prefix_len)?))
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s).map(|(_, prefix)| prefix)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_normalises_host_bits() {
        let prefix: IpPrefix = "10.0.1.7/24".parse().unwrap();
        assert_eq!(prefix.to_string(), "10.0.1.0/24");
        assert_eq!(prefix, "10.0.1.0/24".parse().unwrap());
    }

    #[test]
    fn test_parse_cidr_keeps_address() {
        let (addr, prefix) = parse_cidr("10.0.5.1/26").unwrap();
        assert_eq!(addr, "10.0.5.1".parse::<IpAddr>().unwrap());
        assert_eq!(prefix.to_string(), "10.0.5.0/26");
    }

    #[test]
    fn test_contains() {
        let block: IpPrefix = "10.0.1.0/26".parse().unwrap();
        assert!(block.contains("10.0.1.63".parse().unwrap()));
        assert!(!block.contains("10.0.1.64".parse().unwrap()));
        assert!(!block.contains("::1".parse().unwrap()));

        let everything: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(everything.contains("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_default_and_host() {
        assert!("0.0.0.0/0".parse::<IpPrefix>().unwrap().is_default());
        assert!("::/0".parse::<IpPrefix>().unwrap().is_default());

        let host = IpPrefix::host("10.0.0.9".parse().unwrap());
        assert_eq!(host.to_string(), "10.0.0.9/32");
        assert!(!host.is_default());
    }

    #[test]
    fn test_ipv6_masking() {
        let prefix: IpPrefix = "2001:db8::1/32".parse().unwrap();
        assert_eq!(prefix.to_string(), "2001:db8::/32");
        assert!(!prefix.is_ipv4());
    }

    #[test]
    fn test_ordering_is_numeric() {
        let mut prefixes: Vec<IpPrefix> = ["10.0.10.0/24", "10.0.2.0/24", "10.0.2.0/23"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        prefixes.sort();
        let rendered: Vec<String> = prefixes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["10.0.2.0/23", "10.0.2.0/24", "10.0.10.0/24"]);
    }

    #[test]
    fn test_invalid_prefixes() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("banana/24".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/x".parse::<IpPrefix>().is_err());
    }
}
