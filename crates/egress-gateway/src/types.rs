//! Domain form of the routing facts received from the control plane.

use crate::error::{EgressError, Result};
use crate::proto::{self, route_type, IpPoolType};
use egress_types::{parse_cidr, IpPrefix};
use std::fmt;
use std::net::IpAddr;

/// Route-kind bitmask carried by a route update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RouteKinds(i32);

impl RouteKinds {
    pub const REMOTE_WORKLOAD: RouteKinds = RouteKinds(route_type::REMOTE_WORKLOAD);
    pub const REMOTE_HOST: RouteKinds = RouteKinds(route_type::REMOTE_HOST);
    pub const LOCAL_WORKLOAD: RouteKinds = RouteKinds(route_type::LOCAL_WORKLOAD);
    pub const LOCAL_HOST: RouteKinds = RouteKinds(route_type::LOCAL_HOST);
    pub const REMOTE_TUNNEL: RouteKinds = RouteKinds(route_type::REMOTE_TUNNEL);
    pub const LOCAL_TUNNEL: RouteKinds = RouteKinds(route_type::LOCAL_TUNNEL);

    pub const fn from_bits(bits: i32) -> Self {
        RouteKinds(bits)
    }

    pub const fn bits(&self) -> i32 {
        self.0
    }

    pub const fn contains(&self, other: RouteKinds) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: RouteKinds) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: RouteKinds) -> Self {
        RouteKinds(self.0 | other.0)
    }
}

impl std::ops::BitOr for RouteKinds {
    type Output = RouteKinds;

    fn bitor(self, rhs: RouteKinds) -> RouteKinds {
        self.union(rhs)
    }
}

/// Encapsulation used by the IP pool a route belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolKind {
    #[default]
    None,
    NoEncap,
    Vxlan,
    Ipip,
}

impl From<IpPoolType> for PoolKind {
    fn from(value: IpPoolType) -> Self {
        match value {
            IpPoolType::None => PoolKind::None,
            IpPoolType::NoEncap => PoolKind::NoEncap,
            IpPoolType::Vxlan => PoolKind::Vxlan,
            IpPoolType::Ipip => PoolKind::Ipip,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolKind::None => "none",
            PoolKind::NoEncap => "no-encap",
            PoolKind::Vxlan => "vxlan",
            PoolKind::Ipip => "ipip",
        };
        f.write_str(name)
    }
}

/// Tunnel technologies a tunnel route is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TunnelKinds {
    pub ipip: bool,
    pub vxlan: bool,
    pub wireguard: bool,
}

impl From<proto::TunnelType> for TunnelKinds {
    fn from(value: proto::TunnelType) -> Self {
        TunnelKinds {
            ipip: value.ipip,
            vxlan: value.vxlan,
            wireguard: value.wireguard,
        }
    }
}

/// A routing fact for one destination CIDR.
///
/// `dst` is the normalised network; `dst_addr` keeps the address as the
/// control plane wrote it, which for tunnel facts is the tunnel endpoint
/// itself (e.g. `10.0.5.1/32` or `10.0.5.1/26`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFact {
    pub dst: IpPrefix,
    pub dst_addr: IpAddr,
    pub dst_node_name: String,
    /// Kept as received; the route manager parses and validates it.
    pub dst_node_ip: String,
    pub kinds: RouteKinds,
    pub pool_kind: PoolKind,
    pub tunnel: Option<TunnelKinds>,
    pub same_subnet: bool,
}

impl RouteFact {
    pub fn is_workload(&self) -> bool {
        self.kinds
            .intersects(RouteKinds::LOCAL_WORKLOAD | RouteKinds::REMOTE_WORKLOAD)
    }

    pub fn is_tunnel(&self) -> bool {
        self.kinds
            .intersects(RouteKinds::LOCAL_TUNNEL | RouteKinds::REMOTE_TUNNEL)
    }

    pub fn is_wireguard(&self) -> bool {
        self.tunnel.is_some_and(|t| t.wireguard)
    }
}

impl TryFrom<proto::RouteUpdate> for RouteFact {
    type Error = EgressError;

    fn try_from(update: proto::RouteUpdate) -> Result<Self> {
        if update.dst.is_empty() {
            return Err(EgressError::InvalidFact("route update without dst".into()));
        }
        let (dst_addr, dst) = parse_cidr(&update.dst)?;
        let pool_kind = PoolKind::from(update.ip_pool_type());

        Ok(RouteFact {
            dst,
            dst_addr,
            dst_node_name: update.dst_node_name,
            dst_node_ip: update.dst_node_ip,
            kinds: RouteKinds::from_bits(update.types),
            pool_kind,
            tunnel: update.tunnel_type.map(TunnelKinds::from),
            same_subnet: update.same_subnet,
        })
    }
}
