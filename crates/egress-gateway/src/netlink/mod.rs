//! Kernel interface for routes and neighbours
//!
//! [`NetlinkHandle`] is the only way the route manager touches the kernel.
//! On Linux [`NetlinkKernel`] speaks rtnetlink; [`MockNetlink`] keeps the
//! same state in memory for tests and non-Linux builds.
//!
//! All operations are synchronous. Mutations fail with
//! [`EgressError::Kernel`] carrying the errno the kernel (or mock) returned.

#[cfg(target_os = "linux")]
mod linux;
mod mock;

#[cfg(target_os = "linux")]
pub use linux::NetlinkKernel;
pub use mock::{CallCounts, MockNetlink};

use crate::error::{EgressError, Result};
use egress_types::{IpPrefix, MacAddress};
use std::fmt;
use std::net::IpAddr;

/// The kernel main routing table.
pub const RT_TABLE_MAIN: u32 = 254;

/// `NTF_SELF`: FDB entry lives on the device itself, not a bridge master.
pub const NTF_SELF: u8 = 0x02;

/// Address family a neighbour or route belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Inet,
    Bridge,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet => f.write_str("inet"),
            Family::Bridge => f.write_str("bridge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

/// A unicast route in the form the reconciler compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub table: u32,
    pub link_index: u32,
    /// `None` for a default route.
    pub dst: Option<IpPrefix>,
    pub gw: Option<IpAddr>,
    pub onlink: bool,
}

/// Identity of a route: table, link and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub table: u32,
    pub link_index: u32,
    pub dst: Option<IpPrefix>,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            table: self.table,
            link_index: self.link_index,
            dst: self.dst,
        }
    }

    pub fn is_default(&self) -> bool {
        self.dst.map_or(true, |dst| dst.is_default())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{dst}")?,
            None => f.write_str("default")?,
        }
        if let Some(gw) = self.gw {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {} table {}", self.link_index, self.table)?;
        if self.onlink {
            f.write_str(" onlink")?;
        }
        Ok(())
    }
}

/// Selects routes by outgoing interface and/or table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteFilter {
    pub link_index: Option<u32>,
    pub table: Option<u32>,
}

impl RouteFilter {
    pub fn link(link_index: u32) -> Self {
        Self {
            link_index: Some(link_index),
            table: Some(RT_TABLE_MAIN),
        }
    }

    pub fn main_table() -> Self {
        Self {
            link_index: None,
            table: Some(RT_TABLE_MAIN),
        }
    }

    pub fn matches(&self, route: &Route) -> bool {
        self.link_index.map_or(true, |idx| idx == route.link_index)
            && self.table.map_or(true, |table| table == route.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighState {
    Permanent,
    /// Anything the kernel learned or is resolving.
    Dynamic,
}

/// An ARP entry (`Family::Inet`) or VXLAN FDB entry (`Family::Bridge`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neigh {
    pub link_index: u32,
    pub family: Family,
    pub ip: IpAddr,
    pub mac: Option<MacAddress>,
    pub state: NeighState,
    pub flags: u8,
    /// Programmed on FDB entries; the kernel omits it when it matches the
    /// device default, so it is not part of [`Neigh::same_as`].
    pub vni: Option<u32>,
}

/// Identity of a neighbour: the MAC is deliberately not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NeighKey {
    pub link_index: u32,
    pub family: Family,
    pub ip: IpAddr,
    pub flags: u8,
}

impl Neigh {
    pub fn key(&self) -> NeighKey {
        NeighKey {
            link_index: self.link_index,
            family: self.family,
            ip: self.ip,
            flags: self.flags,
        }
    }

    pub fn same_as(&self, other: &Neigh) -> bool {
        self.key() == other.key() && self.mac == other.mac && self.state == other.state
    }
}

impl fmt::Display for Neigh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} dev {}", self.family, self.ip, self.link_index)?;
        if let Some(mac) = self.mac {
            write!(f, " lladdr {mac}")?;
        }
        Ok(())
    }
}

/// Synchronous kernel operations used by the route manager.
pub trait NetlinkHandle: Send + Sync {
    fn link_by_name(&self, name: &str) -> Result<Link>;
    fn link_by_index(&self, index: u32) -> Result<Link>;

    /// IPv4 routes matching `filter`. Only `Family::Inet` is meaningful.
    fn route_list_filtered(&self, family: Family, filter: &RouteFilter) -> Result<Vec<Route>>;
    fn route_add(&self, route: &Route) -> Result<()>;
    fn route_replace(&self, route: &Route) -> Result<()>;
    fn route_del(&self, route: &Route) -> Result<()>;

    fn neigh_list(&self, link_index: u32, family: Family) -> Result<Vec<Neigh>>;
    /// Creates or replaces the neighbour.
    fn neigh_set(&self, neigh: &Neigh) -> Result<()>;
    fn neigh_del(&self, neigh: &Neigh) -> Result<()>;
}

/// The first main-table IPv4 default route that has a gateway.
pub fn default_route(handle: &dyn NetlinkHandle) -> Result<Route> {
    handle
        .route_list_filtered(Family::Inet, &RouteFilter::main_table())?
        .into_iter()
        .find(|route| route.is_default() && route.gw.is_some())
        .ok_or(EgressError::NoDefaultRoute)
}
