//! Desired kernel state derived from a route snapshot.

use super::tunnels::select_active_tunnels;
use crate::error::{EgressError, Result};
use crate::mac_builder::MacBuilder;
use crate::netlink::{Family, Link, Neigh, NeighKey, NeighState, Route, NTF_SELF, RT_TABLE_MAIN};
use crate::route_store::RouteSnapshot;
use crate::types::RouteFact;
use egress_types::{IpPrefix, MacAddress};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use tracing::{debug, warn};

/// Kernel objects the manager resolved at startup.
#[derive(Debug, Clone)]
pub struct DataplaneLinks {
    /// The managed VXLAN device.
    pub tunnel: Link,
    /// The device carrying the host default route.
    pub default: Link,
    pub default_gw: IpAddr,
    pub vni: u32,
}

/// Everything one reconciliation pass should leave in the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// Encap routes via the tunnel device, by workload CIDR.
    pub workload_routes: BTreeMap<IpPrefix, Route>,
    pub arp_neighs: BTreeMap<NeighKey, Neigh>,
    pub fdb_neighs: BTreeMap<NeighKey, Neigh>,
    /// Routes to tunnel addresses out of the default device, by tunnel CIDR.
    pub exit_routes: BTreeMap<IpPrefix, Route>,
}

struct Builder<'a> {
    links: &'a DataplaneLinks,
    macs: &'a MacBuilder,
}

impl Builder<'_> {
    fn neigh(&self, family: Family, ip: IpAddr, mac: MacAddress) -> Neigh {
        let (flags, vni) = match family {
            Family::Bridge => (NTF_SELF, Some(self.links.vni)),
            Family::Inet => (0, None),
        };
        Neigh {
            link_index: self.links.tunnel.index,
            family,
            ip,
            mac: Some(mac),
            state: NeighState::Permanent,
            flags,
            vni,
        }
    }

    /// FDB entry and exit route for one active tunnel.
    fn tunnel_objects(&self, node: &str, tunnel: &RouteFact) -> Option<(Neigh, Route)> {
        if !tunnel.dst_addr.is_ipv4() {
            warn!(node, dst = %tunnel.dst, "Skipping non-IPv4 tunnel");
            return None;
        }

        let fdb = self.neigh(Family::Bridge, tunnel.dst_addr, self.macs.generate(node));
        let exit = Route {
            table: RT_TABLE_MAIN,
            link_index: self.links.default.index,
            dst: Some(tunnel.dst),
            gw: Some(self.links.default_gw),
            onlink: true,
        };
        Some((fdb, exit))
    }

    fn node_ip(&self, workload: &RouteFact) -> Option<IpAddr> {
        match workload.dst_node_ip.parse::<IpAddr>() {
            Ok(ip @ IpAddr::V4(_)) if workload.dst.is_ipv4() => Some(ip),
            Ok(_) => {
                warn!(dst = %workload.dst, node_ip = %workload.dst_node_ip, "Skipping non-IPv4 workload");
                None
            }
            Err(_) => {
                warn!(dst = %workload.dst, node_ip = %workload.dst_node_ip, "Skipping workload with unparseable node IP");
                None
            }
        }
    }
}

/// Computes the desired kernel state for `snapshot`.
///
/// Fails only if the snapshot has no workload route for this gateway; bad
/// individual facts are skipped with a warning.
pub fn build_desired(
    snapshot: &RouteSnapshot,
    links: &DataplaneLinks,
    macs: &MacBuilder,
) -> Result<DesiredState> {
    let this_workload = snapshot.this_workload.as_ref().ok_or_else(|| {
        EgressError::InvalidFact("no workload route found for this gateway".to_string())
    })?;
    let builder = Builder { links, macs };
    let mut desired = DesiredState::default();

    let active = select_active_tunnels(
        this_workload,
        &snapshot.workloads_by_node,
        &snapshot.tunnels_by_node,
    );

    // One FDB entry per remote host; a tunnel address beats the node address.
    let mut fdb_macs: HashSet<MacAddress> = HashSet::new();
    for (node, tunnel) in &active {
        if let Some((fdb, exit)) = builder.tunnel_objects(node, tunnel) {
            if let Some(mac) = fdb.mac {
                fdb_macs.insert(mac);
            }
            desired.fdb_neighs.insert(fdb.key(), fdb);
            desired.exit_routes.insert(tunnel.dst, exit);
        }
    }

    for (node, workloads) in &snapshot.workloads_by_node {
        let mac = macs.generate(node);
        for workload in workloads {
            let Some(node_ip) = builder.node_ip(workload) else {
                continue;
            };

            let arp = builder.neigh(Family::Inet, node_ip, mac);
            desired.arp_neighs.insert(arp.key(), arp);

            if fdb_macs.insert(mac) {
                let fdb = builder.neigh(Family::Bridge, node_ip, mac);
                desired.fdb_neighs.insert(fdb.key(), fdb);
            }

            desired.workload_routes.insert(
                workload.dst,
                Route {
                    table: RT_TABLE_MAIN,
                    link_index: links.tunnel.index,
                    dst: Some(workload.dst),
                    gw: Some(node_ip),
                    onlink: true,
                },
            );
        }
    }

    debug!(
        routes = desired.workload_routes.len(),
        arp = desired.arp_neighs.len(),
        fdb = desired.fdb_neighs.len(),
        exit_routes = desired.exit_routes.len(),
        active_tunnels = active.len(),
        "Computed desired dataplane"
    );
    Ok(desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolKind, RouteKinds, TunnelKinds};
    use pretty_assertions::assert_eq;

    fn links() -> DataplaneLinks {
        DataplaneLinks {
            tunnel: Link {
                index: 10,
                name: "vxlan0".into(),
            },
            default: Link {
                index: 2,
                name: "eth0".into(),
            },
            default_gw: "172.16.0.1".parse().unwrap(),
            vni: 4097,
        }
    }

    fn workload(dst: &str, node: &str, node_ip: &str) -> RouteFact {
        let (dst_addr, dst) = egress_types::parse_cidr(dst).unwrap();
        RouteFact {
            dst,
            dst_addr,
            dst_node_name: node.into(),
            dst_node_ip: node_ip.into(),
            kinds: RouteKinds::REMOTE_WORKLOAD,
            pool_kind: PoolKind::Vxlan,
            tunnel: None,
            same_subnet: false,
        }
    }

    fn tunnel(dst: &str, node: &str) -> RouteFact {
        RouteFact {
            kinds: RouteKinds::REMOTE_TUNNEL,
            tunnel: Some(TunnelKinds {
                vxlan: true,
                ..Default::default()
            }),
            ..workload(dst, node, "192.168.1.1")
        }
    }

    fn snapshot(this: RouteFact, workloads: Vec<RouteFact>, tunnels: Vec<RouteFact>) -> RouteSnapshot {
        let mut snapshot = RouteSnapshot {
            this_workload: Some(this.clone()),
            ..Default::default()
        };
        for w in std::iter::once(this).chain(workloads) {
            snapshot
                .workloads_by_node
                .entry(w.dst_node_name.clone())
                .or_default()
                .push(w);
        }
        for t in tunnels {
            snapshot
                .tunnels_by_node
                .entry(t.dst_node_name.clone())
                .or_default()
                .push(t);
        }
        snapshot
    }

    fn gateway() -> RouteFact {
        workload("10.0.0.0/26", "gw-node", "192.168.1.5")
    }

    #[test]
    fn test_workload_yields_route_arp_and_fdb() {
        let snap = snapshot(
            gateway(),
            vec![workload("10.0.1.0/24", "example.foo", "192.168.1.1")],
            vec![],
        );
        let desired = build_desired(&snap, &links(), &MacBuilder).unwrap();

        let route = &desired.workload_routes[&"10.0.1.0/24".parse().unwrap()];
        assert_eq!(route.link_index, 10);
        assert_eq!(route.gw, Some("192.168.1.1".parse().unwrap()));
        assert!(route.onlink);

        let node_ip: IpAddr = "192.168.1.1".parse().unwrap();
        let mac: MacAddress = "1a:7d:9c:e2:71:41".parse().unwrap();
        let arp = desired
            .arp_neighs
            .values()
            .find(|n| n.ip == node_ip)
            .unwrap();
        assert_eq!(arp.mac, Some(mac));
        assert_eq!(arp.family, Family::Inet);

        let fdb = desired
            .fdb_neighs
            .values()
            .find(|n| n.mac == Some(mac))
            .unwrap();
        assert_eq!(fdb.ip, node_ip);
        assert_eq!(fdb.flags, NTF_SELF);
        assert_eq!(fdb.vni, Some(4097));
        assert!(desired.exit_routes.is_empty());
    }

    #[test]
    fn test_tunnel_fdb_preferred_and_exit_route() {
        let snap = snapshot(
            gateway(),
            vec![
                workload("10.0.1.0/26", "example.foo", "192.168.1.1"),
                workload("10.0.1.64/26", "example.foo", "192.168.1.1"),
            ],
            vec![tunnel("10.0.1.1/32", "example.foo")],
        );
        let desired = build_desired(&snap, &links(), &MacBuilder).unwrap();

        let mac: MacAddress = "1a:7d:9c:e2:71:41".parse().unwrap();
        let fdbs: Vec<&Neigh> = desired
            .fdb_neighs
            .values()
            .filter(|n| n.mac == Some(mac))
            .collect();
        assert_eq!(fdbs.len(), 1);
        assert_eq!(fdbs[0].ip, "10.0.1.1".parse::<IpAddr>().unwrap());

        let exit = &desired.exit_routes[&"10.0.1.1/32".parse().unwrap()];
        assert_eq!(exit.link_index, 2);
        assert_eq!(exit.gw, Some("172.16.0.1".parse().unwrap()));
        assert!(exit.onlink);

        assert_eq!(desired.workload_routes.len(), 3);
        // One ARP entry per node IP
        assert_eq!(desired.arp_neighs.len(), 2);
    }

    #[test]
    fn test_missing_gateway_workload_fails() {
        let snap = RouteSnapshot::default();
        assert!(build_desired(&snap, &links(), &MacBuilder).is_err());
    }

    #[test]
    fn test_bad_node_ip_skipped() {
        let snap = snapshot(
            gateway(),
            vec![
                workload("10.0.1.0/24", "node-b", "not-an-ip"),
                workload("10.0.2.0/24", "node-c", "fd00::1"),
                workload("10.0.3.0/24", "node-d", "192.168.1.4"),
            ],
            vec![],
        );
        let desired = build_desired(&snap, &links(), &MacBuilder).unwrap();
        let dsts: Vec<String> = desired.workload_routes.keys().map(ToString::to_string).collect();
        assert_eq!(dsts, vec!["10.0.0.0/26", "10.0.3.0/24"]);
    }
}
