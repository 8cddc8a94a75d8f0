//! Active tunnel selection.

use crate::types::RouteFact;
use std::collections::BTreeMap;

/// Picks at most one tunnel per remote node for return traffic.
///
/// Only nodes other than the gateway's own that currently host workloads are
/// considered. When the gateway's node runs WireGuard, a WireGuard tunnel on
/// the remote node wins outright. Otherwise the first tunnel (in CIDR order)
/// whose pool kind matches the gateway workload's is used, except that a
/// cross-subnet gateway workload never picks a same-subnet tunnel.
pub fn select_active_tunnels<'a>(
    this_workload: &RouteFact,
    workloads_by_node: &BTreeMap<String, Vec<RouteFact>>,
    tunnels_by_node: &'a BTreeMap<String, Vec<RouteFact>>,
) -> BTreeMap<String, &'a RouteFact> {
    let this_node = this_workload.dst_node_name.as_str();
    let gateway_has_wireguard = tunnels_by_node
        .get(this_node)
        .is_some_and(|tunnels| tunnels.iter().any(RouteFact::is_wireguard));
    let cross_subnet = this_workload.same_subnet;

    let mut active = BTreeMap::new();
    for (node, tunnels) in tunnels_by_node {
        if node == this_node {
            continue;
        }
        if workloads_by_node.get(node).map_or(true, Vec::is_empty) {
            continue;
        }

        let mut candidates: Vec<&RouteFact> = tunnels.iter().collect();
        candidates.sort_by_key(|t| t.dst);

        let wireguard = gateway_has_wireguard
            .then(|| candidates.iter().copied().find(|t| t.is_wireguard()))
            .flatten();
        let chosen = wireguard.or_else(|| {
            candidates.iter().copied().find(|t| {
                t.pool_kind == this_workload.pool_kind && !(cross_subnet && t.same_subnet)
            })
        });

        if let Some(tunnel) = chosen {
            active.insert(node.clone(), tunnel);
        }
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolKind, RouteKinds, TunnelKinds};
    use pretty_assertions::assert_eq;

    fn fact(dst: &str, node: &str, pool_kind: PoolKind) -> RouteFact {
        let (dst_addr, dst) = egress_types::parse_cidr(dst).unwrap();
        RouteFact {
            dst,
            dst_addr,
            dst_node_name: node.into(),
            dst_node_ip: "192.168.1.1".into(),
            kinds: RouteKinds::REMOTE_WORKLOAD,
            pool_kind,
            tunnel: None,
            same_subnet: false,
        }
    }

    fn tunnel(dst: &str, node: &str, pool_kind: PoolKind, wireguard: bool) -> RouteFact {
        RouteFact {
            kinds: RouteKinds::REMOTE_TUNNEL,
            tunnel: Some(TunnelKinds {
                wireguard,
                ..Default::default()
            }),
            ..fact(dst, node, pool_kind)
        }
    }

    fn by_node(facts: Vec<RouteFact>) -> BTreeMap<String, Vec<RouteFact>> {
        let mut map: BTreeMap<String, Vec<RouteFact>> = BTreeMap::new();
        for f in facts {
            map.entry(f.dst_node_name.clone()).or_default().push(f);
        }
        map
    }

    fn selected(active: &BTreeMap<String, &RouteFact>) -> Vec<(String, String)> {
        active
            .iter()
            .map(|(node, t)| (node.clone(), t.dst.to_string()))
            .collect()
    }

    #[test]
    fn test_wireguard_wins_when_gateway_has_wireguard() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::NoEncap);
        let workloads = by_node(vec![this.clone(), fact("10.0.1.0/26", "node-b", PoolKind::NoEncap)]);
        let tunnels = by_node(vec![
            tunnel("10.0.0.1/32", "node-a", PoolKind::None, true),
            tunnel("10.0.1.1/32", "node-b", PoolKind::NoEncap, false),
            tunnel("10.0.1.2/32", "node-b", PoolKind::None, true),
        ]);

        let active = select_active_tunnels(&this, &workloads, &tunnels);
        assert_eq!(
            selected(&active),
            vec![("node-b".to_string(), "10.0.1.2/32".to_string())]
        );
    }

    #[test]
    fn test_wireguard_ignored_without_gateway_wireguard() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::Vxlan);
        let workloads = by_node(vec![this.clone(), fact("10.0.1.0/26", "node-b", PoolKind::Vxlan)]);
        let tunnels = by_node(vec![
            tunnel("10.0.1.2/32", "node-b", PoolKind::None, true),
            tunnel("10.0.1.3/32", "node-b", PoolKind::Vxlan, false),
        ]);

        let active = select_active_tunnels(&this, &workloads, &tunnels);
        assert_eq!(
            selected(&active),
            vec![("node-b".to_string(), "10.0.1.3/32".to_string())]
        );
    }

    #[test]
    fn test_cross_subnet_skips_same_subnet_tunnel() {
        let mut this = fact("10.0.0.0/26", "node-a", PoolKind::Ipip);
        this.same_subnet = true;
        let workloads = by_node(vec![this.clone(), fact("10.0.1.0/26", "node-b", PoolKind::Ipip)]);
        let mut ipip = tunnel("10.0.1.1/32", "node-b", PoolKind::Ipip, false);
        ipip.same_subnet = true;
        let tunnels = by_node(vec![ipip]);

        assert!(select_active_tunnels(&this, &workloads, &tunnels).is_empty());
    }

    #[test]
    fn test_nodes_without_workloads_skipped() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::Vxlan);
        let workloads = by_node(vec![this.clone()]);
        let tunnels = by_node(vec![tunnel("10.0.1.1/32", "node-b", PoolKind::Vxlan, false)]);

        assert!(select_active_tunnels(&this, &workloads, &tunnels).is_empty());
    }

    #[test]
    fn test_gateway_node_never_selected() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::Vxlan);
        let workloads = by_node(vec![this.clone(), fact("10.0.0.64/26", "node-a", PoolKind::Vxlan)]);
        let tunnels = by_node(vec![tunnel("10.0.0.1/32", "node-a", PoolKind::Vxlan, false)]);

        assert!(select_active_tunnels(&this, &workloads, &tunnels).is_empty());
    }

    #[test]
    fn test_multiple_matches_pick_smallest_cidr() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::Vxlan);
        let workloads = by_node(vec![this.clone(), fact("10.0.1.0/26", "node-b", PoolKind::Vxlan)]);
        // Deliberately out of order
        let tunnels = by_node(vec![
            tunnel("10.0.1.9/32", "node-b", PoolKind::Vxlan, false),
            tunnel("10.0.1.10/32", "node-b", PoolKind::Vxlan, false),
            tunnel("10.0.1.2/32", "node-b", PoolKind::Vxlan, false),
        ]);

        let active = select_active_tunnels(&this, &workloads, &tunnels);
        assert_eq!(active["node-b"].dst.to_string(), "10.0.1.2/32");
    }

    #[test]
    fn test_no_matching_pool_kind() {
        let this = fact("10.0.0.0/26", "node-a", PoolKind::Vxlan);
        let workloads = by_node(vec![this.clone(), fact("10.0.1.0/26", "node-b", PoolKind::Vxlan)]);
        let tunnels = by_node(vec![tunnel("10.0.1.1/32", "node-b", PoolKind::Ipip, false)]);

        assert!(select_active_tunnels(&this, &workloads, &tunnels).is_empty());
    }
}
