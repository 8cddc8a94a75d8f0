//! rtnetlink implementation of [`NetlinkHandle`].
//!
//! One `NETLINK_ROUTE` socket is shared behind a mutex; each call sends a
//! single request and reads replies with the same sequence number until the
//! kernel acknowledges or finishes the dump.

use super::{Family, Link, Neigh, NeighState, NetlinkHandle, Route, RouteFilter, NTF_SELF};
use crate::error::{EgressError, Result};
use egress_types::{IpPrefix, MacAddress};
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REPLACE, NLM_F_REQUEST,
};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourFlags, NeighbourMessage, NeighbourState,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteFlags, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, instrument, trace};

/// `RTNH_F_ONLINK` in `rtm_flags`.
const RTNH_F_ONLINK: u32 = 0x04;

/// Request/response rtnetlink client.
pub struct NetlinkKernel {
    socket: Mutex<Socket>,
    seq: AtomicU32,
}

impl NetlinkKernel {
    /// Opens and connects a `NETLINK_ROUTE` socket. Requires `CAP_NET_ADMIN`
    /// for the mutating operations.
    #[instrument]
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| EgressError::Netlink(format!("Failed to create socket: {}", e)))?;
        socket
            .bind_auto()
            .map_err(|e| EgressError::Netlink(format!("Failed to bind socket: {}", e)))?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| EgressError::Netlink(format!("Failed to connect socket: {}", e)))?;

        debug!("Netlink route socket ready");
        Ok(Self {
            socket: Mutex::new(socket),
            seq: AtomicU32::new(1),
        })
    }

    fn request(
        &self,
        op: &'static str,
        message: RouteNetlinkMessage,
        flags: u16,
    ) -> Result<Vec<RouteNetlinkMessage>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut header = NetlinkHeader::default();
        header.flags = flags;
        header.sequence_number = seq;
        let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(message));
        packet.finalize();

        let mut buf = vec![0u8; packet.buffer_len()];
        packet.serialize(&mut buf);

        let socket = self.socket.lock();
        socket
            .send(&buf, 0)
            .map_err(|e| EgressError::Netlink(format!("{}: send failed: {}", op, e)))?;

        let mut replies = Vec::new();
        loop {
            let (bytes, _) = socket
                .recv_from_full()
                .map_err(|e| EgressError::Netlink(format!("{}: receive failed: {}", op, e)))?;

            let mut offset = 0;
            while offset < bytes.len() {
                let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&bytes[offset..])
                    .map_err(|e| {
                        EgressError::Netlink(format!("{}: failed to parse reply: {}", op, e))
                    })?;

                let len = msg.header.length as usize;
                if len == 0 {
                    return Err(EgressError::Netlink(format!("{}: zero-length reply", op)));
                }
                // Netlink messages are 4-byte aligned
                offset += (len + 3) & !3;

                if msg.header.sequence_number != seq {
                    trace!(op, seq = msg.header.sequence_number, "Skipping stale reply");
                    continue;
                }

                match msg.payload {
                    NetlinkPayload::Done(_) => return Ok(replies),
                    NetlinkPayload::Error(err) => {
                        return match err.code {
                            None => Ok(replies),
                            Some(code) => Err(EgressError::Kernel {
                                op,
                                errno: -code.get(),
                            }),
                        };
                    }
                    NetlinkPayload::InnerMessage(inner) => replies.push(inner),
                    _ => {}
                }
            }
        }
    }

    fn get_link(&self, message: LinkMessage, what: String) -> Result<Link> {
        let replies = self
            .request(
                "link_get",
                RouteNetlinkMessage::GetLink(message),
                NLM_F_REQUEST | NLM_F_ACK,
            )
            .map_err(|e| match e {
                EgressError::Kernel { errno, .. } if errno == libc::ENODEV => {
                    EgressError::LinkNotFound(what.clone())
                }
                other => other,
            })?;

        replies
            .into_iter()
            .find_map(|reply| match reply {
                RouteNetlinkMessage::NewLink(link) => parse_link(link),
                _ => None,
            })
            .ok_or(EgressError::LinkNotFound(what))
    }

    fn new_route(&self, op: &'static str, route: &Route, flags: u16) -> Result<()> {
        let message = build_route(route, true)?;
        self.request(op, RouteNetlinkMessage::NewRoute(message), flags)
            .map(|_| ())
    }
}

impl NetlinkHandle for NetlinkKernel {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        let mut message = LinkMessage::default();
        message.attributes.push(LinkAttribute::IfName(name.to_string()));
        self.get_link(message, name.to_string())
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        let mut message = LinkMessage::default();
        message.header.index = index;
        self.get_link(message, format!("index {}", index))
    }

    fn route_list_filtered(&self, family: Family, filter: &RouteFilter) -> Result<Vec<Route>> {
        if family != Family::Inet {
            return Ok(Vec::new());
        }

        let mut message = RouteMessage::default();
        message.header.address_family = AddressFamily::Inet;
        let replies = self.request(
            "route_list",
            RouteNetlinkMessage::GetRoute(message),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewRoute(route) => parse_route(route),
                _ => None,
            })
            .filter(|route| filter.matches(route))
            .collect())
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        self.new_route(
            "route_add",
            route,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        )
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        self.new_route(
            "route_replace",
            route,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        )
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        let message = build_route(route, false)?;
        self.request(
            "route_del",
            RouteNetlinkMessage::DelRoute(message),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .map(|_| ())
    }

    fn neigh_list(&self, link_index: u32, family: Family) -> Result<Vec<Neigh>> {
        let mut message = NeighbourMessage::default();
        message.header.family = address_family(family);
        let replies = self.request(
            "neigh_list",
            RouteNetlinkMessage::GetNeighbour(message),
            NLM_F_REQUEST | NLM_F_DUMP,
        )?;

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewNeighbour(neigh) => parse_neigh(neigh),
                _ => None,
            })
            .filter(|neigh| neigh.link_index == link_index && neigh.family == family)
            .collect())
    }

    fn neigh_set(&self, neigh: &Neigh) -> Result<()> {
        self.request(
            "neigh_set",
            RouteNetlinkMessage::NewNeighbour(build_neigh(neigh)?),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        )
        .map(|_| ())
    }

    fn neigh_del(&self, neigh: &Neigh) -> Result<()> {
        self.request(
            "neigh_del",
            RouteNetlinkMessage::DelNeighbour(build_neigh(neigh)?),
            NLM_F_REQUEST | NLM_F_ACK,
        )
        .map(|_| ())
    }
}

fn address_family(family: Family) -> AddressFamily {
    match family {
        Family::Inet => AddressFamily::Inet,
        Family::Bridge => AddressFamily::Bridge,
    }
}

fn ipv4(addr: IpAddr, what: &str) -> Result<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Ok(v4),
        IpAddr::V6(v6) => Err(EgressError::Netlink(format!(
            "{} {} is not IPv4",
            what, v6
        ))),
    }
}

fn parse_link(message: LinkMessage) -> Option<Link> {
    let index = message.header.index;
    message.attributes.into_iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(Link { index, name }),
        _ => None,
    })
}

fn build_route(route: &Route, for_add: bool) -> Result<RouteMessage> {
    let mut message = RouteMessage::default();
    message.header.address_family = AddressFamily::Inet;
    message.header.kind = RouteType::Unicast;
    if for_add {
        message.header.protocol = RouteProtocol::Boot;
        message.header.scope = RouteScope::Universe;
    } else {
        message.header.scope = RouteScope::NoWhere;
    }
    if route.onlink {
        message.header.flags = RouteFlags::from_bits_retain(RTNH_F_ONLINK);
    }

    match u8::try_from(route.table) {
        Ok(table) => message.header.table = table,
        Err(_) => message.attributes.push(RouteAttribute::Table(route.table)),
    }

    if let Some(dst) = route.dst.filter(|dst| !dst.is_default()) {
        message.header.destination_prefix_length = dst.prefix_len();
        message
            .attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(ipv4(
                dst.network(),
                "destination",
            )?)));
    }
    if let Some(gw) = route.gw {
        message
            .attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet(ipv4(gw, "gateway")?)));
    }
    message.attributes.push(RouteAttribute::Oif(route.link_index));

    Ok(message)
}

fn parse_route(message: RouteMessage) -> Option<Route> {
    if message.header.address_family != AddressFamily::Inet
        || message.header.kind != RouteType::Unicast
    {
        return None;
    }

    let prefix_len = message.header.destination_prefix_length;
    let mut route = Route {
        table: u32::from(message.header.table),
        link_index: 0,
        dst: None,
        gw: None,
        onlink: message.header.flags.bits() & RTNH_F_ONLINK != 0,
    };

    for attr in message.attributes {
        match attr {
            RouteAttribute::Table(table) => route.table = table,
            RouteAttribute::Oif(index) => route.link_index = index,
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                route.dst = IpPrefix::new(IpAddr::V4(addr), prefix_len).ok();
            }
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => {
                route.gw = Some(IpAddr::V4(addr));
            }
            _ => {}
        }
    }
    Some(route)
}

fn build_neigh(neigh: &Neigh) -> Result<NeighbourMessage> {
    let mut message = NeighbourMessage::default();
    message.header.family = address_family(neigh.family);
    message.header.ifindex = neigh.link_index;
    message.header.state = match neigh.state {
        NeighState::Permanent => NeighbourState::Permanent,
        NeighState::Dynamic => NeighbourState::Reachable,
    };
    message.header.flags = NeighbourFlags::from_bits_retain(neigh.flags);

    message
        .attributes
        .push(NeighbourAttribute::Destination(NeighbourAddress::Inet(ipv4(
            neigh.ip, "neighbour",
        )?)));
    if let Some(mac) = neigh.mac {
        message
            .attributes
            .push(NeighbourAttribute::LinkLocalAddress(mac.to_vec()));
    }
    if neigh.family == Family::Bridge {
        if let Some(vni) = neigh.vni {
            message.attributes.push(NeighbourAttribute::Vni(vni));
        }
    }
    Ok(message)
}

fn parse_neigh(message: NeighbourMessage) -> Option<Neigh> {
    let family = match message.header.family {
        AddressFamily::Inet => Family::Inet,
        AddressFamily::Bridge => Family::Bridge,
        _ => return None,
    };
    let flags = message.header.flags.bits();
    let state = if message.header.state == NeighbourState::Permanent {
        NeighState::Permanent
    } else {
        NeighState::Dynamic
    };

    let mut ip = None;
    let mut mac = None;
    let mut vni = None;
    for attr in message.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => {
                ip = Some(IpAddr::V4(addr));
            }
            NeighbourAttribute::LinkLocalAddress(bytes) => {
                mac = MacAddress::try_from(bytes.as_slice()).ok();
            }
            NeighbourAttribute::Vni(v) => vni = Some(v),
            _ => {}
        }
    }

    // FDB entries without a remote IP (e.g. the device's own address) are not ours
    let ip = ip?;
    if family == Family::Bridge && flags & NTF_SELF == 0 {
        return None;
    }

    Some(Neigh {
        link_index: message.header.ifindex,
        family,
        ip,
        mac,
        state,
        flags,
        vni,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::RT_TABLE_MAIN;

    fn encap_route() -> Route {
        Route {
            table: RT_TABLE_MAIN,
            link_index: 9,
            dst: Some("10.0.1.0/24".parse().unwrap()),
            gw: Some("192.168.1.1".parse().unwrap()),
            onlink: true,
        }
    }

    #[test]
    fn test_route_message_roundtrip() {
        let message = build_route(&encap_route(), true).unwrap();
        assert_eq!(message.header.table, 254);
        assert_eq!(message.header.destination_prefix_length, 24);
        assert_eq!(parse_route(message), Some(encap_route()));
    }

    #[test]
    fn test_default_route_has_no_destination() {
        let route = Route {
            dst: None,
            onlink: false,
            ..encap_route()
        };
        let message = build_route(&route, true).unwrap();
        assert!(!message
            .attributes
            .iter()
            .any(|a| matches!(a, RouteAttribute::Destination(_))));
        assert!(parse_route(message).unwrap().is_default());
    }

    #[test]
    fn test_fdb_message_carries_vni() {
        let neigh = Neigh {
            link_index: 9,
            family: Family::Bridge,
            ip: "192.168.1.1".parse().unwrap(),
            mac: Some("1a:7d:9c:e2:71:41".parse().unwrap()),
            state: NeighState::Permanent,
            flags: NTF_SELF,
            vni: Some(4097),
        };
        let message = build_neigh(&neigh).unwrap();
        assert!(message
            .attributes
            .iter()
            .any(|a| matches!(a, NeighbourAttribute::Vni(4097))));

        let parsed = parse_neigh(message).unwrap();
        assert!(parsed.same_as(&neigh));
    }

    #[test]
    fn test_ipv6_rejected() {
        let route = Route {
            gw: Some("fe80::1".parse().unwrap()),
            ..encap_route()
        };
        assert!(build_route(&route, true).is_err());
    }
}
