//! Diff-and-apply of desired routes and neighbours against the kernel.
//!
//! Each function lists what the kernel has on one device, deletes what is
//! not desired, fixes what differs and adds what is missing. A failed entry
//! does not stop the others; the last error is returned.

use crate::error::{EgressError, Result};
use crate::netlink::{Family, Link, Neigh, NeighKey, NetlinkHandle, Route, RouteFilter};
use egress_types::IpPrefix;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Makes the routes on `link` match `desired`.
///
/// Default routes are never touched, and neither are routes for which
/// `owned` returns false.
pub fn ensure_routing(
    nl: &dyn NetlinkHandle,
    desired: &BTreeMap<IpPrefix, Route>,
    link: &Link,
    owned: impl Fn(&Route) -> bool,
) -> Result<()> {
    let kernel_routes = nl
        .route_list_filtered(Family::Inet, &RouteFilter::link(link.index))
        .inspect_err(|e| warn!(link = %link.name, error = %e, "Could not list routes"))?;

    let mut last_err: Option<EgressError> = None;
    let mut kernel_by_dst: BTreeMap<IpPrefix, Route> = BTreeMap::new();

    for route in kernel_routes {
        if route.is_default() || !owned(&route) {
            continue;
        }
        let Some(dst) = route.dst else { continue };

        if desired.contains_key(&dst) {
            kernel_by_dst.insert(dst, route);
        } else {
            debug!(route = %route, "Deleting stale route");
            if let Err(e) = nl.route_del(&route) {
                warn!(route = %route, error = %e, "Could not delete stale route");
                last_err = Some(e);
            }
        }
    }

    for (dst, route) in desired {
        let result = match kernel_by_dst.get(dst) {
            Some(current) if current == route => continue,
            Some(current) => {
                debug!(from = %current, to = %route, "Replacing out-of-sync route");
                nl.route_replace(route)
            }
            None => {
                debug!(route = %route, "Adding route");
                nl.route_add(route)
            }
        };
        if let Err(e) = result {
            warn!(route = %route, error = %e, "Could not program route");
            last_err = Some(e);
        }
    }

    last_err.map_or(Ok(()), Err)
}

/// Makes the `family` neighbours on `link` match `desired`.
pub fn ensure_neighs(
    nl: &dyn NetlinkHandle,
    desired: &BTreeMap<NeighKey, Neigh>,
    link: &Link,
    family: Family,
) -> Result<()> {
    let kernel_neighs = nl
        .neigh_list(link.index, family)
        .inspect_err(|e| warn!(link = %link.name, %family, error = %e, "Could not list neighbours"))?;

    let mut last_err: Option<EgressError> = None;
    let mut kernel_by_key: BTreeMap<NeighKey, Neigh> = BTreeMap::new();

    for neigh in kernel_neighs {
        let key = neigh.key();
        if desired.contains_key(&key) {
            kernel_by_key.insert(key, neigh);
            continue;
        }

        debug!(neigh = %neigh, "Deleting stale neighbour");
        match nl.neigh_del(&neigh) {
            Ok(()) => {}
            // Already gone
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(neigh = %neigh, error = %e, "Could not delete stale neighbour");
                last_err = Some(e);
            }
        }
    }

    for (key, neigh) in desired {
        if kernel_by_key.get(key).is_some_and(|current| current.same_as(neigh)) {
            continue;
        }
        debug!(neigh = %neigh, "Setting neighbour");
        if let Err(e) = nl.neigh_set(neigh) {
            warn!(neigh = %neigh, error = %e, "Could not program neighbour");
            last_err = Some(e);
        }
    }

    last_err.map_or(Ok(()), Err)
}
