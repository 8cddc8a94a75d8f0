//! In-memory kernel used by tests and non-Linux builds.

use super::{Family, Link, Neigh, NeighKey, NetlinkHandle, Route, RouteFilter, RouteKey};
use crate::error::{EgressError, Result};
use egress_types::IpPrefix;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

/// Number of calls made per operation since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub route_list: usize,
    pub route_add: usize,
    pub route_replace: usize,
    pub route_del: usize,
    pub neigh_list: usize,
    pub neigh_set: usize,
    pub neigh_del: usize,
}

impl CallCounts {
    /// Calls that would have changed kernel state.
    pub fn mutations(&self) -> usize {
        self.route_add + self.route_replace + self.route_del + self.neigh_set + self.neigh_del
    }
}

#[derive(Default)]
struct MockState {
    links: BTreeMap<u32, String>,
    routes: BTreeMap<RouteKey, Route>,
    neighs: BTreeMap<NeighKey, Neigh>,
    calls: CallCounts,
    fail_all_mutations: Option<i32>,
    fail_prefixes: HashSet<IpPrefix>,
}

impl MockState {
    fn check_failure(&self, dst: Option<IpPrefix>) -> Result<()> {
        if let Some(errno) = self.fail_all_mutations {
            return Err(EgressError::Kernel {
                op: "mock",
                errno,
            });
        }
        if dst.is_some_and(|dst| self.fail_prefixes.contains(&dst)) {
            return Err(EgressError::Kernel {
                op: "mock",
                errno: libc::EINVAL,
            });
        }
        Ok(())
    }
}

/// Kernel stand-in. Adding an existing route fails with `EEXIST`, removing a
/// missing object with `ENOENT`, like the real kernel.
#[derive(Default)]
pub struct MockNetlink {
    state: Mutex<MockState>,
}

impl MockNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, index: u32, name: &str) {
        self.state.lock().links.insert(index, name.to_string());
    }

    /// Seeds a route without counting it as a call.
    pub fn insert_route(&self, route: Route) {
        self.state.lock().routes.insert(route.key(), route);
    }

    /// Seeds a neighbour without counting it as a call.
    pub fn insert_neigh(&self, neigh: Neigh) {
        self.state.lock().neighs.insert(neigh.key(), neigh);
    }

    pub fn routes(&self) -> Vec<Route> {
        self.state.lock().routes.values().cloned().collect()
    }

    pub fn neighs(&self) -> Vec<Neigh> {
        self.state.lock().neighs.values().cloned().collect()
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls = CallCounts::default();
    }

    /// Makes every mutation fail with `errno` until cleared with `None`.
    pub fn fail_mutations(&self, errno: Option<i32>) {
        self.state.lock().fail_all_mutations = errno;
    }

    /// Makes route mutations for `dst` fail with `EINVAL`.
    pub fn fail_prefix(&self, dst: IpPrefix) {
        self.state.lock().fail_prefixes.insert(dst);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_all_mutations = None;
        state.fail_prefixes.clear();
    }
}

impl NetlinkHandle for MockNetlink {
    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.state
            .lock()
            .links
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(index, name)| Link {
                index: *index,
                name: name.clone(),
            })
            .ok_or_else(|| EgressError::LinkNotFound(name.to_string()))
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        self.state
            .lock()
            .links
            .get(&index)
            .map(|name| Link {
                index,
                name: name.clone(),
            })
            .ok_or_else(|| EgressError::LinkNotFound(format!("index {index}")))
    }

    fn route_list_filtered(&self, family: Family, filter: &RouteFilter) -> Result<Vec<Route>> {
        let mut state = self.state.lock();
        state.calls.route_list += 1;
        if family != Family::Inet {
            return Ok(Vec::new());
        }
        Ok(state
            .routes
            .values()
            .filter(|route| filter.matches(route))
            .cloned()
            .collect())
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.route_add += 1;
        state.check_failure(route.dst)?;
        if state.routes.contains_key(&route.key()) {
            return Err(EgressError::Kernel {
                op: "route_add",
                errno: libc::EEXIST,
            });
        }
        state.routes.insert(route.key(), route.clone());
        Ok(())
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.route_replace += 1;
        state.check_failure(route.dst)?;
        state.routes.insert(route.key(), route.clone());
        Ok(())
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.route_del += 1;
        state.check_failure(route.dst)?;
        state
            .routes
            .remove(&route.key())
            .map(|_| ())
            .ok_or(EgressError::Kernel {
                op: "route_del",
                errno: libc::ESRCH,
            })
    }

    fn neigh_list(&self, link_index: u32, family: Family) -> Result<Vec<Neigh>> {
        let mut state = self.state.lock();
        state.calls.neigh_list += 1;
        Ok(state
            .neighs
            .values()
            .filter(|n| n.link_index == link_index && n.family == family)
            .cloned()
            .collect())
    }

    fn neigh_set(&self, neigh: &Neigh) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.neigh_set += 1;
        state.check_failure(None)?;
        state.neighs.insert(neigh.key(), neigh.clone());
        Ok(())
    }

    fn neigh_del(&self, neigh: &Neigh) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.neigh_del += 1;
        state.check_failure(None)?;
        state
            .neighs
            .remove(&neigh.key())
            .map(|_| ())
            .ok_or(EgressError::Kernel {
                op: "neigh_del",
                errno: libc::ENOENT,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::{NeighState, RT_TABLE_MAIN};

    fn route(dst: &str) -> Route {
        Route {
            table: RT_TABLE_MAIN,
            link_index: 7,
            dst: Some(dst.parse().unwrap()),
            gw: Some("192.168.1.1".parse().unwrap()),
            onlink: true,
        }
    }

    #[test]
    fn test_route_add_twice_is_eexist() {
        let mock = MockNetlink::new();
        mock.route_add(&route("10.0.1.0/24")).unwrap();
        let err = mock.route_add(&route("10.0.1.0/24")).unwrap_err();
        assert!(matches!(err, EgressError::Kernel { errno, .. } if errno == libc::EEXIST));
        assert_eq!(mock.calls().route_add, 2);
    }

    #[test]
    fn test_neigh_del_missing_is_enoent() {
        let mock = MockNetlink::new();
        let neigh = Neigh {
            link_index: 7,
            family: Family::Inet,
            ip: "192.168.1.1".parse().unwrap(),
            mac: None,
            state: NeighState::Permanent,
            flags: 0,
            vni: None,
        };
        assert!(mock.neigh_del(&neigh).unwrap_err().is_not_found());
    }

    #[test]
    fn test_failure_injection() {
        let mock = MockNetlink::new();
        mock.fail_prefix("10.0.2.0/24".parse().unwrap());
        assert!(mock.route_add(&route("10.0.2.0/24")).is_err());
        assert!(mock.route_add(&route("10.0.3.0/24")).is_ok());

        mock.fail_mutations(Some(libc::EPERM));
        assert!(mock.route_replace(&route("10.0.3.0/24")).is_err());
        mock.clear_failures();
        assert!(mock.route_replace(&route("10.0.3.0/24")).is_ok());
        assert_eq!(mock.routes().len(), 1);
    }
}
