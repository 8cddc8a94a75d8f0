//! Authoritative table of workload and tunnel routes.
//!
//! The store rebuilds its table from scratch for every stream the sync client
//! hands it. Observers hear about changes only once the control plane has
//! declared the stream in sync, so partial state during catch-up is never
//! published.

use crate::proto::{to_dataplane::Payload, RouteRemove, RouteUpdate, ToDataplane};
use crate::sync_client::{FactStream, SyncClient};
use crate::types::RouteFact;
use egress_types::IpPrefix;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives a notification after every change once the store is in sync.
pub trait ResyncObserver: Send + Sync + 'static {
    fn notify_resync(&self, store: &RouteStore);
}

/// Decomposition of the table used by the route manager.
///
/// Groupings are keyed by node name and each group is ordered by CIDR.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSnapshot {
    /// The workload route of this gateway, if the control plane sent one.
    pub this_workload: Option<RouteFact>,
    pub workloads_by_node: BTreeMap<String, Vec<RouteFact>>,
    pub tunnels_by_node: BTreeMap<String, Vec<RouteFact>>,
}

#[derive(Default)]
struct TableState {
    table: BTreeMap<IpPrefix, RouteFact>,
    in_sync: bool,
}

struct Inner {
    gateway_ip: IpAddr,
    state: RwLock<TableState>,
    observers: RwLock<Vec<Arc<dyn ResyncObserver>>>,
}

/// Workload/tunnel route table. Clones share state.
#[derive(Clone)]
pub struct RouteStore {
    inner: Arc<Inner>,
}

impl RouteStore {
    pub fn new(gateway_ip: IpAddr) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway_ip,
                state: RwLock::new(TableState::default()),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ResyncObserver>) {
        self.inner.observers.write().push(observer);
    }

    pub fn in_sync(&self) -> bool {
        self.inner.state.read().in_sync
    }

    /// Copy of the raw table.
    pub fn table(&self) -> BTreeMap<IpPrefix, RouteFact> {
        self.inner.state.read().table.clone()
    }

    /// Groups the table for the route manager.
    pub fn routes(&self) -> RouteSnapshot {
        self.group(&self.inner.state.read())
    }

    /// Like [`RouteStore::routes`], but `None` while the table is still
    /// being rebuilt after a reset.
    pub fn synced_routes(&self) -> Option<RouteSnapshot> {
        let state = self.inner.state.read();
        state.in_sync.then(|| self.group(&state))
    }

    fn group(&self, state: &TableState) -> RouteSnapshot {
        let gateway_ip = self.inner.gateway_ip;

        let mut snapshot = RouteSnapshot::default();
        for fact in state.table.values() {
            if fact.is_workload() {
                if fact.dst.contains(gateway_ip)
                    && snapshot
                        .this_workload
                        .as_ref()
                        .map_or(true, |current| current.dst.prefix_len() < fact.dst.prefix_len())
                {
                    snapshot.this_workload = Some(fact.clone());
                }
                snapshot
                    .workloads_by_node
                    .entry(fact.dst_node_name.clone())
                    .or_default()
                    .push(fact.clone());
            }
            if fact.is_tunnel() {
                snapshot
                    .tunnels_by_node
                    .entry(fact.dst_node_name.clone())
                    .or_default()
                    .push(fact.clone());
            }
        }
        snapshot
    }

    /// Consumes one stream until the client closes it.
    pub async fn ingest(&self, stream: FactStream) {
        self.reset();
        while let Some(msg) = stream.recv().await {
            self.apply(msg);
        }
        debug!("Fact stream closed");
    }

    /// Ingests the client's current stream over and over until cancelled.
    pub async fn run(&self, client: Arc<SyncClient>, cancel: CancellationToken) {
        info!(gateway_ip = %self.inner.gateway_ip, "Route store started");
        loop {
            let stream = client.current_fact_stream();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ingest(stream) => {}
            }
        }
        info!("Route store stopped");
    }

    fn reset(&self) {
        let mut state = self.inner.state.write();
        state.in_sync = false;
        state.table.clear();
        debug!("Route table reset for new stream");
    }

    /// Applies one message and notifies observers if in sync.
    pub fn apply(&self, msg: ToDataplane) {
        let in_sync = match msg.payload {
            Some(Payload::RouteUpdate(update)) => self.on_update(update),
            Some(Payload::RouteRemove(remove)) => self.on_remove(remove),
            Some(Payload::InSync(_)) => {
                let mut state = self.inner.state.write();
                if !state.in_sync {
                    info!(routes = state.table.len(), "Route table in sync");
                }
                state.in_sync = true;
                true
            }
            None => {
                warn!(seq = msg.sequence_number, "Ignoring message with unknown payload");
                return;
            }
        };

        if in_sync {
            self.notify_observers();
        }
    }

    fn on_update(&self, update: RouteUpdate) -> bool {
        let dst = update.dst.clone();
        let fact = match RouteFact::try_from(update) {
            Ok(fact) => fact,
            Err(e) => {
                warn!(dst = %dst, error = %e, "Skipping malformed route update");
                return self.in_sync();
            }
        };

        let mut state = self.inner.state.write();
        if fact.is_workload() || fact.is_tunnel() {
            debug!(dst = %fact.dst, node = %fact.dst_node_name, "Route update");
            state.table.insert(fact.dst, fact);
        } else if state.table.remove(&fact.dst).is_some() {
            debug!(dst = %fact.dst, "Route no longer a workload or tunnel, removed");
        }
        state.in_sync
    }

    fn on_remove(&self, remove: RouteRemove) -> bool {
        let dst: IpPrefix = match remove.dst.parse() {
            Ok(dst) => dst,
            Err(e) => {
                warn!(dst = %remove.dst, error = %e, "Skipping malformed route remove");
                return self.in_sync();
            }
        };

        let mut state = self.inner.state.write();
        if state.table.remove(&dst).is_some() {
            debug!(dst = %dst, "Route removed");
        }
        state.in_sync
    }

    fn notify_observers(&self) {
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            let store = self.clone();
            tokio::spawn(async move {
                observer.notify_resync(&store);
            });
        }
    }
}
