//! Route manager: programs the kernel from route store snapshots.
//!
//! Store notifications only mark the manager dirty; the table is read when
//! the notification is dequeued, so a late notification can never program
//! an older table. Each snapshot is turned into a [`DesiredState`] (encap
//! routes, ARP and FDB entries on the VXLAN device, exit routes on the
//! default device) which is then reconciled against the kernel.
//! Reconciliation runs L2 and L3 on two blocking tasks and joins them. A
//! failed pass schedules a jittered retry; a newer snapshot always replaces
//! a pending retry.

mod desired;
mod reconcile;
mod tunnels;

pub use desired::{build_desired, DataplaneLinks, DesiredState};
pub use reconcile::{ensure_neighs, ensure_routing};
pub use tunnels::select_active_tunnels;

use crate::backoff::{BackoffPolicy, JitteredBackoff, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_JITTER};
use crate::error::{EgressError, Result};
use crate::health::{HealthAggregator, HealthReport};
use crate::mac_builder::MacBuilder;
use crate::mailbox::Mailbox;
use crate::netlink::{default_route, Family, NetlinkHandle};
use crate::route_store::{ResyncObserver, RouteSnapshot, RouteStore};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health reporter name for the kernel programming loop.
pub const DATAPLANE_REPORTER: &str = "dataplane";

#[derive(Debug, Clone)]
pub struct RouteManagerConfig {
    /// Name of the VXLAN device to program.
    pub tunnel_interface: String,
    pub vni: u32,
    pub retry_interval: Duration,
    pub retry_jitter: f64,
}

impl Default for RouteManagerConfig {
    fn default() -> Self {
        Self {
            tunnel_interface: "vxlan0".to_string(),
            vni: 4097,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

/// Marks the manager dirty on every in-sync store change.
struct ResyncInbox {
    mailbox: Arc<Mailbox<()>>,
}

impl ResyncObserver for ResyncInbox {
    fn notify_resync(&self, _store: &RouteStore) {
        if self.mailbox.post(()).is_some() {
            debug!("Store change coalesced with a pending one");
        }
    }
}

pub struct RouteManager {
    nl: Arc<dyn NetlinkHandle>,
    links: DataplaneLinks,
    macs: MacBuilder,
    store: RouteStore,
    inbox: Arc<Mailbox<()>>,
    health: HealthAggregator,
    backoff: Box<dyn BackoffPolicy>,
    /// Last successfully computed desired state; retries re-apply it.
    desired: Option<Arc<DesiredState>>,
}

impl RouteManager {
    /// Resolves the tunnel device, default route and default device, and
    /// subscribes to `store`. Any missing prerequisite is an error.
    pub fn new(
        nl: Arc<dyn NetlinkHandle>,
        store: &RouteStore,
        config: RouteManagerConfig,
        health: HealthAggregator,
    ) -> Result<Self> {
        let tunnel = nl.link_by_name(&config.tunnel_interface)?;
        let route = default_route(nl.as_ref())?;
        let default_gw = route.gw.ok_or(EgressError::NoDefaultRoute)?;
        let default = nl.link_by_index(route.link_index)?;

        info!(
            tunnel = %tunnel.name,
            tunnel_index = tunnel.index,
            default_link = %default.name,
            default_gw = %default_gw,
            vni = config.vni,
            "Route manager initialised"
        );

        health.register_reporter(DATAPLANE_REPORTER, HealthReport::ready());

        let inbox = Arc::new(Mailbox::new());
        store.subscribe(Arc::new(ResyncInbox {
            mailbox: inbox.clone(),
        }));

        Ok(Self {
            nl,
            links: DataplaneLinks {
                tunnel,
                default,
                default_gw,
                vni: config.vni,
            },
            macs: MacBuilder,
            store: store.clone(),
            inbox,
            health,
            backoff: Box::new(JitteredBackoff::new(
                config.retry_interval,
                config.retry_jitter,
            )),
            desired: None,
        })
    }

    pub fn with_backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    pub fn links(&self) -> &DataplaneLinks {
        &self.links
    }

    /// Computes desired state for `snapshot` and reconciles it.
    ///
    /// If the snapshot has no workload route for this gateway the previous
    /// desired state is kept and an error returned.
    pub async fn sync_snapshot(&mut self, snapshot: RouteSnapshot) -> Result<()> {
        let desired = build_desired(&snapshot, &self.links, &self.macs)
            .inspect_err(|e| error!(error = %e, "Could not compute desired dataplane"))?;
        let desired = Arc::new(desired);
        self.desired = Some(desired.clone());
        self.ensure_networking(desired).await
    }

    /// Re-applies the last desired state.
    pub async fn resync(&self) -> Result<()> {
        match &self.desired {
            Some(desired) => self.ensure_networking(desired.clone()).await,
            None => Err(EgressError::NoDesiredState),
        }
    }

    async fn ensure_networking(&self, desired: Arc<DesiredState>) -> Result<()> {
        info!("Attempting to ensure kernel networking");

        let l2 = {
            let nl = self.nl.clone();
            let desired = desired.clone();
            let tunnel = self.links.tunnel.clone();
            tokio::task::spawn_blocking(move || {
                let arp = ensure_neighs(nl.as_ref(), &desired.arp_neighs, &tunnel, Family::Inet)
                    .inspect_err(|e| warn!(error = %e, "Error programming kernel ARP"));
                let fdb = ensure_neighs(nl.as_ref(), &desired.fdb_neighs, &tunnel, Family::Bridge)
                    .inspect_err(|e| warn!(error = %e, "Error programming kernel FDB"));
                fdb.and(arp)
            })
        };

        let l3 = {
            let nl = self.nl.clone();
            let links = self.links.clone();
            tokio::task::spawn_blocking(move || {
                let encap = ensure_routing(nl.as_ref(), &desired.workload_routes, &links.tunnel, |_| true)
                    .inspect_err(|e| warn!(error = %e, "Error programming kernel VXLAN routes"));
                // Only routes via the default gateway on the default device are ours
                let default_gw = links.default_gw;
                let exit = ensure_routing(nl.as_ref(), &desired.exit_routes, &links.default, |route| {
                    route.gw == Some(default_gw)
                })
                .inspect_err(|e| warn!(error = %e, "Error programming kernel exit routes"));
                exit.and(encap)
            })
        };

        let (l2, l3) = tokio::join!(l2, l3);
        let mut last_err = None;
        for (class, joined) in [("l2", l2), ("l3", l3)] {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => last_err = Some(e),
                Err(e) => {
                    error!(class, error = %e, "Kernel programming task failed");
                    last_err = Some(EgressError::Netlink(format!("{} task failed: {}", class, e)));
                }
            }
        }

        match last_err {
            None => {
                info!("Kernel networking in sync");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Processes snapshots and retries until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Route manager started");
        let inbox = self.inbox.clone();
        let mut retry: Option<Pin<Box<Sleep>>> = None;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = inbox.recv() => {
                    let Some(snapshot) = self.store.synced_routes() else {
                        debug!("Store is rebuilding, waiting for the next in-sync");
                        continue;
                    };
                    retry = None;
                    self.sync_snapshot(snapshot).await
                }
                _ = wait_for_retry(&mut retry) => {
                    retry = None;
                    info!("Retrying kernel programming");
                    self.resync().await
                }
            };

            match result {
                Ok(()) => self.health.report(DATAPLANE_REPORTER, HealthReport::ready()),
                Err(e) => {
                    self.health
                        .report(DATAPLANE_REPORTER, HealthReport::not_ready());
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Kernel programming failed, scheduling retry");
                    retry = Some(Box::pin(tokio::time::sleep(delay)));
                }
            }
        }

        self.health
            .report(DATAPLANE_REPORTER, HealthReport::not_ready());
        info!("Route manager stopped");
    }
}

async fn wait_for_retry(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
