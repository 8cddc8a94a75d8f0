//! Egress gateway route synchronisation
//!
//! Keeps the kernel of an egress gateway node programmed so that return
//! traffic for remote workloads is encapsulated over VXLAN towards the node
//! hosting them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  facts  ┌─────────────┐ snapshot ┌──────────────┐ netlink ┌────────┐
//! │  SyncClient  │────────▶│ RouteStore  │─────────▶│ RouteManager │────────▶│ kernel │
//! │ (PolicySync) │  queue  │ (CIDR table)│  mailbox │ (reconcile)  │         │        │
//! └──────────────┘         └─────────────┘          └──────────────┘         └────────┘
//!                                                          │ readiness
//!                                                          ▼
//!                                                  ┌─────────────────┐
//!                                                  │ HealthAggregator│
//!                                                  └─────────────────┘
//! ```
//!
//! The client replaces its queue on every reconnect; the store resets and
//! waits for the new in-sync marker before publishing. The manager only ever
//! reconciles the newest snapshot and retries failures with jittered backoff.

pub mod backoff;
pub mod config;
pub mod error;
pub mod health;
pub mod mac_builder;
pub mod mailbox;
pub mod netlink;
pub mod proto;
pub mod route_manager;
pub mod route_store;
pub mod sync_client;
pub mod types;

pub use config::GatewayConfig;
pub use error::{EgressError, Result};
pub use health::HealthAggregator;
pub use route_manager::{RouteManager, RouteManagerConfig};
pub use route_store::{RouteSnapshot, RouteStore};
pub use sync_client::{FactSource, PolicySyncSource, SyncClient};
