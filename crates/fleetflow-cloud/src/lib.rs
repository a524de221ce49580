//! FleetFlow Cloud Infrastructure
//!
//! This crate reconciles sub-resources that live inside a shared remote
//! aggregate, such as the rules, probes, NAT rules and pools of a load
//! balancer. Each sub-resource is declared and managed independently, but the
//! cloud API only accepts whole-aggregate writes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │     callers (one per declared sub-resource)      │
//! └─────────────────┬───────────────────────────────┘
//!                   │ upsert / remove / apply
//! ┌─────────────────▼───────────────────────────────┐
//! │               fleetflow-cloud                    │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │              Reconciler                   │   │
//! │  │  lock ▸ fetch ▸ mutate ▸ submit ▸ poll    │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐ ┌────────────┐ ┌──────────┐   │
//! │  │ LockRegistry │ │  locator   │ │ id parser│   │
//! │  └──────────────┘ └────────────┘ └──────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │ trait AggregateStore
//!         ┌─────────┴─────────┐
//! ┌───────▼───────┐   ┌───────▼───────┐
//! │ InMemoryStore │   │  azure (ARM)  │
//! └───────────────┘   └───────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleetflow_cloud::*;
//! use std::sync::Arc;
//!
//! let locks = Arc::new(LockRegistry::new());
//! let reconciler = Reconciler::new(store, locks);
//!
//! let lb = ResourceIdentifier::parse(lb_id)?;
//! let ssh = SubResource::new(
//!     "ssh",
//!     SubResourceProperties::InboundNatRule(InboundNatRule::new(
//!         "public",
//!         TransportProtocol::Tcp,
//!         50022,
//!         22,
//!     )),
//! )?;
//! reconciler.upsert(&lb, ssh).await?;
//! reconciler.remove(&lb, CollectionKind::InboundNatRule, "rdp").await?;
//! ```

pub mod config;
pub mod error;
pub mod id;
pub mod locator;
pub mod lock;
pub mod memory;
pub mod model;
pub mod reconcile;
pub mod store;

// Re-exports
pub use config::{BackoffConfig, DuplicatePolicy, ReconcilerConfig};
pub use error::{CloudError, Result};
pub use id::{ResourceIdentifier, Segment};
pub use lock::{LockGuard, LockKey, LockRegistry, MultiLockGuard};
pub use memory::InMemoryStore;
pub use model::{
    AggregateResource, BackendAddressPool, CollectionKind, FrontendIpConfiguration,
    InboundNatPool, InboundNatRule, IpAllocation, LoadBalancingRule, LoadDistribution,
    OutboundRule, Placement, Probe, ProbeProtocol, SubResource, SubResourceProperties,
    TransportProtocol,
};
pub use reconcile::{Change, Reconciler};
pub use store::{AggregateStore, OperationHandle};
