//! Azure provider for FleetFlow
//!
//! This crate implements the `AggregateStore` trait for Azure Resource
//! Manager load balancers, so the reconciler in `fleetflow-cloud` can manage
//! frontend IP configurations, backend pools, probes, rules, inbound NAT rules
//! and pools, and outbound rules as independent resources.
//!
//! # Requirements
//!
//! - `ARM_ACCESS_TOKEN` with write access to the target load balancers
//! - Optional: `ARM_ENDPOINT`, `ARM_API_VERSION`, `ARM_POLL_INTERVAL_MS`,
//!   `ARM_USE_ETAG`, `ARM_SUBSCRIPTION_ID`
//!
//! # Example
//!
//! ```ignore
//! use fleetflow_cloud::{LockRegistry, Reconciler};
//! use fleetflow_cloud_azure::AzureLoadBalancerStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(AzureLoadBalancerStore::from_env()?);
//! let reconciler = Reconciler::new(store, Arc::new(LockRegistry::new()));
//!
//! reconciler.upsert(&lb, ssh_rule).await?;
//! ```

pub mod config;
pub mod error;
pub mod store;
pub mod wire;

pub use config::AzureConfig;
pub use error::{AzureError, Result};
pub use store::AzureLoadBalancerStore;
