//! Cluster metadata controllers.
//!
//! This crate starts a catalog of independent, watch-driven controllers on top
//! of shared Kubernetes informers, waits for their caches to sync, and keeps an
//! in-memory map of node labels and pod service tags that is served over a
//! small HTTP API.
//!
//! Startup goes through three steps:
//! 1. build a [`ControllerCatalog`] (usually [`default_catalog`])
//! 2. call [`orchestrator::run`], which starts every enabled controller and
//!    then begins dispatching informer events
//! 3. await [`Startup::wait_ready`] for each controller's cache sync outcome
//!
//! Controllers with fleet-wide side effects run behind a
//! [`LeaderGatedController`] and only tick while this replica leads.

pub mod aggregator;
pub mod api;
pub mod autoscalers;
pub mod catalog;
pub mod config;
pub mod controllers;
pub mod error;
pub mod informer;
pub mod leader;
pub mod metrics;
pub mod orchestrator;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_utils;

pub use aggregator::{ClusterMetadata, MetadataAggregator, MetadataQuery, NodePods};
pub use catalog::{default_catalog, ControllerCatalog, ControllerContext};
pub use config::AgentConfig;
pub use error::ControllerError;
pub use informer::{InformerFactory, WatchSource};
pub use leader::{LeaderElector, LeaderGatedController, LeadershipState};
pub use orchestrator::Startup;
