//! Rating service - incremental reputation aggregation per workspace
//!
//! Consumes the change-record log of every workspace from NATS JetStream and
//! keeps one reputation aggregate per account in the workspace's MongoDB
//! database, with best-effort live notification of rating changes.
//!
//! ## Components
//!
//! - **Formula**: aggregate counters to a scalar rating
//! - **Resolver**: author identity to account, with negative caching
//! - **Burst limiter**: debounces rapid-fire operations per account
//! - **Flush coordinator**: batched upserts and change notifications
//! - **Calculator**: migration replay and incremental processing of one workspace
//! - **Manager**: calculator lifecycle across workspaces, queue consumers

pub mod config;
pub mod db;
pub mod manager;
pub mod model;
pub mod nats;
pub mod rating;
pub mod services;
pub mod types;

pub use config::Args;
pub use manager::{ManagerConfig, ManagerDeps, WorkspaceManager};
pub use types::{RatingError, Result};
