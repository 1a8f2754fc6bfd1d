//! # Mergex Core
//!
//! Core library for the Mergex auto-merge service.
//!
//! ## Overview
//!
//! Mergex consumes repository webhook events, keeps a durable per-repository
//! FIFO of merge candidates, and drives each candidate through a multi-phase
//! merge pipeline against the hosting platform's API:
//!
//! - **Ingress**: normalizes raw webhook payloads into typed work items
//! - **Queue store**: durable FIFO + dedup set + lease per repository,
//!   backed by Redis (or an in-process store for tests and dev runs)
//! - **Scheduler**: a pool of workers, each holding at most one repo lease
//! - **Pipeline**: policy load, eligibility evaluation, branch update,
//!   check polling, and the final guarded merge call
//! - **GitHub facade**: typed operations over the remote API with retry
//!   discipline and rate-limit observation

/// Work items and repository coordinates
pub mod model;

/// Per-repository merge policy and commit templates
pub mod policy;

/// Durable queue store implementations
pub mod queue;

/// Typed facade over the hosting platform API
pub mod github;

/// Webhook event normalization
pub mod ingress;

/// Worker pool driving repo queues
pub mod scheduler;

/// The per-item merge state machine
pub mod pipeline;

/// Prometheus metric families
pub mod metrics;

pub use metrics::Metrics;
pub use model::{RepoKey, WorkItem};
pub use policy::{MergeMethod, RepoPolicy};
