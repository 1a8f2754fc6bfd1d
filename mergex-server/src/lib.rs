//! # Mergex Server
//!
//! Webhook-driven auto-merge service.
//!
//! ## Overview
//!
//! The server accepts repository webhook events, normalizes them into work
//! items on a durable per-repository FIFO, and drives a pool of workers
//! that evaluate, update, wait on checks, and finally merge eligible pull
//! requests on the user's behalf.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - Redis for the durable queue, dedup sets, leases, and dead letters
//! - The hosting platform's REST API behind a typed facade
//! - Prometheus text exposition for metrics

/// Environment configuration
pub mod config;

/// HTTP surface: webhook, metrics, health, admin
pub mod http;

/// Webhook signature verification
pub mod signature;
