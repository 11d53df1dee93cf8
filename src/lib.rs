//! Turnstile - a self-hosted visit tracker.
//!
//! A small HTTP service that records page visits and click events in
//! PostgreSQL, mirrors every entry to a local JSONL log (optionally forwarding
//! it to a remote collector), and serves aggregate counters plus a health
//! endpoint suitable for load-balancer checks.

pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod http;
pub mod middleware;
pub mod routes;
pub mod shipper;
pub mod state;
pub mod visits;
