//! Ringgate - a webhook fan-out proxy for a local SMS gateway
//!
//! The gateway only delivers webhooks to loopback, so this daemon sits on the
//! same host and re-emits events to remote subscribers. It:
//! - Receives gateway webhooks on a loopback-only ingress listener
//! - Routes each event to the right deployment ring based on a durable
//!   per-sender allowlist
//! - Fans events out to registered subscribers in parallel with bounded retries
//! - Tracks subscribers as soft state with a heartbeat TTL and pruning
//! - Continuously reconciles the gateway's webhook registrations
//! - Exposes a control-plane API restricted to a configured private interface

pub mod admin;
pub mod allowlist;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fanout;
pub mod gateway;
pub mod ingress;
pub mod netutil;
pub mod reconciler;
pub mod registry;
