//! xmpp-smsd: an XEP-0114 component that bridges XMPP users to SMS carriers.
//!
//! The process is split into a handful of long-running tasks connected by
//! channels:
//! - the XMPP transport (component connection, reconnect, serialized writer)
//! - the webhook server (one axum sub-router per configured provider)
//! - the gateway router (single consumer owning contact state)
//! - the admin server (health, stats, metrics)

pub mod address;
pub mod admin;
pub mod bootstrap;
pub mod config;
pub mod contact;
pub mod gateway;
pub mod provider;
pub mod roster;
pub mod telemetry;
pub mod webhook;
pub mod xmpp;
