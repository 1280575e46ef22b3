//! hermes - Real-time chat gateway
//!
//! This library provides an authenticated STOMP-over-WebSocket gateway with
//! direct and group routing, inline attachments, delivery acknowledgments
//! and presence, backed by a SQLite store.

pub mod gateway;

pub use gateway::{Gateway, GatewayConfig};
