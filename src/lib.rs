//! Sensor Seal Gateway Server core.
//!
//! A UDP endpoint for sensor-seal edge gateways speaking SSGSCP: packet
//! authentication and decryption ([`protocol::codec`]), telemetry decoding
//! ([`protocol::seal`]), per-gateway reliability state ([`server::gateway`])
//! and the single-task dispatch loop ([`server`]).
//!
//! Applications supply a connection hook that installs per-gateway
//! `on_message` / `on_reconnect` callbacks, and send configuration
//! payloads through a [`server::ServerHandle`].

pub mod config;
pub mod protocol;
pub mod server;
