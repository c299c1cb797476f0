//! # Tunnel Wire Protocol
//!
//! Shared wire-level types for the tunnel server and client:
//!
//! - [`message`] — control-plane messages (newline-delimited JSON)
//! - [`codec`]   — async framing for the control channel
//! - [`frame`]   — the binary UDP datagram format
//! - [`crypto`]  — AES-256-GCM sealing for UDP payloads
//! - [`ids`]     — random request IDs and subdomain labels

pub mod codec;
pub mod crypto;
pub mod frame;
pub mod ids;
pub mod message;

/// Protocol version string advertised in `registered` replies.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
