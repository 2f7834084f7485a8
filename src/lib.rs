//! Realtime voice-assistant session gateway.
//!
//! See module docs for the session kernel (§4.7), the MCP sub-session
//! (§4.6), and the connection mux (§4.8) for the shape of the system;
//! `README`/`DESIGN.md` at the repo root carry the broader rationale.

pub mod adapters;
pub mod audio;
pub mod config;
pub mod error;
pub mod mcp;
pub mod mux;
pub mod peer;
pub mod protocol;
pub mod session;

pub use config::GatewayConfig;
pub use mux::ConnectionMux;
pub use peer::PeerRegistry;
