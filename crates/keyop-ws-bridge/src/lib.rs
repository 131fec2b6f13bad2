//! A persistent, mutually-authenticated WebSocket extension of the bus
//! across hosts, with resume-by-cursor and per-message acknowledgement.

pub mod client;
pub mod server;

pub use client::{WsBridgeClientConfig, run_client};
pub use server::{WsBridgeServerConfig, run_server};
