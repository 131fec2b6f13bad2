//! A minimal push path for constrained publishers and point-to-point
//! fan-out: one envelope per mTLS `POST /`.

pub mod client;
pub mod server;

pub use client::{HttpsBridgeClientConfig, run_client};
pub use server::{HttpsBridgeServerConfig, run_server};
