//! Tally core library: configuration, the session relay, and the HTTP + WebSocket
//! gateway, shared by the `tally` CLI.

pub mod config;
pub mod gateway;
pub mod init;
pub mod relay;
pub mod session;
