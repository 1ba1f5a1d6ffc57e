//! pollcast library
//!
//! A live polling server: one shared question, a voting flag and a tally,
//! driven by admins and voters over WebSocket.

pub mod auth;
pub mod cli;
pub mod config;
pub mod logging;
pub mod polls;
pub mod registry;
pub mod server;
