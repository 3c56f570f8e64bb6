//! Remote terminal sessions over WebSocket.
//!
//! The server binds each WebSocket connection to one session from
//! [`session_driver`] and speaks the [`terminal_protocol`] frame format;
//! the client drives a local terminal (or a pipe) against it.

pub mod cli;
pub mod client;
pub mod config;
pub mod server;
