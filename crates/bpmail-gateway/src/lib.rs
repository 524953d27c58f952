//! Mail gateway over a spool-backed bundle transport.
//!
//! `bpmailrecv` receives one delivery, verifies and sanitizes it and writes
//! the message to stdout. `bpmailsend` compresses stdin and queues it.

pub mod app;
pub mod config;
pub mod logging;
pub mod resolver;
pub mod spool;
