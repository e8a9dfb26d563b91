//! A static file server built as a pipeline of per-worker queues.
//!
//! Each [`worker::Worker`] accepts connections from a shared listener and
//! moves them through four stages: waiting for the request head, sending the
//! file, handing the connection to a cooperating server, and finishing.
//! Anything that can't be served safely and simply from the document root is
//! handed off.

pub mod access_log;
pub mod config;
pub mod filter;
pub mod finish;
pub mod handoff;
pub mod header;
pub mod http;
pub mod mime;
pub mod pool;
pub mod record;
pub mod security;
pub mod send;
pub mod sys;
pub mod worker;
