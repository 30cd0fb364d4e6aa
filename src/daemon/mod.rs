//! The CA daemon: the HTTP API and the background tasks behind it.

pub mod http;
pub mod start;
