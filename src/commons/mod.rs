//! Common types and helpers used by the CA and by workloads.

pub mod api;
pub mod cache;
pub mod crypto;
pub mod error;
pub mod events;
pub mod flight;
pub mod httpclient;
pub mod identity;
pub mod metrics;
pub mod storage;

pub use self::error::{CaResult, Error};
