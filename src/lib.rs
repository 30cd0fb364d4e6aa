//! The _meshca_ library crate.
//!
//! A workload certificate authority for zero-trust service meshes: the CA
//! side keeps its own identity and trust chain, the client side obtains,
//! rotates and verifies short-lived workload certificates, and both sides
//! share OCSP based revocation checking.

pub mod ca;
pub mod client;
pub mod commons;
pub mod config;
pub mod constants;
pub mod daemon;
