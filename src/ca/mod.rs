//! The certificate authority.

pub mod certdb;
pub mod checker;
pub mod cleaner;
pub mod keeper;
pub mod lifecycle;
pub mod ocsp;
pub mod pemstore;
pub mod revoke;
pub mod signer;
pub mod upper;

pub use self::certdb::CertDb;
pub use self::keeper::Keeper;
pub use self::lifecycle::CertLifecycle;
pub use self::ocsp::OcspResponder;
pub use self::revoke::SelfRevoker;
pub use self::signer::CaSigner;
pub use self::upper::{SigningCapability, UpperCa, UpperClients};
