//! The CA certificates a workload trusts.

use std::collections::HashMap;
use std::sync::RwLock;

use openssl::hash::MessageDigest;
use openssl::x509::store::{X509Store, X509StoreBuilder};
use openssl::x509::{X509, X509Ref};

use crate::commons::crypto::{authority_key_id, subject_key_id};
use crate::commons::error::CaResult;

//------------ TrustStore ----------------------------------------------------

/// Trusted CA certificates, keyed by subject key identifier.
///
/// Adding and flushing are mutually exclusive. Readers get snapshots and
/// never observe a half-applied refresh.
#[derive(Debug, Default)]
pub struct TrustStore {
    certs: RwLock<HashMap<String, X509>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the certificates, returns how many were new.
    pub fn add_certs(&self, certs: &[X509]) -> CaResult<usize> {
        let keyed = certs
            .iter()
            .map(|cert| Ok((Self::key(cert)?, cert.clone())))
            .collect::<CaResult<Vec<_>>>()?;

        let mut store = self.certs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut added = 0;
        for (key, cert) in keyed {
            if store.insert(key, cert).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Replaces the whole content in one step.
    pub fn replace(&self, certs: &[X509]) -> CaResult<()> {
        let keyed = certs
            .iter()
            .map(|cert| Ok((Self::key(cert)?, cert.clone())))
            .collect::<CaResult<HashMap<_, _>>>()?;
        *self.certs.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = keyed;
        Ok(())
    }

    pub fn flush(&self) {
        self.certs.write().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }

    /// Looks up a certificate by its hex subject key identifier.
    pub fn get(&self, key_id: &str) -> Option<X509> {
        self.read(|certs| certs.get(key_id).cloned())
    }

    pub fn certificates(&self) -> Vec<X509> {
        self.read(|certs| certs.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read(|certs| certs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Builds an OpenSSL store from the current content for chain
    /// verification.
    pub fn x509_store(&self) -> CaResult<X509Store> {
        let mut builder = X509StoreBuilder::new()?;
        for cert in self.certificates() {
            builder.add_cert(cert)?;
        }
        Ok(builder.build())
    }

    /// Finds the issuer of `cert`.
    ///
    /// The trusted certificates are searched first, then the certificates
    /// the peer presented along with its own.
    pub fn find_issuer(&self, cert: &X509Ref, presented: &[X509]) -> Option<X509> {
        let aki = authority_key_id(cert)?;
        self.get(&aki).or_else(|| {
            presented
                .iter()
                .find(|candidate| subject_key_id(candidate).as_deref() == Some(aki.as_str()))
                .cloned()
        })
    }

    fn read<T>(&self, op: impl FnOnce(&HashMap<String, X509>) -> T) -> T {
        op(&self.certs.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Certificates without a key identifier are keyed by their digest.
    fn key(cert: &X509Ref) -> CaResult<String> {
        match subject_key_id(cert) {
            Some(ski) => Ok(ski),
            None => Ok(hex::encode(cert.digest(MessageDigest::sha256())?)),
        }
    }
}

//------------ Tests ---------------------------------------------------------
