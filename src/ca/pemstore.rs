//! Where certificate and key PEMs live.
//!
//! The CA keeps the PEMs of its own key pair, of its trust chain and of
//! every issued certificate. They are either kept next to the certificate
//! records in the database, or in a separate secret store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use crate::commons::error::{CaResult, Error};
use crate::commons::storage::{Key, KeyValueStore};
use crate::constants::{PEM_KEY_LOCAL_STORE, PEM_KEY_TRUST_CERTS};

//------------ PemKey --------------------------------------------------------

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PemKey {
    /// An issued certificate, by its decimal serial number.
    Serial(String),

    /// The CA's own key pair.
    LocalStore,

    /// The CA's trust certificates bundle.
    TrustCerts,
}

impl PemKey {
    fn name(&self) -> &str {
        match self {
            PemKey::Serial(sn) => sn,
            PemKey::LocalStore => PEM_KEY_LOCAL_STORE,
            PemKey::TrustCerts => PEM_KEY_TRUST_CERTS,
        }
    }
}

impl fmt::Display for PemKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

//------------ PemEntry ------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PemEntry {
    pub cert: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key: Option<String>,
}

impl PemEntry {
    pub fn cert(cert: impl Into<String>) -> Self {
        PemEntry {
            cert: cert.into(),
            key: None,
        }
    }

    pub fn key_pair(key: impl Into<String>, cert: impl Into<String>) -> Self {
        PemEntry {
            cert: cert.into(),
            key: Some(key.into()),
        }
    }
}

//------------ CertPemStore --------------------------------------------------

pub trait CertPemStore: fmt::Debug + Send + Sync {
    fn get(&self, key: &PemKey) -> CaResult<Option<PemEntry>>;

    fn put(&self, key: &PemKey, entry: &PemEntry) -> CaResult<()>;

    /// Removes an entry. Removing an absent entry is not an error.
    fn delete(&self, key: &PemKey) -> CaResult<()>;

    /// Whether the PEM of a certificate is removed when its holder revokes
    /// it.
    fn deletes_on_self_revoke(&self) -> bool;
}

//------------ PemStorage ----------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PemStorage {
    #[default]
    Database,
    SecretStore,
}

impl FromStr for PemStorage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "db" => Ok(PemStorage::Database),
            "secret-store" | "vault" => Ok(PemStorage::SecretStore),
            _ => Err(Error::custom(format!("unknown pem storage '{}'", s))),
        }
    }
}

impl<'de> Deserialize<'de> for PemStorage {
    fn deserialize<D>(d: D) -> Result<PemStorage, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        PemStorage::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Creates the PEM store for the configured strategy.
pub fn create_pem_store(
    storage: PemStorage,
    storage_uri: &Url,
    secret_store_uri: Option<&Url>,
) -> CaResult<Arc<dyn CertPemStore>> {
    match storage {
        PemStorage::Database => Ok(Arc::new(DbCertPemStore::create(storage_uri)?)),
        PemStorage::SecretStore => {
            let uri = secret_store_uri.unwrap_or(storage_uri);
            let secrets = KvSecretStore::create(uri)?;
            Ok(Arc::new(SecretCertPemStore::new(Arc::new(secrets))))
        }
    }
}

//------------ DbCertPemStore ------------------------------------------------

/// Keeps PEMs in the certificate database.
#[derive(Debug)]
pub struct DbCertPemStore {
    store: KeyValueStore,
}

impl DbCertPemStore {
    const SCOPE: &'static str = "pem";

    pub fn create(storage_uri: &Url) -> CaResult<Self> {
        Ok(DbCertPemStore {
            store: KeyValueStore::create(storage_uri, "certdb")?,
        })
    }

    fn storage_key(key: &PemKey) -> CaResult<Key> {
        Ok(Key::new(Self::SCOPE, key.name())?)
    }
}

impl CertPemStore for DbCertPemStore {
    fn get(&self, key: &PemKey) -> CaResult<Option<PemEntry>> {
        Ok(self.store.get(&Self::storage_key(key)?)?)
    }

    fn put(&self, key: &PemKey, entry: &PemEntry) -> CaResult<()> {
        Ok(self.store.store(&Self::storage_key(key)?, entry)?)
    }

    fn delete(&self, key: &PemKey) -> CaResult<()> {
        Ok(self.store.drop_key(&Self::storage_key(key)?)?)
    }

    fn deletes_on_self_revoke(&self) -> bool {
        false
    }
}

//------------ SecretStore ---------------------------------------------------

/// A store of named secrets.
pub trait SecretStore: fmt::Debug + Send + Sync {
    fn read(&self, path: &str) -> CaResult<Option<PemEntry>>;
    fn write(&self, path: &str, secret: &PemEntry) -> CaResult<()>;
    fn remove(&self, path: &str) -> CaResult<()>;
}

/// A secret store kept in a key value store of its own.
#[derive(Debug)]
pub struct KvSecretStore {
    store: KeyValueStore,
}

impl KvSecretStore {
    const SCOPE: &'static str = "secrets";

    pub fn create(uri: &Url) -> CaResult<Self> {
        Ok(KvSecretStore {
            store: KeyValueStore::create(uri, "secrets")?,
        })
    }

    fn key(path: &str) -> CaResult<Key> {
        Ok(Key::new(Self::SCOPE, path.replace('/', "_"))?)
    }
}

impl SecretStore for KvSecretStore {
    fn read(&self, path: &str) -> CaResult<Option<PemEntry>> {
        Ok(self.store.get(&Self::key(path)?)?)
    }

    fn write(&self, path: &str, secret: &PemEntry) -> CaResult<()> {
        Ok(self.store.store(&Self::key(path)?, secret)?)
    }

    fn remove(&self, path: &str) -> CaResult<()> {
        Ok(self.store.drop_key(&Self::key(path)?)?)
    }
}

//------------ SecretCertPemStore --------------------------------------------

/// Keeps PEMs in a secret store, under `certs/<name>`.
#[derive(Debug)]
pub struct SecretCertPemStore {
    secrets: Arc<dyn SecretStore>,
}

impl SecretCertPemStore {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        SecretCertPemStore { secrets }
    }

    fn path(key: &PemKey) -> String {
        format!("certs/{}", key)
    }
}

impl CertPemStore for SecretCertPemStore {
    fn get(&self, key: &PemKey) -> CaResult<Option<PemEntry>> {
        self.secrets.read(&Self::path(key))
    }

    fn put(&self, key: &PemKey, entry: &PemEntry) -> CaResult<()> {
        debug!("writing secret {}", Self::path(key));
        self.secrets.write(&Self::path(key), entry)
    }

    fn delete(&self, key: &PemKey) -> CaResult<()> {
        self.secrets.remove(&Self::path(key))
    }

    fn deletes_on_self_revoke(&self) -> bool {
        true
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn exercise(store: &dyn CertPemStore) {
        let sn = PemKey::Serial("1234".into());
        assert_eq!(store.get(&sn).unwrap(), None);

        store.put(&sn, &PemEntry::cert("CERT")).unwrap();
        store
            .put(&PemKey::LocalStore, &PemEntry::key_pair("KEY", "CA"))
            .unwrap();

        assert_eq!(store.get(&sn).unwrap(), Some(PemEntry::cert("CERT")));
        assert_eq!(
            store.get(&PemKey::LocalStore).unwrap().and_then(|e| e.key),
            Some("KEY".to_string())
        );

        store.delete(&sn).unwrap();
        store.delete(&sn).unwrap();
        assert_eq!(store.get(&sn).unwrap(), None);
    }

    #[test]
    fn database_strategy() {
        let store = create_pem_store(PemStorage::Database, &test::mem_storage(), None).unwrap();
        exercise(store.as_ref());
        assert!(!store.deletes_on_self_revoke());
    }

    #[test]
    fn secret_store_strategy() {
        let secrets = test::mem_storage();
        let store = create_pem_store(PemStorage::SecretStore, &test::mem_storage(), Some(&secrets)).unwrap();
        exercise(store.as_ref());
        assert!(store.deletes_on_self_revoke());
    }

    #[test]
    fn parse_storage() {
        assert_eq!(PemStorage::from_str("database").unwrap(), PemStorage::Database);
        assert_eq!(PemStorage::from_str("secret-store").unwrap(), PemStorage::SecretStore);
        assert!(PemStorage::from_str("floppy").is_err());
    }
}
