//! Bookkeeping of issued certificates and of the forbid list.

use chrono::{DateTime, Utc};
use log::debug;
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::commons::crypto::CertInfo;
use crate::commons::crypto::ocsp::{OcspCertStatus, RevocationReason};
use crate::commons::error::{CaResult, Error};
use crate::commons::storage::{Key, KeyValueStore, StorageResult, Transaction};
use crate::constants::LIFECYCLE_BATCH_LIMIT;

const NAMESPACE: &str = "certdb";
const SCOPE_CERTIFICATES: &str = "certificates";
const SCOPE_FORBID: &str = "forbid";

//------------ CertKey -------------------------------------------------------

/// Identifies an issued certificate.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct CertKey {
    pub serial_number: String,
    pub authority_key_id: String,
}

impl CertKey {
    pub fn new(serial_number: impl Into<String>, authority_key_id: impl Into<String>) -> Self {
        CertKey {
            serial_number: serial_number.into(),
            authority_key_id: authority_key_id.into(),
        }
    }

    fn storage_key(&self) -> CaResult<Key> {
        Ok(Key::new(
            SCOPE_CERTIFICATES,
            format!("{}-{}", self.serial_number, self.authority_key_id),
        )?)
    }
}

//------------ CertStatus ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Good,
    Revoked,
}

//------------ CertificateRecord ---------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateRecord {
    pub serial_number: String,
    pub authority_key_id: String,
    pub common_name: String,
    pub ca_label: String,
    pub status: CertStatus,
    pub reason: RevocationReason,
    pub issued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl CertificateRecord {
    /// Creates the record for a freshly issued certificate.
    pub fn issued(cert: &X509Ref, ca_label: &str) -> CaResult<Self> {
        let info = CertInfo::from_cert(cert)?;
        Ok(CertificateRecord {
            serial_number: info.serial_number,
            authority_key_id: info.authority_key_id,
            common_name: info.common_name,
            ca_label: ca_label.to_string(),
            status: CertStatus::Good,
            reason: RevocationReason::Unspecified,
            issued_at: Utc::now(),
            not_before: info.not_before,
            expiry: info.not_after,
            revoked_at: None,
        })
    }

    pub fn key(&self) -> CertKey {
        CertKey::new(&self.serial_number, &self.authority_key_id)
    }

    pub fn is_revoked(&self) -> bool {
        self.status == CertStatus::Revoked
    }

    pub fn ocsp_status(&self) -> OcspCertStatus {
        match (self.status, self.revoked_at) {
            (CertStatus::Good, _) => OcspCertStatus::Good,
            (CertStatus::Revoked, revoked_at) => OcspCertStatus::Revoked {
                revoked_at: revoked_at.unwrap_or(self.issued_at),
                reason: self.reason,
            },
        }
    }

    fn revoke(&mut self, reason: RevocationReason, now: DateTime<Utc>) {
        self.status = CertStatus::Revoked;
        self.reason = reason;
        self.revoked_at = Some(now);
    }

    fn recover(&mut self) {
        self.status = CertStatus::Good;
        self.reason = RevocationReason::Unspecified;
        self.revoked_at = None;
    }
}

//------------ ForbidRecord --------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ForbidRecord {
    pub id: Uuid,
    pub unique_id: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ForbidRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

//------------ CertSelector --------------------------------------------------

/// Selects the certificates an administrative operation applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CertSelector {
    Key(CertKey),
    Identity(String),
}

impl CertSelector {
    fn matches(&self, record: &CertificateRecord) -> bool {
        match self {
            CertSelector::Key(key) => {
                record.serial_number == key.serial_number && record.authority_key_id == key.authority_key_id
            }
            CertSelector::Identity(unique_id) => &record.common_name == unique_id,
        }
    }
}

//------------ StatusChange --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusChange {
    Revoke(RevocationReason),
    Recover,
}

//------------ CertDb --------------------------------------------------------

/// The durable store of certificate records and forbid records.
#[derive(Debug)]
pub struct CertDb {
    store: KeyValueStore,
}

impl CertDb {
    pub fn create(storage_uri: &Url) -> CaResult<Self> {
        Ok(CertDb {
            store: KeyValueStore::create(storage_uri, NAMESPACE)?,
        })
    }

    pub fn insert_certificate(&self, record: &CertificateRecord) -> CaResult<()> {
        let key = record.key().storage_key()?;
        self.store.store(&key, record)?;
        Ok(())
    }

    pub fn get_certificate(&self, key: &CertKey) -> CaResult<Option<CertificateRecord>> {
        Ok(self.store.get(&key.storage_key()?)?)
    }

    pub fn list_certificates(&self) -> CaResult<Vec<CertificateRecord>> {
        Ok(self
            .store
            .values::<CertificateRecord>(SCOPE_CERTIFICATES)?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    /// Revokes one certificate. Revoking a revoked certificate again keeps
    /// its original revocation time and reason.
    pub fn revoke_certificate(&self, key: &CertKey, reason: RevocationReason) -> CaResult<CertificateRecord> {
        let storage_key = key.storage_key()?;
        let now = Utc::now();
        let record = self.store.execute(|tx| {
            let record: Option<CertificateRecord> = tx.get(&storage_key)?;
            match record {
                None => Ok(None),
                Some(mut record) => {
                    if !record.is_revoked() {
                        record.revoke(reason, now);
                        tx.store(&storage_key, &record)?;
                    }
                    Ok(Some(record))
                }
            }
        })?;
        record.ok_or_else(|| Error::not_found(format!("certificate {}", key.serial_number)))
    }

    /// Changes the status of all unexpired certificates matched by the
    /// selector in one transaction.
    ///
    /// Returns the records that changed. Certificates already in the target
    /// state are left alone. Fails with `NotFound` if the selector matches
    /// no unexpired certificate at all.
    pub fn change_status(&self, selector: &CertSelector, change: StatusChange) -> CaResult<Vec<CertificateRecord>> {
        let now = Utc::now();
        let res = self.store.execute(|tx| {
            let mut matched = 0;
            let mut changed = vec![];

            for (key, mut record) in tx.values::<CertificateRecord>(SCOPE_CERTIFICATES)? {
                if !selector.matches(&record) || record.expiry <= now {
                    continue;
                }
                matched += 1;

                let applies = match change {
                    StatusChange::Revoke(_) => !record.is_revoked(),
                    StatusChange::Recover => record.is_revoked(),
                };
                if !applies || changed.len() >= LIFECYCLE_BATCH_LIMIT {
                    continue;
                }

                match change {
                    StatusChange::Revoke(reason) => record.revoke(reason, now),
                    StatusChange::Recover => record.recover(),
                }
                tx.store(&key, &record)?;
                changed.push(record);
            }
            Ok((matched, changed))
        })?;

        match res {
            (0, _) => Err(Error::not_found("no certificates found")),
            (matched, changed) => {
                debug!("{:?}: {} matched, {} changed", change, matched, changed.len());
                Ok(changed)
            }
        }
    }

    pub fn delete_certificates(&self, keys: &[CertKey]) -> CaResult<()> {
        let storage_keys = keys.iter().map(CertKey::storage_key).collect::<CaResult<Vec<_>>>()?;
        self.store.execute(|tx| {
            for key in &storage_keys {
                tx.delete(key);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Adds an active forbid record for each identity that has none yet.
    ///
    /// Returns the records that were added.
    pub fn forbid(&self, unique_ids: &[String]) -> CaResult<Vec<ForbidRecord>> {
        let now = Utc::now();
        let added = self.store.execute(|tx| {
            let active = Self::active_forbids_tx(tx)?;
            let mut added = vec![];
            for unique_id in unique_ids {
                let known = active.iter().chain(added.iter()).any(|f: &ForbidRecord| &f.unique_id == unique_id);
                if known {
                    continue;
                }
                let record = ForbidRecord {
                    id: Uuid::new_v4(),
                    unique_id: unique_id.clone(),
                    created_at: now,
                    deleted_at: None,
                };
                tx.store(&Key::new(SCOPE_FORBID, record.id.to_string())?, &record)?;
                added.push(record);
            }
            Ok(added)
        })?;
        Ok(added)
    }

    /// Soft deletes the active forbid records of the identities. Returns
    /// the records that were lifted.
    pub fn recover_forbid(&self, unique_ids: &[String]) -> CaResult<Vec<ForbidRecord>> {
        let now = Utc::now();
        let lifted = self.store.execute(|tx| {
            let mut lifted = vec![];
            for mut record in Self::active_forbids_tx(tx)? {
                if unique_ids.contains(&record.unique_id) {
                    record.deleted_at = Some(now);
                    tx.store(&Key::new(SCOPE_FORBID, record.id.to_string())?, &record)?;
                    lifted.push(record);
                }
            }
            Ok(lifted)
        })?;
        Ok(lifted)
    }

    pub fn is_forbidden(&self, unique_id: &str) -> CaResult<bool> {
        Ok(self.active_forbids()?.iter().any(|f| f.unique_id == unique_id))
    }

    pub fn active_forbids(&self) -> CaResult<Vec<ForbidRecord>> {
        Ok(self.store.execute(|tx| Self::active_forbids_tx(tx))?)
    }

    fn active_forbids_tx(tx: &Transaction) -> StorageResult<Vec<ForbidRecord>> {
        Ok(tx
            .values::<ForbidRecord>(SCOPE_FORBID)?
            .into_iter()
            .map(|(_, record)| record)
            .filter(ForbidRecord::is_active)
            .collect())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn record(serial: &str, cn: &str, expiry_in: i64) -> CertificateRecord {
        let now = Utc::now();
        CertificateRecord {
            serial_number: serial.into(),
            authority_key_id: "aa".into(),
            common_name: cn.into(),
            ca_label: "sidecar".into(),
            status: CertStatus::Good,
            reason: RevocationReason::Unspecified,
            issued_at: now,
            not_before: now,
            expiry: now + chrono::Duration::seconds(expiry_in),
            revoked_at: None,
        }
    }

    fn db_with(records: &[CertificateRecord]) -> CertDb {
        let db = CertDb::create(&test::mem_storage()).unwrap();
        for r in records {
            db.insert_certificate(r).unwrap();
        }
        db
    }

    #[test]
    fn revoke_by_identity_leaves_siblings_alone() {
        let db = db_with(&[
            record("1", "svc-a", 3600),
            record("2", "svc-a", 3600),
            record("3", "svc-b", 3600),
            record("4", "svc-a", -10),
        ]);

        let changed = db
            .change_status(
                &CertSelector::Identity("svc-a".into()),
                StatusChange::Revoke(RevocationReason::CaCompromise),
            )
            .unwrap();
        assert_eq!(changed.len(), 2);

        let get = |sn: &str| db.get_certificate(&CertKey::new(sn, "aa")).unwrap().unwrap();
        assert_eq!(get("1").status, CertStatus::Revoked);
        assert_eq!(get("1").reason, RevocationReason::CaCompromise);
        assert!(get("1").revoked_at.is_some());
        assert_eq!(get("2").status, CertStatus::Revoked);
        assert_eq!(get("3").status, CertStatus::Good);
        assert_eq!(get("4").status, CertStatus::Good, "expired certificates are not touched");
    }

    #[test]
    fn revoke_is_idempotent_and_recover_reverses() {
        let db = db_with(&[record("1", "svc-a", 3600)]);
        let selector = CertSelector::Key(CertKey::new("1", "aa"));
        let revoke = StatusChange::Revoke(RevocationReason::CaCompromise);

        assert_eq!(db.change_status(&selector, revoke).unwrap().len(), 1);
        let first = db.get_certificate(&CertKey::new("1", "aa")).unwrap().unwrap();

        assert!(db.change_status(&selector, revoke).unwrap().is_empty());
        let second = db.get_certificate(&CertKey::new("1", "aa")).unwrap().unwrap();
        assert_eq!(first, second);

        assert_eq!(db.change_status(&selector, StatusChange::Recover).unwrap().len(), 1);
        let recovered = db.get_certificate(&CertKey::new("1", "aa")).unwrap().unwrap();
        assert_eq!(recovered.status, CertStatus::Good);
        assert_eq!(recovered.reason, RevocationReason::Unspecified);
        assert_eq!(recovered.revoked_at, None);
    }

    #[test]
    fn nothing_matching_is_not_found() {
        let db = db_with(&[record("1", "svc-a", 3600)]);
        let res = db.change_status(&CertSelector::Identity("nope".into()), StatusChange::Recover);
        assert!(matches!(res, Err(Error::NotFound(_))));
    }

    #[test]
    fn single_revocation_keeps_first_reason() {
        let db = db_with(&[record("1", "svc-a", 3600)]);
        let key = CertKey::new("1", "aa");
        let first = db.revoke_certificate(&key, RevocationReason::KeyCompromise).unwrap();
        let again = db.revoke_certificate(&key, RevocationReason::Superseded).unwrap();
        assert_eq!(first, again);
        assert!(matches!(
            db.revoke_certificate(&CertKey::new("9", "aa"), RevocationReason::KeyCompromise),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn forbid_and_recover() {
        let db = db_with(&[]);
        let ids = vec!["svc-a".to_string(), "svc-b".to_string()];
        assert_eq!(db.forbid(&ids).unwrap().len(), 2);
        assert!(db.forbid(&ids).unwrap().is_empty(), "already active");
        assert!(db.is_forbidden("svc-a").unwrap());

        assert_eq!(db.recover_forbid(&["svc-a".to_string()]).unwrap().len(), 1);
        assert!(!db.is_forbidden("svc-a").unwrap());
        assert!(db.is_forbidden("svc-b").unwrap());

        assert_eq!(db.forbid(&["svc-a".to_string()]).unwrap().len(), 1);
        assert!(db.is_forbidden("svc-a").unwrap());
    }
}
