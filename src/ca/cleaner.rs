//! Garbage collection of sidecar certificates.
//!
//! Certificates of workloads that no longer exist, and certificates their
//! workloads revoked themselves, are of no further use. The cleaner asks
//! an inventory which workloads exist and deletes the rest.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Deserialize;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::ca::certdb::{CertDb, CertKey, CertificateRecord};
use crate::ca::pemstore::{CertPemStore, PemKey};
use crate::commons::crypto::ocsp::RevocationReason;
use crate::commons::error::CaResult;
use crate::commons::httpclient;
use crate::constants::PROFILE_SIDECAR;

//------------ Inventory -----------------------------------------------------

/// Knows the identities of the workloads currently running.
#[async_trait]
pub trait Inventory: fmt::Debug + Send + Sync {
    async fn unique_ids(&self) -> CaResult<Vec<String>>;
}

/// A fixed list of identities.
#[derive(Clone, Debug, Default)]
pub struct StaticInventory(pub Vec<String>);

#[async_trait]
impl Inventory for StaticInventory {
    async fn unique_ids(&self) -> CaResult<Vec<String>> {
        Ok(self.0.clone())
    }
}

/// Reads `data.list[].unique_id` from a JSON endpoint.
#[derive(Clone, Debug)]
pub struct HttpInventory {
    uri: String,
    token: Option<String>,
}

impl HttpInventory {
    pub fn new(uri: impl Into<String>, token: Option<String>) -> Self {
        HttpInventory {
            uri: uri.into(),
            token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InventoryBody {
    data: InventoryData,
}

#[derive(Debug, Deserialize)]
struct InventoryData {
    #[serde(default)]
    list: Vec<InventoryItem>,
}

#[derive(Debug, Deserialize)]
struct InventoryItem {
    #[serde(default)]
    unique_id: String,
}

impl InventoryBody {
    fn into_unique_ids(self) -> Vec<String> {
        self.data
            .list
            .into_iter()
            .map(|item| item.unique_id)
            .filter(|id| !id.is_empty())
            .collect()
    }
}

#[async_trait]
impl Inventory for HttpInventory {
    async fn unique_ids(&self) -> CaResult<Vec<String>> {
        let body: InventoryBody = httpclient::get_json(&self.uri, self.token.as_deref()).await?;
        Ok(body.into_unique_ids())
    }
}

//------------ GcReport ------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GcReport {
    /// Certificates of workloads missing from the inventory.
    pub offline: usize,

    /// Certificates revoked by their own workload.
    pub self_revoked: usize,
}

//------------ CertCleaner ---------------------------------------------------

#[derive(Debug)]
pub struct CertCleaner {
    certdb: Arc<CertDb>,
    pems: Arc<dyn CertPemStore>,
    inventory: Arc<dyn Inventory>,
}

impl CertCleaner {
    pub fn new(certdb: Arc<CertDb>, pems: Arc<dyn CertPemStore>, inventory: Arc<dyn Inventory>) -> Self {
        CertCleaner {
            certdb,
            pems,
            inventory,
        }
    }

    /// Runs one collection.
    ///
    /// Nothing is deleted if the inventory cannot be read.
    pub async fn garbage_collect(&self) -> CaResult<GcReport> {
        let running: HashSet<String> = self.inventory.unique_ids().await?.into_iter().collect();
        debug!("inventory lists {} workloads", running.len());

        let sidecars: Vec<CertificateRecord> = self
            .certdb
            .list_certificates()?
            .into_iter()
            .filter(|record| record.ca_label == PROFILE_SIDECAR)
            .collect();

        let (offline, online): (Vec<_>, Vec<_>) = sidecars
            .into_iter()
            .partition(|record| !running.contains(&record.common_name));
        let self_revoked: Vec<_> = online
            .into_iter()
            .filter(|record| record.is_revoked() && record.reason == RevocationReason::KeyCompromise)
            .collect();

        if !offline.is_empty() {
            let ids: HashSet<&str> = offline.iter().map(|r| r.common_name.as_str()).collect();
            info!("removing certificates of offline workloads {:?}", ids);
            self.remove(&offline)?;
        }
        if !self_revoked.is_empty() {
            info!("removing {} self revoked sidecar certificates", self_revoked.len());
            self.remove(&self_revoked)?;
        }

        Ok(GcReport {
            offline: offline.len(),
            self_revoked: self_revoked.len(),
        })
    }

    fn remove(&self, records: &[CertificateRecord]) -> CaResult<()> {
        for record in records {
            if let Err(e) = self.pems.delete(&PemKey::Serial(record.serial_number.clone())) {
                warn!("cannot delete PEM of certificate {}: {}", record.serial_number, e);
            }
        }
        let keys: Vec<CertKey> = records.iter().map(CertificateRecord::key).collect();
        self.certdb.delete_certificates(&keys)
    }
}

/// Runs the cleaner at the given interval until the token is cancelled.
pub fn spawn_cleaner(cleaner: Arc<CertCleaner>, every: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("certificate cleaner runs every {}s", every.as_secs());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("certificate cleaner stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match cleaner.garbage_collect().await {
                        Ok(report) => debug!("garbage collection done: {:?}", report),
                        Err(e) => error!("garbage collection failed: {}", e),
                    }
                }
            }
        }
    });

    cancel
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::certdb::{CertSelector, StatusChange};
    use crate::commons::crypto::CertInfo;
    use crate::test::TestCa;

    fn cleaner(ca: &TestCa, running: &[&str]) -> CertCleaner {
        CertCleaner::new(
            ca.certdb.clone(),
            ca.keeper.pem_store().clone(),
            Arc::new(StaticInventory(running.iter().map(|s| s.to_string()).collect())),
        )
    }

    #[test]
    fn inventory_body() {
        let body: InventoryBody =
            serde_json::from_str(r#"{"data":{"list":[{"unique_id":"a"},{"name":"x"},{"unique_id":"b"}]}}"#).unwrap();
        assert_eq!(body.into_unique_ids(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn offline_and_self_revoked_certs_are_removed() {
        let ca = TestCa::root();
        ca.issue_workload("running");
        let (revoked, _) = ca.issue_workload("running");
        let (gone, _) = ca.issue_workload("gone");

        let revoked = CertInfo::from_cert(&revoked).unwrap();
        ca.certdb
            .revoke_certificate(
                &CertKey::new(&revoked.serial_number, &revoked.authority_key_id),
                RevocationReason::KeyCompromise,
            )
            .unwrap();

        let report = cleaner(&ca, &["running"]).garbage_collect().await.unwrap();
        assert_eq!(report, GcReport { offline: 1, self_revoked: 1 });

        let left = ca.certdb.list_certificates().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].common_name, "running");
        assert!(!left[0].is_revoked());

        let gone = CertInfo::from_cert(&gone).unwrap();
        assert!(ca.keeper.pem_store().get(&PemKey::Serial(gone.serial_number)).unwrap().is_none());
    }

    #[tokio::test]
    async fn administrative_revocations_are_kept() {
        let ca = TestCa::root();
        ca.issue_workload("svc");
        ca.certdb
            .change_status(
                &CertSelector::Identity("svc".into()),
                StatusChange::Revoke(RevocationReason::CaCompromise),
            )
            .unwrap();

        let report = cleaner(&ca, &["svc"]).garbage_collect().await.unwrap();
        assert_eq!(report, GcReport::default());
        assert_eq!(ca.certdb.list_certificates().unwrap().len(), 1);
    }
}
