//! Administrative management of workload certificates: bulk revocation and
//! recovery, and the forbid list that blocks signing for an identity.

use std::sync::Arc;

use log::info;

use crate::ca::certdb::{CertDb, CertKey, CertSelector, CertificateRecord, StatusChange};
use crate::commons::api::CertsSelection;
use crate::commons::crypto::ocsp::RevocationReason;
use crate::commons::error::{CaResult, Error};
use crate::commons::events::{CertOp, EventKind, EventSink, LifecycleEvent};
use crate::constants::OPERATOR_PLATFORM;

impl TryFrom<&CertsSelection> for CertSelector {
    type Error = Error;

    /// An identity takes precedence over a serial number and key id.
    fn try_from(sel: &CertsSelection) -> CaResult<Self> {
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
        match (non_empty(&sel.unique_id), non_empty(&sel.sn), non_empty(&sel.aki)) {
            (Some(unique_id), _, _) => Ok(CertSelector::Identity(unique_id)),
            (None, Some(sn), Some(aki)) => Ok(CertSelector::Key(CertKey::new(sn, aki))),
            _ => Err(Error::BadRequest(
                "either 'unique_id', or both 'sn' and 'aki' are required".to_string(),
            )),
        }
    }
}

//------------ CertLifecycle -------------------------------------------------

#[derive(Debug)]
pub struct CertLifecycle {
    certdb: Arc<CertDb>,
    events: Arc<dyn EventSink>,
}

impl CertLifecycle {
    pub fn new(certdb: Arc<CertDb>, events: Arc<dyn EventSink>) -> Self {
        CertLifecycle { certdb, events }
    }

    /// Revokes all unexpired certificates matched by the selection.
    pub fn revoke(&self, selection: &CertsSelection) -> CaResult<Vec<CertOp>> {
        let selector = CertSelector::try_from(selection)?;
        let changed = self
            .certdb
            .change_status(&selector, StatusChange::Revoke(RevocationReason::CaCompromise))?;
        info!("revoked {} certificates for {:?}", changed.len(), selector);
        Ok(self.emit_all(EventKind::Revoke, &changed))
    }

    /// Restores all unexpired revoked certificates matched by the selection.
    pub fn recover(&self, selection: &CertsSelection) -> CaResult<Vec<CertOp>> {
        let selector = CertSelector::try_from(selection)?;
        let changed = self.certdb.change_status(&selector, StatusChange::Recover)?;
        info!("recovered {} certificates for {:?}", changed.len(), selector);
        Ok(self.emit_all(EventKind::Recover, &changed))
    }

    /// Stops signing for the identities. Returns the newly forbidden ones.
    pub fn forbid(&self, unique_ids: &[String]) -> CaResult<Vec<String>> {
        let unique_ids = Self::check_ids(unique_ids)?;
        let added = self.certdb.forbid(&unique_ids)?;
        let ids: Vec<String> = added.into_iter().map(|f| f.unique_id).collect();
        for id in &ids {
            self.events
                .emit(LifecycleEvent::new(OPERATOR_PLATFORM, EventKind::Forbid, CertOp::identity(id)));
        }
        info!("forbade signing for {:?}", ids);
        Ok(ids)
    }

    /// Allows signing again. Returns the identities that were forbidden.
    pub fn recover_forbid(&self, unique_ids: &[String]) -> CaResult<Vec<String>> {
        let unique_ids = Self::check_ids(unique_ids)?;
        let lifted = self.certdb.recover_forbid(&unique_ids)?;
        let ids: Vec<String> = lifted.into_iter().map(|f| f.unique_id).collect();
        for id in &ids {
            self.events.emit(LifecycleEvent::new(
                OPERATOR_PLATFORM,
                EventKind::RecoverForbid,
                CertOp::identity(id),
            ));
        }
        info!("allowed signing again for {:?}", ids);
        Ok(ids)
    }

    fn check_ids(unique_ids: &[String]) -> CaResult<Vec<String>> {
        let ids: Vec<String> = unique_ids.iter().filter(|id| !id.is_empty()).cloned().collect();
        if ids.is_empty() {
            Err(Error::BadRequest("no 'unique_ids' given".to_string()))
        } else {
            Ok(ids)
        }
    }

    fn emit_all(&self, kind: EventKind, records: &[CertificateRecord]) -> Vec<CertOp> {
        records
            .iter()
            .map(|record| {
                let op = CertOp::cert(&record.common_name, &record.serial_number, &record.authority_key_id);
                self.events.emit(LifecycleEvent::new(OPERATOR_PLATFORM, kind, op.clone()));
                op
            })
            .collect()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::CertInfo;
    use crate::test::TestCa;

    fn lifecycle(ca: &TestCa) -> CertLifecycle {
        CertLifecycle::new(ca.certdb.clone(), ca.events.clone())
    }

    fn by_id(unique_id: &str) -> CertsSelection {
        CertsSelection {
            unique_id: Some(unique_id.into()),
            ..Default::default()
        }
    }

    #[test]
    fn selection_needs_an_id_or_key() {
        assert!(CertSelector::try_from(&CertsSelection::default()).is_err());
        let only_sn = CertsSelection {
            sn: Some("1".into()),
            ..Default::default()
        };
        assert!(CertSelector::try_from(&only_sn).is_err());
    }

    #[test]
    fn revoke_and_recover_by_identity() {
        let ca = TestCa::root();
        ca.issue_workload("svc-a");
        ca.issue_workload("svc-a");
        ca.issue_workload("svc-b");
        let lifecycle = lifecycle(&ca);

        let revoked = lifecycle.revoke(&by_id("svc-a")).unwrap();
        assert_eq!(revoked.len(), 2);
        assert!(lifecycle.revoke(&by_id("svc-a")).unwrap().is_empty());

        let records = ca.certdb.list_certificates().unwrap();
        for record in records {
            assert_eq!(record.is_revoked(), record.common_name == "svc-a");
            if record.is_revoked() {
                assert_eq!(record.reason, RevocationReason::CaCompromise);
            }
        }

        assert_eq!(lifecycle.recover(&by_id("svc-a")).unwrap().len(), 2);
        assert!(ca.certdb.list_certificates().unwrap().iter().all(|r| !r.is_revoked()));

        let kinds = ca.events.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Revoke).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Recover).count(), 2);
    }

    #[test]
    fn revoke_by_key() {
        let ca = TestCa::root();
        let (cert, _) = ca.issue_workload("svc-c");
        ca.issue_workload("svc-c");
        let info = CertInfo::from_cert(&cert).unwrap();

        let sel = CertsSelection {
            sn: Some(info.serial_number.clone()),
            aki: Some(info.authority_key_id.clone()),
            ..Default::default()
        };
        let revoked = lifecycle(&ca).revoke(&sel).unwrap();
        assert_eq!(revoked, vec![CertOp::cert("svc-c", &info.serial_number, &info.authority_key_id)]);
    }

    #[test]
    fn nothing_matching_is_not_found() {
        let ca = TestCa::root();
        assert!(matches!(lifecycle(&ca).revoke(&by_id("nobody")), Err(Error::NotFound(_))));
    }

    #[test]
    fn forbid_blocks_signing() {
        let ca = TestCa::root();
        let lifecycle = lifecycle(&ca);
        let ids = vec!["svc-d".to_string()];

        assert_eq!(lifecycle.forbid(&ids).unwrap(), ids);
        assert!(lifecycle.forbid(&ids).unwrap().is_empty());
        assert!(matches!(ca.try_issue_workload("svc-d"), Err(Error::Forbidden(_))));
        assert!(ca.events.kinds().contains(&EventKind::ForbidSign));

        assert_eq!(lifecycle.recover_forbid(&ids).unwrap(), ids);
        assert!(ca.try_issue_workload("svc-d").is_ok());
        assert!(lifecycle.forbid(&[]).is_err());
    }
}
