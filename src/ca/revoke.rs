//! Self revocation of workload certificates.
//!
//! A workload revokes its own certificate by signing the certificate's
//! serial number with its private key. A registry operator may instead
//! present the auth key of the configured operator profile.

use std::sync::Arc;

use log::{info, warn};

use crate::ca::certdb::{CertDb, CertKey, CertificateRecord};
use crate::ca::pemstore::{CertPemStore, PemKey};
use crate::commons::api::RevokeRequest;
use crate::commons::crypto::ocsp::RevocationReason;
use crate::commons::crypto::{parse_cert_pem, secrets_match, verify_nonce};
use crate::commons::error::{CaResult, Error};
use crate::commons::events::{CertOp, EventKind, EventSink, LifecycleEvent};
use crate::constants::OPERATOR_SDK;

//------------ RevokeAuthorization -------------------------------------------

/// The proof a revocation request carries.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RevokeAuthorization {
    /// The certificate's key signed the nonce.
    Signature { nonce: String, sign: String },

    /// The auth key of an operator profile.
    OperatorKey { profile: String, auth_key: String },
}

impl RevokeAuthorization {
    /// Picks the authorization from the wire request.
    ///
    /// Exactly one of the two forms must be present.
    pub fn from_request(req: &RevokeRequest) -> CaResult<Self> {
        let signature = match (&req.nonce, &req.sign) {
            (None, None) => None,
            (Some(nonce), Some(sign)) if !nonce.is_empty() && !sign.is_empty() => Some((nonce, sign)),
            _ => return Err(Error::BadRequest("both 'nonce' and 'sign' are required".to_string())),
        };
        let operator = req.auth_key.as_ref().filter(|key| !key.is_empty());

        match (signature, operator) {
            (Some((nonce, sign)), None) => Ok(RevokeAuthorization::Signature {
                nonce: nonce.clone(),
                sign: sign.clone(),
            }),
            (None, Some(auth_key)) => {
                let profile = req
                    .profile
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Error::BadRequest("no profile given".to_string()))?;
                Ok(RevokeAuthorization::OperatorKey {
                    profile,
                    auth_key: auth_key.clone(),
                })
            }
            (Some(_), Some(_)) => Err(Error::BadRequest(
                "request carries both a signature and an auth key".to_string(),
            )),
            (None, None) => Err(Error::BadRequest("request carries no authorization".to_string())),
        }
    }
}

//------------ OperatorCredentials -------------------------------------------

/// The one profile allowed to revoke certificates by auth key.
#[derive(Clone, Debug)]
pub struct OperatorCredentials {
    pub profile: String,
    pub auth_key: String,
}

//------------ SelfRevoker ---------------------------------------------------

#[derive(Debug)]
pub struct SelfRevoker {
    certdb: Arc<CertDb>,
    pems: Arc<dyn CertPemStore>,
    operator: Option<OperatorCredentials>,
    events: Arc<dyn EventSink>,
}

impl SelfRevoker {
    pub fn new(
        certdb: Arc<CertDb>,
        pems: Arc<dyn CertPemStore>,
        operator: Option<OperatorCredentials>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        SelfRevoker {
            certdb,
            pems,
            operator,
            events,
        }
    }

    /// Revokes the certificate with reason key compromise.
    ///
    /// Revoking a revoked certificate succeeds without changing it.
    pub fn revoke(&self, req: &RevokeRequest) -> CaResult<CertificateRecord> {
        if req.serial.is_empty() {
            return Err(Error::BadRequest(
                "serial number is required but not provided".to_string(),
            ));
        }
        let auth = RevokeAuthorization::from_request(req)?;
        let key = CertKey::new(&req.serial, &req.authority_key_id);

        let record = self
            .certdb
            .get_certificate(&key)?
            .ok_or_else(|| Error::not_found(format!("certificate {}", req.serial)))?;

        match &auth {
            RevokeAuthorization::Signature { nonce, sign } => {
                if nonce != &req.serial {
                    return Err(Error::SignatureInvalid("nonce must be the serial number".to_string()));
                }
                match self.pems.get(&PemKey::Serial(req.serial.clone()))? {
                    Some(entry) => {
                        let cert = parse_cert_pem(&entry.cert)?;
                        verify_nonce(&*cert.public_key()?, nonce, sign)
                            .inspect_err(|_| warn!("invalid revocation signature for {}", req.serial))?;
                    }
                    None if record.is_revoked() => return Ok(record),
                    None => return Err(Error::parse("certificate", "PEM is missing")),
                }
            }
            RevokeAuthorization::OperatorKey { profile, auth_key } => {
                let allowed = self
                    .operator
                    .as_ref()
                    .is_some_and(|op| &op.profile == profile && secrets_match(&op.auth_key, auth_key));
                if !allowed {
                    warn!("rejected revocation of {} for profile '{}'", req.serial, profile);
                    return Err(Error::Unauthorized(format!(
                        "profile '{}' may not revoke certificates",
                        profile
                    )));
                }
            }
        }

        if record.is_revoked() {
            return Ok(record);
        }

        let revoked = self.certdb.revoke_certificate(&key, RevocationReason::KeyCompromise)?;
        if self.pems.deletes_on_self_revoke() {
            if let Err(e) = self.pems.delete(&PemKey::Serial(req.serial.clone())) {
                warn!("cannot delete PEM of revoked certificate {}: {}", req.serial, e);
            }
        }

        self.events.emit(LifecycleEvent::new(
            OPERATOR_SDK,
            EventKind::SelfRevoke,
            CertOp::cert(&revoked.common_name, &revoked.serial_number, &revoked.authority_key_id),
        ));
        info!("workload '{}' revoked certificate {}", revoked.common_name, revoked.serial_number);
        Ok(revoked)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::pemstore::{KvSecretStore, SecretCertPemStore};
    use crate::commons::crypto::{CertInfo, sign_nonce};
    use crate::test::{TestCa, mem_storage};

    fn signed_request(ca: &TestCa, unique_id: &str) -> RevokeRequest {
        let (cert, key) = ca.issue_workload(unique_id);
        let info = CertInfo::from_cert(&cert).unwrap();
        RevokeRequest {
            sign: Some(sign_nonce(&key, &info.serial_number).unwrap()),
            nonce: Some(info.serial_number.clone()),
            serial: info.serial_number,
            authority_key_id: info.authority_key_id,
            ..Default::default()
        }
    }

    fn revoker(ca: &TestCa) -> SelfRevoker {
        SelfRevoker::new(
            ca.certdb.clone(),
            ca.keeper.pem_store().clone(),
            Some(OperatorCredentials {
                profile: "registry".into(),
                auth_key: "0123456789abcdef".into(),
            }),
            ca.events.clone(),
        )
    }

    #[test]
    fn authorization_forms() {
        let mut req = RevokeRequest {
            serial: "1".into(),
            ..Default::default()
        };
        assert!(RevokeAuthorization::from_request(&req).is_err());

        req.nonce = Some("1".into());
        assert!(RevokeAuthorization::from_request(&req).is_err());

        req.sign = Some("ab".into());
        assert!(matches!(
            RevokeAuthorization::from_request(&req),
            Ok(RevokeAuthorization::Signature { .. })
        ));

        req.auth_key = Some("key".into());
        req.profile = Some("registry".into());
        assert!(RevokeAuthorization::from_request(&req).is_err());

        req.nonce = None;
        req.sign = None;
        assert!(matches!(
            RevokeAuthorization::from_request(&req),
            Ok(RevokeAuthorization::OperatorKey { .. })
        ));
    }

    #[test]
    fn signed_self_revocation() {
        let ca = TestCa::root();
        let req = signed_request(&ca, "svc-a");

        let record = revoker(&ca).revoke(&req).unwrap();
        assert!(record.is_revoked());
        assert_eq!(record.reason, RevocationReason::KeyCompromise);
        assert_eq!(ca.events.kinds().last(), Some(&EventKind::SelfRevoke));

        let again = revoker(&ca).revoke(&req).unwrap();
        assert_eq!(again.revoked_at, record.revoked_at);
    }

    #[test]
    fn nonce_must_be_the_serial() {
        let ca = TestCa::root();
        let (_, key) = ca.issue_workload("svc-b");
        let mut req = signed_request(&ca, "svc-b2");
        req.nonce = Some("123".into());
        req.sign = Some(sign_nonce(&key, "123").unwrap());
        assert!(matches!(revoker(&ca).revoke(&req), Err(Error::SignatureInvalid(_))));
    }

    #[test]
    fn signature_of_another_key_is_rejected() {
        let ca = TestCa::root();
        let (_, other_key) = ca.issue_workload("svc-c");
        let mut req = signed_request(&ca, "svc-d");
        req.sign = Some(sign_nonce(&other_key, &req.serial).unwrap());
        assert!(matches!(revoker(&ca).revoke(&req), Err(Error::SignatureInvalid(_))));

        let key = CertKey::new(&req.serial, &req.authority_key_id);
        assert!(!ca.certdb.get_certificate(&key).unwrap().unwrap().is_revoked());
    }

    #[test]
    fn operator_key() {
        let ca = TestCa::root();
        let mut req = signed_request(&ca, "svc-e");
        req.nonce = None;
        req.sign = None;
        req.profile = Some("registry".into());
        req.auth_key = Some("wrong-key-wrong-key".into());
        assert!(matches!(revoker(&ca).revoke(&req), Err(Error::Unauthorized(_))));

        req.profile = Some("sidecar".into());
        req.auth_key = Some("0123456789abcdef".into());
        assert!(matches!(revoker(&ca).revoke(&req), Err(Error::Unauthorized(_))));

        req.profile = Some("registry".into());
        assert!(revoker(&ca).revoke(&req).unwrap().is_revoked());
    }

    #[test]
    fn secret_store_pem_is_deleted() {
        let ca = TestCa::root();
        let secrets = Arc::new(KvSecretStore::create(&mem_storage()).unwrap());
        let pems: Arc<dyn CertPemStore> = Arc::new(SecretCertPemStore::new(secrets));
        let req = signed_request(&ca, "svc-f");

        let entry = ca.keeper.pem_store().get(&PemKey::Serial(req.serial.clone())).unwrap().unwrap();
        pems.put(&PemKey::Serial(req.serial.clone()), &entry).unwrap();

        let revoker = SelfRevoker::new(ca.certdb.clone(), pems.clone(), None, ca.events.clone());
        revoker.revoke(&req).unwrap();
        assert!(pems.get(&PemKey::Serial(req.serial.clone())).unwrap().is_none());

        // The PEM is gone but the revocation is already recorded.
        assert!(revoker.revoke(&req).unwrap().is_revoked());
    }

    #[test]
    fn unknown_certificate() {
        let ca = TestCa::root();
        let mut req = signed_request(&ca, "svc-g");
        req.serial = "99999".into();
        req.nonce = Some("99999".into());
        assert!(matches!(revoker(&ca).revoke(&req), Err(Error::NotFound(_))));
    }
}
