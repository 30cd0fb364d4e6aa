//! Signing of certificate requests, and provisioning of the CA's own key
//! pair.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::ca::certdb::{CertDb, CertificateRecord};
use crate::ca::keeper::Keeper;
use crate::ca::pemstore::{PemEntry, PemKey};
use crate::ca::upper::SigningCapability;
use crate::commons::api::{AuthenticatedRequest, InfoRequest, InfoResponse, SignRequest};
use crate::commons::crypto::{
    CertUsage, CsrTemplate, IssueRequest, KeyAlgorithm, cert_to_pem, issue_certificate, parse_csr_pem,
    private_key_to_pem, self_signed_ca, verify_request_token,
};
use crate::commons::error::{CaResult, Error};
use crate::commons::events::{CertOp, EventKind, EventSink, LifecycleEvent};
use crate::commons::identity::WorkloadIdentity;
use crate::commons::metrics::{Counters, MetricsPoint, MetricsSink};
use crate::config::{CaTemplate, SigningConfig, SigningProfile};
use crate::constants::{METRICS_CERT_SIGNED, OPERATOR_SDK, PROFILE_INTERMEDIATE};

//------------ CaSigner ------------------------------------------------------

/// Issues certificates with the CA's own key.
pub struct CaSigner {
    signing: SigningConfig,
    keeper: Arc<Keeper>,
    certdb: Arc<CertDb>,
    events: Arc<dyn EventSink>,
    metrics: Option<Arc<dyn MetricsSink>>,
    counters: Counters,
}

impl CaSigner {
    pub fn new(
        signing: SigningConfig,
        keeper: Arc<Keeper>,
        certdb: Arc<CertDb>,
        events: Arc<dyn EventSink>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        CaSigner {
            signing,
            keeper,
            certdb,
            events,
            metrics,
            counters: Counters::default(),
        }
    }

    /// Checks the request token against the profile's key, then signs.
    pub fn auth_sign(&self, req: &AuthenticatedRequest) -> CaResult<String> {
        let request = req.request_bytes()?;
        let sign_req: SignRequest =
            serde_json::from_slice(&request).map_err(|e| Error::BadRequest(format!("unable to parse sign request: {}", e)))?;

        let profile = self.profile(&sign_req.profile)?;
        verify_request_token(profile.auth_key.as_bytes(), &request, &req.token_bytes()?)
            .inspect_err(|_| warn!("received sign request with invalid token"))?;

        self.sign_request(&sign_req)
    }

    /// Signs a request that has been authenticated already.
    pub fn sign_request(&self, req: &SignRequest) -> CaResult<String> {
        let profile = self.profile(&req.profile)?;
        if req.certificate_request.is_empty() {
            return Err(Error::BadRequest("missing parameter 'certificate_request'".to_string()));
        }

        for host in &req.hosts {
            if let Some(id) = WorkloadIdentity::from_host(host) {
                if self.certdb.is_forbidden(id.unique_id())? {
                    self.events.emit(LifecycleEvent::new(
                        OPERATOR_SDK,
                        EventKind::ForbidSign,
                        CertOp::identity(id.unique_id()),
                    ));
                    return Err(Error::Forbidden("unique_id forbidden for signing certs".to_string()));
                }
            }
        }

        let csr = parse_csr_pem(&req.certificate_request)?;
        let usage = if profile.is_ca || req.profile == PROFILE_INTERMEDIATE {
            CertUsage::IntermediateCa
        } else {
            CertUsage::Workload
        };

        let ca = self.keeper.get_cached_self_key_pair()?;
        let cert = issue_certificate(
            &IssueRequest {
                csr: &csr,
                hosts: &req.hosts,
                validity: profile.validity(),
                usage,
            },
            &ca.key,
            &ca.cert,
        )?;
        let pem = cert_to_pem(&cert)?;

        let label = if req.label.is_empty() { &req.profile } else { &req.label };
        let record = CertificateRecord::issued(&cert, label)?;
        self.certdb.insert_certificate(&record)?;
        self.keeper
            .pem_store()
            .put(&PemKey::Serial(record.serial_number.clone()), &PemEntry::cert(pem.clone()))?;

        debug!(
            "issued certificate {} for '{}' with profile '{}'",
            record.serial_number, record.common_name, req.profile
        );
        self.events.emit(LifecycleEvent::new(
            OPERATOR_SDK,
            EventKind::Sign,
            CertOp::cert(&record.common_name, &record.serial_number, &record.authority_key_id),
        ));
        self.counters.increment("sign_count");
        if let Some(metrics) = &self.metrics {
            metrics.add_point(
                MetricsPoint::new(METRICS_CERT_SIGNED)
                    .tag("unique_id", &record.common_name)
                    .field("certs_num", 1i64),
            );
        }

        Ok(pem)
    }

    /// Returns the CA's certificate and trust chain.
    pub async fn ca_info(&self, req: &InfoRequest) -> CaResult<InfoResponse> {
        let (usages, expiry) = if req.profile.is_empty() {
            (vec![], String::new())
        } else {
            let profile = self.profile(&req.profile)?;
            (profile.usages.clone(), format!("{}h", profile.expiry_hours))
        };

        let pem = self.keeper.get_cached_self_key_pair_pem()?;
        let trust = self.keeper.get_l3_cached_trust_certs().await?;
        let trust_certificates = trust.iter().map(|cert| cert_to_pem(cert)).collect::<CaResult<Vec<_>>>()?;

        Ok(InfoResponse {
            certificate: pem.cert.clone(),
            trust_certificates,
            usages,
            expiry,
        })
    }

    /// The number of certificates issued since start.
    pub fn sign_count(&self) -> u64 {
        self.counters.get("sign_count")
    }

    fn profile(&self, name: &str) -> CaResult<&SigningProfile> {
        self.signing
            .profiles
            .get(name)
            .ok_or_else(|| Error::ProfileUnknown(name.to_string()))
    }
}

#[async_trait]
impl SigningCapability for CaSigner {
    async fn sign(&self, req: &SignRequest) -> CaResult<String> {
        self.sign_request(req)
    }

    async fn info(&self, req: &InfoRequest) -> CaResult<InfoResponse> {
        self.ca_info(req).await
    }
}

//------------ SelfSigner ----------------------------------------------------

/// Provisions a root CA with a self-signed certificate.
pub struct SelfSigner<'a> {
    keeper: &'a Keeper,
    template: &'a CaTemplate,
    algorithm: KeyAlgorithm,
}

impl<'a> SelfSigner<'a> {
    pub fn new(keeper: &'a Keeper, template: &'a CaTemplate, algorithm: KeyAlgorithm) -> Self {
        SelfSigner {
            keeper,
            template,
            algorithm,
        }
    }

    /// Creates the key pair unless one exists.
    pub fn run(&self) -> CaResult<()> {
        if self.keeper.has_self_key_pair()? {
            info!("CA key pair exists, skipping self signing");
            return Ok(());
        }

        warn!("no CA key pair found, creating a self-signed {} root", self.algorithm);
        let key = self.algorithm.generate()?;
        let cert = self_signed_ca(&key, &self.template.subject(), self.template.validity())?;
        self.keeper
            .set_key_pair_pem(&private_key_to_pem(&key)?, &cert_to_pem(&cert)?)
    }
}

//------------ RemoteSigner --------------------------------------------------

/// Provisions an intermediate CA with a certificate from an upstream CA.
pub struct RemoteSigner<'a> {
    keeper: &'a Keeper,
    template: &'a CaTemplate,
    algorithm: KeyAlgorithm,
}

impl<'a> RemoteSigner<'a> {
    pub fn new(keeper: &'a Keeper, template: &'a CaTemplate, algorithm: KeyAlgorithm) -> Self {
        RemoteSigner {
            keeper,
            template,
            algorithm,
        }
    }

    /// Requests the key pair's certificate unless one exists.
    pub async fn run(&self) -> CaResult<()> {
        if self.keeper.is_self_sign() {
            return Ok(());
        }
        if self.keeper.has_self_key_pair()? {
            info!("CA key pair exists, skipping remote signing");
            return Ok(());
        }

        warn!("no CA key pair found, requesting an intermediate certificate upstream");
        let key = self.algorithm.generate()?;
        let csr = CsrTemplate::new(self.template.subject(), vec![]).build_pem(&key)?;
        let req = SignRequest {
            hosts: vec![],
            certificate_request: csr,
            profile: PROFILE_INTERMEDIATE.to_string(),
            label: PROFILE_INTERMEDIATE.to_string(),
        };

        let cert = self
            .keeper
            .upper_clients()
            .do_with_retry(|client| {
                let req = req.clone();
                async move { client.sign(&req).await }
            })
            .await?;

        self.keeper.set_key_pair_pem(&private_key_to_pem(&key)?, &cert)
    }
}

//------------ Tests ---------------------------------------------------------
