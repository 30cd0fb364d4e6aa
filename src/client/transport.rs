//! The workload's own certificate and the trust store it verifies peers
//! against.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use log::{debug, info};
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509, X509Ref};
use tokio::sync::Mutex;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::ca::upper::SigningCapability;
use crate::client::truststore::TrustStore;
use crate::commons::api::{InfoRequest, SignRequest};
use crate::commons::crypto::{
    CertInfo, CsrSubject, CsrTemplate, KeyAlgorithm, cert_to_pem, parse_cert_pem, private_key_from_pem,
    private_key_to_pem,
};
use crate::commons::error::{CaResult, Error};
use crate::commons::identity::WorkloadIdentity;
use crate::constants::CERT_REFRESH_DURATION_RATE;

//------------ IdentityBundle ------------------------------------------------

/// A workload certificate with its private key, ready for TLS.
#[derive(Debug)]
pub struct IdentityBundle {
    key: PKey<Private>,
    cert: X509,
    info: CertInfo,
    certified: Arc<CertifiedKey>,
}

impl IdentityBundle {
    pub fn new(key: PKey<Private>, cert: X509) -> CaResult<Self> {
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::signing("certificate does not match the private key"));
        }
        let info = CertInfo::from_cert(&cert)?;
        let certified = Arc::new(certified_key(&key, &cert)?);
        Ok(IdentityBundle {
            key,
            cert,
            info,
            certified,
        })
    }

    pub fn from_pem(key_pem: &str, cert_pem: &str) -> CaResult<Self> {
        Self::new(private_key_from_pem(key_pem)?, parse_cert_pem(cert_pem)?)
    }

    pub fn key(&self) -> &PKeyRef<Private> {
        &self.key
    }

    pub fn cert(&self) -> &X509Ref {
        &self.cert
    }

    pub fn info(&self) -> &CertInfo {
        &self.info
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }

    pub fn key_pem(&self) -> CaResult<String> {
        private_key_to_pem(&self.key)
    }

    pub fn cert_pem(&self) -> CaResult<String> {
        cert_to_pem(&self.cert)
    }

    /// Whether at most 1/`CERT_REFRESH_DURATION_RATE` of the validity
    /// window is left at `now`.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        let remaining = self.info.not_after - now;
        remaining <= self.info.lifetime() / CERT_REFRESH_DURATION_RATE as i32
    }
}

fn certified_key(key: &PKeyRef<Private>, cert: &X509Ref) -> CaResult<CertifiedKey> {
    let der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key_to_pkcs8()?));
    let signing_key = any_supported_type(&der).map_err(Error::tls)?;
    Ok(CertifiedKey::new(vec![CertificateDer::from(cert.to_der()?)], signing_key))
}

//------------ Transport -----------------------------------------------------

/// Obtains and renews the certificate of one workload identity.
///
/// The first caller issues the certificate, concurrent callers wait for it.
/// Rotation swaps the bundle atomically, TLS handshakes pick it up on their
/// next resolve.
pub struct Transport {
    identity: WorkloadIdentity,
    signer: Arc<dyn SigningCapability>,
    profile: String,
    key_algorithm: KeyAlgorithm,
    trust_store: Arc<TrustStore>,
    current: RwLock<Option<Arc<IdentityBundle>>>,
    issuing: Mutex<()>,
}

impl Transport {
    pub fn new(
        identity: WorkloadIdentity,
        signer: Arc<dyn SigningCapability>,
        profile: impl Into<String>,
        key_algorithm: KeyAlgorithm,
        trust_store: Arc<TrustStore>,
    ) -> Self {
        Transport {
            identity,
            signer,
            profile: profile.into(),
            key_algorithm,
            trust_store,
            current: RwLock::new(None),
            issuing: Mutex::new(()),
        }
    }

    /// Starts with an existing key pair instead of issuing one.
    pub fn with_bundle(self, bundle: IdentityBundle) -> Self {
        self.install(Arc::new(bundle));
        self
    }

    pub fn identity(&self) -> &WorkloadIdentity {
        &self.identity
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust_store
    }

    /// The current bundle, if one has been issued.
    pub fn current(&self) -> Option<Arc<IdentityBundle>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Returns the current bundle, issuing it on first use.
    pub async fn get_certificate(&self) -> CaResult<Arc<IdentityBundle>> {
        if let Some(bundle) = self.current() {
            return Ok(bundle);
        }

        let _issuing = self.issuing.lock().await;
        if let Some(bundle) = self.current() {
            return Ok(bundle);
        }
        self.issue().await
    }

    /// Re-issues the certificate when it is close to expiry.
    ///
    /// Returns whether a new certificate was installed.
    pub async fn auto_update(&self) -> CaResult<bool> {
        let _issuing = self.issuing.lock().await;
        match self.current() {
            Some(bundle) if !bundle.needs_renewal(Utc::now()) => {
                debug!(
                    "certificate {} of {} is still fresh",
                    bundle.info().serial_number,
                    self.identity
                );
                Ok(false)
            }
            _ => {
                self.issue().await?;
                Ok(true)
            }
        }
    }

    /// Adds the CA's certificate and trust chain to the trust store.
    pub async fn refresh_trust_store(&self) -> CaResult<usize> {
        let info = self.signer.info(&InfoRequest::for_profile(&self.profile)).await?;

        let mut certs = vec![];
        if !info.certificate.is_empty() {
            certs.push(parse_cert_pem(&info.certificate)?);
        }
        for pem in &info.trust_certificates {
            certs.push(parse_cert_pem(pem)?);
        }
        if certs.is_empty() {
            return Err(Error::custom("CA returned no trust certificates"));
        }

        let added = self.trust_store.add_certs(&certs)?;
        debug!("trust store refreshed, {} new of {} certificates", added, certs.len());
        Ok(added)
    }

    /// Issues a new certificate. Callers hold the issuing lock.
    async fn issue(&self) -> CaResult<Arc<IdentityBundle>> {
        if self.trust_store.is_empty() {
            self.refresh_trust_store().await?;
        }

        let key = self.key_algorithm.generate()?;
        let uri = self.identity.to_uri();
        let csr = CsrTemplate::new(CsrSubject::new(self.identity.unique_id()), vec![uri.clone()]).build_pem(&key)?;
        let req = SignRequest {
            hosts: vec![uri],
            certificate_request: csr,
            profile: self.profile.clone(),
            label: self.profile.clone(),
        };

        let pem = self.signer.sign(&req).await?;
        let bundle = Arc::new(IdentityBundle::new(key, parse_cert_pem(&pem)?)?);
        info!(
            "obtained certificate {} for {}, valid until {}",
            bundle.info().serial_number,
            self.identity,
            bundle.info().not_after
        );
        self.install(bundle.clone());
        Ok(bundle)
    }

    fn install(&self, bundle: Arc<IdentityBundle>) {
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(bundle);
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("identity", &self.identity)
            .field("profile", &self.profile)
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
