//! The workload side of meshca.
//!
//! A [`CaInstance`] stands for one CA a workload obtains certificates
//! from. It hands out an [`Exchanger`] per workload identity, which issues
//! and rotates that identity's certificate and builds mutual TLS
//! configurations that verify peers against the CA's trust chain and its
//! OCSP responder.
//!
//! ```no_run
//! # async fn run() -> meshca::commons::error::CaResult<()> {
//! use meshca::client::{CaInstance, CaInstanceConfig};
//! use meshca::commons::identity::WorkloadIdentity;
//!
//! let ca_addr = url::Url::parse("https://ca.mesh.local:8081").unwrap();
//! let instance = CaInstance::new(CaInstanceConfig::new(ca_addr, "sidecar-auth-key"))?;
//! let exchanger = instance.new_exchanger(WorkloadIdentity::new("site", "cluster", "orders-1"));
//! let tls = exchanger.server_tls_config().await?;
//! let _rotation = exchanger.rotate_controller().spawn();
//! # drop(tls);
//! # Ok(())
//! # }
//! ```

pub mod exchanger;
pub mod ocsp;
pub mod revoke;
pub mod rotate;
pub mod tls;
pub mod transport;
pub mod truststore;

pub use self::exchanger::Exchanger;
pub use self::ocsp::{OcspClient, OcspKillSwitch, OcspVerdict, RevocationCheckPolicy};
pub use self::tls::TlsGenerator;
pub use self::transport::{IdentityBundle, Transport};
pub use self::truststore::TrustStore;

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::ca::upper::{RemoteCa, SigningCapability};
use crate::client::ocsp::{HttpOcspFetcher, OcspFetcher};
use crate::commons::crypto::{KeyAlgorithm, parse_cert_pem, private_key_from_pem};
use crate::commons::error::CaResult;
use crate::commons::identity::WorkloadIdentity;
use crate::constants::{API_OCSP_PATH, API_REVOKE_PATH, DEFAULT_ROTATE_AFTER, PROFILE_SIDECAR};

//------------ CaInstanceConfig ----------------------------------------------

#[derive(Clone, Debug)]
pub struct CaInstanceConfig {
    /// Base URI of the CA's API.
    pub ca_addr: Url,

    /// The OCSP responder, if not the CA's own endpoint.
    pub ocsp_addr: Option<Url>,

    /// The auth key of the signing profile.
    pub auth_key: String,

    pub profile: String,
    pub rotate_after: Duration,
    pub key_algorithm: KeyAlgorithm,
    pub revocation_policy: RevocationCheckPolicy,
}

impl CaInstanceConfig {
    pub fn new(ca_addr: Url, auth_key: impl Into<String>) -> Self {
        CaInstanceConfig {
            ca_addr,
            ocsp_addr: None,
            auth_key: auth_key.into(),
            profile: PROFILE_SIDECAR.to_string(),
            rotate_after: DEFAULT_ROTATE_AFTER,
            key_algorithm: KeyAlgorithm::EcdsaP256,
            revocation_policy: RevocationCheckPolicy::default(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.ca_addr.as_str().trim_end_matches('/'), path)
    }

    fn ocsp_uri(&self) -> String {
        match &self.ocsp_addr {
            Some(addr) => addr.to_string(),
            None => self.endpoint(API_OCSP_PATH),
        }
    }
}

//------------ CaInstance ----------------------------------------------------

/// A CA as seen by the workloads using it.
pub struct CaInstance {
    config: CaInstanceConfig,
    signer: Arc<dyn SigningCapability>,
    ocsp: Arc<OcspClient>,
    kill_switch: OcspKillSwitch,
}

impl CaInstance {
    /// Talks to the CA over its HTTP API.
    pub fn new(config: CaInstanceConfig) -> CaResult<Self> {
        let signer = Arc::new(RemoteCa::new(&config.ca_addr, &config.auth_key)?);
        let fetcher = Arc::new(HttpOcspFetcher::new(config.ocsp_uri()));
        Ok(Self::with_parts(config, signer, fetcher))
    }

    /// Uses the given signer and OCSP fetcher instead of the HTTP API.
    pub fn with_parts(
        config: CaInstanceConfig,
        signer: Arc<dyn SigningCapability>,
        fetcher: Arc<dyn OcspFetcher>,
    ) -> Self {
        let kill_switch = OcspKillSwitch::default();
        let ocsp = Arc::new(OcspClient::new(fetcher, config.revocation_policy, kill_switch.clone()));
        CaInstance {
            config,
            signer,
            ocsp,
            kill_switch,
        }
    }

    pub fn config(&self) -> &CaInstanceConfig {
        &self.config
    }

    /// Makes every OCSP check, and with it every handshake, fail.
    pub fn block_ocsp_requests(&self) {
        self.kill_switch.block();
    }

    pub fn allow_ocsp_requests(&self) {
        self.kill_switch.allow();
    }

    pub fn reset_ocsp_cache(&self) {
        self.ocsp.reset();
    }

    pub fn new_exchanger(&self, identity: WorkloadIdentity) -> Exchanger {
        let transport = self.transport(identity);
        self.exchanger(transport)
    }

    /// Creates an exchanger starting with an existing key pair.
    pub fn new_exchanger_with_key_pair(
        &self,
        identity: WorkloadIdentity,
        key_pem: &str,
        cert_pem: &str,
    ) -> CaResult<Exchanger> {
        let bundle = IdentityBundle::from_pem(key_pem, cert_pem)?;
        let transport = self.transport(identity).with_bundle(bundle);
        Ok(self.exchanger(transport))
    }

    /// Revokes a certificate with its key, without an exchanger.
    pub async fn revoke_cert(&self, key_pem: &str, cert_pem: &str) -> CaResult<()> {
        let key = private_key_from_pem(key_pem)?;
        let cert = parse_cert_pem(cert_pem)?;
        revoke::revoke_cert(&self.config.endpoint(API_REVOKE_PATH), &key, &cert).await
    }

    fn transport(&self, identity: WorkloadIdentity) -> Transport {
        Transport::new(
            identity,
            self.signer.clone(),
            self.config.profile.clone(),
            self.config.key_algorithm,
            Arc::new(TrustStore::new()),
        )
    }

    fn exchanger(&self, transport: Transport) -> Exchanger {
        Exchanger::new(
            Arc::new(transport),
            self.ocsp.clone(),
            self.config.endpoint(API_REVOKE_PATH),
            self.config.rotate_after,
        )
    }
}

impl std::fmt::Debug for CaInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CaInstance")
            .field("ca_addr", &self.config.ca_addr.as_str())
            .field("ocsp", &self.ocsp)
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{LocalOcspFetcher, TestCa, identity};

    fn instance(ca: &TestCa) -> CaInstance {
        let config = CaInstanceConfig::new(Url::parse("http://localhost:1").unwrap(), "unused");
        CaInstance::with_parts(config, ca.signer.clone(), Arc::new(LocalOcspFetcher::new(ca)))
    }

    #[test]
    fn endpoints() {
        let mut config = CaInstanceConfig::new(Url::parse("https://ca:8081/").unwrap(), "key");
        assert_eq!(config.endpoint(API_REVOKE_PATH), "https://ca:8081/api/v1/cfssl/revoke");
        assert_eq!(config.ocsp_uri(), "https://ca:8081/api/v1/cfssl/ocsp");

        config.ocsp_addr = Some(Url::parse("http://ocsp:9000/check").unwrap());
        assert_eq!(config.ocsp_uri(), "http://ocsp:9000/check");
    }

    #[tokio::test]
    async fn exchanger_with_existing_key_pair() {
        let ca = TestCa::root();
        let (cert, key) = ca.issue_workload("svc");
        let instance = instance(&ca);

        let exchanger = instance
            .new_exchanger_with_key_pair(
                identity("svc"),
                &crate::commons::crypto::private_key_to_pem(&key).unwrap(),
                &crate::commons::crypto::cert_to_pem(&cert).unwrap(),
            )
            .unwrap();
        let bundle = exchanger.get_certificate().await.unwrap();
        assert!(bundle.cert().public_key().unwrap().public_eq(&key));
        assert_eq!(ca.signer.sign_count(), 1);
    }

    #[tokio::test]
    async fn kill_switch_is_shared_by_all_exchangers() {
        let ca = TestCa::root();
        let instance = instance(&ca);
        let a = instance.new_exchanger(identity("a"));
        let b = instance.new_exchanger(identity("b"));
        let a_cert = a.get_certificate().await.unwrap();
        let issuer = ca.keeper.get_cached_self_key_pair().unwrap().cert.clone();

        instance.block_ocsp_requests();
        assert!(!b.ocsp().validate(a_cert.cert(), &issuer).await.is_valid());
        instance.allow_ocsp_requests();
        assert!(b.ocsp().validate(a_cert.cert(), &issuer).await.is_valid());
    }
}
