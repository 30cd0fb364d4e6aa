//! Revocation checks of peer certificates.
//!
//! Every TLS peer's leaf certificate is checked with the OCSP responder of
//! the CA before a connection is handed out. Good answers are cached per
//! serial number, concurrent checks of one serial share a single request.
//! What happens when the responder cannot be asked is a policy decision,
//! see [`RevocationCheckPolicy`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use openssl::x509::{X509, X509Ref};

use crate::commons::cache::TtlCache;
use crate::commons::crypto::ocsp::{OcspCertStatus, OcspRequest, OcspResponse};
use crate::commons::error::{CaResult, Error};
use crate::commons::flight::Flight;
use crate::commons::httpclient;
use crate::constants::{
    HTTP_CLIENT_TIMEOUT_SECS, OCSP_CACHE_CAPACITY, OCSP_CLIENT_CACHE_TTL, OCSP_REQUEST_CONTENT_TYPE,
};

//------------ OcspFetcher ---------------------------------------------------

/// Asks an OCSP responder about one certificate.
#[async_trait]
pub trait OcspFetcher: Send + Sync {
    /// Returns the verified response about `leaf` for the request.
    async fn fetch(&self, req: &OcspRequest, leaf: &X509Ref, issuer: &X509Ref) -> CaResult<OcspResponse>;
}

/// Posts requests to the responder endpoint of a CA.
#[derive(Clone, Debug)]
pub struct HttpOcspFetcher {
    uri: String,
    timeout: Duration,
}

impl HttpOcspFetcher {
    pub fn new(uri: impl Into<String>) -> Self {
        HttpOcspFetcher {
            uri: uri.into(),
            timeout: Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl OcspFetcher for HttpOcspFetcher {
    async fn fetch(&self, req: &OcspRequest, leaf: &X509Ref, issuer: &X509Ref) -> CaResult<OcspResponse> {
        let body = Bytes::copy_from_slice(req.to_der());
        let bytes = httpclient::post_binary(&self.uri, body, OCSP_REQUEST_CONTENT_TYPE, self.timeout)
            .await
            .map_err(|e| Error::OcspUnavailable(e.to_string()))?;
        OcspResponse::verify(&bytes, leaf, issuer)
    }
}

//------------ OcspKillSwitch ------------------------------------------------

/// Disables all OCSP requests of a CA instance at once.
///
/// While blocked every peer fails verification.
#[derive(Clone, Debug, Default)]
pub struct OcspKillSwitch(Arc<AtomicBool>);

impl OcspKillSwitch {
    pub fn block(&self) {
        info!("OCSP requests blocked");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn allow(&self) {
        info!("OCSP requests allowed");
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_blocked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

//------------ RevocationCheckPolicy -----------------------------------------

/// What to do with a peer when its revocation status cannot be learned.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RevocationCheckPolicy {
    /// Accept the peer. A responder outage does not take the mesh down.
    #[default]
    FailOpen,

    /// Reject the peer.
    FailClosed,
}

//------------ OcspVerdict ---------------------------------------------------

#[derive(Clone, Debug)]
pub enum OcspVerdict {
    /// A good answer was cached.
    Cached,

    /// The responder answered good.
    Valid,

    /// The responder could not be asked, and the policy accepts the peer.
    FailedOpen(Error),

    Rejected(Error),
}

impl OcspVerdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, OcspVerdict::Rejected(_))
    }

    pub fn into_result(self) -> CaResult<()> {
        match self {
            OcspVerdict::Rejected(e) => Err(e),
            _ => Ok(()),
        }
    }
}

//------------ OcspClient ----------------------------------------------------

pub struct OcspClient {
    fetcher: Arc<dyn OcspFetcher>,
    policy: RevocationCheckPolicy,
    kill_switch: OcspKillSwitch,
    cache: TtlCache<String, ()>,
    flight: Flight<String, CaResult<OcspResponse>>,
}

impl OcspClient {
    pub fn new(fetcher: Arc<dyn OcspFetcher>, policy: RevocationCheckPolicy, kill_switch: OcspKillSwitch) -> Self {
        OcspClient {
            fetcher,
            policy,
            kill_switch,
            cache: TtlCache::new(OCSP_CLIENT_CACHE_TTL, OCSP_CACHE_CAPACITY),
            flight: Flight::new(),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = TtlCache::new(ttl, OCSP_CACHE_CAPACITY);
        self
    }

    pub fn policy(&self) -> RevocationCheckPolicy {
        self.policy
    }

    /// Checks the revocation status of `leaf`, issued by `issuer`.
    pub async fn validate(&self, leaf: &X509Ref, issuer: &X509Ref) -> OcspVerdict {
        if self.kill_switch.is_blocked() {
            return OcspVerdict::Rejected(Error::OcspBlocked);
        }

        let req = match OcspRequest::for_certificate(leaf, issuer) {
            Ok(req) => req,
            Err(e) => return OcspVerdict::Rejected(e),
        };
        let serial = req.serial_number.clone();
        if self.cache.get(&serial).is_some() {
            debug!("OCSP status of {} served from cache", serial);
            return OcspVerdict::Cached;
        }

        let fetcher = self.fetcher.clone();
        let leaf: X509 = leaf.to_owned();
        let issuer: X509 = issuer.to_owned();
        let res = self
            .flight
            .run(format!("ocsp{}", serial), async move { fetcher.fetch(&req, &leaf, &issuer).await })
            .await;

        match res {
            Ok(res) => match res.cert_status {
                OcspCertStatus::Good => {
                    self.cache.insert(serial, ());
                    OcspVerdict::Valid
                }
                status => {
                    warn!("peer certificate {} is not good: {:?}", serial, status);
                    OcspVerdict::Rejected(Error::Revoked(format!("certificate {}", serial)))
                }
            },
            Err(e @ Error::SignatureInvalid(_)) => {
                warn!("rejecting peer certificate {}: {}", serial, e);
                OcspVerdict::Rejected(e)
            }
            Err(e) => match self.policy {
                RevocationCheckPolicy::FailOpen => {
                    warn!("cannot check revocation of {}, accepting the peer: {}", serial, e);
                    OcspVerdict::FailedOpen(e)
                }
                RevocationCheckPolicy::FailClosed => {
                    warn!("cannot check revocation of {}, rejecting the peer: {}", serial, e);
                    OcspVerdict::Rejected(e)
                }
            },
        }
    }

    /// Forgets all cached answers.
    pub fn reset(&self) {
        self.cache.clear();
    }
}

impl fmt::Debug for OcspClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OcspClient")
            .field("policy", &self.policy)
            .field("blocked", &self.kill_switch.is_blocked())
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::commons::crypto::CertInfo;
    use crate::commons::crypto::ocsp::RevocationReason;
    use crate::ca::certdb::CertKey;
    use crate::test::{LocalOcspFetcher, TestCa};

    /// Counts fetches and answers slowly.
    struct CountingFetcher {
        inner: Arc<dyn OcspFetcher>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OcspFetcher for CountingFetcher {
        async fn fetch(&self, req: &OcspRequest, leaf: &X509Ref, issuer: &X509Ref) -> CaResult<OcspResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.inner.fetch(req, leaf, issuer).await
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl OcspFetcher for FailingFetcher {
        async fn fetch(&self, _req: &OcspRequest, _leaf: &X509Ref, _issuer: &X509Ref) -> CaResult<OcspResponse> {
            Err(Error::OcspUnavailable("connection refused".into()))
        }
    }

    /// Answers good, but with an answer that expired a day ago.
    struct StaleFetcher {
        key: openssl::pkey::PKey<openssl::pkey::Private>,
    }

    #[async_trait]
    impl OcspFetcher for StaleFetcher {
        async fn fetch(&self, req: &OcspRequest, leaf: &X509Ref, issuer: &X509Ref) -> CaResult<OcspResponse> {
            let this_update = chrono::Utc::now() - chrono::TimeDelta::days(2);
            let der = OcspResponse {
                cert_status: OcspCertStatus::Good,
                this_update,
                next_update: Some(this_update + chrono::TimeDelta::days(1)),
            }
            .sign(req, &self.key)?;
            OcspResponse::verify(&der, leaf, issuer)
        }
    }

    fn client(ca: &TestCa, policy: RevocationCheckPolicy) -> OcspClient {
        OcspClient::new(Arc::new(LocalOcspFetcher::new(ca)), policy, OcspKillSwitch::default())
    }

    fn ca_cert(ca: &TestCa) -> X509 {
        ca.keeper.get_cached_self_key_pair().unwrap().cert.clone()
    }

    #[tokio::test]
    async fn good_answers_are_cached() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-a");
        let client = client(&ca, RevocationCheckPolicy::FailClosed);

        assert!(matches!(client.validate(&leaf, &ca_cert(&ca)).await, OcspVerdict::Valid));
        assert!(matches!(client.validate(&leaf, &ca_cert(&ca)).await, OcspVerdict::Cached));

        client.reset();
        assert!(matches!(client.validate(&leaf, &ca_cert(&ca)).await, OcspVerdict::Valid));
    }

    #[tokio::test]
    async fn revoked_peers_are_rejected() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-b");
        let info = CertInfo::from_cert(&leaf).unwrap();
        ca.certdb
            .revoke_certificate(
                &CertKey::new(&info.serial_number, &info.authority_key_id),
                RevocationReason::KeyCompromise,
            )
            .unwrap();

        let verdict = client(&ca, RevocationCheckPolicy::FailOpen)
            .validate(&leaf, &ca_cert(&ca))
            .await;
        assert!(!verdict.is_valid());
        assert!(matches!(verdict.into_result(), Err(Error::Revoked(_))));
    }

    #[tokio::test]
    async fn kill_switch_rejects_everything() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-c");
        let switch = OcspKillSwitch::default();
        let client = OcspClient::new(
            Arc::new(LocalOcspFetcher::new(&ca)),
            RevocationCheckPolicy::FailOpen,
            switch.clone(),
        );

        switch.block();
        assert!(matches!(
            client.validate(&leaf, &ca_cert(&ca)).await,
            OcspVerdict::Rejected(Error::OcspBlocked)
        ));
        switch.allow();
        assert!(client.validate(&leaf, &ca_cert(&ca)).await.is_valid());
    }

    #[tokio::test]
    async fn unreachable_responder_follows_the_policy() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-d");

        let open = OcspClient::new(Arc::new(FailingFetcher), RevocationCheckPolicy::default(), OcspKillSwitch::default());
        let verdict = open.validate(&leaf, &ca_cert(&ca)).await;
        assert!(matches!(verdict, OcspVerdict::FailedOpen(Error::OcspUnavailable(_))));
        assert!(verdict.is_valid());

        let closed = OcspClient::new(Arc::new(FailingFetcher), RevocationCheckPolicy::FailClosed, OcspKillSwitch::default());
        assert!(!closed.validate(&leaf, &ca_cert(&ca)).await.is_valid());
    }

    #[tokio::test]
    async fn stale_answers_follow_the_policy() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-f");
        let stale = || {
            Arc::new(StaleFetcher {
                key: ca.keeper.get_cached_self_key_pair().unwrap().key.clone(),
            })
        };

        let open = OcspClient::new(stale(), RevocationCheckPolicy::FailOpen, OcspKillSwitch::default());
        let verdict = open.validate(&leaf, &ca_cert(&ca)).await;
        assert!(matches!(verdict, OcspVerdict::FailedOpen(Error::OcspUnavailable(_))));

        let closed = OcspClient::new(stale(), RevocationCheckPolicy::FailClosed, OcspKillSwitch::default());
        assert!(matches!(
            closed.validate(&leaf, &ca_cert(&ca)).await,
            OcspVerdict::Rejected(Error::OcspUnavailable(_))
        ));
        assert!(matches!(open.validate(&leaf, &ca_cert(&ca)).await, OcspVerdict::FailedOpen(_)));
    }

    #[tokio::test]
    async fn concurrent_checks_share_one_request() {
        let ca = TestCa::root();
        let (leaf, _) = ca.issue_workload("svc-e");
        let fetcher = Arc::new(CountingFetcher {
            inner: Arc::new(LocalOcspFetcher::new(&ca)),
            calls: AtomicUsize::new(0),
        });
        let client = Arc::new(OcspClient::new(
            fetcher.clone(),
            RevocationCheckPolicy::FailClosed,
            OcspKillSwitch::default(),
        ));

        let issuer = ca_cert(&ca);
        let mut handles = vec![];
        for _ in 0..10 {
            let (client, leaf, issuer) = (client.clone(), leaf.clone(), issuer.clone());
            handles.push(tokio::spawn(async move { client.validate(&leaf, &issuer).await.is_valid() }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
