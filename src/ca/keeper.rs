//! Keeps the CA's own key pair and its trust chain.
//!
//! Both are cached in memory. The key pair is read from the PEM store on
//! first use. Trust certificates are looked up in memory first, then in
//! the PEM store, and finally fetched from an upstream CA.
//!
//! Every new key pair bumps a generation counter. A value read from the
//! PEM store is only cached if no new key pair was stored in the meantime.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, error, info, warn};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tokio::task::JoinHandle;

use crate::ca::pemstore::{CertPemStore, PemEntry, PemKey};
use crate::ca::upper::UpperClients;
use crate::commons::api::InfoRequest;
use crate::commons::crypto::{certs_to_pem, parse_cert_pem, parse_certs_pem, private_key_from_pem, serial_number};
use crate::commons::error::{CaResult, Error};
use crate::commons::metrics::{MetricsPoint, MetricsSink};
use crate::constants::{METRICS_UPPER_CA_INFO, PROFILE_INTERMEDIATE};

//------------ SelfKeyPair ---------------------------------------------------

/// The CA's own key and certificate.
#[derive(Clone, Debug)]
pub struct SelfKeyPair {
    pub key: PKey<Private>,
    pub cert: X509,
}

/// The PEM encoding of the CA's own key and certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelfKeyPairPem {
    pub key: String,
    pub cert: String,
}

impl SelfKeyPairPem {
    fn parse(&self) -> CaResult<SelfKeyPair> {
        let key = private_key_from_pem(&self.key)?;
        let cert = parse_cert_pem(&self.cert)?;
        if !cert.public_key()?.public_eq(&key) {
            return Err(Error::parse("self key pair", "certificate does not match key"));
        }
        Ok(SelfKeyPair { key, cert })
    }
}

//------------ Keeper --------------------------------------------------------

pub struct Keeper {
    pems: Arc<dyn CertPemStore>,
    uppers: UpperClients,
    self_sign: bool,
    metrics: Option<Arc<dyn MetricsSink>>,

    key_pair_pem: RwLock<Option<Arc<SelfKeyPairPem>>>,
    key_pair: RwLock<Option<Arc<SelfKeyPair>>>,
    trust_certs: RwLock<Option<Arc<Vec<X509>>>>,
    generation: AtomicU64,

    persisting: Mutex<Vec<JoinHandle<()>>>,
}

impl Keeper {
    pub fn new(
        pems: Arc<dyn CertPemStore>,
        uppers: UpperClients,
        self_sign: bool,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        Keeper {
            pems,
            uppers,
            self_sign,
            metrics,
            key_pair_pem: RwLock::new(None),
            key_pair: RwLock::new(None),
            trust_certs: RwLock::new(None),
            generation: AtomicU64::new(0),
            persisting: Mutex::new(vec![]),
        }
    }

    pub fn is_self_sign(&self) -> bool {
        self.self_sign
    }

    pub fn upper_clients(&self) -> &UpperClients {
        &self.uppers
    }

    pub fn pem_store(&self) -> &Arc<dyn CertPemStore> {
        &self.pems
    }

    /// Returns whether a key pair has been provisioned.
    pub fn has_self_key_pair(&self) -> CaResult<bool> {
        match self.get_cached_self_key_pair_pem() {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the parsed key pair.
    pub fn get_cached_self_key_pair(&self) -> CaResult<Arc<SelfKeyPair>> {
        if let Some(pair) = self.key_pair.read().map_err(poisoned)?.as_ref() {
            return Ok(pair.clone());
        }

        let generation = self.generation();
        let pem = self.get_cached_self_key_pair_pem()?;
        let pair = Arc::new(pem.parse().inspect_err(|e| error!("cannot use self key pair: {}", e))?);

        let mut cached = self.key_pair.write().map_err(poisoned)?;
        if self.generation() == generation {
            *cached = Some(pair.clone());
        }
        Ok(pair)
    }

    /// Returns the key pair PEMs.
    pub fn get_cached_self_key_pair_pem(&self) -> CaResult<Arc<SelfKeyPairPem>> {
        if let Some(pem) = self.key_pair_pem.read().map_err(poisoned)?.as_ref() {
            return Ok(pem.clone());
        }

        let generation = self.generation();
        let entry = self
            .pems
            .get(&PemKey::LocalStore)?
            .ok_or_else(|| Error::not_found("self key pair"))?;
        let key = entry
            .key
            .ok_or_else(|| Error::parse("self key pair", "no private key stored"))?;
        let pem = Arc::new(SelfKeyPairPem { key, cert: entry.cert });

        let mut cached = self.key_pair_pem.write().map_err(poisoned)?;
        if self.generation() == generation {
            *cached = Some(pem.clone());
        } else {
            debug!("self key pair replaced while loading, not caching it");
        }
        Ok(pem)
    }

    /// Stores a new key pair and flushes everything cached.
    pub fn set_key_pair_pem(&self, key: &str, cert: &str) -> CaResult<()> {
        let pem = SelfKeyPairPem {
            key: key.to_string(),
            cert: cert.to_string(),
        };
        pem.parse()?;

        let mut key_pair_pem = self.key_pair_pem.write().map_err(poisoned)?;
        let mut key_pair = self.key_pair.write().map_err(poisoned)?;
        let mut trust_certs = self.trust_certs.write().map_err(poisoned)?;

        self.pems.put(&PemKey::LocalStore, &PemEntry::key_pair(key, cert))?;

        *key_pair_pem = None;
        *key_pair = None;
        *trust_certs = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("stored new self key pair");
        Ok(())
    }

    /// Returns the trust certificates, from memory, durable storage or an
    /// upstream CA, whichever has them first.
    ///
    /// A fetched chain is kept in memory right away and persisted in the
    /// background.
    pub async fn get_l3_cached_trust_certs(&self) -> CaResult<Arc<Vec<X509>>> {
        if let Some(certs) = self.trust_certs.read().map_err(poisoned)?.as_ref() {
            return Ok(certs.clone());
        }

        let generation = self.generation();
        if let Some(certs) = self.durable_trust_certs() {
            let certs = Arc::new(certs);
            self.cache_trust_certs(generation, &certs)?;
            return Ok(certs);
        }

        let certs = self
            .get_remote_trust_certs()
            .await
            .inspect_err(|e| error!("cannot get trust certificates from upstream: {}", e))?;
        let certs = Arc::new(certs);

        if !certs.is_empty() {
            self.cache_trust_certs(generation, &certs)?;
            self.persist_trust_certs(certs.clone())?;
        }
        Ok(certs)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn cache_trust_certs(&self, generation: u64, certs: &Arc<Vec<X509>>) -> CaResult<()> {
        let mut cached = self.trust_certs.write().map_err(poisoned)?;
        if self.generation() == generation {
            *cached = Some(certs.clone());
        }
        Ok(())
    }

    fn durable_trust_certs(&self) -> Option<Vec<X509>> {
        match self.pems.get(&PemKey::TrustCerts) {
            Ok(Some(entry)) => match parse_certs_pem(&entry.cert) {
                Ok(certs) => Some(certs),
                Err(e) => {
                    error!("stored trust certificates are unusable: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("cannot read stored trust certificates: {}", e);
                None
            }
        }
    }

    fn persist_trust_certs(&self, certs: Arc<Vec<X509>>) -> CaResult<()> {
        let pem = certs_to_pem(&certs)?;
        let pems = self.pems.clone();
        let handle = tokio::task::spawn_blocking(move || {
            match pems.put(&PemKey::TrustCerts, &PemEntry::cert(pem)) {
                Ok(()) => info!("stored {} trust certificates", certs.len()),
                Err(e) => error!("cannot store trust certificates: {}", e),
            }
        });
        self.persisting.lock().map_err(poisoned)?.push(handle);
        Ok(())
    }

    /// Waits until trust certificates fetched so far have been persisted.
    pub async fn wait_for_persistence(&self) {
        let handles = match self.persisting.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("trust certificate persistence task failed: {}", e);
            }
        }
    }

    /// Fetches the upstream's certificate and its trust chain.
    ///
    /// A root CA has no upstream and returns nothing.
    pub async fn get_remote_trust_certs(&self) -> CaResult<Vec<X509>> {
        if self.self_sign {
            return Ok(vec![]);
        }

        let metrics = self.metrics.clone();
        let res = self
            .uppers
            .do_with_retry(|client| {
                let metrics = metrics.clone();
                async move {
                    let res = client.info(&InfoRequest::for_profile(PROFILE_INTERMEDIATE)).await?;
                    if let Some(metrics) = metrics {
                        metrics.add_point(
                            MetricsPoint::new(METRICS_UPPER_CA_INFO)
                                .tag("type", "info")
                                .tag("host", client.host())
                                .field("trust_certs_num", (res.trust_certificates.len() + 1) as i64),
                        );
                    }
                    Ok(res)
                }
            })
            .await?;

        let mut seen = HashSet::new();
        let mut certs = vec![];
        for pem in res.trust_certificates.iter().chain(std::iter::once(&res.certificate)) {
            let cert = parse_cert_pem(pem)?;
            if seen.insert(serial_number(&cert)?) {
                certs.push(cert);
            }
        }
        debug!("got {} trust certificates from upstream", certs.len());
        Ok(certs)
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::custom("keeper cache lock poisoned")
}

//------------ Tests ---------------------------------------------------------
