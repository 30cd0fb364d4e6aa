//! The OCSP responder.
//!
//! Answers are signed with the CA's own key and cached per serial number
//! and issuer key hash for the configured cache time. Every answer, and
//! every failure to answer, is counted by outcome.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::ca::certdb::{CertDb, CertKey, CertificateRecord};
use crate::ca::keeper::Keeper;
use crate::ca::pemstore::PemKey;
use crate::commons::cache::TtlCache;
use crate::commons::crypto::ocsp::{OcspRequest, OcspResponse};
use crate::commons::crypto::{CertInfo, parse_cert_pem};
use crate::commons::error::{CaResult, Error};
use crate::commons::events::{CertOp, EventKind, EventSink, LifecycleEvent};
use crate::commons::metrics::{Counters, MetricsPoint, MetricsSink};
use crate::constants::{METRICS_OCSP_RESPONSES, OCSP_CACHE_CAPACITY, OPERATOR_SDK};

//------------ OcspOutcome ---------------------------------------------------

/// How a request to the responder ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OcspOutcome {
    Cached,
    Good,
    NotFound,
    ServerError,
    CertParseError,
    OcspSignError,
}

impl OcspOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            OcspOutcome::Cached => "cached",
            OcspOutcome::Good => "good",
            OcspOutcome::NotFound => "notfound",
            OcspOutcome::ServerError => "servererror",
            OcspOutcome::CertParseError => "certparseerror",
            OcspOutcome::OcspSignError => "ocspsignerror",
        }
    }

    fn is_success(self) -> bool {
        matches!(self, OcspOutcome::Cached | OcspOutcome::Good)
    }
}

impl fmt::Display for OcspOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ OcspResponder -------------------------------------------------

pub struct OcspResponder {
    certdb: Arc<CertDb>,
    keeper: Arc<Keeper>,
    events: Arc<dyn EventSink>,
    metrics: Option<Arc<dyn MetricsSink>>,
    cache: TtlCache<(String, String), Bytes>,
    counters: Counters,
}

impl OcspResponder {
    pub fn new(
        certdb: Arc<CertDb>,
        keeper: Arc<Keeper>,
        events: Arc<dyn EventSink>,
        metrics: Option<Arc<dyn MetricsSink>>,
        cache_ttl: std::time::Duration,
    ) -> Self {
        OcspResponder {
            certdb,
            keeper,
            events,
            metrics,
            cache: TtlCache::new(cache_ttl, OCSP_CACHE_CAPACITY),
            counters: Counters::default(),
        }
    }

    /// Returns the encoded, signed response for the request.
    pub fn response(&self, req: &OcspRequest) -> CaResult<Bytes> {
        let cache_key = (req.serial_number.clone(), req.issuer_key_hash.clone());
        if let Some(res) = self.cache.get(&cache_key) {
            debug!("OCSP response for {} served from cache", req.serial_number);
            self.record("", OcspOutcome::Cached);
            return Ok(res);
        }

        let key = CertKey::new(&req.serial_number, &req.issuer_key_hash);
        let record = match self.certdb.get_certificate(&key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("OCSP request for unknown certificate {}", req.serial_number);
                self.record("", OcspOutcome::NotFound);
                return Err(Error::not_found(format!("certificate {}", req.serial_number)));
            }
            Err(e) => {
                error!("cannot look up certificate {}: {}", req.serial_number, e);
                self.record("", OcspOutcome::ServerError);
                return Err(e);
            }
        };

        let unique_id = match self.unique_id(&record) {
            Ok(unique_id) => unique_id,
            Err(e) => {
                error!("cannot use certificate {} for OCSP: {}", req.serial_number, e);
                self.record("", OcspOutcome::CertParseError);
                return Err(e);
            }
        };

        let res = match self.sign(req, &record) {
            Ok(res) => res,
            Err(e) => {
                error!("cannot sign OCSP response for {}: {}", req.serial_number, e);
                self.record(&unique_id, OcspOutcome::OcspSignError);
                return Err(Error::signing(e));
            }
        };

        self.events.emit(LifecycleEvent::new(
            OPERATOR_SDK,
            EventKind::OcspSign,
            CertOp::cert(&unique_id, &record.serial_number, &record.authority_key_id),
        ));
        self.cache.insert(cache_key, res.clone());
        info!("signed OCSP response for {} ({})", record.serial_number, unique_id);
        self.record(&unique_id, OcspOutcome::Good);
        Ok(res)
    }

    /// The number of requests that ended with the given outcome.
    pub fn count(&self, outcome: OcspOutcome) -> u64 {
        self.counters.get(outcome.as_str())
    }

    /// Drops all cached responses.
    pub fn flush(&self) {
        self.cache.clear();
    }

    /// Finds the identity of the certificate from its PEM.
    ///
    /// A revoked certificate may have lost its PEM. It is answered from
    /// its record alone.
    fn unique_id(&self, record: &CertificateRecord) -> CaResult<String> {
        let entry = self
            .keeper
            .pem_store()
            .get(&PemKey::Serial(record.serial_number.clone()))?;
        match entry {
            Some(entry) => {
                let cert = parse_cert_pem(&entry.cert)?;
                Ok(CertInfo::from_cert(&cert)?.common_name)
            }
            None if record.is_revoked() => Ok(record.common_name.clone()),
            None => Err(Error::parse("certificate", "PEM is missing")),
        }
    }

    fn sign(&self, req: &OcspRequest, record: &CertificateRecord) -> CaResult<Bytes> {
        let ca = self.keeper.get_cached_self_key_pair()?;
        let now = Utc::now();
        let next_update = now + chrono::Duration::from_std(self.cache.ttl()).map_err(Error::signing)?;
        let res = OcspResponse {
            cert_status: record.ocsp_status(),
            this_update: now,
            next_update: Some(next_update),
        };
        Ok(Bytes::from(res.sign(req, &ca.key)?))
    }

    fn record(&self, unique_id: &str, outcome: OcspOutcome) {
        self.counters.increment(outcome.as_str());
        if let Some(metrics) = &self.metrics {
            let (cache, kind) = match outcome {
                OcspOutcome::Cached => ("hit", "success"),
                _ if outcome.is_success() => ("miss", "success"),
                _ => ("miss", "failed"),
            };
            metrics.add_point(
                MetricsPoint::new(METRICS_OCSP_RESPONSES)
                    .tag("unique_id", unique_id)
                    .tag("cache", cache)
                    .tag("status", outcome)
                    .tag("type", kind)
                    .field("times", 1i64),
            );
        }
    }
}

//------------ Tests ---------------------------------------------------------
