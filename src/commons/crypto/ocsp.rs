//! OCSP messages exchanged between workloads and the responder.
//!
//! Both directions use the DER encoding of RFC 6960, so any standard OCSP
//! client can talk to the responder. Requests are built and responses
//! are checked with OpenSSL. Responses are written here and signed
//! directly with the issuing CA's key, with the responder identified by
//! the hash of that key.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use openssl::asn1::Asn1GeneralizedTimeRef;
use openssl::bn::BigNum;
use openssl::hash::{MessageDigest, hash};
use openssl::ocsp::{self, OcspCertId, OcspFlag, OcspResponseStatus};
use openssl::pkey::{Id, PKeyRef, Private};
use openssl::sign::Signer;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};

use crate::commons::crypto::der::{self, Reader};
use crate::commons::error::{CaResult, Error};
use crate::constants::OCSP_CLOCK_SKEW_SECS;

/// id-pkix-ocsp-basic
const ID_PKIX_OCSP_BASIC: &[u8] = &[0x06, 0x09, 0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

const SHA256_WITH_RSA: &[u8] = &[
    0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B, 0x05, 0x00,
];

const ECDSA_WITH_SHA256: &[u8] = &[0x30, 0x0A, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];

//------------ RevocationReason ----------------------------------------------

/// Revocation reasons with their RFC 5280 codes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    pub fn code(self) -> u8 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }

    /// Maps a CRL reason code, treating unknown codes as unspecified.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => RevocationReason::KeyCompromise,
            2 => RevocationReason::CaCompromise,
            3 => RevocationReason::AffiliationChanged,
            4 => RevocationReason::Superseded,
            5 => RevocationReason::CessationOfOperation,
            _ => RevocationReason::Unspecified,
        }
    }

    /// Parses a reason name as used in requests, e.g. `keycompromise`.
    pub fn from_name(name: &str) -> CaResult<Self> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "" | "unspecified" => Ok(RevocationReason::Unspecified),
            "keycompromise" => Ok(RevocationReason::KeyCompromise),
            "cacompromise" => Ok(RevocationReason::CaCompromise),
            "affiliationchanged" => Ok(RevocationReason::AffiliationChanged),
            "superseded" => Ok(RevocationReason::Superseded),
            "cessationofoperation" => Ok(RevocationReason::CessationOfOperation),
            _ => Err(Error::BadRequest(format!("unknown revocation reason '{}'", name))),
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

//------------ OcspRequest ---------------------------------------------------

/// A request about a single certificate.
///
/// Only the first certificate of a request listing several is answered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OcspRequest {
    /// Decimal serial number of the certificate.
    pub serial_number: String,

    /// Hex SHA-1 hash of the issuer's public key.
    pub issuer_key_hash: String,

    /// The encoded CertID, echoed in the response.
    cert_id: Vec<u8>,

    der: Vec<u8>,
}

impl OcspRequest {
    /// Creates the request for a certificate issued by `issuer`.
    pub fn for_certificate(cert: &X509Ref, issuer: &X509Ref) -> CaResult<Self> {
        let id = OcspCertId::from_cert(MessageDigest::sha1(), cert, issuer)?;
        let mut req = ocsp::OcspRequest::new()?;
        req.add_id(id)?;
        Self::decode(&req.to_der()?)
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn decode(bytes: &[u8]) -> CaResult<Self> {
        let mut outer = Reader::new(bytes);
        let request = outer.expect(der::SEQUENCE)?;
        outer.finish()?;

        // The optional signature after the request is ignored.
        let mut tbs = request.reader().expect(der::SEQUENCE)?.reader();
        tbs.skip_if(der::explicit(0))?;
        tbs.skip_if(der::explicit(1))?;
        let mut list = tbs.expect(der::SEQUENCE)?.reader();
        let cert_id = list.expect(der::SEQUENCE)?.reader().expect(der::SEQUENCE)?;

        let mut fields = cert_id.reader();
        fields.expect(der::SEQUENCE)?;
        fields.expect(der::OCTET_STRING)?;
        let key_hash = fields.expect(der::OCTET_STRING)?;
        let serial = fields.expect(der::INTEGER)?;
        fields.finish()?;

        if serial.content.is_empty() || key_hash.content.is_empty() {
            return Err(Error::parse("OCSP request", "missing serial number or issuer key hash"));
        }
        let serial_number = BigNum::from_slice(serial.content)
            .and_then(|bn| bn.to_dec_str().map(|s| s.to_string()))
            .map_err(|e| Error::parse("OCSP request serial number", e))?;

        Ok(OcspRequest {
            serial_number,
            issuer_key_hash: hex::encode(key_hash.content),
            cert_id: cert_id.raw.to_vec(),
            der: bytes.to_vec(),
        })
    }
}

//------------ OcspCertStatus ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OcspCertStatus {
    Good,
    Revoked {
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    },
    Unknown,
}

impl OcspCertStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, OcspCertStatus::Good)
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            OcspCertStatus::Good => der::tlv(der::implicit(0), &[]),
            OcspCertStatus::Revoked { revoked_at, reason } => {
                let time = der::generalized_time(revoked_at);
                if *reason == RevocationReason::Unspecified {
                    der::constructed(der::explicit(1), &[&time])
                } else {
                    let reason = der::constructed(der::explicit(0), &[&der::enumerated(reason.code())]);
                    der::constructed(der::explicit(1), &[&time, &reason])
                }
            }
            OcspCertStatus::Unknown => der::tlv(der::implicit(2), &[]),
        }
    }
}

//------------ OcspResponse --------------------------------------------------

/// The answer about one certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OcspResponse {
    pub cert_status: OcspCertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

impl OcspResponse {
    /// Encodes the answer to `req`, signed with the issuer's key.
    ///
    /// The production time is `this_update`.
    pub fn sign(&self, req: &OcspRequest, key: &PKeyRef<Private>) -> CaResult<Vec<u8>> {
        let (algorithm, digest) = match key.id() {
            Id::RSA => (SHA256_WITH_RSA, MessageDigest::sha256()),
            Id::EC => (ECDSA_WITH_SHA256, MessageDigest::sha256()),
            other => return Err(Error::signing(format!("cannot sign OCSP responses with {:?} keys", other))),
        };

        let status = self.cert_status.encode();
        let this_update = der::generalized_time(&self.this_update);
        let single = match &self.next_update {
            Some(next) => {
                let next = der::constructed(der::explicit(0), &[&der::generalized_time(next)]);
                der::sequence(&[&req.cert_id, &status, &this_update, &next])
            }
            None => der::sequence(&[&req.cert_id, &status, &this_update]),
        };
        let responder_id = der::constructed(der::explicit(2), &[&der::octet_string(&public_key_hash(key)?)]);
        let tbs = der::sequence(&[&responder_id, &this_update, &der::sequence(&[&single])]);

        let mut signer = Signer::new(digest, key)?;
        signer.update(&tbs)?;
        let signature = signer.sign_to_vec()?;

        let basic = der::sequence(&[&tbs, algorithm, &der::bit_string(&signature)]);
        let response_bytes = der::sequence(&[ID_PKIX_OCSP_BASIC, &der::octet_string(&basic)]);
        Ok(der::sequence(&[
            &der::enumerated(0),
            &der::constructed(der::explicit(0), &[&response_bytes]),
        ]))
    }

    /// Decodes and checks the answer about `cert`.
    ///
    /// The response must be signed by `issuer` and be current. A bad
    /// signature, or an answer about another certificate, is reported as
    /// [`Error::SignatureInvalid`]. Error responses and stale answers are
    /// reported as [`Error::OcspUnavailable`].
    pub fn verify(bytes: &[u8], cert: &X509Ref, issuer: &X509Ref) -> CaResult<Self> {
        let res = ocsp::OcspResponse::from_der(bytes)
            .map_err(|e| Error::OcspUnavailable(format!("cannot parse response: {}", e)))?;
        let status = res.status();
        if status != OcspResponseStatus::SUCCESSFUL {
            let msg = match OcspErrorResponse::from_status(status) {
                Some(err) => err.to_string(),
                None => format!("OCSP response status {}", status.as_raw()),
            };
            return Err(Error::OcspUnavailable(msg));
        }
        let basic = res
            .basic()
            .map_err(|e| Error::OcspUnavailable(format!("not a basic OCSP response: {}", e)))?;

        let mut certs = Stack::new()?;
        certs.push(issuer.to_owned())?;
        let store = X509StoreBuilder::new()?.build();
        basic
            .verify(&certs, &store, OcspFlag::TRUST_OTHER)
            .map_err(|e| Error::SignatureInvalid(format!("OCSP response is not signed by the issuer: {}", e)))?;

        let id = OcspCertId::from_cert(MessageDigest::sha1(), cert, issuer)?;
        let single = basic
            .find_status(&id)
            .ok_or_else(|| Error::SignatureInvalid("OCSP response is for another certificate".into()))?;
        single
            .check_validity(OCSP_CLOCK_SKEW_SECS, None)
            .map_err(|e| Error::OcspUnavailable(format!("OCSP response is not current: {}", e)))?;

        let cert_status = if single.status == ocsp::OcspCertStatus::GOOD {
            OcspCertStatus::Good
        } else if single.status == ocsp::OcspCertStatus::REVOKED {
            let revoked_at = match single.revocation_time {
                Some(time) => generalized_time(time)?,
                None => generalized_time(single.this_update)?,
            };
            OcspCertStatus::Revoked {
                revoked_at,
                reason: RevocationReason::from_code(single.reason.as_raw()),
            }
        } else {
            OcspCertStatus::Unknown
        };

        Ok(OcspResponse {
            cert_status,
            this_update: generalized_time(single.this_update)?,
            next_update: single.next_update().map(generalized_time).transpose()?,
        })
    }
}

/// The SHA-1 hash of the public key bits, as used in responder IDs.
fn public_key_hash(key: &PKeyRef<Private>) -> CaResult<Vec<u8>> {
    let spki = key.public_key_to_der()?;
    let mut outer = Reader::new(&spki);
    let mut info = outer.expect(der::SEQUENCE)?.reader();
    info.expect(der::SEQUENCE)?;
    let bits = info.expect(der::BIT_STRING)?;
    let key_bits = bits
        .content
        .get(1..)
        .ok_or_else(|| Error::parse("public key", "empty bit string"))?;
    Ok(hash(MessageDigest::sha1(), key_bits)?.to_vec())
}

/// Converts OpenSSL's rendering, e.g. `Jan  2 03:04:05 2024 GMT`.
fn generalized_time(time: &Asn1GeneralizedTimeRef) -> CaResult<DateTime<Utc>> {
    let rendered = time.to_string().split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&rendered, "%b %d %H:%M:%S %Y GMT")
        .map(|time| time.and_utc())
        .map_err(|e| Error::parse("OCSP time", format!("{}: {}", rendered, e)))
}

//------------ OcspErrorResponse ---------------------------------------------

/// The unsigned OCSP error responses of RFC 6960.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OcspErrorResponse {
    MalformedRequest,
    InternalError,
    TryLater,
    SigRequired,
    Unauthorized,
}

const MALFORMED_REQUEST: &[u8] = &[0x30, 0x03, 0x0A, 0x01, 0x01];
const INTERNAL_ERROR: &[u8] = &[0x30, 0x03, 0x0A, 0x01, 0x02];
const TRY_LATER: &[u8] = &[0x30, 0x03, 0x0A, 0x01, 0x03];
const SIG_REQUIRED: &[u8] = &[0x30, 0x03, 0x0A, 0x01, 0x05];
const UNAUTHORIZED: &[u8] = &[0x30, 0x03, 0x0A, 0x01, 0x06];

impl OcspErrorResponse {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            OcspErrorResponse::MalformedRequest => MALFORMED_REQUEST,
            OcspErrorResponse::InternalError => INTERNAL_ERROR,
            OcspErrorResponse::TryLater => TRY_LATER,
            OcspErrorResponse::SigRequired => SIG_REQUIRED,
            OcspErrorResponse::Unauthorized => UNAUTHORIZED,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            MALFORMED_REQUEST => Some(OcspErrorResponse::MalformedRequest),
            INTERNAL_ERROR => Some(OcspErrorResponse::InternalError),
            TRY_LATER => Some(OcspErrorResponse::TryLater),
            SIG_REQUIRED => Some(OcspErrorResponse::SigRequired),
            UNAUTHORIZED => Some(OcspErrorResponse::Unauthorized),
            _ => None,
        }
    }

    pub fn status(self) -> OcspResponseStatus {
        match self {
            OcspErrorResponse::MalformedRequest => OcspResponseStatus::MALFORMED_REQUEST,
            OcspErrorResponse::InternalError => OcspResponseStatus::INTERNAL_ERROR,
            OcspErrorResponse::TryLater => OcspResponseStatus::TRY_LATER,
            OcspErrorResponse::SigRequired => OcspResponseStatus::SIG_REQUIRED,
            OcspErrorResponse::Unauthorized => OcspResponseStatus::UNAUTHORIZED,
        }
    }

    pub fn from_status(status: OcspResponseStatus) -> Option<Self> {
        [
            OcspErrorResponse::MalformedRequest,
            OcspErrorResponse::InternalError,
            OcspErrorResponse::TryLater,
            OcspErrorResponse::SigRequired,
            OcspErrorResponse::Unauthorized,
        ]
        .into_iter()
        .find(|err| err.status() == status)
    }
}

impl fmt::Display for OcspErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OcspErrorResponse::MalformedRequest => "OCSP malformed",
            OcspErrorResponse::InternalError => "OCSP internal error",
            OcspErrorResponse::TryLater => "OCSP try later",
            OcspErrorResponse::SigRequired => "OCSP signature required",
            OcspErrorResponse::Unauthorized => "OCSP unauthorized",
        };
        f.write_str(s)
    }
}

//------------ Tests ---------------------------------------------------------
