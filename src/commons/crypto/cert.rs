//! Certificate parsing, inspection and issuance.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509NameRef, X509Ref, X509ReqRef, X509v3Context};

use crate::commons::crypto::CsrSubject;
use crate::commons::error::{CaResult, Error};
use crate::commons::identity::WorkloadIdentity;

/// Certificates are valid from slightly before their issuance, to allow
/// for clock skew between the CA and relying parties.
const BACKDATE_SECS: i64 = 60;

//------------ Parsing -------------------------------------------------------

pub fn parse_cert_pem(pem: &str) -> CaResult<X509> {
    X509::from_pem(pem.as_bytes()).map_err(|e| Error::parse("certificate PEM", e))
}

/// Parses all certificates in a PEM bundle. An empty bundle is fine.
pub fn parse_certs_pem(pem: &str) -> CaResult<Vec<X509>> {
    if pem.trim().is_empty() {
        return Ok(vec![]);
    }
    X509::stack_from_pem(pem.as_bytes()).map_err(|e| Error::parse("certificate bundle PEM", e))
}

pub fn cert_to_pem(cert: &X509Ref) -> CaResult<String> {
    let pem = cert.to_pem()?;
    String::from_utf8(pem).map_err(|e| Error::parse("certificate PEM", e))
}

pub fn certs_to_pem(certs: &[X509]) -> CaResult<String> {
    let mut res = String::new();
    for cert in certs {
        res.push_str(&cert_to_pem(cert)?);
    }
    Ok(res)
}

/// Returns the serial number in decimal notation.
pub fn serial_number(cert: &X509Ref) -> CaResult<String> {
    Ok(cert.serial_number().to_bn()?.to_dec_str()?.to_string())
}

/// Returns the subject key identifier as lower case hex, if present.
pub fn subject_key_id(cert: &X509Ref) -> Option<String> {
    cert.subject_key_id().map(|ski| hex::encode(ski.as_slice()))
}

/// Returns the authority key identifier as lower case hex, if present.
pub fn authority_key_id(cert: &X509Ref) -> Option<String> {
    cert.authority_key_id().map(|aki| hex::encode(aki.as_slice()))
}

pub fn asn1_time_to_datetime(time: &Asn1TimeRef) -> CaResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0).ok_or_else(|| Error::parse("certificate time", secs))
}

fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}

//------------ CertInfo ------------------------------------------------------

/// The fields of a certificate meshca cares about.
#[derive(Clone, Debug)]
pub struct CertInfo {
    pub serial_number: String,
    pub subject_key_id: String,
    pub authority_key_id: String,
    pub common_name: String,
    pub uris: Vec<String>,
    pub dns_names: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertInfo {
    pub fn from_cert(cert: &X509Ref) -> CaResult<Self> {
        let mut uris = vec![];
        let mut dns_names = vec![];
        if let Some(names) = cert.subject_alt_names() {
            for name in names.iter() {
                if let Some(uri) = name.uri() {
                    uris.push(uri.to_string());
                } else if let Some(dns) = name.dnsname() {
                    dns_names.push(dns.to_string());
                }
            }
        }

        Ok(CertInfo {
            serial_number: serial_number(cert)?,
            subject_key_id: subject_key_id(cert).unwrap_or_default(),
            authority_key_id: authority_key_id(cert).unwrap_or_default(),
            common_name: common_name(cert.subject_name()).unwrap_or_default(),
            uris,
            dns_names,
            not_before: asn1_time_to_datetime(cert.not_before())?,
            not_after: asn1_time_to_datetime(cert.not_after())?,
        })
    }

    pub fn from_pem(pem: &str) -> CaResult<Self> {
        Self::from_cert(&*parse_cert_pem(pem)?)
    }

    /// Returns the first workload identity among the URI names.
    pub fn identity(&self) -> Option<WorkloadIdentity> {
        self.uris.iter().find_map(|uri| WorkloadIdentity::from_host(uri))
    }

    /// Returns the total validity period.
    pub fn lifetime(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }
}

//------------ Issuance ------------------------------------------------------

/// What a certificate is issued for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CertUsage {
    /// A workload: TLS server and client authentication.
    Workload,

    /// A CA below this one that may issue further certificates.
    IntermediateCa,
}

/// The input for issuing a certificate from a CSR.
pub struct IssueRequest<'a> {
    pub csr: &'a X509ReqRef,
    pub hosts: &'a [String],
    pub validity: Duration,
    pub usage: CertUsage,
}

/// Issues a certificate for the CSR's subject and key, signed by the CA.
///
/// The subject alternative names are taken from `hosts`: identity URIs
/// become URI names, IP addresses IP names, everything else DNS names.
pub fn issue_certificate(req: &IssueRequest, ca_key: &PKeyRef<Private>, ca_cert: &X509Ref) -> CaResult<X509> {
    let csr_key = req.csr.public_key()?;
    if !req.csr.verify(&csr_key)? {
        return Err(Error::parse("certificate request", "self-signature does not verify"));
    }

    let mut builder = base_builder(req.csr.subject_name(), ca_cert.subject_name(), &csr_key, req.validity)?;

    match req.usage {
        CertUsage::Workload => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .key_encipherment()
                    .build()?,
            )?;
            builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;
        }
        CertUsage::IntermediateCa => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .digital_signature()
                    .build()?,
            )?;
        }
    }

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(ski)?;
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(aki)?;

    if !req.hosts.is_empty() {
        let san = subject_alt_names(req.hosts, &builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(san)?;
    }

    builder.sign(ca_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Creates a self-signed root CA certificate.
pub fn self_signed_ca(key: &PKeyRef<Private>, subject: &CsrSubject, validity: Duration) -> CaResult<X509> {
    let name = subject.to_name()?;
    let mut builder = base_builder(&name, &name, key, validity)?;

    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn base_builder<K: HasPublic>(
    subject: &X509NameRef,
    issuer: &X509NameRef,
    key: &PKeyRef<K>,
    validity: Duration,
) -> CaResult<X509Builder> {
    let mut builder = X509::builder()?;
    builder.set_version(2)?;

    let mut serial = BigNum::new()?;
    serial.rand(159, MsbOption::MAYBE_ZERO, false)?;
    builder.set_serial_number(&*serial.to_asn1_integer()?)?;

    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    builder.set_pubkey(key)?;

    let now = Utc::now().timestamp();
    let validity = i64::try_from(validity.as_secs()).map_err(|_| Error::custom("validity too long"))?;
    builder.set_not_before(&*Asn1Time::from_unix(now - BACKDATE_SECS)?)?;
    builder.set_not_after(&*Asn1Time::from_unix(now + validity)?)?;

    Ok(builder)
}

pub(super) fn subject_alt_names(
    hosts: &[String],
    ctx: &X509v3Context,
) -> CaResult<openssl::x509::X509Extension> {
    let mut san = SubjectAlternativeName::new();
    for host in hosts {
        if host.contains("://") {
            san.uri(host);
        } else if host.parse::<IpAddr>().is_ok() {
            san.ip(host);
        } else {
            san.dns(host);
        }
    }
    Ok(san.build(ctx)?)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::{CsrTemplate, KeyAlgorithm};

    fn subject(cn: &str) -> CsrSubject {
        CsrSubject {
            common_name: cn.to_string(),
            organization: Some("meshca".to_string()),
            organizational_unit: None,
        }
    }

    #[test]
    fn root_signs_workload() {
        let ca_key = KeyAlgorithm::EcdsaP256.generate().unwrap();
        let ca_cert = self_signed_ca(&ca_key, &subject("root"), Duration::from_secs(3600)).unwrap();
        assert!(ca_cert.verify(&ca_key).unwrap());

        let key = KeyAlgorithm::EcdsaP256.generate().unwrap();
        let identity = WorkloadIdentity::new("site", "cluster", "svc-1");
        let template = CsrTemplate::new(subject("svc-1"), vec![identity.to_uri(), "127.0.0.1".into()]);
        let csr = template.build(&key).unwrap();

        let cert = issue_certificate(
            &IssueRequest {
                csr: &csr,
                hosts: &template.hosts,
                validity: Duration::from_secs(600),
                usage: CertUsage::Workload,
            },
            &ca_key,
            &ca_cert,
        )
        .unwrap();

        assert!(cert.verify(&ca_key).unwrap());
        assert!(cert.public_key().unwrap().public_eq(&key));

        let info = CertInfo::from_cert(&cert).unwrap();
        assert_eq!(info.common_name, "svc-1");
        assert_eq!(info.identity(), Some(identity));
        assert_eq!(info.authority_key_id, subject_key_id(&ca_cert).unwrap());
        assert!(!info.serial_number.is_empty());
        assert!(info.lifetime().num_seconds() >= 600);
    }

    #[test]
    fn pem_bundles() {
        let key = KeyAlgorithm::EcdsaP256.generate().unwrap();
        let a = self_signed_ca(&key, &subject("a"), Duration::from_secs(60)).unwrap();
        let b = self_signed_ca(&key, &subject("b"), Duration::from_secs(60)).unwrap();
        let pem = certs_to_pem(&[a.clone(), b]).unwrap();

        let parsed = parse_certs_pem(&pem).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(serial_number(&parsed[0]).unwrap(), serial_number(&a).unwrap());
        assert!(parse_certs_pem("").unwrap().is_empty());
        assert!(parse_cert_pem("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
    }
}
