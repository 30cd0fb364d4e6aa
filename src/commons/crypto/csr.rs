use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Name, X509Req, X509ReqBuilder};
use serde::{Deserialize, Serialize};

use crate::commons::crypto::cert::subject_alt_names;
use crate::commons::error::{CaResult, Error};

//------------ CsrSubject ----------------------------------------------------

/// The distinguished name put into requests and self-signed certificates.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CsrSubject {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
}

impl CsrSubject {
    pub fn new(common_name: impl Into<String>) -> Self {
        CsrSubject {
            common_name: common_name.into(),
            ..Default::default()
        }
    }

    pub fn to_name(&self) -> CaResult<X509Name> {
        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &self.common_name)?;
        if let Some(o) = &self.organization {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, o)?;
        }
        if let Some(ou) = &self.organizational_unit {
            name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, ou)?;
        }
        Ok(name.build())
    }
}

//------------ CsrTemplate ---------------------------------------------------

/// A certificate request to be signed with a freshly generated key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CsrTemplate {
    pub subject: CsrSubject,
    pub hosts: Vec<String>,
}

impl CsrTemplate {
    pub fn new(subject: CsrSubject, hosts: Vec<String>) -> Self {
        CsrTemplate { subject, hosts }
    }

    /// Builds and signs the request.
    pub fn build(&self, key: &PKeyRef<Private>) -> CaResult<X509Req> {
        let mut req = X509ReqBuilder::new()?;
        req.set_version(0)?;
        req.set_subject_name(&*self.subject.to_name()?)?;
        req.set_pubkey(key)?;

        if !self.hosts.is_empty() {
            let san = subject_alt_names(&self.hosts, &req.x509v3_context(None))?;
            let mut extensions = Stack::new()?;
            extensions.push(san)?;
            req.add_extensions(&extensions)?;
        }

        req.sign(key, MessageDigest::sha256())?;
        Ok(req.build())
    }

    pub fn build_pem(&self, key: &PKeyRef<Private>) -> CaResult<String> {
        let pem = self.build(key)?.to_pem()?;
        String::from_utf8(pem).map_err(|e| Error::parse("certificate request PEM", e))
    }
}

pub fn parse_csr_pem(pem: &str) -> CaResult<X509Req> {
    X509Req::from_pem(pem.as_bytes()).map_err(|e| Error::parse("certificate request", e))
}
