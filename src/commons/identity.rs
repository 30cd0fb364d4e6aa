//! Workload identities and their URI form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::commons::error::{CaResult, Error};
use crate::constants::IDENTITY_URI_SCHEME;

//------------ WorkloadIdentity ----------------------------------------------

/// Identifies one service instance in the mesh.
///
/// Rendered as `spiffe://<site_id>/<cluster_id>/<unique_id>` and embedded
/// in workload certificates as a URI subject alternative name. The
/// `unique_id` doubles as the certificate's common name.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct WorkloadIdentity {
    pub site_id: String,
    pub cluster_id: String,
    pub unique_id: String,
}

impl WorkloadIdentity {
    pub fn new(site_id: impl Into<String>, cluster_id: impl Into<String>, unique_id: impl Into<String>) -> Self {
        WorkloadIdentity {
            site_id: site_id.into(),
            cluster_id: cluster_id.into(),
            unique_id: unique_id.into(),
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn to_uri(&self) -> String {
        format!(
            "{}://{}/{}/{}",
            IDENTITY_URI_SCHEME, self.site_id, self.cluster_id, self.unique_id
        )
    }

    /// Parses the URI form.
    pub fn parse(uri: &str) -> CaResult<Self> {
        let url = Url::parse(uri).map_err(|e| Error::parse("workload identity", e))?;
        if url.scheme() != IDENTITY_URI_SCHEME {
            return Err(Error::parse("workload identity", format!("unexpected scheme in '{}'", uri)));
        }

        let site_id = url.host_str().unwrap_or_default();
        let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();

        match segments.as_slice() {
            [cluster_id, unique_id] if !site_id.is_empty() && !cluster_id.is_empty() && !unique_id.is_empty() => {
                Ok(WorkloadIdentity::new(site_id, *cluster_id, *unique_id))
            }
            _ => Err(Error::parse(
                "workload identity",
                format!("expected {}://site/cluster/unique_id, got '{}'", IDENTITY_URI_SCHEME, uri),
            )),
        }
    }

    /// Returns the identity if the string looks like an identity URI.
    ///
    /// Used to pick identities out of a list of certificate hosts, which
    /// also contains DNS names and IP addresses.
    pub fn from_host(host: &str) -> Option<Self> {
        if host.starts_with(IDENTITY_URI_SCHEME) {
            Self::parse(host).ok()
        } else {
            None
        }
    }
}

impl FromStr for WorkloadIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

//------------ Tests ---------------------------------------------------------
