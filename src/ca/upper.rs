//! Clients for upstream CAs.
//!
//! An intermediate CA gets its own certificate and trust chain from one of
//! a list of upstream CAs. They are tried in configuration order; the
//! first success wins.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use url::Url;

use crate::commons::api::{ApiResponse, AuthenticatedRequest, InfoRequest, InfoResponse, SignRequest, SignResponse};
use crate::commons::crypto::request_token;
use crate::commons::error::{CaResult, Error, UpstreamFailure};
use crate::commons::httpclient;
use crate::constants::{API_HEALTH_PATH, API_INFO_PATH, API_SIGN_PATH};

//------------ SigningCapability ---------------------------------------------

/// Something that can sign certificate requests and describe itself.
///
/// Implemented by the local CA signer and by clients of remote CAs.
#[async_trait]
pub trait SigningCapability: Send + Sync {
    /// Signs a request, returns the certificate PEM.
    async fn sign(&self, req: &SignRequest) -> CaResult<String>;

    async fn info(&self, req: &InfoRequest) -> CaResult<InfoResponse>;
}

//------------ UpperCa -------------------------------------------------------

/// An upstream CA.
#[async_trait]
pub trait UpperCa: SigningCapability + fmt::Debug {
    /// The host this CA is reached at, for logging and metrics.
    fn host(&self) -> &str;

    /// The base URI of the CA.
    fn uri(&self) -> &str;

    /// Asks the CA for its health status.
    async fn health(&self) -> CaResult<StatusCode>;
}

//------------ RemoteCa ------------------------------------------------------

/// A CA reached over its HTTP API.
#[derive(Clone)]
pub struct RemoteCa {
    base: String,
    host: String,
    auth_key: Vec<u8>,
}

impl RemoteCa {
    pub fn new(uri: &Url, auth_key: &str) -> CaResult<Self> {
        let host = match (uri.host_str(), uri.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(Error::custom(format!("upstream CA uri '{}' has no host", uri))),
        };
        Ok(RemoteCa {
            base: uri.as_str().trim_end_matches('/').to_string(),
            host,
            auth_key: auth_key.as_bytes().to_vec(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl fmt::Debug for RemoteCa {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteCa").field("base", &self.base).finish()
    }
}

#[async_trait]
impl SigningCapability for RemoteCa {
    async fn sign(&self, req: &SignRequest) -> CaResult<String> {
        let request = serde_json::to_vec(req)?;
        let token = request_token(&self.auth_key, &request)?;
        let body = AuthenticatedRequest::new(&token, &request);

        let uri = self.endpoint(API_SIGN_PATH);
        debug!("requesting certificate for profile '{}' from {}", req.profile, self.host);
        let res: ApiResponse<SignResponse> = httpclient::post_json_with_response(&uri, &body, None).await?;
        Ok(res.result.certificate)
    }

    async fn info(&self, req: &InfoRequest) -> CaResult<InfoResponse> {
        let uri = self.endpoint(API_INFO_PATH);
        let res: ApiResponse<InfoResponse> = httpclient::post_json_with_response(&uri, req, None).await?;
        Ok(res.result)
    }
}

#[async_trait]
impl UpperCa for RemoteCa {
    fn host(&self) -> &str {
        &self.host
    }

    fn uri(&self) -> &str {
        &self.base
    }

    async fn health(&self) -> CaResult<StatusCode> {
        Ok(httpclient::get_status(&self.endpoint(API_HEALTH_PATH)).await?)
    }
}

//------------ UpperClients --------------------------------------------------

/// The upstream CAs, in configuration order.
#[derive(Clone, Debug, Default)]
pub struct UpperClients {
    clients: Vec<Arc<dyn UpperCa>>,
}

impl UpperClients {
    pub fn new(clients: Vec<Arc<dyn UpperCa>>) -> Self {
        UpperClients { clients }
    }

    /// Creates HTTP clients for the given upstream URIs.
    pub fn remote(uris: &[Url], auth_key: &str) -> CaResult<Self> {
        let mut clients: Vec<Arc<dyn UpperCa>> = vec![];
        for uri in uris {
            clients.push(Arc::new(RemoteCa::new(uri, auth_key)?));
        }
        debug!("configured {} upstream CA clients", clients.len());
        Ok(UpperClients { clients })
    }

    /// Runs `op` against each client in turn until one succeeds.
    ///
    /// If all fail, the error lists every failure in order.
    pub async fn do_with_retry<T, F, Fut>(&self, mut op: F) -> CaResult<T>
    where
        F: FnMut(Arc<dyn UpperCa>) -> Fut,
        Fut: Future<Output = CaResult<T>>,
    {
        if self.clients.is_empty() {
            return Err(Error::NoClientsAvailable);
        }

        let mut failures = vec![];
        for client in &self.clients {
            match op(client.clone()).await {
                Ok(res) => return Ok(res),
                Err(e) => {
                    warn!("upstream CA {} failed: {}", client.host(), e);
                    failures.push(UpstreamFailure {
                        host: client.host().to_string(),
                        error: e,
                    });
                }
            }
        }
        Err(Error::UpstreamUnavailable(failures))
    }

    pub fn all_clients(&self) -> &[Arc<dyn UpperCa>] {
        &self.clients
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::FakeUpper;

    fn clients(uppers: &[Arc<FakeUpper>]) -> UpperClients {
        UpperClients::new(uppers.iter().map(|u| u.clone() as Arc<dyn UpperCa>).collect())
    }

    #[tokio::test]
    async fn first_success_wins() {
        let a = FakeUpper::failing("a");
        let b = FakeUpper::healthy("b");
        let c = FakeUpper::healthy("c");
        let uppers = clients(&[a.clone(), b.clone(), c.clone()]);

        let host = uppers
            .do_with_retry(|client| async move {
                client.info(&InfoRequest::for_profile("intermediate")).await?;
                Ok(client.host().to_string())
            })
            .await
            .unwrap();

        assert_eq!(host, "b");
        assert_eq!(a.info_calls(), 1);
        assert_eq!(b.info_calls(), 1);
        assert_eq!(c.info_calls(), 0);
    }

    #[tokio::test]
    async fn all_failures_are_reported_in_order() {
        let uppers = clients(&[FakeUpper::failing("a"), FakeUpper::failing("b")]);
        let err = uppers
            .do_with_retry(|client| async move { client.info(&InfoRequest::default()).await })
            .await
            .unwrap_err();

        match err {
            Error::UpstreamUnavailable(failures) => {
                let hosts: Vec<_> = failures.iter().map(|f| f.host.as_str()).collect();
                assert_eq!(hosts, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn no_clients() {
        let err = UpperClients::default()
            .do_with_retry(|_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoClientsAvailable));
        assert_eq!(err.to_string(), "No clients available");
    }

    #[test]
    fn remote_host_includes_port() {
        let ca = RemoteCa::new(&Url::parse("https://ca.example:8081/").unwrap(), "key").unwrap();
        assert_eq!(ca.host(), "ca.example:8081");
        assert_eq!(ca.endpoint(API_SIGN_PATH), "https://ca.example:8081/api/v1/cfssl/authsign");
    }
}
