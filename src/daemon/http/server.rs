//! Routing of the CA API.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, Method};
use log::{debug, info};
use serde::de::DeserializeOwned;

use crate::ca::lifecycle::CertLifecycle;
use crate::ca::ocsp::OcspResponder;
use crate::ca::revoke::SelfRevoker;
use crate::ca::signer::CaSigner;
use crate::commons::api::{
    AuthenticatedRequest, CertsChanged, CertsSelection, Empty, ForbidChanged, ForbidRequest, InfoRequest,
    InfoResponse, RevokeRequest, SignResponse,
};
use crate::commons::crypto::ocsp::{OcspErrorResponse, OcspRequest};
use crate::commons::crypto::secrets_match;
use crate::commons::error::{CaResult, Error};
use crate::commons::events::CertOp;
use crate::constants::{
    API_ADMIN_PREFIX, API_HEALTH_PATH, API_INFO_PATH, API_OCSP_PATH, API_REVOKE_PATH, API_SIGN_PATH,
    HTTP_REQUEST_BODY_LIMIT,
};

use super::{HttpResponse, HyperRequest, HyperResponse};

//------------ HttpServer ----------------------------------------------------

pub struct HttpServer {
    signer: Arc<CaSigner>,
    ocsp: Arc<OcspResponder>,
    revoker: Arc<SelfRevoker>,
    lifecycle: Arc<CertLifecycle>,
    admin_token: Option<String>,
}

impl HttpServer {
    pub fn new(
        signer: Arc<CaSigner>,
        ocsp: Arc<OcspResponder>,
        revoker: Arc<SelfRevoker>,
        lifecycle: Arc<CertLifecycle>,
        admin_token: Option<String>,
    ) -> Self {
        HttpServer {
            signer,
            ocsp,
            revoker,
            lifecycle,
            admin_token,
        }
    }

    pub async fn process_request(&self, req: HyperRequest) -> Result<HyperResponse, Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let res = self.dispatch(req, &method, &path).await;
        debug!("{} {} {}", method, path, res.status());
        Ok(res.into_hyper())
    }

    async fn dispatch(&self, req: HyperRequest, method: &Method, path: &str) -> HttpResponse {
        if *method == Method::GET {
            return match path {
                API_HEALTH_PATH => HttpResponse::ok(),
                _ => HttpResponse::not_found(path),
            };
        }
        if *method != Method::POST {
            return HttpResponse::not_found(path);
        }

        match path {
            API_SIGN_PATH => self.sign(req).await.into(),
            API_INFO_PATH => self.info(req).await.into(),
            API_REVOKE_PATH => match self.revoke(req).await {
                Ok(()) => HttpResponse::json(&Empty {}),
                Err(e) => HttpResponse::error(e),
            },
            API_OCSP_PATH => self.ocsp(req).await,
            _ => match path.strip_prefix(API_ADMIN_PREFIX) {
                Some(action) => self.admin(req, action).await,
                None => HttpResponse::not_found(path),
            },
        }
    }

    async fn sign(&self, req: HyperRequest) -> CaResult<SignResponse> {
        let req: AuthenticatedRequest = read_json(req).await?;
        let certificate = self.signer.auth_sign(&req)?;
        Ok(SignResponse { certificate })
    }

    async fn info(&self, req: HyperRequest) -> CaResult<InfoResponse> {
        let req: InfoRequest = read_json(req).await?;
        self.signer.ca_info(&req).await
    }

    async fn revoke(&self, req: HyperRequest) -> CaResult<()> {
        let req: RevokeRequest = read_json(req).await?;
        self.revoker.revoke(&req)?;
        self.ocsp.flush();
        Ok(())
    }

    /// Answers OCSP requests.
    ///
    /// Failures are reported as OCSP error responses with status 200.
    async fn ocsp(&self, req: HyperRequest) -> HttpResponse {
        let body = match read_body(req).await {
            Ok(body) => body,
            Err(_) => return HttpResponse::ocsp(OcspErrorResponse::MalformedRequest.as_bytes()),
        };
        let req = match OcspRequest::decode(&body) {
            Ok(req) => req,
            Err(e) => {
                debug!("malformed OCSP request: {}", e);
                return HttpResponse::ocsp(OcspErrorResponse::MalformedRequest.as_bytes());
            }
        };

        match self.ocsp.response(&req) {
            Ok(res) => HttpResponse::ocsp(res),
            Err(e) => {
                let answer = match e {
                    Error::NotFound(_) => OcspErrorResponse::Unauthorized,
                    Error::Signing(_) => OcspErrorResponse::TryLater,
                    _ => OcspErrorResponse::InternalError,
                };
                HttpResponse::ocsp(answer.as_bytes())
            }
        }
    }

    async fn admin(&self, req: HyperRequest, action: &str) -> HttpResponse {
        if let Err(e) = self.check_admin_token(req.headers()) {
            return HttpResponse::error(e);
        }

        match action {
            "revoke" => self.change_certs(req, |sel| self.lifecycle.revoke(sel)).await.into(),
            "recover" => self.change_certs(req, |sel| self.lifecycle.recover(sel)).await.into(),
            "forbid" => self.change_forbids(req, |ids| self.lifecycle.forbid(ids)).await.into(),
            "recover-forbid" => self
                .change_forbids(req, |ids| self.lifecycle.recover_forbid(ids))
                .await
                .into(),
            _ => HttpResponse::not_found(&format!("{}{}", API_ADMIN_PREFIX, action)),
        }
    }

    async fn change_certs<F>(&self, req: HyperRequest, op: F) -> CaResult<CertsChanged>
    where
        F: FnOnce(&CertsSelection) -> CaResult<Vec<CertOp>>,
    {
        let selection: CertsSelection = read_json(req).await?;
        let certs = op(&selection)?;
        self.ocsp.flush();
        info!("administrative change of {} certificates", certs.len());
        Ok(CertsChanged { certs })
    }

    async fn change_forbids<F>(&self, req: HyperRequest, op: F) -> CaResult<ForbidChanged>
    where
        F: FnOnce(&[String]) -> CaResult<Vec<String>>,
    {
        let req: ForbidRequest = read_json(req).await?;
        let unique_ids = op(&req.unique_ids)?;
        Ok(ForbidChanged { unique_ids })
    }

    fn check_admin_token(&self, headers: &HeaderMap) -> CaResult<()> {
        let expected = self
            .admin_token
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("admin API is disabled".to_string()))?;

        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);

        match presented {
            Some(token) if secrets_match(token, expected) => Ok(()),
            Some(_) => Err(Error::Unauthorized("invalid bearer token".to_string())),
            None => Err(Error::Unauthorized("missing bearer token".to_string())),
        }
    }
}

//------------ Request bodies ------------------------------------------------

async fn read_body(req: HyperRequest) -> CaResult<Bytes> {
    Limited::new(req.into_body(), HTTP_REQUEST_BODY_LIMIT)
        .collect()
        .await
        .map(|body| body.to_bytes())
        .map_err(|e| Error::BadRequest(format!("cannot read request body: {}", e)))
}

async fn read_json<T: DeserializeOwned>(req: HyperRequest) -> CaResult<T> {
    let body = read_body(req).await?;
    serde_json::from_slice(&body).map_err(|e| Error::parse("request body", e))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{ADMIN_TOKEN, TestCa};
    use hyper::header::HeaderValue;
    use std::time::Duration;

    fn server(ca: &TestCa, admin_token: Option<&str>) -> HttpServer {
        let ocsp = OcspResponder::new(ca.certdb.clone(), ca.keeper.clone(), ca.events.clone(), None, Duration::ZERO);
        let revoker = SelfRevoker::new(ca.certdb.clone(), ca.keeper.pem_store().clone(), None, ca.events.clone());
        HttpServer::new(
            ca.signer.clone(),
            Arc::new(ocsp),
            Arc::new(revoker),
            Arc::new(CertLifecycle::new(ca.certdb.clone(), ca.events.clone())),
            admin_token.map(str::to_string),
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", token)).unwrap());
        headers
    }

    #[test]
    fn admin_token_is_checked() {
        let ca = TestCa::root();
        let server = server(&ca, Some(ADMIN_TOKEN));

        assert!(server.check_admin_token(&bearer(ADMIN_TOKEN)).is_ok());
        assert!(matches!(
            server.check_admin_token(&bearer("guess")),
            Err(Error::Unauthorized(_))
        ));
        assert!(matches!(
            server.check_admin_token(&HeaderMap::new()),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn admin_api_without_token_is_disabled() {
        let ca = TestCa::root();
        let server = server(&ca, None);
        assert!(server.check_admin_token(&bearer("")).is_err());
    }
}
