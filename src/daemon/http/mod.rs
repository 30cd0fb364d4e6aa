//! HTTP plumbing of the CA API.

pub mod server;
pub mod tls;

use bytes::Bytes;
use http_body_util::Full;
use hyper::StatusCode;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use log::{error, warn};
use serde::Serialize;

use crate::commons::api::ApiResponse;
use crate::commons::error::Error;
use crate::constants::OCSP_RESPONSE_CONTENT_TYPE;

//------------ HyperRequest and HyperResponse --------------------------------

pub type HyperRequest = hyper::Request<Incoming>;
pub type HyperResponse = hyper::Response<Full<Bytes>>;

//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ContentType {
    Json,
    Ocsp,
    Text,
}

impl ContentType {
    fn as_str(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Ocsp => OCSP_RESPONSE_CONTENT_TYPE,
            ContentType::Text => "text/plain",
        }
    }
}

//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    status: StatusCode,
    content_type: ContentType,
    body: Bytes,
}

impl HttpResponse {
    fn new(status: StatusCode, content_type: ContentType, body: Bytes) -> Self {
        HttpResponse {
            status,
            content_type,
            body,
        }
    }

    /// Serializes the value as the whole body.
    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self::new(StatusCode::OK, ContentType::Json, body.into()),
            Err(e) => Self::error(Error::custom(format!("cannot serialize response: {}", e))),
        }
    }

    /// Wraps the value in the success envelope.
    pub fn api<T: Serialize>(result: T) -> Self {
        Self::json(&ApiResponse::ok(result))
    }

    pub fn ocsp(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, ContentType::Ocsp, body.into())
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::OK, ContentType::Text, Bytes::from_static(b"ok"))
    }

    pub fn not_found(path: &str) -> Self {
        Self::error(Error::not_found(format!("no such endpoint {}", path)))
    }

    /// Reports the error with its status and an error body.
    pub fn error(err: Error) -> Self {
        let status = err.status();
        if status.is_server_error() {
            error!("{}", err);
        } else {
            warn!("{}", err);
        }
        let body = serde_json::to_vec(&err.to_error_response()).unwrap_or_default();
        Self::new(status, ContentType::Json, body.into())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn into_hyper(self) -> HyperResponse {
        let mut res = hyper::Response::new(Full::new(self.body));
        *res.status_mut() = self.status;
        let headers = res.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(self.content_type.as_str()));
        if self.status == StatusCode::UNAUTHORIZED {
            headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        res
    }
}

impl<T: Serialize> From<Result<T, Error>> for HttpResponse {
    fn from(res: Result<T, Error>) -> Self {
        match res {
            Ok(value) => HttpResponse::api(value),
            Err(e) => HttpResponse::error(e),
        }
    }
}

//------------ Tests ---------------------------------------------------------
