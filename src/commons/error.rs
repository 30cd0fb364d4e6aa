//! Defines the error type shared by all meshca components.

use std::{error, fmt, io};

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use crate::commons::httpclient;
use crate::commons::storage::KeyValueError;

//------------ CaResult ------------------------------------------------------

pub type CaResult<T> = Result<T, Error>;

//------------ UpstreamFailure -----------------------------------------------

/// A failed attempt against one upstream CA.
#[derive(Clone, Debug)]
pub struct UpstreamFailure {
    pub host: String,
    pub error: Error,
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.error)
    }
}

//------------ Error ---------------------------------------------------------

/// The error type of the certificate authority.
///
/// All variants carry rendered messages rather than source errors so that
/// one result can be handed to every waiter of a shared request.
#[derive(Clone, Debug)]
pub enum Error {
    /// A certificate, key pair or forbid record does not exist.
    NotFound(String),

    /// Signing for an identity is forbidden.
    Forbidden(String),

    /// A peer certificate was reported as revoked.
    Revoked(String),

    /// All upstream CAs failed; one entry per attempted upstream.
    UpstreamUnavailable(Vec<UpstreamFailure>),

    /// There are no upstream CAs configured.
    NoClientsAvailable,

    /// A revocation signature or request token did not verify.
    SignatureInvalid(String),

    /// The durable store or secret store failed.
    StorageError(String),

    /// A PEM, CSR, certificate or message could not be parsed.
    ParseError(String),

    BadRequest(String),
    Unauthorized(String),
    ProfileUnknown(String),

    /// The OCSP responder could not be asked or gave no usable answer.
    OcspUnavailable(String),

    /// OCSP requests are disabled by the kill switch.
    OcspBlocked,

    Tls(String),
    HttpClient(String),
    Signing(String),
    Custom(String),
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Error::NotFound(msg.to_string())
    }

    pub fn parse(what: &str, err: impl fmt::Display) -> Self {
        Error::ParseError(format!("cannot parse {}: {}", what, err))
    }

    pub fn signing(err: impl fmt::Display) -> Self {
        Error::Signing(err.to_string())
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        Error::StorageError(err.to_string())
    }

    pub fn tls(err: impl fmt::Display) -> Self {
        Error::Tls(err.to_string())
    }

    /// Returns the HTTP status code to report this error with.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Forbidden(_) | Error::Revoked(_) => StatusCode::FORBIDDEN,
            Error::UpstreamUnavailable(_) | Error::NoClientsAvailable => StatusCode::BAD_GATEWAY,
            Error::SignatureInvalid(_) | Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ParseError(_) | Error::BadRequest(_) | Error::ProfileUnknown(_) => StatusCode::BAD_REQUEST,
            Error::OcspUnavailable(_) | Error::HttpClient(_) => StatusCode::BAD_GATEWAY,
            Error::OcspBlocked => StatusCode::SERVICE_UNAVAILABLE,
            Error::Tls(_) | Error::Signing(_) | Error::Custom(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not-found",
            Error::Forbidden(_) => "forbidden",
            Error::Revoked(_) => "revoked",
            Error::UpstreamUnavailable(_) => "upstream-unavailable",
            Error::NoClientsAvailable => "no-clients",
            Error::SignatureInvalid(_) => "signature-invalid",
            Error::StorageError(_) => "storage",
            Error::ParseError(_) => "parse",
            Error::BadRequest(_) => "bad-request",
            Error::Unauthorized(_) => "unauthorized",
            Error::ProfileUnknown(_) => "profile-unknown",
            Error::OcspUnavailable(_) => "ocsp-unavailable",
            Error::OcspBlocked => "ocsp-blocked",
            Error::Tls(_) => "tls",
            Error::HttpClient(_) => "http-client",
            Error::Signing(_) => "signing",
            Error::Custom(_) => "other",
        }
    }

    /// Whether a retry against the same collaborator could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_)
                | Error::NoClientsAvailable
                | Error::HttpClient(_)
                | Error::OcspUnavailable(_)
                | Error::StorageError(_)
        )
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            label: self.label().to_string(),
            error: self.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "not found: {}", msg),
            Error::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            Error::Revoked(msg) => write!(f, "certificate revoked: {}", msg),
            Error::UpstreamUnavailable(failures) => {
                write!(f, "all upstream CAs failed")?;
                for failure in failures {
                    write!(f, "; {}", failure)?;
                }
                Ok(())
            }
            Error::NoClientsAvailable => write!(f, "No clients available"),
            Error::SignatureInvalid(msg) => write!(f, "invalid signature: {}", msg),
            Error::StorageError(msg) => write!(f, "storage error: {}", msg),
            Error::ParseError(msg) => msg.fmt(f),
            Error::BadRequest(msg) => write!(f, "bad request: {}", msg),
            Error::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            Error::ProfileUnknown(profile) => write!(f, "unknown signing profile '{}'", profile),
            Error::OcspUnavailable(msg) => write!(f, "OCSP unavailable: {}", msg),
            Error::OcspBlocked => write!(f, "ocsp requests disabled"),
            Error::Tls(msg) => write!(f, "TLS error: {}", msg),
            Error::HttpClient(msg) => write!(f, "HTTP client error: {}", msg),
            Error::Signing(msg) => write!(f, "signing error: {}", msg),
            Error::Custom(msg) => msg.fmt(f),
        }
    }
}

impl error::Error for Error {}

impl From<KeyValueError> for Error {
    fn from(e: KeyValueError) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        match e {
            httpclient::Error::ErrorResponseWithJson(_, _, res) => res.into_error(),
            other => Error::HttpClient(other.to_string()),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Signing(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ParseError(format!("invalid JSON: {}", e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Custom(format!("I/O error: {}", e))
    }
}

//------------ ErrorResponse -------------------------------------------------

/// The JSON body of an error reply from the API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    pub label: String,
    pub error: String,
}

impl ErrorResponse {
    /// Turns an error reply from a remote CA back into a typed error.
    pub fn into_error(self) -> Error {
        let msg = self.error;
        match self.label.as_str() {
            "not-found" => Error::NotFound(msg),
            "forbidden" => Error::Forbidden(msg),
            "revoked" => Error::Revoked(msg),
            "signature-invalid" => Error::SignatureInvalid(msg),
            "parse" => Error::ParseError(msg),
            "bad-request" => Error::BadRequest(msg),
            "unauthorized" => Error::Unauthorized(msg),
            "profile-unknown" => Error::ProfileUnknown(msg),
            "storage" => Error::StorageError(msg),
            _ => Error::HttpClient(msg),
        }
    }
}

//------------ Tests ---------------------------------------------------------
