//! Request and response bodies of the CA API.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::commons::error::{CaResult, Error, ErrorResponse};
use crate::commons::events::CertOp;

//------------ ApiResponse ---------------------------------------------------

/// The envelope of successful replies.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub result: T,
    #[serde(default)]
    pub errors: Vec<ErrorResponse>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(result: T) -> Self {
        ApiResponse {
            success: true,
            result,
            errors: vec![],
            messages: vec![],
        }
    }
}

//------------ Signing -------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignRequest {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub certificate_request: String,
    pub profile: String,
    #[serde(default)]
    pub label: String,
}

/// A request body with its HMAC token, both base64 encoded.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuthenticatedRequest {
    pub token: String,
    pub request: String,
}

impl AuthenticatedRequest {
    pub fn new(token: &[u8], request: &[u8]) -> Self {
        AuthenticatedRequest {
            token: STANDARD.encode(token),
            request: STANDARD.encode(request),
        }
    }

    pub fn token_bytes(&self) -> CaResult<Vec<u8>> {
        STANDARD
            .decode(&self.token)
            .map_err(|e| Error::BadRequest(format!("token is not base64: {}", e)))
    }

    pub fn request_bytes(&self) -> CaResult<Vec<u8>> {
        STANDARD
            .decode(&self.request)
            .map_err(|e| Error::BadRequest(format!("request is not base64: {}", e)))
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SignResponse {
    pub certificate: String,
}

//------------ Info ----------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub profile: String,
}

impl InfoRequest {
    pub fn for_profile(profile: &str) -> Self {
        InfoRequest {
            label: String::new(),
            profile: profile.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InfoResponse {
    /// The PEM of the CA's own certificate.
    pub certificate: String,

    /// PEMs of the certificates the CA's certificate chains up to.
    #[serde(default)]
    pub trust_certificates: Vec<String>,

    #[serde(default)]
    pub usages: Vec<String>,

    #[serde(default)]
    pub expiry: String,
}

//------------ Revocation ----------------------------------------------------

/// The body of a revocation request from a workload or operator.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RevokeRequest {
    pub serial: String,
    pub authority_key_id: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Empty {}

//------------ Administration ------------------------------------------------

/// Selects certificates either by serial number and authority key id, or
/// by identity.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertsSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aki: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ForbidRequest {
    pub unique_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertsChanged {
    pub certs: Vec<CertOp>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ForbidChanged {
    pub unique_ids: Vec<String>,
}
