//! Some helper functions for HTTP calls to upstream CAs and OCSP responders.
use std::{env, fmt, fs, time::Duration};

use bytes::Bytes;
use reqwest::{
    Response, StatusCode,
    header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::commons::error::ErrorResponse;
use crate::constants::{HTTP_CLIENT_TIMEOUT_SECS, MESHCA_ENV_HTTPS_ROOT_CERTS, MESHCA_VERSION};

const JSON_CONTENT: &str = "application/json";

/// Performs a GET request and returns the status code of the response.
///
/// The body is discarded. Only failing to reach the server at all is
/// reported as an error.
pub async fn get_status(uri: &str) -> Result<StatusCode, Error> {
    let res = client(uri)?
        .get(uri)
        .headers(headers(uri, None, None)?)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;
    Ok(res.status())
}

/// Performs a GET request that expects a json response that can be
/// deserialized into an owned value of the expected type.
pub async fn get_json<T: DeserializeOwned>(uri: &str, token: Option<&str>) -> Result<T, Error> {
    let res = client(uri)?
        .get(uri)
        .headers(headers(uri, Some(JSON_CONTENT), token)?)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

/// Performs a POST of data that can be serialized into json, and expects
/// a json response that can be deserialized into an owned value of the
/// expected type.
pub async fn post_json_with_response<T: DeserializeOwned>(
    uri: &str,
    data: impl Serialize,
    token: Option<&str>,
) -> Result<T, Error> {
    let body = serde_json::to_string(&data).map_err(|e| Error::request_build_json(uri, e))?;

    let res = client(uri)?
        .post(uri)
        .headers(headers(uri, Some(JSON_CONTENT), token)?)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    process_json_response(uri, res).await
}

/// Posts binary data, and expects a binary response.
///
/// Used for OCSP requests. Bytes may be empty if the post was successful
/// but the response was empty.
pub async fn post_binary(uri: &str, data: Bytes, content_type: &str, timeout: Duration) -> Result<Bytes, Error> {
    let client = client_with_timeout(uri, timeout)?;

    let res = client
        .post(uri)
        .headers(headers(uri, Some(content_type), None)?)
        .body(data)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match res.status() {
        StatusCode::OK => res
            .bytes()
            .await
            .map_err(|e| Error::response(uri, format!("cannot get body: {}", e))),
        _ => Err(Error::from_res(uri, res).await),
    }
}

/// Default client for meshca use cases.
#[allow(clippy::result_large_err)]
pub fn client(uri: &str) -> Result<reqwest::Client, Error> {
    client_with_timeout(uri, Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS))
}

/// Client with a custom timeout.
///
/// Server certificates are verified against the system roots and the
/// PEM files listed in `MESHCA_HTTPS_ROOT_CERTS`, except for local
/// servers.
#[allow(clippy::result_large_err)]
pub fn client_with_timeout(uri: &str, timeout: Duration) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::ClientBuilder::new().timeout(timeout);

    if let Ok(cert_list) = env::var(MESHCA_ENV_HTTPS_ROOT_CERTS) {
        for cert in load_root_certs(&cert_list)? {
            builder = builder.add_root_certificate(cert);
        }
    }

    if is_local(uri) {
        builder.danger_accept_invalid_certs(true).build()
    } else {
        builder.build()
    }
    .map_err(|e| Error::request_build(uri, e))
}

/// Loads the certificates of a colon separated list of PEM files.
#[allow(clippy::result_large_err)]
fn load_root_certs(cert_list: &str) -> Result<Vec<reqwest::Certificate>, Error> {
    cert_list
        .split(':')
        .filter(|path| !path.is_empty())
        .map(|path| {
            let pem = fs::read(path).map_err(|e| Error::request_build_https_cert(path, e))?;
            reqwest::Certificate::from_pem(&pem).map_err(|e| Error::request_build_https_cert(path, e))
        })
        .collect()
}

fn is_local(uri: &str) -> bool {
    reqwest::Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.host_str()
                .map(|host| matches!(host, "localhost" | "127.0.0.1" | "[::1]"))
        })
        .unwrap_or(false)
}

#[allow(clippy::result_large_err)]
fn headers(uri: &str, content_type: Option<&str>, token: Option<&str>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let ua_string = format!("meshca/{}", MESHCA_VERSION);
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&ua_string).map_err(|e| Error::request_build(uri, e))?,
    );

    if let Some(content_type) = content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type).map_err(|e| Error::request_build(uri, e))?,
        );
    }
    if let Some(token) = token {
        headers.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| Error::request_build(uri, e))?,
        );
    }
    Ok(headers)
}

async fn process_json_response<T: DeserializeOwned>(uri: &str, res: Response) -> Result<T, Error> {
    match res.status() {
        StatusCode::OK => {
            let text = res
                .text()
                .await
                .map_err(|e| Error::response(uri, format!("cannot get body: {}", e)))?;
            if text.is_empty() {
                return Err(Error::response(uri, "got empty response body"));
            }
            serde_json::from_str(&text)
                .map_err(|e| Error::response(uri, format!("could not parse JSON response: {}", e)))
        }
        _ => Err(Error::from_res(uri, res).await),
    }
}

//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type ErrorMessage = String;

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),
    RequestExecute(ErrorUri, ErrorMessage),
    Response(ErrorUri, ErrorMessage),
    ErrorResponseWithBody(ErrorUri, StatusCode, String),
    ErrorResponseWithJson(ErrorUri, StatusCode, ErrorResponse),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => write!(f, "Issue creating request for URI: {}, error: {}", uri, msg),
            Error::RequestExecute(uri, msg) => write!(f, "Issue accessing URI: {}, error: {}", uri, msg),
            Error::Response(uri, msg) => write!(f, "Issue processing response from URI: {}, error: {}", uri, msg),
            Error::ErrorResponseWithBody(uri, code, e) => {
                write!(f, "Error response from URI: {}, Status: {}, Error: {}", uri, code, e)
            }
            Error::ErrorResponseWithJson(uri, code, res) => write!(
                f,
                "Error response from URI: {}, Status: {}, Error: {} ({})",
                uri, code, res.error, res.label
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_https_cert(path: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(
            path.to_string(),
            format!("cannot use HTTPS root certificate: {}", msg),
        )
    }

    pub fn request_build_json(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), format!("could not serialize type to JSON: {}", e))
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    pub fn response_unexpected_status(uri: &str, status: StatusCode) -> Self {
        Error::Response(uri.to_string(), format!("unexpected status code {}", status))
    }

    async fn from_res(uri: &str, res: Response) -> Error {
        let status = res.status();
        match res.text().await {
            Ok(body) => {
                if body.is_empty() {
                    Self::response_unexpected_status(uri, status)
                } else {
                    match serde_json::from_str::<ErrorResponse>(&body) {
                        Ok(res) => Error::ErrorResponseWithJson(uri.to_string(), status, res),
                        Err(_) => Error::ErrorResponseWithBody(uri.to_string(), status, body),
                    }
                }
            }
            _ => Self::response_unexpected_status(uri, status),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_servers_skip_verification() {
        assert!(is_local("https://localhost:3000/api/v1/cfssl/info"));
        assert!(is_local("https://127.0.0.1/api"));
        assert!(is_local("https://[::1]:8888/"));
        assert!(!is_local("https://ca.example.net/api"));
        assert!(!is_local("https://localhost.example.net/"));
        assert!(!is_local("not a uri"));
    }

    #[test]
    fn root_certificates_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let (_, cert) = crate::test::root_key_pair_pem("https root");
        let path = dir.path().join("root.pem");
        fs::write(&path, cert).unwrap();
        let path = path.to_str().unwrap().to_string();

        assert_eq!(load_root_certs(&path).unwrap().len(), 1);
        assert_eq!(load_root_certs(&format!("{}:{}", path, path)).unwrap().len(), 2);
        assert!(load_root_certs("").unwrap().is_empty());

        let absent = dir.path().join("absent.pem");
        assert!(matches!(
            load_root_certs(absent.to_str().unwrap()),
            Err(Error::RequestBuild(_, _))
        ));
    }
}
