//! The OCSP endpoint of a running CA.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use meshca::client::ocsp::{HttpOcspFetcher, OcspFetcher};
use meshca::client::{CaInstance, CaInstanceConfig};
use meshca::commons::crypto::ocsp::{OcspErrorResponse, OcspRequest};
use meshca::commons::error::Error;
use meshca::commons::httpclient;
use meshca::constants::{API_OCSP_PATH, OCSP_REQUEST_CONTENT_TYPE};
use meshca::test::{SIDECAR_AUTH_KEY, identity, root_key_pair, start_server, test_config};

#[tokio::test]
async fn answers_for_issued_certificates() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = CaInstance::new(CaInstanceConfig::new(Url::parse(&base).unwrap(), SIDECAR_AUTH_KEY)).unwrap();
    let exchanger = ca.new_exchanger(identity("payments"));
    let bundle = exchanger.get_certificate().await.unwrap();
    let issuer = exchanger
        .transport()
        .trust_store()
        .find_issuer(bundle.cert(), &[])
        .unwrap();

    let fetcher = HttpOcspFetcher::new(format!("{}{}", base, API_OCSP_PATH));
    let req = OcspRequest::for_certificate(bundle.cert(), &issuer).unwrap();
    let res = fetcher.fetch(&req, bundle.cert(), &issuer).await.unwrap();
    assert!(res.cert_status.is_good());
    assert!(res.next_update.is_some());

    // A certificate the CA never issued.
    let (_, stranger) = root_key_pair("stranger");
    let req = OcspRequest::for_certificate(&stranger, &issuer).unwrap();
    assert!(matches!(
        fetcher.fetch(&req, &stranger, &issuer).await,
        Err(Error::OcspUnavailable(_))
    ));

    shutdown.cancel();
}

#[tokio::test]
async fn garbage_is_malformed() {
    let (base, shutdown) = start_server(test_config()).await;

    let res = httpclient::post_binary(
        &format!("{}{}", base, API_OCSP_PATH),
        Bytes::from_static(b"not an ocsp request"),
        OCSP_REQUEST_CONTENT_TYPE,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(OcspErrorResponse::from_bytes(&res), Some(OcspErrorResponse::MalformedRequest));

    shutdown.cancel();
}
