//! A CA keeps its identity and its records across restarts.

use std::time::Duration;

use url::Url;

use meshca::client::{CaInstance, CaInstanceConfig};
use meshca::commons::api::{ApiResponse, InfoRequest, InfoResponse, RevokeRequest};
use meshca::commons::error::Error;
use meshca::commons::httpclient;
use meshca::constants::{API_INFO_PATH, API_REVOKE_PATH, PROFILE_SIDECAR};
use meshca::test::{SIDECAR_AUTH_KEY, free_port, identity, start_server, test_config};

async fn ca_certificate(base: &str) -> String {
    let res: ApiResponse<InfoResponse> = httpclient::post_json_with_response(
        &format!("{}{}", base, API_INFO_PATH),
        InfoRequest::for_profile(PROFILE_SIDECAR),
        None,
    )
    .await
    .unwrap();
    res.result.certificate
}

#[tokio::test]
async fn identity_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage_uri = Url::parse(&format!("local://{}", dir.path().display())).unwrap();

    let (base, shutdown) = start_server(config.clone()).await;
    let before = ca_certificate(&base).await;
    let ca = CaInstance::new(CaInstanceConfig::new(Url::parse(&base).unwrap(), SIDECAR_AUTH_KEY)).unwrap();
    let bundle = ca.new_exchanger(identity("ledger")).get_certificate().await.unwrap();
    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    config.port = free_port();
    let (base, shutdown) = start_server(config).await;
    assert_eq!(ca_certificate(&base).await, before);

    // The record issued before the restart is still known.
    let req = RevokeRequest {
        serial: bundle.info().serial_number.clone(),
        authority_key_id: bundle.info().authority_key_id.clone(),
        nonce: Some(bundle.info().serial_number.clone()),
        sign: Some("00".into()),
        ..Default::default()
    };
    let res: Result<meshca::commons::api::Empty, Error> =
        httpclient::post_json_with_response(&format!("{}{}", base, API_REVOKE_PATH), &req, None)
            .await
            .map_err(Error::from);
    assert!(matches!(res, Err(Error::SignatureInvalid(_))));

    shutdown.cancel();
}
