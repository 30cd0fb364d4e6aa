//! The administrative API: revocation, recovery and the forbid list.

use tokio::io::duplex;
use url::Url;

use meshca::client::ocsp::OcspVerdict;
use meshca::client::{CaInstance, CaInstanceConfig, RevocationCheckPolicy};
use meshca::commons::api::{ApiResponse, CertsChanged, CertsSelection, ForbidChanged, ForbidRequest};
use meshca::commons::error::Error;
use meshca::commons::httpclient;
use meshca::constants::API_ADMIN_PREFIX;
use meshca::test::{ADMIN_TOKEN, SIDECAR_AUTH_KEY, identity, start_server, test_config};

async fn admin<T, R>(base: &str, action: &str, body: &T, token: Option<&str>) -> Result<R, Error>
where
    T: serde::Serialize,
    R: serde::de::DeserializeOwned,
{
    let uri = format!("{}{}{}", base, API_ADMIN_PREFIX, action);
    let res: ApiResponse<R> = httpclient::post_json_with_response(&uri, body, token).await?;
    Ok(res.result)
}

fn instance(base: &str) -> CaInstance {
    CaInstance::new(CaInstanceConfig::new(Url::parse(base).unwrap(), SIDECAR_AUTH_KEY)).unwrap()
}

#[tokio::test]
async fn admin_calls_need_the_token() {
    let (base, shutdown) = start_server(test_config()).await;
    let forbid = ForbidRequest {
        unique_ids: vec!["svc".into()],
    };

    let res: Result<ForbidChanged, _> = admin(&base, "forbid", &forbid, None).await;
    assert!(matches!(res, Err(Error::Unauthorized(_))));
    let res: Result<ForbidChanged, _> = admin(&base, "forbid", &forbid, Some("guess")).await;
    assert!(matches!(res, Err(Error::Unauthorized(_))));

    shutdown.cancel();
}

#[tokio::test]
async fn forbidden_identities_get_no_certificates() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = instance(&base);
    let forbid = ForbidRequest {
        unique_ids: vec!["rogue".into()],
    };

    let changed: ForbidChanged = admin(&base, "forbid", &forbid, Some(ADMIN_TOKEN)).await.unwrap();
    assert_eq!(changed.unique_ids, vec!["rogue".to_string()]);

    let res = ca.new_exchanger(identity("rogue")).get_certificate().await;
    assert!(matches!(res, Err(Error::Forbidden(_))));

    let _: ForbidChanged = admin(&base, "recover-forbid", &forbid, Some(ADMIN_TOKEN)).await.unwrap();
    assert!(ca.new_exchanger(identity("rogue")).get_certificate().await.is_ok());

    shutdown.cancel();
}

#[tokio::test]
async fn revoke_and_recover_by_identity() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = instance(&base);
    let exchanger = ca.new_exchanger(identity("inventory"));
    let bundle = exchanger.get_certificate().await.unwrap();

    let selection = CertsSelection {
        unique_id: Some("inventory".into()),
        ..Default::default()
    };
    let revoked: CertsChanged = admin(&base, "revoke", &selection, Some(ADMIN_TOKEN)).await.unwrap();
    assert_eq!(revoked.certs.len(), 1);
    assert_eq!(revoked.certs[0].sn, bundle.info().serial_number);

    // Nothing left to revoke.
    let again: CertsChanged = admin(&base, "revoke", &selection, Some(ADMIN_TOKEN)).await.unwrap();
    assert!(again.certs.is_empty());

    let recovered: CertsChanged = admin(&base, "recover", &selection, Some(ADMIN_TOKEN)).await.unwrap();
    assert_eq!(recovered.certs.len(), 1);

    let unknown = CertsSelection {
        unique_id: Some("nobody".into()),
        ..Default::default()
    };
    let res: Result<CertsChanged, _> = admin(&base, "revoke", &unknown, Some(ADMIN_TOKEN)).await;
    assert!(matches!(res, Err(Error::NotFound(_))));

    shutdown.cancel();
}

#[tokio::test]
async fn revoked_identity_loses_mutual_tls() {
    let (base, shutdown) = start_server(test_config()).await;
    let mut config = CaInstanceConfig::new(Url::parse(&base).unwrap(), SIDECAR_AUTH_KEY);
    config.revocation_policy = RevocationCheckPolicy::FailClosed;
    let ca = CaInstance::new(config).unwrap();

    let svc = ca.new_exchanger(identity("svc-1"));
    let peer = ca.new_exchanger(identity("peer"));
    let bundle = svc.get_certificate().await.unwrap();
    let client = svc.client_tls_config("peer").await.unwrap();
    let server = peer.server_tls_config().await.unwrap();

    let (a, b) = duplex(64 * 1024);
    let (client_conn, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    assert!(client_conn.is_ok());
    assert!(server_conn.is_ok());

    let selection = CertsSelection {
        unique_id: Some("svc-1".into()),
        ..Default::default()
    };
    let revoked: CertsChanged = admin(&base, "revoke", &selection, Some(ADMIN_TOKEN)).await.unwrap();
    assert_eq!(revoked.certs.len(), 1);
    ca.reset_ocsp_cache();

    let issuer = svc
        .transport()
        .trust_store()
        .find_issuer(bundle.cert(), &[])
        .unwrap();
    let verdict = svc.ocsp().validate(bundle.cert(), &issuer).await;
    assert!(matches!(verdict, OcspVerdict::Rejected(Error::Revoked(_))));

    let (a, b) = duplex(64 * 1024);
    let (_, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    assert!(matches!(server_conn, Err(Error::Revoked(_))));

    shutdown.cancel();
}
