//! Workloads getting certificates from a running CA and talking mutual
//! TLS, until one of them revokes its certificate.

use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use url::Url;

use meshca::client::{CaInstance, CaInstanceConfig, RevocationCheckPolicy};
use meshca::commons::error::Error;
use meshca::test::{SIDECAR_AUTH_KEY, identity, start_server, test_config};

fn instance(base: &str) -> CaInstance {
    let mut config = CaInstanceConfig::new(Url::parse(base).unwrap(), SIDECAR_AUTH_KEY);
    config.revocation_policy = RevocationCheckPolicy::FailClosed;
    CaInstance::new(config).unwrap()
}

#[tokio::test]
async fn mutual_tls_until_self_revocation() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = instance(&base);

    let orders = ca.new_exchanger(identity("orders"));
    let billing = ca.new_exchanger(identity("billing"));
    let client = orders.client_tls_config("billing").await.unwrap();
    let server = billing.server_tls_config().await.unwrap();

    let (a, b) = duplex(64 * 1024);
    let (client_conn, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    let (mut client_conn, mut server_conn) = (client_conn.unwrap(), server_conn.unwrap());
    client_conn.write_all(b"order 42").await.unwrap();
    client_conn.flush().await.unwrap();
    let mut buf = [0u8; 8];
    server_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"order 42");

    orders.revoke_itself().await.unwrap();
    ca.reset_ocsp_cache();

    let (a, b) = duplex(64 * 1024);
    let (_, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    assert!(matches!(server_conn, Err(Error::Revoked(_))));

    shutdown.cancel();
}

#[tokio::test]
async fn revoking_twice_succeeds() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = instance(&base);

    let exchanger = ca.new_exchanger(identity("cart"));
    exchanger.revoke_itself().await.unwrap();
    exchanger.revoke_itself().await.unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn blocked_ocsp_refuses_every_peer() {
    let (base, shutdown) = start_server(test_config()).await;
    let ca = instance(&base);

    let client = ca.new_exchanger(identity("a")).client_tls_config("b").await.unwrap();
    let server = ca.new_exchanger(identity("b")).server_tls_config().await.unwrap();

    ca.block_ocsp_requests();
    let (a, b) = duplex(64 * 1024);
    let (_, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    assert!(matches!(server_conn, Err(Error::OcspBlocked)));

    ca.allow_ocsp_requests();
    let (a, b) = duplex(64 * 1024);
    let (client_conn, server_conn) = tokio::join!(client.connect(a), server.accept(b));
    assert!(client_conn.is_ok());
    assert!(server_conn.is_ok());

    shutdown.cancel();
}
