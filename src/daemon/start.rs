//! Starting and stopping the CA daemon.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::ca::certdb::CertDb;
use crate::ca::checker::spawn_checker;
use crate::ca::cleaner::{CertCleaner, HttpInventory, spawn_cleaner};
use crate::ca::keeper::Keeper;
use crate::ca::lifecycle::CertLifecycle;
use crate::ca::ocsp::OcspResponder;
use crate::ca::pemstore::create_pem_store;
use crate::ca::revoke::{OperatorCredentials, SelfRevoker};
use crate::ca::signer::{CaSigner, RemoteSigner, SelfSigner};
use crate::ca::upper::UpperClients;
use crate::commons::crypto::CertInfo;
use crate::commons::error::Error;
use crate::commons::events::{EventSink, LogEvents};
use crate::commons::metrics::{LogMetrics, MetricsSink};
use crate::config::Config;

use super::http::server::HttpServer;
use super::http::tls;

/// Runs the CA until `shutdown` is cancelled.
///
/// On first start the CA creates its own key pair, self-signed or signed
/// by an upstream CA. Errors during start-up are returned, the listener
/// is bound before this function starts serving.
pub async fn start_meshca_daemon(config: Arc<Config>, shutdown: CancellationToken) -> Result<(), Error> {
    let events: Arc<dyn EventSink> = Arc::new(LogEvents);
    let metrics: Option<Arc<dyn MetricsSink>> = if config.metrics.enabled {
        Some(Arc::new(LogMetrics))
    } else {
        None
    };

    let pems = create_pem_store(config.pem.storage, &config.storage_uri, config.pem.secret_store_uri.as_ref())?;
    let uppers = upper_clients(&config)?;
    let keeper = Arc::new(Keeper::new(
        pems.clone(),
        uppers.clone(),
        config.keymanager.self_sign,
        metrics.clone(),
    ));
    bootstrap(&config, &keeper).await?;

    let certdb = Arc::new(CertDb::create(&config.storage_uri)?);
    let signer = Arc::new(CaSigner::new(
        config.signing.clone(),
        keeper.clone(),
        certdb.clone(),
        events.clone(),
        metrics.clone(),
    ));
    let ocsp = Arc::new(OcspResponder::new(
        certdb.clone(),
        keeper.clone(),
        events.clone(),
        metrics.clone(),
        config.ocsp.cache_ttl(),
    ));
    let revoker = Arc::new(SelfRevoker::new(
        certdb.clone(),
        pems.clone(),
        operator_credentials(&config)?,
        events.clone(),
    ));
    let lifecycle = Arc::new(CertLifecycle::new(certdb.clone(), events.clone()));

    let mut background = vec![];
    if let Some(metrics) = &metrics {
        if !uppers.is_empty() {
            background.push(spawn_checker(
                uppers.clone(),
                metrics.clone(),
                config.checker_interval(),
                config.ip.to_string(),
            ));
        }
    }
    if let Some(uri) = &config.gc.inventory_uri {
        let inventory = Arc::new(HttpInventory::new(uri.clone(), config.gc.inventory_token.clone()));
        let cleaner = Arc::new(CertCleaner::new(certdb.clone(), pems.clone(), inventory));
        background.push(spawn_cleaner(cleaner, config.gc_interval()));
    }

    let server = Arc::new(HttpServer::new(
        signer,
        ocsp,
        revoker,
        lifecycle,
        config.admin_token.clone(),
    ));

    let tls = match &config.https {
        Some(https) => Some(TlsAcceptor::from(Arc::new(tls::create_server_config(
            &https.key_file,
            &https.cert_file,
        )?))),
        None => None,
    };

    let addr = config.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::custom(format!("Could not bind to {}: {}", addr, e)))?;
    info!(
        "meshca listening on {}://{}",
        if tls.is_some() { "https" } else { "http" },
        addr
    );

    single_http_listener(server, listener, tls, shutdown).await;

    for token in background {
        token.cancel();
    }
    info!("meshca stopped");
    Ok(())
}

fn upper_clients(config: &Config) -> Result<UpperClients, Error> {
    if config.keymanager.self_sign {
        return Ok(UpperClients::default());
    }
    let auth_key = config
        .keymanager
        .upper_auth_key
        .as_deref()
        .ok_or_else(|| Error::custom("an intermediate CA needs 'upper_auth_key'"))?;
    UpperClients::remote(&config.keymanager.upper_ca, auth_key)
}

/// Creates the CA's own key pair unless it already has one.
async fn bootstrap(config: &Config, keeper: &Keeper) -> Result<(), Error> {
    let templates = &config.keymanager.csr_templates;
    let algorithm = config.keymanager.key_algorithm;
    if config.keymanager.self_sign {
        SelfSigner::new(keeper, &templates.root_ca, algorithm).run()?;
    } else {
        RemoteSigner::new(keeper, &templates.intermediate_ca, algorithm)
            .run()
            .await?;
    }

    let own = CertInfo::from_cert(&keeper.get_cached_self_key_pair()?.cert)?;
    info!("CA certificate '{}', serial {}", own.common_name, own.serial_number);
    Ok(())
}

fn operator_credentials(config: &Config) -> Result<Option<OperatorCredentials>, Error> {
    match &config.revoke.operator_profile {
        Some(profile) => Ok(Some(OperatorCredentials {
            profile: profile.clone(),
            auth_key: config.profile(profile)?.auth_key.clone(),
        })),
        None => Ok(None),
    }
}

/// Accepts connections until `shutdown` is cancelled.
async fn single_http_listener(
    server: Arc<HttpServer>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    error!("Fatal error in HTTP server: {}", err);
                    return;
                }
            }
        };

        let server = server.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(server, stream).await,
                    Err(err) => debug!("TLS handshake failed: {}", err),
                },
                None => serve_connection(server, stream).await,
            }
        });
    }
}

async fn serve_connection<S>(server: Arc<HttpServer>, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |req| {
                let server = server.clone();
                async move { server.process_request(req).await }
            }),
        )
        .await;
}
