//! The per-identity handle workloads use to get certificates and TLS.

use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::client::ocsp::OcspClient;
use crate::client::revoke::revoke_cert;
use crate::client::rotate::RotateController;
use crate::client::tls::TlsGenerator;
use crate::client::transport::{IdentityBundle, Transport};
use crate::commons::error::CaResult;
use crate::commons::identity::WorkloadIdentity;

//------------ Exchanger -----------------------------------------------------

#[derive(Debug)]
pub struct Exchanger {
    transport: Arc<Transport>,
    ocsp: Arc<OcspClient>,
    revoke_uri: String,
    rotate_after: Duration,
}

impl Exchanger {
    pub(super) fn new(
        transport: Arc<Transport>,
        ocsp: Arc<OcspClient>,
        revoke_uri: String,
        rotate_after: Duration,
    ) -> Self {
        Exchanger {
            transport,
            ocsp,
            revoke_uri,
            rotate_after,
        }
    }

    pub fn identity(&self) -> &WorkloadIdentity {
        self.transport.identity()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn ocsp(&self) -> &Arc<OcspClient> {
        &self.ocsp
    }

    /// The current certificate, issued on first use.
    pub async fn get_certificate(&self) -> CaResult<Arc<IdentityBundle>> {
        self.transport.get_certificate().await
    }

    /// TLS for connecting to `host`.
    pub async fn client_tls_config(&self, host: &str) -> CaResult<TlsGenerator> {
        self.get_certificate().await?;
        TlsGenerator::client(self.transport.clone(), self.ocsp.clone(), host)
    }

    /// TLS for accepting connections from other workloads.
    pub async fn server_tls_config(&self) -> CaResult<TlsGenerator> {
        self.get_certificate().await?;
        TlsGenerator::server(self.transport.clone(), self.ocsp.clone())
    }

    /// Revokes the current certificate, typically when going offline.
    pub async fn revoke_itself(&self) -> CaResult<()> {
        let bundle = self.get_certificate().await?;
        revoke_cert(&self.revoke_uri, bundle.key(), bundle.cert()).await?;
        info!(
            "{} revoked its certificate {}",
            self.identity(),
            bundle.info().serial_number
        );
        Ok(())
    }

    pub fn rotate_controller(&self) -> RotateController {
        RotateController::new(self.transport.clone(), self.rotate_after)
    }
}
