//! Mutual TLS between workloads.
//!
//! Peers are verified against the workload's trust store and must carry a
//! workload identity. After the handshake the peer's certificate is checked
//! with OCSP, and the connection is only handed out if that check and any
//! extra validator pass.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use openssl::stack::Stack;
use openssl::x509::{X509, X509StoreContext};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::client::ResolvesClientCert;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::{CryptoProvider, ring, verify_tls12_signature, verify_tls13_signature};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{
    self, CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

use crate::client::ocsp::OcspClient;
use crate::client::transport::Transport;
use crate::client::truststore::TrustStore;
use crate::commons::crypto::CertInfo;
use crate::commons::error::{CaResult, Error};
use crate::commons::identity::WorkloadIdentity;

/// A check run on the peer's identity after all other checks passed.
pub type ExtraValidator = Arc<dyn Fn(&WorkloadIdentity) -> CaResult<()> + Send + Sync>;

//------------ TlsGenerator --------------------------------------------------

enum Side {
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
    Server {
        acceptor: TlsAcceptor,
    },
}

/// Establishes verified TLS connections for one workload.
pub struct TlsGenerator {
    side: Side,
    trust_store: Arc<TrustStore>,
    ocsp: Arc<OcspClient>,
    extra_validator: Option<ExtraValidator>,
}

impl TlsGenerator {
    /// Creates the client side for connections to `host`.
    pub fn client(transport: Arc<Transport>, ocsp: Arc<OcspClient>, host: &str) -> CaResult<Self> {
        let server_name = ServerName::try_from(host.to_string()).map_err(Error::tls)?;
        let trust_store = transport.trust_store().clone();
        let config = client_config(transport)?;
        Ok(TlsGenerator {
            side: Side::Client {
                connector: TlsConnector::from(Arc::new(config)),
                server_name,
            },
            trust_store,
            ocsp,
            extra_validator: None,
        })
    }

    /// Creates the server side, which requires client certificates.
    pub fn server(transport: Arc<Transport>, ocsp: Arc<OcspClient>) -> CaResult<Self> {
        let trust_store = transport.trust_store().clone();
        let config = server_config(transport)?;
        Ok(TlsGenerator {
            side: Side::Server {
                acceptor: TlsAcceptor::from(Arc::new(config)),
            },
            trust_store,
            ocsp,
            extra_validator: None,
        })
    }

    pub fn bind_extra_validator(&mut self, validator: ExtraValidator) {
        self.extra_validator = Some(validator);
    }

    pub fn with_extra_validator(mut self, validator: ExtraValidator) -> Self {
        self.bind_extra_validator(validator);
        self
    }

    /// Performs the client handshake and checks the server.
    pub async fn connect<IO>(&self, stream: IO) -> CaResult<client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let Side::Client { connector, server_name } = &self.side else {
            return Err(Error::tls("cannot connect with a server configuration"));
        };
        let stream = connector.connect(server_name.clone(), stream).await.map_err(Error::tls)?;
        let peer = self.check_peer(stream.get_ref().1.peer_certificates()).await?;
        debug!("connected to {}", peer);
        Ok(stream)
    }

    /// Performs the server handshake and checks the client.
    pub async fn accept<IO>(&self, stream: IO) -> CaResult<server::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let Side::Server { acceptor } = &self.side else {
            return Err(Error::tls("cannot accept with a client configuration"));
        };
        let stream = acceptor.accept(stream).await.map_err(Error::tls)?;
        let peer = self.check_peer(stream.get_ref().1.peer_certificates()).await?;
        debug!("accepted connection from {}", peer);
        Ok(stream)
    }

    async fn check_peer(&self, certs: Option<&[CertificateDer<'static>]>) -> CaResult<WorkloadIdentity> {
        let (leaf, presented) = match certs {
            Some([leaf, rest @ ..]) => (
                X509::from_der(leaf.as_ref())?,
                rest.iter()
                    .map(|der| X509::from_der(der.as_ref()))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => return Err(Error::tls("peer presented no certificate")),
        };

        let identity = CertInfo::from_cert(&leaf)?
            .identity()
            .ok_or_else(|| Error::tls("peer certificate carries no workload identity"))?;
        let issuer = self
            .trust_store
            .find_issuer(&leaf, &presented)
            .ok_or_else(|| Error::tls(format!("issuer of {} is unknown", identity)))?;

        self.ocsp.validate(&leaf, &issuer).await.into_result()?;
        if let Some(validator) = &self.extra_validator {
            validator(&identity).inspect_err(|e| warn!("peer {} rejected: {}", identity, e))?;
        }
        Ok(identity)
    }
}

impl fmt::Debug for TlsGenerator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let side = match self.side {
            Side::Client { .. } => "client",
            Side::Server { .. } => "server",
        };
        f.debug_struct("TlsGenerator").field("side", &side).finish()
    }
}

//------------ Configurations ------------------------------------------------

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// A client configuration presenting the transport's certificate.
///
/// It only verifies chains. Revocation is checked by
/// [`TlsGenerator::connect`].
pub(crate) fn client_config(transport: Arc<Transport>) -> CaResult<ClientConfig> {
    let provider = provider();
    let verifier = TrustStoreVerifier::new(transport.trust_store().clone(), provider.clone());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(Arc::new(TransportResolver(transport)));
    Ok(config)
}

/// A server configuration that requires and verifies client certificates.
///
/// The certificate is resolved per handshake, so rotations take effect
/// without rebuilding the configuration. Revocation is checked by
/// [`TlsGenerator::accept`].
pub(crate) fn server_config(transport: Arc<Transport>) -> CaResult<ServerConfig> {
    let provider = provider();
    let verifier = TrustStoreVerifier::new(transport.trust_store().clone(), provider.clone());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(Error::tls)?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_cert_resolver(Arc::new(TransportResolver(transport)));
    Ok(config)
}

//------------ TrustStoreVerifier --------------------------------------------

/// Verifies peer chains against the trust store.
///
/// Peers are identified by their workload identity, not by host name, so
/// the server name is not checked.
#[derive(Debug)]
struct TrustStoreVerifier {
    trust_store: Arc<TrustStore>,
    provider: Arc<CryptoProvider>,
}

impl TrustStoreVerifier {
    fn new(trust_store: Arc<TrustStore>, provider: Arc<CryptoProvider>) -> Self {
        TrustStoreVerifier { trust_store, provider }
    }

    fn verify_chain(&self, end_entity: &CertificateDer, intermediates: &[CertificateDer]) -> Result<(), rustls::Error> {
        let bad_encoding = |_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding);
        let general = |e: openssl::error::ErrorStack| rustls::Error::General(e.to_string());

        let leaf = X509::from_der(end_entity.as_ref()).map_err(bad_encoding)?;
        let mut chain = Stack::new().map_err(general)?;
        for der in intermediates {
            chain.push(X509::from_der(der.as_ref()).map_err(bad_encoding)?).map_err(general)?;
        }

        let store = self
            .trust_store
            .x509_store()
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        let mut ctx = X509StoreContext::new().map_err(general)?;
        let (verified, result) = ctx
            .init(&store, &leaf, &chain, |ctx| Ok((ctx.verify_cert()?, ctx.error())))
            .map_err(general)?;
        if !verified {
            warn!("peer certificate does not verify: {}", result.error_string());
            return Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer));
        }

        match CertInfo::from_cert(&leaf).ok().and_then(|info| info.identity()) {
            Some(_) => Ok(()),
            None => {
                warn!("peer certificate carries no workload identity");
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            }
        }
    }
}

impl ServerCertVerifier for TrustStoreVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for TrustStoreVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.verify_chain(end_entity, intermediates)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

//------------ TransportResolver ---------------------------------------------

/// Hands out the transport's current certificate on every handshake.
#[derive(Debug)]
struct TransportResolver(Arc<Transport>);

impl TransportResolver {
    fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.0.current().map(|bundle| bundle.certified_key())
    }
}

impl ResolvesServerCert for TransportResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current()
    }
}

impl ResolvesClientCert for TransportResolver {
    fn resolve(&self, _root_hint_subjects: &[&[u8]], _sigschemes: &[SignatureScheme]) -> Option<Arc<CertifiedKey>> {
        self.current()
    }

    fn has_certs(&self) -> bool {
        self.0.current().is_some()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;
    use crate::ca::certdb::CertKey;
    use crate::client::ocsp::{OcspKillSwitch, RevocationCheckPolicy};
    use crate::commons::crypto::KeyAlgorithm;
    use crate::commons::crypto::ocsp::RevocationReason;
    use crate::constants::PROFILE_SIDECAR;
    use crate::test::{LocalOcspFetcher, TestCa, identity};

    async fn transport(ca: &TestCa, unique_id: &str) -> Arc<Transport> {
        let transport = Arc::new(Transport::new(
            identity(unique_id),
            ca.signer.clone(),
            PROFILE_SIDECAR,
            KeyAlgorithm::EcdsaP256,
            Arc::new(TrustStore::new()),
        ));
        transport.get_certificate().await.unwrap();
        transport
    }

    fn ocsp(ca: &TestCa) -> Arc<OcspClient> {
        Arc::new(OcspClient::new(
            Arc::new(LocalOcspFetcher::new(ca)),
            RevocationCheckPolicy::FailClosed,
            OcspKillSwitch::default(),
        ))
    }

    async fn handshake(
        client: &TlsGenerator,
        server: &TlsGenerator,
    ) -> (CaResult<client::TlsStream<tokio::io::DuplexStream>>, CaResult<server::TlsStream<tokio::io::DuplexStream>>) {
        let (a, b) = duplex(64 * 1024);
        tokio::join!(client.connect(a), server.accept(b))
    }

    #[tokio::test]
    async fn mutual_tls_between_workloads() {
        let ca = TestCa::root();
        let client = TlsGenerator::client(transport(&ca, "client").await, ocsp(&ca), "localhost").unwrap();
        let server = TlsGenerator::server(transport(&ca, "server").await, ocsp(&ca)).unwrap();

        let (client, server) = handshake(&client, &server).await;
        let (mut client, mut server) = (client.unwrap(), server.unwrap());

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn revoked_client_is_refused() {
        let ca = TestCa::root();
        let client_transport = transport(&ca, "client").await;
        let client = TlsGenerator::client(client_transport.clone(), ocsp(&ca), "localhost").unwrap();
        let server = TlsGenerator::server(transport(&ca, "server").await, ocsp(&ca)).unwrap();

        let info = client_transport.current().unwrap().info().clone();
        ca.certdb
            .revoke_certificate(
                &CertKey::new(&info.serial_number, &info.authority_key_id),
                RevocationReason::KeyCompromise,
            )
            .unwrap();

        let (_, server) = handshake(&client, &server).await;
        assert!(matches!(server, Err(Error::Revoked(_))));
    }

    #[tokio::test]
    async fn untrusted_peer_is_refused() {
        let ca = TestCa::root();
        let other = TestCa::root();
        let client = TlsGenerator::client(transport(&other, "client").await, ocsp(&other), "localhost").unwrap();
        let server = TlsGenerator::server(transport(&ca, "server").await, ocsp(&ca)).unwrap();

        let (client, server) = handshake(&client, &server).await;
        assert!(client.is_err());
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn extra_validator_sees_the_peer_identity() {
        let ca = TestCa::root();
        let client = TlsGenerator::client(transport(&ca, "client").await, ocsp(&ca), "localhost").unwrap();
        let server = TlsGenerator::server(transport(&ca, "server").await, ocsp(&ca))
            .unwrap()
            .with_extra_validator(Arc::new(|peer: &WorkloadIdentity| {
                if peer.unique_id() == "client" {
                    Err(Error::Forbidden(format!("{} may not connect", peer)))
                } else {
                    Ok(())
                }
            }));

        let (_, server) = handshake(&client, &server).await;
        assert!(matches!(server, Err(Error::Forbidden(_))));
    }
}
