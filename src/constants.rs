//! Various meshca-wide constants.

use std::time::Duration;

//------------ Binary Names -------------------------------------------------

/// The friendly name of the `meshca` binary.
pub const MESHCA_SERVER_APP: &str = "meshca";

/// The version of this crate, used in the user agent of outgoing requests.
pub const MESHCA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The default path to the meshca config file.
pub const MESHCA_DEFAULT_CONFIG_FILE: &str = "/etc/meshca.conf";

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It is
/// overwritten by the config file. The default is “info.”
pub const MESHCA_ENV_LOG_LEVEL: &str = "MESHCA_LOG_LEVEL";

/// The environment variable with the admin API token.
pub const MESHCA_ENV_ADMIN_TOKEN: &str = "MESHCA_ADMIN_TOKEN";

/// The environment variable with a colon separated list of PEM files of
/// extra root certificates for outgoing HTTPS requests.
pub const MESHCA_ENV_HTTPS_ROOT_CERTS: &str = "MESHCA_HTTPS_ROOT_CERTS";

//------------ Log Targets --------------------------------------------------

/// The log target for audit events of the certificate lifecycle.
pub const EVENTS_LOG_TARGET: &str = "meshca::events";

/// The log target used by the log-backed metrics sink.
pub const METRICS_LOG_TARGET: &str = "meshca::metrics";

//------------ Well-known Names ---------------------------------------------

/// The signing profile used for intermediate CA certificates.
pub const PROFILE_INTERMEDIATE: &str = "intermediate";

/// The signing profile and label used for workload (sidecar) certificates.
pub const PROFILE_SIDECAR: &str = "sidecar";

/// The well-known PEM store key of the CA's own key pair.
pub const PEM_KEY_LOCAL_STORE: &str = "local_store";

/// The well-known PEM store key of the cached trust chain.
pub const PEM_KEY_TRUST_CERTS: &str = "trust_certs";

/// The URI scheme of workload identities.
pub const IDENTITY_URI_SCHEME: &str = "spiffe";

/// The operator name recorded for administrative lifecycle events.
pub const OPERATOR_PLATFORM: &str = "MSP platform";

/// The operator name recorded for events triggered by workloads.
pub const OPERATOR_SDK: &str = "SDK";

/// The category of all certificate lifecycle events.
pub const EVENT_CATEGORY: &str = "workload_lifecycle";

//------------ HTTP API -----------------------------------------------------

pub const API_SIGN_PATH: &str = "/api/v1/cfssl/authsign";
pub const API_INFO_PATH: &str = "/api/v1/cfssl/info";
pub const API_REVOKE_PATH: &str = "/api/v1/cfssl/revoke";
pub const API_OCSP_PATH: &str = "/api/v1/cfssl/ocsp";
pub const API_HEALTH_PATH: &str = "/api/v1/cfssl/health";
pub const API_ADMIN_PREFIX: &str = "/api/v1/workload/certs/";

/// The content type of OCSP requests.
pub const OCSP_REQUEST_CONTENT_TYPE: &str = "application/ocsp-request";

/// The content type of OCSP responses.
pub const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

/// Maximum accepted size of request bodies.
pub const HTTP_REQUEST_BODY_LIMIT: usize = 1024 * 1024;

/// Timeout for all outgoing HTTP requests.
pub const HTTP_CLIENT_TIMEOUT_SECS: u64 = 30;

/// The status recorded by the health checker when an upstream is
/// unreachable.
pub const HEALTH_STATUS_UNREACHABLE: u16 = 599;

//------------ Timing -------------------------------------------------------

/// Workload certificates are renewed once this fraction of their validity
/// (1/rate) remains.
pub const CERT_REFRESH_DURATION_RATE: u32 = 2;

/// Default interval of the rotate controller.
pub const DEFAULT_ROTATE_AFTER: Duration = Duration::from_secs(60 * 60);

/// Default interval of the upstream health checker.
pub const DEFAULT_CHECKER_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval of the certificate cleaner.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// How long a "good" OCSP answer is cached by workloads.
pub const OCSP_CLIENT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Upper bound of entries in an OCSP cache.
pub const OCSP_CACHE_CAPACITY: usize = 10_000;

/// Slack allowed between the responder's clock and ours when checking
/// the update times of an OCSP response.
pub const OCSP_CLOCK_SKEW_SECS: u32 = 5 * 60;

/// Trust store refresh backoff: number of attempts.
pub const TRUST_REFRESH_STEPS: u32 = 5;

/// Trust store refresh backoff: first delay.
pub const TRUST_REFRESH_INITIAL: Duration = Duration::from_secs(1);

/// Trust store refresh backoff: growth factor.
pub const TRUST_REFRESH_FACTOR: f64 = 3.0;

/// Trust store refresh backoff: randomization of each delay.
pub const TRUST_REFRESH_JITTER: f64 = 0.1;

/// Maximum number of certificates changed by one administrative request.
pub const LIFECYCLE_BATCH_LIMIT: usize = 1000;

//------------ Metrics ------------------------------------------------------

/// Measurement of upstream CA health probes and info calls.
pub const METRICS_UPPER_CA_INFO: &str = "upper_ca_info";

/// Measurement of OCSP responder outcomes.
pub const METRICS_OCSP_RESPONSES: &str = "ocsp_responses";

/// Measurement of issued certificates.
pub const METRICS_CERT_SIGNED: &str = "cert_signed";
