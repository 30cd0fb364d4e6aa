//! Configuration of the meshca daemon.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error, info};
use serde::de;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::ca::pemstore::PemStorage;
use crate::commons::crypto::{CsrSubject, KeyAlgorithm};
use crate::commons::error::Error;
use crate::constants::*;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        8081
    }

    fn storage_uri() -> Url {
        Url::parse("local://./data/").expect("valid default storage uri")
    }

    fn log_level() -> LevelFilter {
        match env::var(MESHCA_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}", MESHCA_ENV_LOG_LEVEL);
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./meshca.log")
    }

    fn admin_token() -> Option<String> {
        env::var(MESHCA_ENV_ADMIN_TOKEN).ok()
    }

    fn self_sign() -> bool {
        true
    }

    fn key_algorithm() -> KeyAlgorithm {
        KeyAlgorithm::Rsa4096
    }

    fn root_ca_expiry_hours() -> u64 {
        24 * 365 * 10
    }

    fn intermediate_ca_expiry_hours() -> u64 {
        24 * 365 * 5
    }

    fn ocsp_cache_time() -> u64 {
        60
    }

    fn checker_interval_secs() -> u64 {
        DEFAULT_CHECKER_INTERVAL.as_secs()
    }

    fn gc_interval_secs() -> u64 {
        DEFAULT_GC_INTERVAL.as_secs()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the meshca daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    /// Where certificate records, forbid records and PEMs are kept.
    #[serde(default = "ConfigDefaults::storage_uri")]
    pub storage_uri: Url,

    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    /// Bearer token for the administrative API. Without one the
    /// administrative API is disabled.
    #[serde(default = "ConfigDefaults::admin_token")]
    pub admin_token: Option<String>,

    pub https: Option<HttpsConfig>,

    #[serde(default)]
    pub keymanager: KeymanagerConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub pem: PemConfig,

    #[serde(default)]
    pub ocsp: OcspConfig,

    #[serde(default)]
    pub revoke: RevokeConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub gc: GcConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct KeymanagerConfig {
    /// Whether this is a root CA that signs its own certificate.
    #[serde(default = "ConfigDefaults::self_sign")]
    pub self_sign: bool,

    /// Upstream CAs, tried in this order.
    #[serde(default)]
    pub upper_ca: Vec<Url>,

    /// The key authenticating requests to the upstream CAs.
    pub upper_auth_key: Option<String>,

    #[serde(default = "ConfigDefaults::key_algorithm")]
    pub key_algorithm: KeyAlgorithm,

    #[serde(default)]
    pub csr_templates: CsrTemplates,
}

impl Default for KeymanagerConfig {
    fn default() -> Self {
        KeymanagerConfig {
            self_sign: ConfigDefaults::self_sign(),
            upper_ca: vec![],
            upper_auth_key: None,
            key_algorithm: ConfigDefaults::key_algorithm(),
            csr_templates: CsrTemplates::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CsrTemplates {
    #[serde(default = "CaTemplate::root")]
    pub root_ca: CaTemplate,

    #[serde(default = "CaTemplate::intermediate")]
    pub intermediate_ca: CaTemplate,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CaTemplate {
    pub cn: String,
    pub o: Option<String>,
    pub ou: Option<String>,
    pub expiry_hours: u64,
}

impl CaTemplate {
    pub fn root() -> Self {
        CaTemplate {
            cn: "meshca root".to_string(),
            o: None,
            ou: None,
            expiry_hours: ConfigDefaults::root_ca_expiry_hours(),
        }
    }

    pub fn intermediate() -> Self {
        CaTemplate {
            cn: "meshca intermediate".to_string(),
            o: None,
            ou: None,
            expiry_hours: ConfigDefaults::intermediate_ca_expiry_hours(),
        }
    }

    pub fn subject(&self) -> CsrSubject {
        CsrSubject {
            common_name: self.cn.clone(),
            organization: self.o.clone(),
            organizational_unit: self.ou.clone(),
        }
    }

    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.expiry_hours * 3600)
    }
}

impl Default for CsrTemplates {
    fn default() -> Self {
        CsrTemplates {
            root_ca: CaTemplate::root(),
            intermediate_ca: CaTemplate::intermediate(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub profiles: HashMap<String, SigningProfile>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SigningProfile {
    pub expiry_hours: u64,

    #[serde(default)]
    pub usages: Vec<String>,

    /// Whether certificates of this profile may sign certificates.
    #[serde(default)]
    pub is_ca: bool,

    /// The key authenticating sign requests for this profile.
    pub auth_key: String,
}

impl SigningProfile {
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.expiry_hours * 3600)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PemConfig {
    #[serde(default)]
    pub storage: PemStorage,

    /// Where the secret store keeps its data; defaults to `storage_uri`.
    pub secret_store_uri: Option<Url>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OcspConfig {
    /// How long signed responses are cached, in minutes.
    #[serde(default = "ConfigDefaults::ocsp_cache_time")]
    pub cache_time: u64,
}

impl Default for OcspConfig {
    fn default() -> Self {
        OcspConfig {
            cache_time: ConfigDefaults::ocsp_cache_time(),
        }
    }
}

impl OcspConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_time * 60)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RevokeConfig {
    /// The signing profile whose auth key may revoke any certificate.
    pub operator_profile: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "ConfigDefaults::checker_interval_secs")]
    pub checker_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            checker_interval_secs: ConfigDefaults::checker_interval_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GcConfig {
    /// The runtime inventory listing live workloads. The cleaner only runs
    /// when this is set.
    pub inventory_uri: Option<String>,

    pub inventory_token: Option<String>,

    #[serde(default = "ConfigDefaults::gc_interval_secs")]
    pub interval_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            inventory_uri: None,
            inventory_token: None,
            interval_secs: ConfigDefaults::gc_interval_secs(),
        }
    }
}

impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn checker_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.checker_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc.interval_secs)
    }

    /// Returns the profile, or `ProfileUnknown`.
    pub fn profile(&self, name: &str) -> Result<&SigningProfile, Error> {
        self.signing
            .profiles
            .get(name)
            .ok_or_else(|| Error::ProfileUnknown(name.to_string()))
    }
}

impl Config {
    /// Reads, verifies and applies the config file at startup.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == MESHCA_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                } else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {}, error: {}",
                        config_file, e
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!("{} uses configuration file: {}", MESHCA_SERVER_APP, config_file);
                Ok(config)
            }
        }?;
        config
            .verify()
            .map_err(|e| ConfigError::Other(format!("Error parsing config file: {}, error: {}", config_file, e)))?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if !self.keymanager.self_sign {
            if self.keymanager.upper_ca.is_empty() {
                return Err(ConfigError::other(
                    "upper_ca must list at least one upstream CA unless self_sign is set",
                ));
            }
            if self.keymanager.upper_auth_key.is_none() {
                return Err(ConfigError::other("upper_auth_key is required unless self_sign is set"));
            }
        }

        for (name, profile) in &self.signing.profiles {
            if profile.expiry_hours == 0 {
                return Err(ConfigError::Other(format!("profile '{}' must have expiry_hours > 0", name)));
            }
            if profile.auth_key.len() < 16 {
                return Err(ConfigError::Other(format!(
                    "auth_key of profile '{}' must be at least 16 characters",
                    name
                )));
            }
        }

        if let Some(operator) = &self.revoke.operator_profile {
            if !self.signing.profiles.contains_key(operator) {
                return Err(ConfigError::Other(format!(
                    "revoke operator_profile '{}' is not a signing profile",
                    operator
                )));
            }
        }

        if let Some(token) = &self.admin_token {
            if token.is_empty() {
                return Err(ConfigError::other("admin_token must not be empty"));
            }
        }

        if self.ocsp.cache_time == 0 {
            return Err(ConfigError::other("ocsp cache_time must be at least 1 minute"));
        }

        Ok(())
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(file)?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("rustls", framework_level)
            .level_for("tokio_rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("tokio_util::codec::framed_read", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\" or \"file\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const INTERMEDIATE: &str = r#"
        port = 9443
        storage_uri = "memory://config-test/"
        log_level = "debug"
        admin_token = "let-me-in"

        [keymanager]
        self_sign = false
        upper_ca = ["https://root-1:8081/", "https://root-2:8081/"]
        upper_auth_key = "0123456789abcdef"
        key_algorithm = "ecdsa-p256"

        [keymanager.csr_templates.intermediate_ca]
        cn = "site ca"
        o = "example"
        ou = "mesh"
        expiry_hours = 8760

        [signing.profiles.sidecar]
        expiry_hours = 24
        usages = ["server auth", "client auth"]
        auth_key = "0123456789abcdef"

        [pem]
        storage = "secret-store"

        [revoke]
        operator_profile = "sidecar"
    "#;

    #[test]
    fn parse_intermediate_config() {
        let c = Config::parse(INTERMEDIATE).unwrap();
        c.verify().unwrap();

        assert_eq!(c.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 9443)));
        assert_eq!(c.log_level, LevelFilter::Debug);
        assert!(!c.keymanager.self_sign);
        assert_eq!(c.keymanager.upper_ca.len(), 2);
        assert_eq!(c.keymanager.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(c.keymanager.csr_templates.intermediate_ca.subject().organizational_unit.as_deref(), Some("mesh"));
        assert_eq!(c.keymanager.csr_templates.root_ca.cn, "meshca root");
        assert_eq!(c.pem.storage, PemStorage::SecretStore);
        assert_eq!(c.ocsp.cache_time, 60);
        assert_eq!(c.profile("sidecar").unwrap().validity(), Duration::from_secs(24 * 3600));
        assert!(matches!(c.profile("nope"), Err(Error::ProfileUnknown(_))));
    }

    #[test]
    fn should_parse_default_config_file() {
        let c = Config::parse(include_str!("../defaults/meshca.conf")).unwrap();
        c.verify().unwrap();
        assert!(c.keymanager.self_sign);
        assert!(c.admin_token.is_none() || std::env::var(MESHCA_ENV_ADMIN_TOKEN).is_ok());
        assert!(c.profile("intermediate").unwrap().is_ca);
        assert_eq!(c.ocsp.cache_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn verify_rejects_inconsistent_config() {
        let no_upstream = Config::parse("[keymanager]\nself_sign = false\n").unwrap();
        assert!(no_upstream.verify().is_err());

        let short_key = Config::parse("[signing.profiles.sidecar]\nexpiry_hours = 1\nauth_key = \"short\"\n").unwrap();
        assert!(short_key.verify().is_err());

        let unknown_operator = Config::parse("[revoke]\noperator_profile = \"ops\"\n").unwrap();
        assert!(unknown_operator.verify().is_err());
    }

    #[test]
    fn should_clamp_framework_log_levels() {
        let c = Config::parse("log_level = \"debug\"").unwrap();
        let void_output = fern::Output::writer(Box::new(io::sink()), "");
        let (_, logger) = c.fern_logger().chain(void_output).into_log();

        let meta = |target: &'static str, level: log::Level| log::Metadata::builder().target(target).level(level).build();
        assert!(logger.enabled(&meta("meshca::ca::keeper", log::Level::Debug)));
        assert!(!logger.enabled(&meta("hyper", log::Level::Info)));
        assert!(logger.enabled(&meta("reqwest", log::Level::Warn)));
    }
}
