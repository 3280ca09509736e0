use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// CouchDB service settings consumed by the reconciler and the handshake.
#[derive(Debug, Deserialize, Clone)]
pub struct CouchConfig {
    /// Address CouchDB binds to
    #[serde(default = "default_bind_address", alias = "bind-address")]
    pub bind_address: String,
    /// HTTP port CouchDB listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hostname advertised to joining peers
    #[serde(default = "default_host")]
    pub host: String,
    /// IP advertised to joining peers
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Directory holding `local.ini`, `default.ini`, ...
    #[serde(default = "default_config_dir", alias = "config-dir")]
    pub config_dir: PathBuf,
    /// System service name used for restart/stop
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Packages installed on the install event
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    /// Optional credentials-only document name (written next to `local`)
    #[serde(default)]
    pub credentials_document: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5984
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/couchdb")
}

fn default_service_name() -> String {
    "couchdb".to_string()
}

fn default_packages() -> Vec<String> {
    vec!["couchdb".to_string(), "uuid".to_string()]
}

impl Default for CouchConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            host: default_host(),
            ip: default_ip(),
            config_dir: default_config_dir(),
            service_name: default_service_name(),
            packages: default_packages(),
            credentials_document: None,
        }
    }
}

/// Where the cluster-wide leader settings are kept.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SettingsBackend {
    /// The host's `leader-get` / `leader-set` / `is-leader` tools
    #[default]
    LeaderTools,
    /// A JSON file under `state_dir`; single-host deployments only
    File,
}

/// Per-node runtime settings.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Where node flags and the file-backed leader settings live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default, alias = "settings-backend")]
    pub settings_backend: SettingsBackend,
    /// Leadership for the `file` backend; the leader tools report their own
    #[serde(default)]
    pub is_leader: bool,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/couchkeeper")
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            settings_backend: SettingsBackend::default(),
            is_leader: false,
        }
    }
}

impl NodeConfig {
    pub fn flags_path(&self) -> PathBuf {
        self.state_dir.join("node.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.state_dir.join("leader-settings.json")
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub couchdb: CouchConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // e.g., COUCHKEEPER_COUCHDB__PORT, COUCHKEEPER_NODE__IS_LEADER
            .add_source(
                Environment::with_prefix("COUCHKEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
