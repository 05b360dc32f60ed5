use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

/// Per-account identity, credentials and connection policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    pub resource: Option<String>,
    pub server: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// 0 retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub auto_join: Vec<String>,
    pub nickname: Option<String>,
}

impl AccountConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            resource: None,
            server: None,
            port: None,
            use_tls: true,
            accept_invalid_certs: false,
            auto_reconnect: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auto_join: Vec::new(),
            nickname: None,
        }
    }

    pub fn bare_jid(&self) -> String {
        crate::jid::bare_jid(&self.jid)
    }

    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or(DEFAULT_RESOURCE)
    }

    /// Room nickname: the configured one, else the local part of the jid.
    pub fn nickname(&self) -> String {
        match &self.nickname {
            Some(nick) => nick.clone(),
            None => crate::jid::local_part(&self.jid)
                .unwrap_or(&self.jid)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as uniform random jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_auth_seconds")]
    pub auth_seconds: u64,
    #[serde(default = "default_roster_fetch_seconds")]
    pub roster_fetch_seconds: u64,
    #[serde(default = "default_transfer_negotiation_seconds")]
    pub transfer_negotiation_seconds: u64,
}

impl TimeoutConfig {
    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_seconds)
    }

    pub fn roster_fetch(&self) -> Duration {
        Duration::from_secs(self.roster_fetch_seconds)
    }

    pub fn transfer_negotiation(&self) -> Duration {
        Duration::from_secs(self.transfer_negotiation_seconds)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_seconds: default_auth_seconds(),
            roster_fetch_seconds: default_roster_fetch_seconds(),
            transfer_negotiation_seconds: default_transfer_negotiation_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    pub download_dir: Option<String>,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl TransferConfig {
    /// Resolve the download directory, expanding `~` and falling back to
    /// the platform download folder.
    pub fn download_dir(&self) -> PathBuf {
        if let Some(dir) = &self.download_dir {
            return expand_home(dir);
        }
        directories::UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("downloads"))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_dir: None,
            max_file_size: default_max_file_size(),
            block_size: default_block_size(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => expand_home(path),
            None => match project_dirs() {
                Some(dirs) => dirs.data_dir().join("rookery.db"),
                None => PathBuf::from("rookery.db"),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
    log_level: Option<String>,
}

pub const DEFAULT_RESOURCE: &str = "rookery";

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.25
}

fn default_auth_seconds() -> u64 {
    30
}

fn default_roster_fetch_seconds() -> u64 {
    30
}

fn default_transfer_negotiation_seconds() -> u64 {
    60
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_block_size() -> u32 {
    4096
}

fn default_progress_interval_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[[accounts]]
jid = ""
password = ""
# resource = "rookery"
# server = "xmpp.example.com"
# port = 5222
use_tls = true
accept_invalid_certs = false
auto_reconnect = true
max_reconnect_attempts = 5
auto_join = []
# nickname = "me"

[reconnect]
base_delay_ms = 1000
max_delay_ms = 60000
jitter = 0.25

[timeouts]
auth_seconds = 30
roster_fetch_seconds = 30
transfer_negotiation_seconds = 60

[transfer]
# download_dir = "~/Downloads"
max_file_size = 104857600
block_size = 4096
progress_interval_ms = 250

[storage]
# path = "~/.local/share/rookery/rookery.db"

[logging]
level = "info"

[event_bus]
channel_capacity = 1024
"#;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "rookery", "rookery")
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = project_dirs() {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec![
                    "accounts[0].jid".to_string(),
                    "accounts[0].password".to_string(),
                ],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("ROOKERY_JID").ok(),
        password: std::env::var("ROOKERY_PASSWORD").ok(),
        server: std::env::var("ROOKERY_SERVER").ok(),
        log_level: std::env::var("ROOKERY_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    let touches_account =
        overrides.jid.is_some() || overrides.password.is_some() || overrides.server.is_some();
    if touches_account && config.accounts.is_empty() {
        config.accounts.push(AccountConfig::new("", ""));
    }

    if let Some(account) = config.accounts.first_mut() {
        if let Some(jid) = overrides.jid {
            account.jid = jid;
        }
        if let Some(password) = overrides.password {
            account.password = password;
        }
        if let Some(server) = overrides.server {
            account.server = Some(server);
        }
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.accounts.is_empty() {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["accounts".to_string()],
        });
    }

    let mut missing = Vec::new();
    for (i, account) in config.accounts.iter().enumerate() {
        if account.jid.is_empty() {
            missing.push(format!("accounts[{i}].jid"));
        }
        if account.password.is_empty() {
            missing.push(format!("accounts[{i}].password"));
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    for (i, account) in config.accounts.iter().enumerate() {
        if !account.jid.contains('@') {
            return Err(ConfigError::InvalidValue {
                field: format!("accounts[{i}].jid"),
                message: "must be of the form user@domain".to_string(),
            });
        }
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if !(0.0..=1.0).contains(&config.reconnect.jitter) {
        return Err(ConfigError::InvalidValue {
            field: "reconnect.jitter".to_string(),
            message: "must be between 0 and 1".to_string(),
        });
    }

    if config.transfer.max_file_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "transfer.max_file_size".to_string(),
            message: "must be greater than 0".to_string(),
        });
    }

    if !(1..=65535).contains(&config.transfer.block_size) {
        return Err(ConfigError::InvalidValue {
            field: "transfer.block_size".to_string(),
            message: "must be between 1 and 65535".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
