use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time;

use bridge_common::circuit_breaker::CircuitBreakerConfig;
use bridge_common::retry::RetryPolicy;
use encoding_rs::Encoding;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;

use crate::alerts::AlertRule;
use crate::error::ConfigError;

pub const OVERRIDES_PATH_KEY: &str = "CONFIG_OVERRIDES_PATH";

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub source: SourceConfig,

    #[envconfig(nested = true)]
    pub processing: ProcessingConfig,

    #[envconfig(nested = true)]
    pub retry: RetryConfig,

    #[envconfig(nested = true)]
    pub circuit_breaker: CircuitBreakerEnvConfig,

    #[envconfig(nested = true)]
    pub dlq: DlqConfig,

    #[envconfig(nested = true)]
    pub endpoint: EndpointConfig,

    #[envconfig(from = "ALERT_RULES", default = "[]")]
    pub alert_rules: AlertRules,

    #[envconfig(from = "AUDIT_DIRECTORY", default = "./data/audit")]
    pub audit_directory: String,

    #[envconfig(from = "REPLAY_DLQ_ON_START", default = "false")]
    pub replay_dlq_on_start: bool,

    #[envconfig(from = "CONFIG_OVERRIDES_PATH")]
    pub config_overrides_path: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct SourceConfig {
    #[envconfig(from = "SOURCE_DIRECTORY", default = "./data/incoming")]
    pub directory: NonEmptyString,

    #[envconfig(from = "SOURCE_FILE_PATTERN", default = "*.xml")]
    pub file_pattern: NonEmptyString,

    #[envconfig(from = "SOURCE_POLLING_INTERVAL_MS", default = "30000")]
    pub polling_interval: EnvMsDuration,

    #[envconfig(from = "SOURCE_ENCODING", default = "utf-8")]
    pub encoding: TextEncoding,

    #[envconfig(from = "SOURCE_MAX_FILE_SIZE_MB", default = "100")]
    pub max_file_size_mb: u64,

    /// Only top-level elements with this name are decoded as records. Any name if unset.
    #[envconfig(from = "SOURCE_RECORD_TAG")]
    pub record_tag: Option<NonEmptyString>,
}

#[derive(Envconfig, Clone)]
pub struct ProcessingConfig {
    #[envconfig(from = "BATCH_SIZE", default = "50")]
    pub batch_size: usize,

    #[envconfig(from = "MAX_CONCURRENT_BATCHES", default = "4")]
    pub max_concurrent_batches: usize,

    #[envconfig(from = "MAX_EVENTS_PER_FILE", default = "10000")]
    pub max_events_per_file: usize,

    #[envconfig(from = "BATCH_CHANNEL_CAPACITY", default = "1000")]
    pub batch_channel_capacity: usize,
}

#[derive(Envconfig, Clone)]
pub struct RetryConfig {
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_INITIAL_DELAY_MS", default = "1000")]
    pub initial_delay: EnvMsDuration,

    #[envconfig(from = "RETRY_MAX_DELAY_MS", default = "16000")]
    pub max_delay: EnvMsDuration,

    #[envconfig(from = "RETRY_BACKOFF_MULTIPLIER", default = "2")]
    pub backoff_multiplier: f64,

    #[envconfig(from = "RETRY_JITTER_FACTOR", default = "0.2")]
    pub jitter_factor: f64,

    #[envconfig(from = "RETRYABLE_STATUS_CODES", default = "429,500,502,503,504")]
    pub retryable_status_codes: CommaSeparated<u16>,

    #[envconfig(
        from = "RETRYABLE_ERROR_CODES",
        default = "ECONNREFUSED,ETIMEDOUT,ENOTFOUND,EAI_AGAIN"
    )]
    pub retryable_error_codes: CommaSeparated<String>,
}

#[derive(Envconfig, Clone)]
pub struct CircuitBreakerEnvConfig {
    #[envconfig(from = "CIRCUIT_FAILURE_THRESHOLD", default = "10")]
    pub failure_threshold: u32,

    #[envconfig(from = "CIRCUIT_SUCCESS_THRESHOLD", default = "3")]
    pub success_threshold: u32,

    #[envconfig(from = "CIRCUIT_TIMEOUT_MS", default = "60000")]
    pub timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct DlqConfig {
    #[envconfig(from = "DLQ_DIRECTORY", default = "./data/dlq")]
    pub directory: NonEmptyString,

    #[envconfig(from = "DLQ_FILE_NAME", default = "dlq.jsonl")]
    pub file_name: NonEmptyString,

    #[envconfig(from = "DLQ_MAX_FILE_SIZE_MB", default = "100")]
    pub max_file_size_mb: u64,
}

#[derive(Envconfig, Clone)]
pub struct EndpointConfig {
    #[envconfig(from = "OBM_BASE_URL", default = "http://localhost:8080")]
    pub base_url: NonEmptyString,

    #[envconfig(from = "OBM_EVENT_ENDPOINT", default = "/opr-web/rest/event_list")]
    pub event_endpoint: NonEmptyString,

    #[envconfig(from = "OBM_AUTH_METHOD", default = "basic")]
    pub auth_method: AuthMethod,

    #[envconfig(from = "OBM_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "OBM_PASSWORD")]
    pub password: Option<String>,

    #[envconfig(from = "OBM_API_KEY")]
    pub api_key: Option<String>,

    #[envconfig(from = "OBM_REQUEST_TIMEOUT_MS", default = "30000")]
    pub request_timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the whole configuration and split it into restart-only and reloadable parts.
    pub fn settings(&self) -> Result<(StaticSettings, RuntimeSettings), ConfigError> {
        let source = &self.source;
        let processing = &self.processing;
        let retry = &self.retry;

        if source.polling_interval.0.is_zero() {
            return Err(invalid("SOURCE_POLLING_INTERVAL_MS must be positive"));
        }
        if source.max_file_size_mb == 0 {
            return Err(invalid("SOURCE_MAX_FILE_SIZE_MB must be positive"));
        }
        if let Err(e) = globset::Glob::new(source.file_pattern.as_str()) {
            return Err(invalid(&format!("SOURCE_FILE_PATTERN is not a glob: {e}")));
        }
        if processing.batch_size == 0 {
            return Err(invalid("BATCH_SIZE must be positive"));
        }
        if processing.max_events_per_file == 0 {
            return Err(invalid("MAX_EVENTS_PER_FILE must be positive"));
        }
        if processing.batch_channel_capacity == 0 {
            return Err(invalid("BATCH_CHANNEL_CAPACITY must be positive"));
        }
        if retry.max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS must be positive"));
        }
        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier > 0.0) {
            return Err(invalid("RETRY_BACKOFF_MULTIPLIER must be positive"));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(invalid("RETRY_JITTER_FACTOR must be between 0 and 1"));
        }
        if retry.max_delay.0 < retry.initial_delay.0 {
            return Err(invalid(
                "RETRY_MAX_DELAY_MS must not be below RETRY_INITIAL_DELAY_MS",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(invalid("circuit breaker thresholds must be positive"));
        }
        if self.dlq.max_file_size_mb == 0 {
            return Err(invalid("DLQ_MAX_FILE_SIZE_MB must be positive"));
        }

        let endpoint = self.endpoint.settings()?;

        let static_settings = StaticSettings {
            bind: self.bind(),
            encoding: source.encoding.0,
            record_tag: source.record_tag.as_ref().map(|tag| tag.as_str().to_owned()),
            max_concurrent_batches: processing.max_concurrent_batches,
            batch_channel_capacity: processing.batch_channel_capacity,
            retryable_status_codes: retry.retryable_status_codes.0.clone(),
            retryable_error_codes: retry.retryable_error_codes.0.clone(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.circuit_breaker.failure_threshold,
                success_threshold: self.circuit_breaker.success_threshold,
                timeout: self.circuit_breaker.timeout.0,
            },
            dlq_directory: PathBuf::from(self.dlq.directory.as_str()),
            dlq_file_name: self.dlq.file_name.as_str().to_owned(),
            dlq_max_file_bytes: self.dlq.max_file_size_mb * MEGABYTE,
            endpoint,
            audit_directory: PathBuf::from(&self.audit_directory),
            replay_dlq_on_start: self.replay_dlq_on_start,
        };

        let runtime_settings = RuntimeSettings {
            watch: WatchSettings {
                directory: PathBuf::from(source.directory.as_str()),
                file_pattern: source.file_pattern.as_str().to_owned(),
                polling_interval: source.polling_interval.0,
                max_file_bytes: source.max_file_size_mb * MEGABYTE,
            },
            batch_size: processing.batch_size,
            max_events_per_file: processing.max_events_per_file,
            retry: RetryPolicy::build(retry.max_attempts, retry.initial_delay.0)
                .maximum_interval(retry.max_delay.0)
                .backoff_coefficient(retry.backoff_multiplier)
                .jitter_factor(retry.jitter_factor)
                .provide(),
            alert_rules: self.alert_rules.0.clone(),
        };

        Ok((static_settings, runtime_settings))
    }
}

impl EndpointConfig {
    fn settings(&self) -> Result<EndpointSettings, ConfigError> {
        let base_url = reqwest::Url::parse(self.base_url.as_str())
            .map_err(|e| invalid(&format!("OBM_BASE_URL is not a valid url: {e}")))?;
        let url = base_url
            .join(self.event_endpoint.as_str())
            .map_err(|e| invalid(&format!("OBM_EVENT_ENDPOINT is not a valid path: {e}")))?;

        let auth = match self.auth_method {
            AuthMethod::Basic => match &self.username {
                Some(username) if !username.is_empty() => Auth::Basic {
                    username: username.clone(),
                    password: self.password.clone().unwrap_or_default(),
                },
                _ => return Err(invalid("OBM_USERNAME is required for basic auth")),
            },
            AuthMethod::ApiKey => match &self.api_key {
                Some(key) if !key.is_empty() => Auth::ApiKey(key.clone()),
                _ => return Err(invalid("OBM_API_KEY is required for apikey auth")),
            },
            AuthMethod::None => Auth::None,
        };

        Ok(EndpointSettings {
            url: url.to_string(),
            auth,
            request_timeout: self.request_timeout.0,
        })
    }
}

const MEGABYTE: u64 = 1024 * 1024;

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_owned())
}

/// Settings that only take effect on restart.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticSettings {
    pub bind: String,
    pub encoding: &'static Encoding,
    pub record_tag: Option<String>,
    pub max_concurrent_batches: usize,
    pub batch_channel_capacity: usize,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_error_codes: Vec<String>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dlq_directory: PathBuf,
    pub dlq_file_name: String,
    pub dlq_max_file_bytes: u64,
    pub endpoint: EndpointSettings,
    pub audit_directory: PathBuf,
    pub replay_dlq_on_start: bool,
}

impl StaticSettings {
    /// Names of the settings that differ between `self` and `other`.
    pub fn changed_keys(&self, other: &StaticSettings) -> Vec<String> {
        let mut keys = Vec::new();
        let mut check = |changed: bool, key: &str| {
            if changed {
                keys.push(key.to_owned());
            }
        };

        check(self.bind != other.bind, "BIND_HOST/BIND_PORT");
        check(self.encoding != other.encoding, "SOURCE_ENCODING");
        check(self.record_tag != other.record_tag, "SOURCE_RECORD_TAG");
        check(
            self.max_concurrent_batches != other.max_concurrent_batches,
            "MAX_CONCURRENT_BATCHES",
        );
        check(
            self.batch_channel_capacity != other.batch_channel_capacity,
            "BATCH_CHANNEL_CAPACITY",
        );
        check(
            self.retryable_status_codes != other.retryable_status_codes,
            "RETRYABLE_STATUS_CODES",
        );
        check(
            self.retryable_error_codes != other.retryable_error_codes,
            "RETRYABLE_ERROR_CODES",
        );
        check(
            self.circuit_breaker != other.circuit_breaker,
            "CIRCUIT_BREAKER",
        );
        check(
            self.dlq_directory != other.dlq_directory
                || self.dlq_file_name != other.dlq_file_name
                || self.dlq_max_file_bytes != other.dlq_max_file_bytes,
            "DLQ",
        );
        check(self.endpoint.url != other.endpoint.url, "OBM_BASE_URL/OBM_EVENT_ENDPOINT");
        check(self.endpoint.auth != other.endpoint.auth, "OBM_AUTH");
        check(
            self.endpoint.request_timeout != other.endpoint.request_timeout,
            "OBM_REQUEST_TIMEOUT_MS",
        );
        check(self.audit_directory != other.audit_directory, "AUDIT_DIRECTORY");
        check(
            self.replay_dlq_on_start != other.replay_dlq_on_start,
            "REPLAY_DLQ_ON_START",
        );

        keys
    }
}

#[derive(Clone, PartialEq)]
pub struct EndpointSettings {
    /// Full url events are posted to.
    pub url: String,
    pub auth: Auth,
    pub request_timeout: time::Duration,
}

impl std::fmt::Debug for EndpointSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match self.auth {
            Auth::Basic { .. } => "basic",
            Auth::ApiKey(_) => "apikey",
            Auth::None => "none",
        };
        f.debug_struct("EndpointSettings")
            .field("url", &self.url)
            .field("auth", &auth)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub enum Auth {
    Basic { username: String, password: String },
    ApiKey(String),
    None,
}

/// Settings swapped in place on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub watch: WatchSettings,
    pub batch_size: usize,
    pub max_events_per_file: usize,
    pub retry: RetryPolicy,
    pub alert_rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchSettings {
    pub directory: PathBuf,
    pub file_pattern: String,
    pub polling_interval: time::Duration,
    pub max_file_bytes: u64,
}

/// Holds the validated configuration and publishes reloadable changes.
pub struct ConfigProvider {
    static_settings: StaticSettings,
    runtime: watch::Sender<RuntimeSettings>,
}

impl ConfigProvider {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let (static_settings, runtime_settings) = config.settings()?;
        let (runtime, _) = watch::channel(runtime_settings);
        Ok(Self {
            static_settings,
            runtime,
        })
    }

    pub fn static_settings(&self) -> &StaticSettings {
        &self.static_settings
    }

    pub fn current(&self) -> RuntimeSettings {
        self.runtime.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeSettings> {
        self.runtime.subscribe()
    }

    /// Validate `candidate` and commit its reloadable part. A candidate that fails validation
    /// or touches a restart-only setting is rejected and the current values stay in place.
    /// Returns whether anything changed.
    pub fn reload(&self, candidate: &Config) -> Result<bool, ConfigError> {
        let (static_settings, runtime_settings) = candidate.settings()?;

        let changed = self.static_settings.changed_keys(&static_settings);
        if !changed.is_empty() {
            return Err(ConfigError::RequiresRestart(changed));
        }

        let modified = self.runtime.send_if_modified(|current| {
            if *current == runtime_settings {
                false
            } else {
                *current = runtime_settings;
                true
            }
        });

        if modified {
            info!("configuration reloaded");
        }
        Ok(modified)
    }
}

/// Read the configuration from the process environment, with the `KEY=VALUE` lines of the
/// overrides file (if configured) taking precedence.
pub fn load_config() -> Result<Config, ConfigError> {
    let mut values: HashMap<String, String> = std::env::vars().collect();

    if let Some(path) = values.get(OVERRIDES_PATH_KEY).cloned() {
        let overrides = read_overrides(Path::new(&path))?;
        values.extend(overrides);
    }

    Ok(Config::init_from_hashmap(&values)?)
}

pub fn read_overrides(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|error| ConfigError::Overrides {
        path: path.to_path_buf(),
        error,
    })?;
    Ok(parse_overrides(&contents))
}

fn parse_overrides(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key.trim().to_owned(), value.to_owned())
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A text encoding given by its WHATWG label, e.g. `utf-8`, `utf-16le` or `latin1`.
#[derive(Debug, Clone, Copy)]
pub struct TextEncoding(pub &'static Encoding);

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownEncodingError;

impl FromStr for TextEncoding {
    type Err = UnknownEncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Encoding::for_label(s.trim().as_bytes())
            .map(TextEncoding)
            .ok_or(UnknownEncodingError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    ApiKey,
    None,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownAuthMethodError;

impl FromStr for AuthMethod {
    type Err = UnknownAuthMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "basic" => Ok(AuthMethod::Basic),
            "apikey" => Ok(AuthMethod::ApiKey),
            "none" => Ok(AuthMethod::None),
            _ => Err(UnknownAuthMethodError),
        }
    }
}

/// A comma separated list. Empty items are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct CommaSeparated<T>(pub Vec<T>);

impl<T: FromStr> FromStr for CommaSeparated<T> {
    type Err = T::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(T::from_str)
            .collect::<Result<Vec<T>, T::Err>>()
            .map(CommaSeparated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRules(pub Vec<AlertRule>);

impl FromStr for AlertRules {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map(AlertRules)
    }
}
