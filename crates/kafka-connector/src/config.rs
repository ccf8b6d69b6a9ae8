//! Connector configuration with layered loading.
//!
//! Sources, later wins: built-in defaults, an optional TOML file with
//! `${VAR}` interpolation, the flat lowercase environment keys understood by
//! earlier connector releases (`broker_host`, `gateway_url`, ...), and finally
//! `CONNECTOR_`-prefixed environment variables.

use figment::{
    providers::{Env, Format, Toml},
    value::{Dict, Map, Value},
    Error as FigmentError, Figment, Metadata, Profile, Provider,
};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConnectorError, ConnectorResult};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "connector.toml";

/// Environment variable overriding the configuration file path.
pub const CONFIG_PATH_ENV: &str = "CONNECTOR_CONFIG";

const LEGACY_ENV_KEYS: &[&str] = &[
    "broker_host",
    "topics",
    "group_id",
    "gateway_url",
    "upstream_timeout",
    "rebuild_interval",
    "print_response",
    "print_response_body",
    "topic_delimiter",
    "asynchronous_invocation",
    "routing",
    "offset_policy",
    "basic_auth",
    "secret_mount_path",
];

const DEFAULT_TOPIC_DELIMITER: &str = ",";

/// Top-level connector configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Comma-separated bootstrap brokers.
    pub broker_host: String,

    /// Subscription whitelist pattern, e.g. `faas-topics.*`.
    pub topics: String,

    /// Consumer group id.
    pub group_id: String,

    /// Base URL of the function gateway.
    pub gateway_url: String,

    /// Timeout for a single function invocation.
    #[serde(deserialize_with = "deserialize_duration")]
    pub upstream_timeout: Duration,

    /// Interval between function registry refreshes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub rebuild_interval: Duration,

    /// Log the status of every invocation.
    #[serde(deserialize_with = "deserialize_flag")]
    pub print_response: bool,

    /// Log the body of every invocation.
    #[serde(deserialize_with = "deserialize_flag")]
    pub print_response_body: bool,

    /// Delimiter between entries of the topic annotation.
    pub topic_delimiter: String,

    /// Invoke functions through the gateway's asynchronous path.
    #[serde(deserialize_with = "deserialize_flag")]
    pub asynchronous_invocation: bool,

    /// Annotation key naming a function's output topic.
    pub writer_annotation: String,

    /// Annotation key naming the topics a function subscribes to.
    pub topic_annotation: String,

    /// How messages are routed to functions.
    pub routing: RoutingMode,

    /// Offset decision when routing or dispatch does not go through.
    pub offset_policy: OffsetPolicy,

    /// Broker-side consumer settings.
    pub consumer: ConsumerSettings,

    /// Response producer settings.
    pub producer: ProducerSettings,

    /// Pause before rewinding a partition after a routing failure.
    #[serde(deserialize_with = "deserialize_duration")]
    pub redeliver_backoff: Duration,

    /// Time to wait for in-flight dispatches during shutdown.
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,

    /// Upper bound on detached dispatches running at once. The consumer
    /// loop waits for a free slot before starting another one.
    pub max_in_flight: usize,

    /// Read gateway basic-auth credentials from `secret_mount_path`.
    #[serde(deserialize_with = "deserialize_flag")]
    pub basic_auth: bool,

    /// Directory holding `basic-auth-user` and `basic-auth-password`.
    pub secret_mount_path: PathBuf,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            broker_host: "kafka:9092".to_owned(),
            topics: "faas-topics.*".to_owned(),
            group_id: "faas-kafka-queue-workers".to_owned(),
            gateway_url: "http://gateway:8080".to_owned(),
            upstream_timeout: Duration::from_secs(30),
            rebuild_interval: Duration::from_secs(3),
            print_response: false,
            print_response_body: false,
            topic_delimiter: DEFAULT_TOPIC_DELIMITER.to_owned(),
            asynchronous_invocation: false,
            writer_annotation: "writer".to_owned(),
            topic_annotation: "topic".to_owned(),
            routing: RoutingMode::default(),
            offset_policy: OffsetPolicy::default(),
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
            redeliver_backoff: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
            max_in_flight: 256,
            basic_auth: false,
            secret_mount_path: PathBuf::from("/var/secrets/"),
        }
    }
}

/// Routing strategy selecting which functions receive a message.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Only functions whose topic annotation matches the message topic.
    #[default]
    Declared,
    /// Every known function receives every whitelisted message.
    MatchAll,
}

/// Offset decision policy for the consumer loop.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OffsetPolicy {
    /// Commit as soon as dispatch has started, even when nothing matched.
    #[default]
    FireAndForget,
    /// Commit once every matched invocation has been attempted; seek back
    /// and redeliver when nothing matched.
    RetryOnRedeliver,
}

/// Consumer group settings passed to the broker client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Group session timeout.
    #[serde(deserialize_with = "deserialize_duration")]
    pub session_timeout: Duration,

    /// Group heartbeat interval.
    #[serde(deserialize_with = "deserialize_duration")]
    pub heartbeat_interval: Duration,

    /// Where a new group starts reading (`latest` or `earliest`).
    pub initial_offset: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(6),
            heartbeat_interval: Duration::from_secs(2),
            initial_offset: "latest".to_owned(),
        }
    }
}

/// Settings for the short-lived response producers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Maximum send retries.
    pub retries: u32,

    /// How long to wait for the delivery acknowledgement.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Required acknowledgements (`all`, `1`, `0`).
    pub acks: String,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            retries: 2,
            timeout: Duration::from_secs(10),
            acks: "all".to_owned(),
        }
    }
}

impl ConnectorConfig {
    /// Loads configuration from the file named by `CONNECTOR_CONFIG` (or
    /// `connector.toml`) and the environment.
    pub fn load() -> ConnectorResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from);
        Self::load_from(path)
    }

    /// Loads configuration from the given file path (if present) and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(InterpolatingToml::file(path)?);
        }

        let figment = figment
            .merge(Env::raw().only(LEGACY_ENV_KEYS))
            .merge(Env::prefixed("CONNECTOR_").split("__"));

        Self::from_figment(&figment)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> ConnectorResult<Self> {
        Self::from_figment(&Figment::new().merge(InterpolatingToml::string(content)))
    }

    fn from_figment(figment: &Figment) -> ConnectorResult<Self> {
        let config: Self = figment.extract()?;
        config.normalised()
    }

    fn normalised(mut self) -> ConnectorResult<Self> {
        if self.topic_delimiter.is_empty() {
            self.topic_delimiter = DEFAULT_TOPIC_DELIMITER.to_owned();
        }
        self.gateway_url = self.gateway_url.trim_end_matches('/').to_owned();

        if self.broker_host.trim().is_empty() {
            return Err(ConnectorError::config("broker_host must not be empty"));
        }
        if self.topics.trim().is_empty() {
            return Err(ConnectorError::config("topics pattern must not be empty"));
        }
        if self.rebuild_interval.is_zero() {
            return Err(ConnectorError::config("rebuild_interval must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(ConnectorError::config("max_in_flight must be positive"));
        }
        Ok(self)
    }

    /// Broker list in the form librdkafka expects.
    pub fn brokers(&self) -> String {
        self.broker_host
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Loads gateway credentials when basic auth is enabled.
    pub fn credentials(&self) -> ConnectorResult<Option<GatewayCredentials>> {
        if !self.basic_auth {
            return Ok(None);
        }
        GatewayCredentials::from_mount(&self.secret_mount_path).map(Some)
    }
}

/// Basic-auth credentials for the function gateway.
#[derive(Clone)]
pub struct GatewayCredentials {
    pub user: String,
    pub password: SecretString,
}

impl std::fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayCredentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl GatewayCredentials {
    /// Reads `basic-auth-user` and `basic-auth-password` from a secret mount.
    pub fn from_mount(dir: &Path) -> ConnectorResult<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .map(|s| s.trim().to_owned())
                .map_err(|e| {
                    ConnectorError::Credentials(format!("unable to read {}: {e}", path.display()))
                })
        };

        Ok(Self {
            user: read("basic-auth-user")?,
            password: SecretString::from(read("basic-auth-password")?),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match DurationValue::deserialize(deserializer)? {
        DurationValue::Seconds(secs) => Ok(Duration::from_secs(secs)),
        DurationValue::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

/// Parses `500ms`, `30s`, `5m`, `1h`, compound `1m30s`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Invalid duration: empty".to_owned());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Invalid duration: {s}"))?;
        if digits == 0 {
            return Err(format!("Invalid duration: {s}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("Invalid duration: {s}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            _ => return Err(format!("Invalid duration: {s}")),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("Invalid duration: {s} is out of range"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match FlagValue::deserialize(deserializer)? {
        FlagValue::Bool(b) => b,
        FlagValue::Int(i) => i == 1,
        FlagValue::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
    })
}

fn interpolate_value(value: Value) -> Value {
    match value {
        Value::String(_, s) => Value::from(interpolate_string(&s)),
        Value::Dict(tag, dict) => Value::Dict(
            tag,
            dict.into_iter()
                .map(|(k, v)| (k, interpolate_value(v)))
                .collect(),
        ),
        Value::Array(tag, arr) => {
            Value::Array(tag, arr.into_iter().map(interpolate_value).collect())
        }
        other => other,
    }
}

fn interpolate_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Ok(val) = std::env::var(&after[..end]) {
                    result.push_str(&val);
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// TOML provider expanding `${VAR_NAME}` inside string values.
pub struct InterpolatingToml {
    content: String,
}

impl InterpolatingToml {
    /// Reads the TOML file at `path`.
    pub fn file(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!("unable to read {}: {e}", path.display()))
        })?;
        Ok(Self { content })
    }

    pub fn string(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Provider for InterpolatingToml {
    fn metadata(&self) -> Metadata {
        Metadata::named("Interpolating TOML")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, FigmentError> {
        Ok(Toml::string(&self.content)
            .data()?
            .into_iter()
            .map(|(profile, dict)| {
                let dict: Dict = dict
                    .into_iter()
                    .map(|(k, v)| (k, interpolate_value(v)))
                    .collect();
                (profile, dict)
            })
            .collect())
    }
}
