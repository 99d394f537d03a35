use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Breaker tuning applied to every service unless overridden per service.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Backend services keyed by service id (the `{serviceId}` path segment).
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// One backend service: where it lives and how long a call may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,

    /// Per-call deadline in milliseconds. `0` means "use the default".
    #[serde(default = "default_service_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerOverride>,
}

impl ServiceConfig {
    pub fn new(url: impl Into<String>, timeout: u64) -> Self {
        Self {
            url: url.into(),
            timeout,
            circuit_breaker: None,
        }
    }

    pub fn timeout_millis(&self) -> u64 {
        if self.timeout == 0 {
            default_service_timeout()
        } else {
            self.timeout
        }
    }
}

fn default_service_timeout() -> u64 {
    5000
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Percent of failed calls in the window at which the breaker trips.
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Number of most recent calls kept in the count-based window.
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: u32,

    /// Samples required before the failure rate is evaluated at all.
    #[serde(default = "default_minimum_calls")]
    pub minimum_calls: u32,

    #[serde(
        default = "default_wait_duration_in_open",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub wait_duration_in_open: Duration,

    /// Trial calls let through in HalfOpen; that many successes close the breaker.
    #[serde(default = "default_permitted_calls_in_half_open")]
    pub permitted_calls_in_half_open: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: default_failure_rate_threshold(),
            sliding_window_size: default_sliding_window_size(),
            minimum_calls: default_minimum_calls(),
            wait_duration_in_open: default_wait_duration_in_open(),
            permitted_calls_in_half_open: default_permitted_calls_in_half_open(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Layer a per-service override on top of these values.
    pub fn with_override(&self, ov: &CircuitBreakerOverride) -> Self {
        Self {
            failure_rate_threshold: ov
                .failure_rate_threshold
                .unwrap_or(self.failure_rate_threshold),
            sliding_window_size: ov.sliding_window_size.unwrap_or(self.sliding_window_size),
            minimum_calls: ov.minimum_calls.unwrap_or(self.minimum_calls),
            wait_duration_in_open: ov.wait_duration_in_open.unwrap_or(self.wait_duration_in_open),
            permitted_calls_in_half_open: ov
                .permitted_calls_in_half_open
                .unwrap_or(self.permitted_calls_in_half_open),
        }
    }
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_sliding_window_size() -> u32 {
    10
}

fn default_minimum_calls() -> u32 {
    5
}

fn default_wait_duration_in_open() -> Duration {
    Duration::from_secs(30)
}

fn default_permitted_calls_in_half_open() -> u32 {
    3
}

/// Per-service breaker tuning; unset fields inherit the global values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerOverride {
    #[serde(default)]
    pub failure_rate_threshold: Option<f64>,

    #[serde(default)]
    pub sliding_window_size: Option<u32>,

    #[serde(default)]
    pub minimum_calls: Option<u32>,

    #[serde(
        default,
        serialize_with = "serialize_opt_duration",
        deserialize_with = "deserialize_opt_duration"
    )]
    pub wait_duration_in_open: Option<Duration>,

    #[serde(default)]
    pub permitted_calls_in_half_open: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Request and response bodies are buffered; larger ones are rejected.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

/// Durations are written in humantime form (`"30s"`, `"500ms"`) or as a
/// bare integer number of milliseconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Millis(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            RawDuration::Text(s) => humantime::parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?.into_duration()
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawDuration>::deserialize(deserializer)? {
        Some(raw) => raw.into_duration().map(Some),
        None => Ok(None),
    }
}

fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*d).to_string())
}

fn serialize_opt_duration<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(d) => serialize_duration(d, serializer),
        None => serializer.serialize_none(),
    }
}
