pub mod types;


pub use types::*;

use crate::error::GatewayError;
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for breaker tuning and limits. When the file does
    /// not exist, built-in defaults are used, which means no services are
    /// routable until a config file is supplied.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content, path.extension().and_then(|e| e.to_str()))?
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        config.log_services();
        Ok(config)
    }

    /// Parse config text in the format named by `extension`.
    pub fn parse(content: &str, extension: Option<&str>) -> Result<Self> {
        match extension {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        }
    }

    /// Apply environment variable overrides. Service routes are only ever
    /// read from the config file.
    fn apply_env_overrides(&mut self) {
        let cb = &mut self.circuit_breaker;
        if let Some(v) = env_parse::<f64>("GATEWAY_CB_FAILURE_RATE_THRESHOLD") {
            cb.failure_rate_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_CB_SLIDING_WINDOW_SIZE") {
            cb.sliding_window_size = v;
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_CB_MINIMUM_CALLS") {
            cb.minimum_calls = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_CB_WAIT_DURATION_IN_OPEN") {
            match humantime::parse_duration(&v) {
                Ok(d) => cb.wait_duration_in_open = d,
                Err(e) => tracing::warn!(
                    "config: ignoring GATEWAY_CB_WAIT_DURATION_IN_OPEN={}, error={}",
                    v,
                    e
                ),
            }
        }
        if let Some(v) = env_parse::<u32>("GATEWAY_CB_PERMITTED_CALLS_IN_HALF_OPEN") {
            cb.permitted_calls_in_half_open = v;
        }
        if let Some(v) = env_parse::<u64>("GATEWAY_MAX_BODY_BYTES") {
            self.limits.max_body_bytes = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_breaker("circuit_breaker", &self.circuit_breaker)?;

        for (id, service) in &self.services {
            if id.is_empty() {
                return Err(config_error("service with empty id"));
            }
            if id.contains('/') {
                return Err(config_error(format!("service id '{}' must not contain '/'", id)));
            }
            let uri: http::Uri = service.url.parse().map_err(|e| {
                config_error(format!("service '{}' has invalid url '{}': {}", id, service.url, e))
            })?;
            match uri.scheme_str() {
                Some("http") | Some("https") => {}
                _ => {
                    return Err(config_error(format!(
                        "service '{}' url '{}' must use http or https",
                        id, service.url
                    )))
                }
            }
            if uri.authority().is_none() {
                return Err(config_error(format!(
                    "service '{}' url '{}' has no host",
                    id, service.url
                )));
            }
            if let Some(ref ov) = service.circuit_breaker {
                let section = format!("services.{}.circuit_breaker", id);
                validate_breaker(&section, &self.circuit_breaker.with_override(ov))?;
            }
        }

        if self.limits.max_body_bytes == 0 {
            return Err(config_error("limits.max_body_bytes must be at least 1"));
        }
        Ok(())
    }

    /// Breaker settings for one service: global defaults plus its override.
    pub fn breaker_config_for(&self, service_id: &str) -> CircuitBreakerConfig {
        match self
            .services
            .get(service_id)
            .and_then(|s| s.circuit_breaker.as_ref())
        {
            Some(ov) => self.circuit_breaker.with_override(ov),
            None => self.circuit_breaker.clone(),
        }
    }

    fn log_services(&self) {
        tracing::info!(
            services = self.services.len(),
            failure_rate_threshold = self.circuit_breaker.failure_rate_threshold,
            sliding_window_size = self.circuit_breaker.sliding_window_size,
            minimum_calls = self.circuit_breaker.minimum_calls,
            wait_duration_in_open = %humantime::format_duration(self.circuit_breaker.wait_duration_in_open),
            permitted_calls_in_half_open = self.circuit_breaker.permitted_calls_in_half_open,
            "loaded gateway configuration"
        );
        for (id, service) in &self.services {
            tracing::info!(
                "config: service {} -> {}, timeout={}ms",
                id,
                service.url,
                service.timeout_millis()
            );
        }
    }
}

fn validate_breaker(section: &str, cb: &CircuitBreakerConfig) -> Result<()> {
    if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 100.0) {
        return Err(config_error(format!(
            "{}: failure_rate_threshold must be in (0, 100], got {}",
            section, cb.failure_rate_threshold
        )));
    }
    if cb.sliding_window_size == 0 {
        return Err(config_error(format!("{}: sliding_window_size must be at least 1", section)));
    }
    if cb.minimum_calls == 0 {
        return Err(config_error(format!("{}: minimum_calls must be at least 1", section)));
    }
    if cb.permitted_calls_in_half_open == 0 {
        return Err(config_error(format!(
            "{}: permitted_calls_in_half_open must be at least 1",
            section
        )));
    }
    if cb.wait_duration_in_open == Duration::ZERO {
        tracing::warn!(
            "config: {}: wait_duration_in_open is 0, open breakers probe immediately",
            section
        );
    }
    Ok(())
}

fn config_error(msg: impl Into<String>) -> anyhow::Error {
    GatewayError::Config(msg.into()).into()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("config: ignoring unparseable {}={}", key, raw);
            None
        }
    }
}
