use crate::extract::ServiceNameExtractor;
use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for every setting
pub const ENV_PREFIX: &str = "WAKEGATE_";

/// Proxy configuration, from environment variables or a TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listening port
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Inactivity timeout after which an idle group is stopped
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    /// Service name extraction strategy
    pub extractor: ServiceNameExtractor,

    /// Interval between inactivity sweeps (default: 5s)
    #[serde(default = "default_sweep_interval", deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,

    /// Grace period given to containers on stop (default: 5s)
    #[serde(default = "default_stop_timeout", deserialize_with = "deserialize_duration")]
    pub stop_timeout: Duration,

    /// Docker endpoint (`unix:///path` or `tcp://host:port`); falls back to
    /// DOCKER_HOST and the usual socket paths
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(5)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{}'", raw)))
}

/// Parse a duration string like "10m", "1h30m", "1.5h", "45s", "500ms" or "250us".
///
/// Units are `h`, `m`, `s`, `ms`, `us` (or `µs`) and `ns`; each number may
/// carry a fraction. A bare integer is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let (whole, fraction) = match rest[..number_len].split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (&rest[..number_len], ""),
        };
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return None;
        }
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: u128 = match &rest[..unit_len] {
            "h" => 3_600_000_000_000,
            "m" => 60_000_000_000,
            "s" => 1_000_000_000,
            "ms" => 1_000_000,
            "us" | "µs" | "μs" => 1_000,
            "ns" => 1,
            _ => return None,
        };
        rest = &rest[unit_len..];

        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut part = whole.checked_mul(unit_nanos)?;

        // Past 18 places a digit is worth less than a nanosecond for every unit
        let fraction = &fraction[..fraction.len().min(18)];
        if !fraction.is_empty() {
            let numerator: u128 = fraction.parse().ok()?;
            let scale = 10u128.pow(fraction.len() as u32);
            part = part.checked_add(numerator * unit_nanos / scale)?;
        }

        total_nanos = total_nanos.checked_add(part)?;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).ok()?;
    Some(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from `WAKEGATE_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from a key lookup (environment-style names)
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let mut errors = Vec::new();

        let port = match get("PORT") {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    errors.push(format!("{}PORT: invalid port '{}'", ENV_PREFIX, raw));
                    None
                }
            },
            None => {
                errors.push(format!("{}PORT is required", ENV_PREFIX));
                None
            }
        };

        let timeout = match get("TIMEOUT") {
            Some(raw) => match parse_duration(&raw) {
                Some(timeout) => Some(timeout),
                None => {
                    errors.push(format!("{}TIMEOUT: invalid duration '{}'", ENV_PREFIX, raw));
                    None
                }
            },
            None => {
                errors.push(format!("{}TIMEOUT is required", ENV_PREFIX));
                None
            }
        };

        let extractor = match get("SERVICE_NAME_EXTRACTOR") {
            Some(raw) => match raw.parse::<ServiceNameExtractor>() {
                Ok(extractor) => Some(extractor),
                Err(e) => {
                    errors.push(format!("{}SERVICE_NAME_EXTRACTOR: {}", ENV_PREFIX, e));
                    None
                }
            },
            None => {
                errors.push(format!("{}SERVICE_NAME_EXTRACTOR is required", ENV_PREFIX));
                None
            }
        };

        let mut optional_duration = |name: &str, default: Duration| match get(name) {
            Some(raw) => parse_duration(&raw).unwrap_or_else(|| {
                errors.push(format!("{}{}: invalid duration '{}'", ENV_PREFIX, name, raw));
                default
            }),
            None => default,
        };
        let sweep_interval = optional_duration("SWEEP_INTERVAL", default_sweep_interval());
        let stop_timeout = optional_duration("STOP_TIMEOUT", default_stop_timeout());

        let debug = match get("DEBUG") {
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                errors.push(format!("{}DEBUG: invalid boolean '{}'", ENV_PREFIX, raw));
                false
            }),
            None => false,
        };

        let (Some(port), Some(timeout), Some(extractor)) = (port, timeout, extractor) else {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        };
        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        let config = Config {
            port,
            bind: get("BIND").unwrap_or_else(default_bind_address),
            timeout,
            extractor,
            sweep_interval,
            stop_timeout,
            docker_host: get("DOCKER_HOST"),
            debug,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("port must be between 1 and 65535".to_string());
        }
        if self.bind.trim().parse::<IpAddr>().is_err() {
            errors.push(format!("bind address '{}' is not an IP address", self.bind));
        }
        if self.timeout.is_zero() {
            errors.push("timeout must be greater than zero".to_string());
        }
        if self.sweep_interval.is_zero() {
            errors.push("sweep_interval must be greater than zero".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("10m"), Some(Duration::from_secs(600)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m30s250ms"), Some(Duration::from_millis(90_250)));
        assert_eq!(parse_duration(" 30 "), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_duration_fractions_and_small_units() {
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("2.25m"), Some(Duration::from_secs(135)));
        assert_eq!(parse_duration(".5s"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("250us"), Some(Duration::from_micros(250)));
        assert_eq!(parse_duration("250µs"), Some(Duration::from_micros(250)));
        assert_eq!(parse_duration("1500ns"), Some(Duration::from_nanos(1500)));
        assert_eq!(parse_duration("1s1.5ms"), Some(Duration::from_micros(1_001_500)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("ten minutes"), None);
        assert_eq!(parse_duration("10d"), None);
        assert_eq!(parse_duration("1h30"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration(".s"), None);
        assert_eq!(parse_duration("1.2.3s"), None);
        assert_eq!(parse_duration("1.5"), None);
    }

    #[test]
    fn test_from_lookup_minimal() {
        let config = Config::from_lookup(lookup(&[
            ("WAKEGATE_PORT", "8080"),
            ("WAKEGATE_TIMEOUT", "10m"),
            ("WAKEGATE_SERVICE_NAME_EXTRACTOR", "subdomain"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.extractor, ServiceNameExtractor::Subdomain);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
        assert_eq!(config.docker_host, None);
        assert!(!config.debug);
        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn test_from_lookup_full() {
        let config = Config::from_lookup(lookup(&[
            ("WAKEGATE_PORT", "9000"),
            ("WAKEGATE_TIMEOUT", "1h"),
            ("WAKEGATE_SERVICE_NAME_EXTRACTOR", "header"),
            ("WAKEGATE_BIND", "127.0.0.1"),
            ("WAKEGATE_SWEEP_INTERVAL", "500ms"),
            ("WAKEGATE_STOP_TIMEOUT", "20s"),
            ("WAKEGATE_DOCKER_HOST", "unix:///run/docker.sock"),
            ("WAKEGATE_DEBUG", "true"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:9000");
        assert_eq!(config.sweep_interval, Duration::from_millis(500));
        assert_eq!(config.stop_timeout, Duration::from_secs(20));
        assert_eq!(config.docker_host.as_deref(), Some("unix:///run/docker.sock"));
        assert!(config.debug);
    }

    #[test]
    fn test_missing_required_values_are_all_reported() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err().to_string();

        assert!(err.contains("WAKEGATE_PORT is required"));
        assert!(err.contains("WAKEGATE_TIMEOUT is required"));
        assert!(err.contains("WAKEGATE_SERVICE_NAME_EXTRACTOR is required"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("WAKEGATE_PORT", "http"),
            ("WAKEGATE_TIMEOUT", "soon"),
            ("WAKEGATE_SERVICE_NAME_EXTRACTOR", "cookie"),
        ]))
        .unwrap_err()
        .to_string();

        assert!(err.contains("invalid port 'http'"));
        assert!(err.contains("invalid duration 'soon'"));
        assert!(err.contains("unknown service name extractor 'cookie'"));

        let err = Config::from_lookup(lookup(&[
            ("WAKEGATE_PORT", "8080"),
            ("WAKEGATE_TIMEOUT", "10m"),
            ("WAKEGATE_SERVICE_NAME_EXTRACTOR", "path"),
            ("WAKEGATE_SWEEP_INTERVAL", "often"),
        ]))
        .unwrap_err()
        .to_string();
        assert!(err.contains("WAKEGATE_SWEEP_INTERVAL: invalid duration 'often'"));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("WAKEGATE_PORT", "8080"),
            ("WAKEGATE_TIMEOUT", "0s"),
            ("WAKEGATE_SERVICE_NAME_EXTRACTOR", "query"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("timeout must be greater than zero"));
    }

    #[test]
    fn test_parse_toml_config() {
        let toml = r#"
port = 8080
bind = "127.0.0.1"
timeout = "1h30m"
extractor = "path"
stop_timeout = "10s"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.timeout, Duration::from_secs(5400));
        assert_eq!(config.extractor, ServiceNameExtractor::Path);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.stop_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_toml_rejects_bad_duration() {
        let toml = r#"
port = 8080
timeout = "forever"
extractor = "query"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wakegate.toml");
        std::fs::write(&path, "port = 80\ntimeout = \"15m\"\nextractor = \"subdomain\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(900));
        assert_eq!(config.bind_addr().unwrap().port(), 80);
    }
}
