use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::net::interface::TransportKind;
use crate::scheduler::Priority;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportLinkConfigInput {
    pub version: u32,
    pub transport: Option<String>,
    pub servers: Vec<ServerConfigInput>,
    pub timers: TimerConfigInput,
    pub classifier: ClassifierConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfigInput {
    pub address: String,
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimerConfigInput {
    pub connect_timeout_ms: Option<u64>,
    pub supervision_interval_ms: Option<u64>,
    pub reclassify_interval_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub record_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassifierConfigInput {
    pub min_samples: Option<u64>,
    pub excellent_loss_max: Option<f64>,
    pub good_loss_max: Option<f64>,
    pub fair_loss_max: Option<f64>,
    pub poor_loss_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: SocketAddr,
    pub priority: Priority,
}

/// Periods and deadlines driving the selector and ledger timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// How long an activated server may stay unconnected before it is
    /// degraded to the worst quality.
    pub connect_timeout: Duration,
    pub supervision_interval: Duration,
    pub reclassify_interval: Duration,
    pub sweep_interval: Duration,
    /// Idle time after which a correlation record is evicted.
    pub record_ttl: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            supervision_interval: Duration::from_millis(1000),
            reclassify_interval: Duration::from_millis(2000),
            sweep_interval: Duration::from_millis(5000),
            record_ttl: Duration::from_millis(20_000),
        }
    }
}

/// Loss-ratio buckets for the default quality classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Minimum number of new distinct reports before a verdict is given.
    pub min_samples: u64,
    pub excellent_loss_max: f64,
    pub good_loss_max: f64,
    pub fair_loss_max: f64,
    pub poor_loss_max: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_samples: 4,
            excellent_loss_max: 0.02,
            good_loss_max: 0.05,
            fair_loss_max: 0.15,
            poor_loss_max: 0.40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportLinkConfig {
    pub version: u32,
    pub transport: TransportKind,
    pub servers: Vec<ServerConfig>,
    pub timers: TimerConfig,
    pub classifier: ClassifierConfig,
}

impl Default for ReportLinkConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            transport: TransportKind::default(),
            servers: Vec::new(),
            timers: TimerConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value
        .map(|ms| Duration::from_millis(ms.max(1)))
        .unwrap_or(default)
}

fn ratio_or(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => default,
    }
}

impl ReportLinkConfigInput {
    pub fn resolve(self) -> Result<ReportLinkConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let transport = match self.transport.as_deref().map(str::trim) {
            None | Some("") => TransportKind::default(),
            Some(name) => TransportKind::from_name(name)
                .ok_or_else(|| format!("Unknown transport kind '{}'", name))?,
        };

        let defaults = TimerConfig::default();
        let timers = TimerConfig {
            connect_timeout: millis_or(self.timers.connect_timeout_ms, defaults.connect_timeout),
            supervision_interval: millis_or(
                self.timers.supervision_interval_ms,
                defaults.supervision_interval,
            ),
            reclassify_interval: millis_or(
                self.timers.reclassify_interval_ms,
                defaults.reclassify_interval,
            ),
            sweep_interval: millis_or(self.timers.sweep_interval_ms, defaults.sweep_interval),
            record_ttl: millis_or(self.timers.record_ttl_ms, defaults.record_ttl),
        };

        let defaults = ClassifierConfig::default();
        let classifier = ClassifierConfig {
            min_samples: self
                .classifier
                .min_samples
                .unwrap_or(defaults.min_samples)
                .max(1),
            excellent_loss_max: ratio_or(
                self.classifier.excellent_loss_max,
                defaults.excellent_loss_max,
            ),
            good_loss_max: ratio_or(self.classifier.good_loss_max, defaults.good_loss_max),
            fair_loss_max: ratio_or(self.classifier.fair_loss_max, defaults.fair_loss_max),
            poor_loss_max: ratio_or(self.classifier.poor_loss_max, defaults.poor_loss_max),
        };
        let buckets = [
            classifier.excellent_loss_max,
            classifier.good_loss_max,
            classifier.fair_loss_max,
            classifier.poor_loss_max,
        ];
        if buckets.windows(2).any(|w| w[0] > w[1]) {
            return Err("Classifier loss thresholds must be non-decreasing".to_string());
        }

        let mut used = HashSet::new();
        let mut servers = Vec::new();
        for server in self.servers {
            let raw = server.address.trim();
            if raw.is_empty() {
                continue;
            }
            let address: SocketAddr = raw
                .parse()
                .map_err(|e| format!("Invalid server address '{}': {}", raw, e))?;
            if !used.insert(address) {
                continue;
            }
            servers.push(ServerConfig {
                address,
                priority: Priority::from_ordinal(server.priority.unwrap_or(0)),
            });
        }

        Ok(ReportLinkConfig {
            version,
            transport,
            servers,
            timers,
            classifier,
        })
    }
}

impl ReportLinkConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ReportLinkConfig::default());
        }
        let parsed: ReportLinkConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            transport = "tcp"

            [[servers]]
            address = "10.0.0.1:7000"
            priority = 3

            [[servers]]
            address = "10.0.0.2:7000"

            [timers]
            connect_timeout_ms = 3000
            record_ttl_ms = 10000

            [classifier]
            min_samples = 8
            good_loss_max = 0.1
        "#;

        let cfg = ReportLinkConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.version, CONFIG_VERSION);
        assert_eq!(cfg.transport, TransportKind::Tcp);
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.servers[0].address, "10.0.0.1:7000".parse().unwrap());
        assert_eq!(cfg.servers[0].priority, Priority::Primary);
        assert_eq!(cfg.servers[1].priority, Priority::Fallback);
        assert_eq!(cfg.timers.connect_timeout, Duration::from_millis(3000));
        assert_eq!(cfg.timers.record_ttl, Duration::from_millis(10_000));
        assert_eq!(cfg.timers.sweep_interval, Duration::from_millis(5000));
        assert_eq!(cfg.classifier.min_samples, 8);
        assert!((cfg.classifier.good_loss_max - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = ReportLinkConfig::from_toml_str("  ").unwrap();
        assert_eq!(cfg.transport, TransportKind::Udp);
        assert!(cfg.servers.is_empty());
        assert_eq!(cfg.timers, TimerConfig::default());
        assert_eq!(cfg.timers.record_ttl, Duration::from_millis(20_000));
    }

    #[test]
    fn parse_toml_config_dedup() {
        let toml = r#"
            [[servers]]
            address = "10.0.0.1:7000"
            priority = 1
            [[servers]]
            address = "10.0.0.1:7000"
            priority = 2
            [[servers]]
            address = "   "
        "#;
        let cfg = ReportLinkConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.servers.len(), 1);
        assert_eq!(cfg.servers[0].priority, Priority::Normal);
    }

    #[test]
    fn rejects_bad_version_and_transport() {
        assert!(ReportLinkConfig::from_toml_str("version = 7").is_err());
        assert!(ReportLinkConfig::from_toml_str("transport = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn rejects_bad_address() {
        let toml = r#"
            [[servers]]
            address = "not-an-address"
        "#;
        let err = ReportLinkConfig::from_toml_str(toml).unwrap_err();
        assert!(err.contains("not-an-address"), "err = {}", err);
    }

    #[test]
    fn rejects_unordered_loss_thresholds() {
        let toml = r#"
            [classifier]
            excellent_loss_max = 0.5
            good_loss_max = 0.1
        "#;
        assert!(ReportLinkConfig::from_toml_str(toml).is_err());
    }
}
