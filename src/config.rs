//! Configuration loading and validation
//!
//! Loading hierarchy: environment > file > defaults. The file is TOML,
//! sectioned by concern; a validation pass runs after overrides and any
//! failure is a configuration error (CLI exit code 3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vsm_channels::{AlgedonicConfig, HedonicConfig};
use vsm_consensus::{ConsensusConfig, ReputationConfig};
use vsm_resilience::{CircuitBreakerConfig, PoolConfig, RateLimiterConfig};

/// Configuration errors (CLI exit code 3)
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("config io error: {0}")]
    Io(String),
    /// File could not be parsed
    #[error("config parse error: {0}")]
    Parse(String),
    /// Values failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Supervisor section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Restarts tolerated inside the window
    pub max_restarts: u32,
    /// Restart window in seconds
    pub restart_window_sec: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_window_sec: 60,
        }
    }
}

/// Algedonic section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgedonicSection {
    /// Pain intensity band start
    pub pain: f64,
    /// Agony intensity cap
    pub agony: f64,
    /// Pleasure signal intensity
    pub pleasure: f64,
    /// Baseline smoothing factor
    pub adaptation_rate: f64,
    /// Baseline update period in milliseconds
    pub adaptation_recovery_ms: u64,
}

impl Default for AlgedonicSection {
    fn default() -> Self {
        Self {
            pain: 0.85,
            agony: 0.95,
            pleasure: 0.90,
            adaptation_rate: 0.1,
            adaptation_recovery_ms: 60_000,
        }
    }
}

/// Variety channel section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Packet capacity per channel
    pub capacity: usize,
    /// Overflow policy; only `drop_oldest` is recognized
    pub overflow_policy: String,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow_policy: "drop_oldest".to_string(),
        }
    }
}

/// Rate limiter section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSection {
    /// Global bucket capacity
    pub bucket_size: f64,
    /// Tokens per second
    pub refill_rate: f64,
    /// Event coalescing interval in milliseconds
    pub refill_interval_ms: u64,
}

impl Default for RateLimiterSection {
    fn default() -> Self {
        Self {
            bucket_size: 1000.0,
            refill_rate: 100.0,
            refill_interval_ms: 100,
        }
    }
}

/// Circuit breaker section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    /// Failures before opening
    pub failure_threshold: u32,
    /// Open-state dwell before probing, in milliseconds
    pub recovery_time_ms: u64,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Concurrent half-open probes
    pub half_open_max: u32,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time_ms: 30_000,
            timeout_ms: 5_000,
            half_open_max: 1,
        }
    }
}

/// Belief consensus section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeliefSection {
    /// Live beliefs per level
    pub max_per_level: usize,
    /// Default TTL in milliseconds
    pub ttl_ms: u64,
    /// Reputation below which a node is quarantined
    pub byzantine_threshold: f64,
}

impl Default for BeliefSection {
    fn default() -> Self {
        Self {
            max_per_level: 100,
            ttl_ms: 3_600_000,
            byzantine_threshold: 0.3,
        }
    }
}

/// One named connection pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Base size
    pub size: usize,
    /// Overflow allowance
    pub overflow: usize,
    /// Health endpoint polled every 30 s
    pub health_check_url: Option<String>,
    /// Breaker overrides for this pool
    pub circuit_breaker: PoolBreakerSection,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: 8,
            overflow: 4,
            health_check_url: None,
            circuit_breaker: PoolBreakerSection::default(),
        }
    }
}

/// Breaker overrides nested under a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolBreakerSection {
    /// Failures before opening
    pub threshold: u32,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for PoolBreakerSection {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 5_000,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VsmConfig {
    /// Node id override; derived from the hostname when unset
    pub node_id: Option<String>,
    /// Directory for sled-backed state (warm metrics, delta logs)
    pub data_dir: Option<PathBuf>,
    /// Supervisor tuning
    pub vsm: SupervisorSection,
    /// Algedonic tuning
    pub algedonic: AlgedonicSection,
    /// Variety channel tuning
    pub channel: ChannelSection,
    /// Rate limiter tuning
    pub ratelimiter: RateLimiterSection,
    /// Circuit breaker tuning
    pub circuit: CircuitSection,
    /// Belief consensus tuning
    pub belief: BeliefSection,
    /// Named connection pools
    pub pool: HashMap<String, PoolSection>,
}

/// Load configuration from an optional file plus environment overrides
pub fn load_config(path: Option<&Path>) -> Result<VsmConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_from_file(path)?,
        None => VsmConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse one TOML file
pub fn load_from_file(path: &Path) -> Result<VsmConfig, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Apply `VSM_*` environment overrides
pub fn apply_env_overrides(config: &mut VsmConfig) -> Result<(), ConfigError> {
    if let Ok(node_id) = std::env::var("VSM_NODE_ID") {
        config.node_id = Some(node_id);
    }
    if let Ok(dir) = std::env::var("VSM_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }

    let numeric = |name: &str| -> Result<Option<f64>, ConfigError> {
        match std::env::var(name) {
            Ok(v) => v
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ConfigError::Parse(format!("{} = {:?} is not numeric", name, v))),
            Err(_) => Ok(None),
        }
    };

    if let Some(v) = numeric("VSM_MAX_RESTARTS")? {
        config.vsm.max_restarts = v as u32;
    }
    if let Some(v) = numeric("VSM_CHANNEL_CAPACITY")? {
        config.channel.capacity = v as usize;
    }
    if let Some(v) = numeric("VSM_BUCKET_SIZE")? {
        config.ratelimiter.bucket_size = v;
    }
    if let Some(v) = numeric("VSM_ALGEDONIC_PAIN")? {
        config.algedonic.pain = v;
    }
    Ok(())
}

/// Validate value ranges and cross-field consistency
pub fn validate_config(config: &VsmConfig) -> Result<(), ConfigError> {
    let a = &config.algedonic;
    for (name, v) in [
        ("algedonic.pain", a.pain),
        ("algedonic.agony", a.agony),
        ("algedonic.pleasure", a.pleasure),
        ("algedonic.adaptation_rate", a.adaptation_rate),
        ("belief.byzantine_threshold", config.belief.byzantine_threshold),
    ] {
        if !(0.0..=1.0).contains(&v) {
            return Err(ConfigError::Invalid(format!("{} = {} outside [0, 1]", name, v)));
        }
    }
    if a.pain >= a.agony {
        return Err(ConfigError::Invalid(format!(
            "algedonic.pain ({}) must be below algedonic.agony ({})",
            a.pain, a.agony
        )));
    }
    if config.channel.capacity == 0 {
        return Err(ConfigError::Invalid("channel.capacity must be positive".into()));
    }
    if config.channel.overflow_policy != "drop_oldest" {
        return Err(ConfigError::Invalid(format!(
            "channel.overflow_policy {:?} unrecognized (only drop_oldest)",
            config.channel.overflow_policy
        )));
    }
    if config.ratelimiter.bucket_size <= 0.0 || config.ratelimiter.refill_rate < 0.0 {
        return Err(ConfigError::Invalid(
            "ratelimiter bucket_size must be positive and refill_rate non-negative".into(),
        ));
    }
    if config.circuit.failure_threshold == 0 || config.circuit.half_open_max == 0 {
        return Err(ConfigError::Invalid(
            "circuit failure_threshold and half_open_max must be positive".into(),
        ));
    }
    if config.belief.max_per_level == 0 || config.belief.ttl_ms == 0 {
        return Err(ConfigError::Invalid(
            "belief max_per_level and ttl_ms must be positive".into(),
        ));
    }
    for (name, pool) in &config.pool {
        if pool.size == 0 {
            return Err(ConfigError::Invalid(format!("pool.{}.size must be positive", name)));
        }
    }
    Ok(())
}

impl VsmConfig {
    /// Algedonic configuration for the channel
    pub fn algedonic_config(&self) -> AlgedonicConfig {
        AlgedonicConfig {
            hedonic: HedonicConfig {
                pain_intensity: self.algedonic.pain,
                agony_intensity: self.algedonic.agony,
                pleasure_intensity: self.algedonic.pleasure,
                adaptation_rate: self.algedonic.adaptation_rate,
            },
            adaptation_interval: Duration::from_millis(self.algedonic.adaptation_recovery_ms),
            ..AlgedonicConfig::default()
        }
    }

    /// Rate limiter configuration
    pub fn ratelimiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            bucket_size: self.ratelimiter.bucket_size,
            refill_rate: self.ratelimiter.refill_rate,
            refill_interval: Duration::from_millis(self.ratelimiter.refill_interval_ms),
        }
    }

    /// Breaker defaults shared by subsystems
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit.failure_threshold,
            recovery_time: Duration::from_millis(self.circuit.recovery_time_ms),
            timeout: Duration::from_millis(self.circuit.timeout_ms),
            half_open_max: self.circuit.half_open_max,
        }
    }

    /// Consensus configuration
    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            max_per_level: self.belief.max_per_level,
            default_ttl_ms: self.belief.ttl_ms,
            reputation: ReputationConfig {
                byzantine_threshold: self.belief.byzantine_threshold,
                ..ReputationConfig::default()
            },
            ..ConsensusConfig::default()
        }
    }

    /// Per-name pool configurations
    pub fn pool_configs(&self) -> Vec<(String, PoolConfig)> {
        self.pool
            .iter()
            .map(|(name, section)| {
                (
                    name.clone(),
                    PoolConfig {
                        size: section.size,
                        overflow: section.overflow,
                        health_check_url: section.health_check_url.clone(),
                        breaker: CircuitBreakerConfig {
                            failure_threshold: section.circuit_breaker.threshold,
                            timeout: Duration::from_millis(section.circuit_breaker.timeout_ms),
                            ..self.breaker_config()
                        },
                        ..PoolConfig::default()
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = VsmConfig::default();
        validate_config(&config).unwrap();
        assert_eq!(config.vsm.max_restarts, 10);
        assert_eq!(config.algedonic.pain, 0.85);
        assert_eq!(config.channel.capacity, 1000);
        assert_eq!(config.belief.max_per_level, 100);
    }

    #[test]
    fn test_toml_round_trip() {
        let toml = r#"
            node_id = "node-a"

            [vsm]
            max_restarts = 5
            restart_window_sec = 30

            [algedonic]
            pain = 0.8
            agony = 0.9

            [channel]
            capacity = 500

            [pool.upstream]
            size = 16
            health_check_url = "http://127.0.0.1:8080/health"

            [pool.upstream.circuit_breaker]
            threshold = 3
            timeout_ms = 2000
        "#;
        let config: VsmConfig = toml::from_str(toml).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        assert_eq!(config.vsm.max_restarts, 5);
        assert_eq!(config.algedonic.pain, 0.8);
        // Unset keys fall back to defaults
        assert_eq!(config.algedonic.pleasure, 0.90);
        assert_eq!(config.channel.capacity, 500);

        let pools = config.pool_configs();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].1.size, 16);
        assert_eq!(pools[0].1.breaker.failure_threshold, 3);
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vsm.toml");
        std::fs::write(&path, "[ratelimiter]\nbucket_size = 50.0\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.ratelimiter.bucket_size, 50.0);
        assert_eq!(config.vsm.max_restarts, 10);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let err = load_from_file(Path::new("/nonexistent/vsm.toml"));
        assert!(matches!(err, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_pain_must_stay_below_agony() {
        let mut config = VsmConfig::default();
        config.algedonic.pain = 0.97;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_overflow_policy_is_rejected() {
        let mut config = VsmConfig::default();
        config.channel.overflow_policy = "drop_newest".to_string();
        assert!(validate_config(&config).is_err());
    }
}
