//! Configuration file support for Dosewise.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/dosewise/config.toml`.
//! Everything is supplied once at engine construction and never changes
//! afterwards.

use crate::aggregator::MAX_LOOKBACK_DAYS;
use crate::insight::{builtin_rules, SynergyRule};
use crate::registry::{Registry, MAX_KINETIC_DAYS};
use crate::types::{DoseUnit, Substance, SubstanceId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Substance library; the built-in one when omitted
    #[serde(default = "default_substances")]
    pub substances: Vec<SubstanceConfig>,

    /// Synergy rule table; the built-in one when omitted
    #[serde(default = "builtin_rules")]
    pub rules: Vec<SynergyRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            engine: EngineConfig::default(),
            substances: default_substances(),
            rules: builtin_rules(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Recomputation parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: f64,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lookback_hours: default_lookback_hours(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// A substance as written in the config file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubstanceConfig {
    pub id: SubstanceId,
    pub name: String,
    pub half_life_minutes: f64,
    #[serde(default)]
    pub time_to_peak_minutes: f64,
    pub unit: DoseUnit,
    pub reference_dose: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synergy_threshold: Option<f64>,
}

impl From<&Substance> for SubstanceConfig {
    fn from(s: &Substance) -> Self {
        SubstanceConfig {
            id: s.id.clone(),
            name: s.name.clone(),
            half_life_minutes: s.half_life.num_milliseconds() as f64 / 60_000.0,
            time_to_peak_minutes: s.time_to_peak.num_milliseconds() as f64 / 60_000.0,
            unit: s.unit,
            reference_dose: s.reference_dose,
            synergy_threshold: s.synergy_threshold,
        }
    }
}

impl From<&SubstanceConfig> for Substance {
    fn from(c: &SubstanceConfig) -> Self {
        Substance {
            id: c.id.clone(),
            name: c.name.clone(),
            half_life: minutes(c.half_life_minutes),
            time_to_peak: minutes(c.time_to_peak_minutes),
            unit: c.unit,
            reference_dose: c.reference_dose,
            synergy_threshold: c.synergy_threshold,
        }
    }
}

/// Validated engine timing parameters
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineSettings {
    /// Doses older than this are left out of aggregation
    pub lookback: chrono::Duration,
    /// Period of the observer-driven recomputation tick
    pub tick_interval: std::time::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lookback: chrono::Duration::hours(24),
            tick_interval: std::time::Duration::from_secs(60),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".local/share"))
            .unwrap_or_else(|| PathBuf::from("."))
    });
    base.join("dosewise")
}

fn default_lookback_hours() -> f64 {
    24.0
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_substances() -> Vec<SubstanceConfig> {
    Registry::builtin().iter().map(SubstanceConfig::from).collect()
}

/// Out-of-range values are clamped just past what the registry accepts, so
/// validation reports them instead of the conversion overflowing
fn minutes(value: f64) -> chrono::Duration {
    if value.is_nan() {
        return chrono::Duration::zero();
    }
    let limit = ((MAX_KINETIC_DAYS + 1) * 24 * 60) as f64;
    let clamped = value.clamp(-limit, limit);
    chrono::Duration::milliseconds((clamped * 60_000.0).round() as i64)
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".config"))
                .unwrap_or_else(|| PathBuf::from("."))
        });
        base.join("dosewise").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Location of the durable dose log
    pub fn dose_log_path(&self) -> PathBuf {
        self.data.data_dir.join("doses.jsonl")
    }

    /// Build the (validated) substance registry
    pub fn build_registry(&self) -> Result<Registry> {
        Registry::new(self.substances.iter().map(Substance::from).collect())
    }

    pub fn build_rules(&self) -> Vec<SynergyRule> {
        self.rules.clone()
    }

    /// Validated timing parameters
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let hours = self.engine.lookback_hours;
        if !(hours.is_finite() && hours > 0.0) {
            return Err(Error::Configuration(format!(
                "lookback_hours must be positive, got {}",
                hours
            )));
        }
        let max_hours = (MAX_LOOKBACK_DAYS * 24) as f64;
        if hours > max_hours {
            return Err(Error::Configuration(format!(
                "lookback_hours must not exceed {}, got {}",
                max_hours, hours
            )));
        }
        if self.engine.tick_interval_secs == 0 {
            return Err(Error::Configuration(
                "tick_interval_secs must be positive".into(),
            ));
        }

        Ok(EngineSettings {
            lookback: chrono::Duration::milliseconds((hours * 3_600_000.0).round() as i64),
            tick_interval: std::time::Duration::from_secs(self.engine.tick_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CAFFEINE;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.substances.len(), 3);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.engine_settings().unwrap(), EngineSettings::default());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.engine.lookback_hours, config.engine.lookback_hours);
        assert_eq!(parsed.rules, config.rules);
        let registry = parsed.build_registry().unwrap();
        assert_eq!(
            registry.half_life(&CAFFEINE.into()).unwrap(),
            chrono::Duration::hours(5)
        );
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[engine]
tick_interval_secs = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let settings = config.engine_settings().unwrap();
        assert_eq!(settings.tick_interval, std::time::Duration::from_secs(5));
        assert_eq!(settings.lookback, chrono::Duration::hours(24)); // default
        assert_eq!(config.substances.len(), 3); // default library
    }

    #[test]
    fn test_custom_substance_library() {
        let toml_str = r#"
[[substances]]
id = "creatine"
name = "Creatine"
half_life_minutes = 180
unit = "g"
reference_dose = 5
synergy_threshold = 1

[[rules]]
kind = "creatine_loaded"
tone = "beneficial"
message = "Creatine is active."
requires = [{ substance = "creatine" }]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.half_life(&"creatine".into()).unwrap(),
            chrono::Duration::hours(3)
        );
        assert_eq!(config.rules[0].kind, "creatine_loaded");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::default();
        config.engine.lookback_hours = 0.0;
        assert!(matches!(
            config.engine_settings(),
            Err(Error::Configuration(_))
        ));

        let mut config = Config::default();
        config.engine.tick_interval_secs = 0;
        assert!(config.engine_settings().is_err());
    }

    #[test]
    fn test_huge_lookback_is_configuration_error() {
        let mut config = Config::default();
        config.engine.lookback_hours = 1e12;
        assert!(matches!(
            config.engine_settings(),
            Err(Error::Configuration(_))
        ));

        let clock = std::sync::Arc::new(crate::clock::ManualClock::new(chrono::Utc::now()));
        let result = crate::Tracker::new(
            crate::store::MemoryDoseStore::new(),
            std::sync::Arc::new(Registry::builtin()),
            builtin_rules(),
            EngineSettings {
                lookback: chrono::Duration::days(1_000_000),
                ..EngineSettings::default()
            },
            clock,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_huge_half_life_is_configuration_error() {
        let mut config = Config::default();
        config.substances[0].half_life_minutes = 1e300;
        assert!(matches!(
            config.build_registry(),
            Err(Error::Configuration(ref msg)) if msg.contains("exceeds")
        ));

        let mut config = Config::default();
        config.substances[0].time_to_peak_minutes = f64::INFINITY;
        assert!(config.build_registry().is_err());
    }

    #[test]
    fn test_negative_half_life_rejected() {
        let mut config = Config::default();
        config.substances[0].half_life_minutes = -5.0;
        assert!(config.build_registry().is_err());
    }
}
