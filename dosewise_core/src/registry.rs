//! Decay model registry.
//!
//! Maps each [`SubstanceId`] to its kinetic parameters and defines the
//! single-exponential elimination curve every level computation uses.
//! The registry is built once and never mutated afterwards.

use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;

pub const CAFFEINE: &str = "caffeine";
pub const L_THEANINE: &str = "l_theanine";
pub const WATER: &str = "water";

/// Longest accepted half-life or time to peak, in days
pub const MAX_KINETIC_DAYS: i64 = 365;

/// Cached built-in registry - built once and shared by every engine that
/// does not bring its own substance library
static BUILTIN_REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    substances: builtin_substances(),
});

/// Residual amount of a dose of `amount` taken at `t0`, observed at `t`
///
/// `A · 2^(−(t − t0) / half_life)` from the dose instant onwards, zero before it.
pub fn residual(amount: f64, t0: DateTime<Utc>, t: DateTime<Utc>, half_life: Duration) -> f64 {
    if t < t0 {
        return 0.0;
    }
    let elapsed = (t - t0).num_milliseconds() as f64;
    let half_life = half_life.num_milliseconds() as f64;
    amount * (-elapsed / half_life).exp2()
}

/// Immutable per-substance kinetic configuration
#[derive(Clone, Debug)]
pub struct Registry {
    // Kept in registration order so snapshots come out in a stable order
    substances: Vec<Substance>,
}

impl Registry {
    /// Build a registry, rejecting any invalid substance up front
    pub fn new(substances: Vec<Substance>) -> Result<Self> {
        let registry = Self { substances };
        let errors = registry.validate();
        if !errors.is_empty() {
            return Err(Error::Configuration(errors.join("; ")));
        }
        tracing::debug!("Registered {} substances", registry.len());
        Ok(registry)
    }

    /// The built-in substance library (caffeine, L-theanine, water)
    pub fn builtin() -> Registry {
        BUILTIN_REGISTRY.clone()
    }

    pub fn get(&self, id: &SubstanceId) -> Option<&Substance> {
        self.substances.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &SubstanceId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Substance> {
        self.substances.iter()
    }

    pub fn len(&self) -> usize {
        self.substances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.substances.is_empty()
    }

    /// Look up a substance, failing for unregistered ids
    pub fn substance(&self, id: &SubstanceId) -> Result<&Substance> {
        self.get(id)
            .ok_or_else(|| Error::UnknownSubstance(id.to_string()))
    }

    pub fn half_life(&self, id: &SubstanceId) -> Result<Duration> {
        Ok(self.substance(id)?.half_life)
    }

    /// Residual of a dose of a registered substance
    pub fn residual(
        &self,
        id: &SubstanceId,
        amount: f64,
        t0: DateTime<Utc>,
        t: DateTime<Utc>,
    ) -> Result<f64> {
        Ok(residual(amount, t0, t, self.half_life(id)?))
    }

    /// Longest registered half-life, used to sanity-check the lookback window
    pub fn max_half_life(&self) -> Option<Duration> {
        self.substances.iter().map(|s| s.half_life).max()
    }

    /// Validate the registry for internal consistency
    ///
    /// Returns a list of validation errors (empty if valid).
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (idx, substance) in self.substances.iter().enumerate() {
            let id = &substance.id;
            if id.as_str().trim().is_empty() {
                errors.push(format!("Substance #{} has an empty id", idx));
            }
            let max = Duration::days(MAX_KINETIC_DAYS);
            if substance.half_life <= Duration::zero() {
                errors.push(format!("Substance '{}': half-life must be positive", id));
            } else if substance.half_life > max {
                errors.push(format!(
                    "Substance '{}': half-life exceeds {} days",
                    id, MAX_KINETIC_DAYS
                ));
            }
            if substance.time_to_peak < Duration::zero() {
                errors.push(format!("Substance '{}': time to peak is negative", id));
            } else if substance.time_to_peak > max {
                errors.push(format!(
                    "Substance '{}': time to peak exceeds {} days",
                    id, MAX_KINETIC_DAYS
                ));
            }
            if !(substance.reference_dose.is_finite() && substance.reference_dose > 0.0) {
                errors.push(format!(
                    "Substance '{}': reference dose {} must be positive",
                    id, substance.reference_dose
                ));
            }
            if let Some(threshold) = substance.synergy_threshold {
                if !(threshold.is_finite() && threshold >= 0.0) {
                    errors.push(format!(
                        "Substance '{}': synergy threshold {} must be non-negative",
                        id, threshold
                    ));
                }
            }
            if self.substances[..idx].iter().any(|other| &other.id == id) {
                errors.push(format!("Substance '{}' is registered twice", id));
            }
        }

        errors
    }
}

fn builtin_substances() -> Vec<Substance> {
    vec![
        Substance {
            id: CAFFEINE.into(),
            name: "Caffeine".into(),
            half_life: Duration::hours(5),
            time_to_peak: Duration::minutes(45),
            unit: DoseUnit::Milligrams,
            reference_dose: 95.0,
            synergy_threshold: Some(40.0),
        },
        Substance {
            id: L_THEANINE.into(),
            name: "L-Theanine".into(),
            half_life: Duration::minutes(40),
            time_to_peak: Duration::minutes(50),
            unit: DoseUnit::Milligrams,
            reference_dose: 200.0,
            synergy_threshold: Some(50.0),
        },
        Substance {
            id: WATER.into(),
            name: "Water".into(),
            half_life: Duration::hours(1),
            time_to_peak: Duration::minutes(15),
            unit: DoseUnit::Milliliters,
            reference_dose: 250.0,
            synergy_threshold: None,
        },
    ]
}
