//! Core domain types for the Dosewise system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Substances and their kinetic parameters
//! - Dose events (the only persisted record)
//! - Derived, per-tick snapshots and synergy insights

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Substance Types
// ============================================================================

/// Identifier of a tracked substance kind (e.g. `caffeine`)
///
/// Substances are keyed by string so that new ones can be added through
/// configuration without touching code.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubstanceId(String);

impl SubstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unit a substance amount is displayed in
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DoseUnit {
    #[serde(rename = "mg")]
    Milligrams,
    #[serde(rename = "mcg")]
    Micrograms,
    #[serde(rename = "g")]
    Grams,
    #[serde(rename = "ml")]
    Milliliters,
}

impl DoseUnit {
    pub fn symbol(&self) -> &'static str {
        match self {
            DoseUnit::Milligrams => "mg",
            DoseUnit::Micrograms => "mcg",
            DoseUnit::Grams => "g",
            DoseUnit::Milliliters => "ml",
        }
    }
}

/// Kinetic configuration of a single substance
#[derive(Clone, Debug)]
pub struct Substance {
    pub id: SubstanceId,
    pub name: String,
    /// Elimination half-life; always positive
    pub half_life: Duration,
    /// Advisory only, never used by the decay math
    pub time_to_peak: Duration,
    pub unit: DoseUnit,
    /// "Typical" dose used to normalize levels for display
    pub reference_dose: f64,
    /// Default level a synergy rule requires this substance to exceed
    pub synergy_threshold: Option<f64>,
}

// ============================================================================
// Dose Log Types
// ============================================================================

/// Where a dose entry came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseSource {
    Manual,
    QuickAdd,
    Import,
}

/// A single logged intake of a substance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoseEvent {
    pub id: Uuid,
    pub substance: SubstanceId,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<DoseSource>,
}

impl DoseEvent {
    /// Create a new event with a fresh id
    pub fn new(substance: impl Into<SubstanceId>, amount: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            substance: substance.into(),
            amount,
            timestamp,
            source: None,
        }
    }

    pub fn with_source(mut self, source: DoseSource) -> Self {
        self.source = Some(source);
        self
    }
}

// ============================================================================
// Derived Types
// ============================================================================

/// Active amount of one substance at an instant
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ActiveLevelSnapshot {
    pub substance: SubstanceId,
    pub current_amount: f64,
    pub fraction_of_reference: f64,
    pub last_updated: DateTime<Utc>,
    /// When the most recent dose is expected to peak, if still ahead
    pub expected_peak_at: Option<DateTime<Utc>>,
}

/// Whether an insight is encouraging or a warning
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightTone {
    Beneficial,
    Caution,
}

/// Advisory message produced when a synergy rule fires
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SynergyInsight {
    pub kind: String,
    pub tone: InsightTone,
    pub triggering_substances: Vec<SubstanceId>,
    pub message: String,
}

/// One complete, atomically published recomputation result
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct LevelReport {
    /// Increases by one on every publish
    pub generation: u64,
    pub computed_at: DateTime<Utc>,
    pub snapshots: Vec<ActiveLevelSnapshot>,
    pub insights: Vec<SynergyInsight>,
}

impl LevelReport {
    /// Snapshot for a given substance, if it is registered
    pub fn snapshot(&self, id: &SubstanceId) -> Option<&ActiveLevelSnapshot> {
        self.snapshots.iter().find(|s| &s.substance == id)
    }

    /// Whether an insight of the given kind is currently active
    pub fn has_insight(&self, kind: &str) -> bool {
        self.insights.iter().any(|i| i.kind == kind)
    }
}
