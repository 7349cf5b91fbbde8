//! Synergy insight rules.
//!
//! Rules are plain data: a set of substance requirements and the insight to
//! emit when all of them hold at once. Adding a substance or a synergy is a
//! configuration change; the evaluator never changes.

use crate::registry::{Registry, CAFFEINE, L_THEANINE};
use crate::types::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One substance condition within a rule
///
/// With neither bound set, the substance must exceed its registered
/// synergy threshold.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub substance: SubstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub below: Option<f64>,
}

impl Requirement {
    /// Require the substance to exceed its registered threshold
    pub fn active(substance: impl Into<SubstanceId>) -> Self {
        Self {
            substance: substance.into(),
            above: None,
            below: None,
        }
    }
}

/// A configured synergy: all requirements hold → emit the insight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SynergyRule {
    pub kind: String,
    pub tone: InsightTone,
    pub message: String,
    pub requires: Vec<Requirement>,
}

/// Requirement with its bounds resolved against the registry
#[derive(Clone, Debug)]
struct Condition {
    substance: SubstanceId,
    above: Option<f64>,
    below: Option<f64>,
}

impl Condition {
    fn holds(&self, level: f64) -> bool {
        self.above.map_or(true, |t| level > t) && self.below.map_or(true, |t| level < t)
    }
}

#[derive(Clone, Debug)]
struct CompiledRule {
    kind: String,
    tone: InsightTone,
    message: String,
    conditions: Vec<Condition>,
}

/// Stateless evaluator over a snapshot set
#[derive(Clone, Debug)]
pub struct InsightEngine {
    rules: Vec<CompiledRule>,
}

impl InsightEngine {
    /// Validate every rule against the registry and compile the table
    ///
    /// Any problem is a configuration error; there is no partially valid
    /// rule table.
    pub fn new(rules: Vec<SynergyRule>, registry: &Registry) -> Result<Self> {
        let mut errors = Vec::new();
        let mut kinds = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            if !kinds.insert(rule.kind.clone()) {
                errors.push(format!("Rule '{}' is defined twice", rule.kind));
            }
            if rule.requires.is_empty() {
                errors.push(format!("Rule '{}' has no requirements", rule.kind));
            }

            let mut conditions = Vec::with_capacity(rule.requires.len());
            for req in &rule.requires {
                let Some(substance) = registry.get(&req.substance) else {
                    errors.push(format!(
                        "Rule '{}' references unregistered substance '{}'",
                        rule.kind, req.substance
                    ));
                    continue;
                };

                for bound in [req.above, req.below].into_iter().flatten() {
                    if !(bound.is_finite() && bound >= 0.0) {
                        errors.push(format!(
                            "Rule '{}': bound {} for '{}' must be non-negative",
                            rule.kind, bound, req.substance
                        ));
                    }
                }

                let above = match (req.above, req.below) {
                    (None, None) => match substance.synergy_threshold {
                        Some(threshold) => Some(threshold),
                        None => {
                            errors.push(format!(
                                "Rule '{}': '{}' has no synergy threshold and the rule gives no bound",
                                rule.kind, req.substance
                            ));
                            None
                        }
                    },
                    (above, _) => above,
                };

                conditions.push(Condition {
                    substance: req.substance.clone(),
                    above,
                    below: req.below,
                });
            }

            compiled.push(CompiledRule {
                kind: rule.kind,
                tone: rule.tone,
                message: rule.message,
                conditions,
            });
        }

        if !errors.is_empty() {
            return Err(Error::Configuration(errors.join("; ")));
        }

        tracing::debug!("Compiled {} synergy rules", compiled.len());
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Insights whose rules hold for the given snapshots, in rule order
    ///
    /// A substance without a snapshot counts as a level of zero.
    pub fn evaluate(&self, snapshots: &[ActiveLevelSnapshot]) -> Vec<SynergyInsight> {
        let level_of = |id: &SubstanceId| {
            snapshots
                .iter()
                .find(|s| &s.substance == id)
                .map_or(0.0, |s| s.current_amount)
        };

        self.rules
            .iter()
            .filter(|rule| {
                rule.conditions
                    .iter()
                    .all(|c| c.holds(level_of(&c.substance)))
            })
            .map(|rule| SynergyInsight {
                kind: rule.kind.clone(),
                tone: rule.tone,
                triggering_substances: rule
                    .conditions
                    .iter()
                    .map(|c| c.substance.clone())
                    .collect(),
                message: rule.message.clone(),
            })
            .collect()
    }
}

/// The default rule table
pub fn builtin_rules() -> Vec<SynergyRule> {
    vec![SynergyRule {
        kind: "caffeine_theanine_synergy".into(),
        tone: InsightTone::Beneficial,
        message: "Caffeine and L-Theanine are both active: calm, focused alertness \
                  with fewer jitters."
            .into(),
        requires: vec![Requirement::active(CAFFEINE), Requirement::active(L_THEANINE)],
    }]
}
