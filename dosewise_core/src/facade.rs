//! Query surface for the presentation layer.
//!
//! Reads return the last published [`LevelReport`] without recomputing.
//! The only write, [`Tracker::log_dose`], goes through the engine's
//! serialized path and publishes a fresh report before returning.

use crate::scheduler::Tracker;
use crate::types::*;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

/// A dose prepared for display
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DisplayDose {
    pub id: uuid::Uuid,
    pub substance: SubstanceId,
    pub substance_name: String,
    /// Local wall-clock time, `HH:MM`
    pub time: String,
    /// Rounded amount with unit, e.g. `95 mg`
    pub amount: String,
    pub timestamp: DateTime<Utc>,
}

/// Round an amount for display
///
/// This is the only place amounts are rounded; everything upstream keeps
/// full precision.
pub fn format_amount(value: f64, unit: DoseUnit) -> String {
    let rounded = if value.abs() >= 10.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.1}", value)
    };
    format!("{} {}", rounded, unit.symbol())
}

/// Render a duration as `Xh Ym`
pub fn format_duration(duration: Duration) -> String {
    let minutes = duration.num_minutes().max(0);
    match (minutes / 60, minutes % 60) {
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}

impl Tracker {
    /// The last atomically published report; never triggers recomputation
    pub fn current_snapshots(&self) -> Arc<LevelReport> {
        self.shared.published()
    }

    /// Doses logged since the start of the local day, oldest first
    pub fn todays_log(&self) -> Result<Vec<DisplayDose>> {
        let clock = &self.shared.clock;
        let now = clock.now();
        let cutoff = clock.start_of_local_day(now);
        let offset = clock.local_offset(now);

        let core = self.shared.core.lock();
        let registry = core.log.registry();

        // Doses of substances dropped from the library are left out
        let entries = core
            .log
            .events_since(cutoff)
            .filter_map(|event| {
                let substance = registry.get(&event.substance)?;
                Some(DisplayDose {
                    id: event.id,
                    substance: event.substance.clone(),
                    substance_name: substance.name.clone(),
                    time: event.timestamp.with_timezone(&offset).format("%H:%M").to_string(),
                    amount: format_amount(event.amount, substance.unit),
                    timestamp: event.timestamp,
                })
            })
            .collect();

        Ok(entries)
    }

    /// Validate and durably log a dose, then publish fresh levels
    ///
    /// `at` defaults to the clock's current time. Validation and storage
    /// failures are returned as-is; nothing is retried.
    pub fn log_dose(
        &self,
        substance: &SubstanceId,
        amount: f64,
        at: Option<DateTime<Utc>>,
    ) -> Result<DoseEvent> {
        self.log_dose_with_source(substance, amount, at, DoseSource::Manual)
    }

    pub fn log_dose_with_source(
        &self,
        substance: &SubstanceId,
        amount: f64,
        at: Option<DateTime<Utc>>,
        source: DoseSource,
    ) -> Result<DoseEvent> {
        let timestamp = at.unwrap_or_else(|| self.shared.clock.now());
        let event = DoseEvent::new(substance.clone(), amount, timestamp).with_source(source);

        let mut core = self.shared.core.lock();
        core.log.append(event.clone())?;
        tracing::info!(
            "Logged {} {} at {}",
            event.amount,
            event.substance,
            event.timestamp
        );
        self.shared.publish_locked(&mut core);

        Ok(event)
    }

    /// Append a batch of previously recorded doses and publish once
    ///
    /// Invalid entries, including doses already in the log, are skipped
    /// and logged. Returns how many were appended. A storage failure aborts the batch; earlier entries stay
    /// committed.
    pub fn import(&self, events: Vec<DoseEvent>) -> Result<usize> {
        let mut core = self.shared.core.lock();
        let mut imported = 0;
        let mut outcome = Ok(());

        for event in events {
            let event = DoseEvent {
                source: event.source.or(Some(DoseSource::Import)),
                ..event
            };
            match core.log.append(event) {
                Ok(()) => imported += 1,
                Err(e) if e.is_storage() => {
                    outcome = Err(e);
                    break;
                }
                Err(e) => tracing::warn!("Skipping imported dose: {}", e),
            }
        }

        if imported > 0 {
            self.shared.publish_locked(&mut core);
        }
        tracing::info!("Imported {} doses", imported);
        outcome.map(|_| imported)
    }

    /// Every logged dose, oldest first
    pub fn all_events(&self) -> Vec<DoseEvent> {
        self.shared.core.lock().log.all_events().cloned().collect()
    }

    /// How long until `substance` drops to `threshold` from now, with no
    /// further doses
    pub fn time_until_below(
        &self,
        substance: &SubstanceId,
        threshold: f64,
    ) -> Result<Option<Duration>> {
        let now = self.shared.clock.now();
        let core = self.shared.core.lock();
        core.aggregator
            .time_until_below(&core.log, substance, now, threshold)
    }

    /// Sampled level curve for `substance` from now over `horizon`
    pub fn projection(
        &self,
        substance: &SubstanceId,
        horizon: Duration,
        step: Duration,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let now = self.shared.clock.now();
        let core = self.shared.core.lock();
        core.aggregator
            .project(&core.log, substance, now, horizon, step)
    }
}
