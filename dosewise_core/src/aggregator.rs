//! Level aggregation over the dose log.
//!
//! The active level of a substance at an instant is the sum of the decayed
//! residuals of every dose of it taken within the lookback window up to that
//! instant. The decay model is linear, so overlapping doses simply add.
//!
//! Values are kept at full floating-point precision here; rounding only
//! happens when the facade formats them for display.

use crate::registry::{residual, Registry};
use crate::store::{DoseLog, DoseStore};
use crate::{ActiveLevelSnapshot, Error, Result, Substance, SubstanceId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Upper bound on samples returned by [`LevelAggregator::project`]
const MAX_PROJECTION_SAMPLES: i64 = 10_000;

/// Minimum number of half-lives the lookback window should span
const MIN_WINDOW_HALF_LIVES: i32 = 4;

/// Longest accepted lookback window, in days
pub const MAX_LOOKBACK_DAYS: i64 = 366;

/// Computes active levels from the dose log and the decay registry
#[derive(Clone, Debug)]
pub struct LevelAggregator {
    registry: Arc<Registry>,
    lookback: Duration,
}

impl LevelAggregator {
    pub fn new(registry: Arc<Registry>, lookback: Duration) -> Result<Self> {
        if lookback <= Duration::zero() {
            return Err(Error::Configuration(
                "lookback window must be positive".into(),
            ));
        }
        if lookback > Duration::days(MAX_LOOKBACK_DAYS) {
            return Err(Error::Configuration(format!(
                "lookback window must not exceed {} days",
                MAX_LOOKBACK_DAYS
            )));
        }

        if let Some(max_half_life) = registry.max_half_life() {
            if lookback < max_half_life * MIN_WINDOW_HALF_LIVES {
                tracing::warn!(
                    "Lookback window of {} minutes is short for a half-life of {} minutes; \
                     older doses will be dropped while still measurable",
                    lookback.num_minutes(),
                    max_half_life.num_minutes()
                );
            }
        }

        Ok(Self { registry, lookback })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Summed residual of all doses of `id` in `[at - lookback, at]`
    pub fn active_level<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        id: &SubstanceId,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let substance = self.registry.substance(id)?;
        Ok(self.sum_residuals(log, substance, at))
    }

    /// Active level normalized by the substance's reference dose
    ///
    /// Exceeds 1.0 when doses overlap.
    pub fn fraction_of_reference<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        id: &SubstanceId,
        at: DateTime<Utc>,
    ) -> Result<f64> {
        let substance = self.registry.substance(id)?;
        Ok(self.sum_residuals(log, substance, at) / substance.reference_dose)
    }

    /// Snapshot of a single substance
    pub fn snapshot<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        id: &SubstanceId,
        at: DateTime<Utc>,
    ) -> Result<ActiveLevelSnapshot> {
        let substance = self.registry.substance(id)?;
        Ok(self.build_snapshot(log, substance, at))
    }

    /// Snapshots for every registered substance, in registry order
    pub fn snapshot_all<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        at: DateTime<Utc>,
    ) -> Vec<ActiveLevelSnapshot> {
        self.registry
            .iter()
            .map(|substance| self.build_snapshot(log, substance, at))
            .collect()
    }

    /// How long until the level of `id` drops to `threshold`, assuming no
    /// further doses
    ///
    /// Every dose of a substance decays with the same half-life, so the sum
    /// does too: `t = H · log2(level / threshold)`. Returns `Some(0)` when the
    /// level is already at or below the threshold, and `None` when it can
    /// never get there (a non-positive threshold with a positive level).
    pub fn time_until_below<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        id: &SubstanceId,
        at: DateTime<Utc>,
        threshold: f64,
    ) -> Result<Option<Duration>> {
        let substance = self.registry.substance(id)?;
        let level = self.sum_residuals(log, substance, at);

        if level <= threshold {
            return Ok(Some(Duration::zero()));
        }
        if threshold <= 0.0 || !threshold.is_finite() {
            return Ok(None);
        }

        let half_life_ms = substance.half_life.num_milliseconds() as f64;
        let wait_ms = half_life_ms * (level / threshold).log2();
        Ok(Some(Duration::milliseconds(wait_ms.ceil() as i64)))
    }

    /// Sampled level curve of `id` from `from` to `from + horizon`
    ///
    /// Doses logged inside the horizon are included at their timestamps.
    pub fn project<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        id: &SubstanceId,
        from: DateTime<Utc>,
        horizon: Duration,
        step: Duration,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        let substance = self.registry.substance(id)?;
        if step.num_milliseconds() <= 0 {
            return Err(Error::Validation(
                "projection step must be at least one millisecond".into(),
            ));
        }
        if horizon < Duration::zero() {
            return Err(Error::Validation("projection horizon must not be negative".into()));
        }

        let steps = horizon.num_milliseconds() / step.num_milliseconds();
        if steps >= MAX_PROJECTION_SAMPLES {
            return Err(Error::Validation(format!(
                "projection would produce more than {} samples",
                MAX_PROJECTION_SAMPLES
            )));
        }

        (0..=steps)
            .map(|i| -> Result<(DateTime<Utc>, f64)> {
                let t = step
                    .checked_mul(i as i32)
                    .and_then(|offset| from.checked_add_signed(offset))
                    .ok_or_else(|| {
                        Error::Validation("projection runs past the representable time range".into())
                    })?;
                Ok((t, self.sum_residuals(log, substance, t)))
            })
            .collect()
    }

    fn build_snapshot<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        substance: &Substance,
        at: DateTime<Utc>,
    ) -> ActiveLevelSnapshot {
        let current_amount = self.sum_residuals(log, substance, at);

        // Advisory only: when the newest dose should be at its strongest
        let expected_peak_at = self
            .window(log, substance, at)
            .filter(|e| e.amount > 0.0)
            .last()
            .and_then(|e| e.timestamp.checked_add_signed(substance.time_to_peak))
            .filter(|peak| *peak > at);

        ActiveLevelSnapshot {
            substance: substance.id.clone(),
            current_amount,
            fraction_of_reference: current_amount / substance.reference_dose,
            last_updated: at,
            expected_peak_at,
        }
    }

    fn window<'a, S: DoseStore>(
        &self,
        log: &'a DoseLog<S>,
        substance: &'a Substance,
        at: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a crate::DoseEvent> + 'a {
        let from = at
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        log.events_between(from, at)
            .filter(move |e| e.substance == substance.id)
    }

    fn sum_residuals<S: DoseStore>(
        &self,
        log: &DoseLog<S>,
        substance: &Substance,
        at: DateTime<Utc>,
    ) -> f64 {
        let total: f64 = self
            .window(log, substance, at)
            .map(|e| residual(e.amount, e.timestamp, at, substance.half_life))
            .sum();

        if total.is_finite() {
            total
        } else {
            tracing::warn!(
                "Non-finite level computed for {} at {}; reporting zero",
                substance.id,
                at
            );
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CAFFEINE, L_THEANINE, WATER};
    use crate::store::MemoryDoseStore;
    use crate::DoseEvent;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()
    }

    fn setup() -> (LevelAggregator, DoseLog<MemoryDoseStore>) {
        let registry = Arc::new(Registry::builtin());
        let log = DoseLog::open(MemoryDoseStore::new(), registry.clone()).unwrap();
        let aggregator = LevelAggregator::new(registry, Duration::hours(24)).unwrap();
        (aggregator, log)
    }

    fn assert_close(actual: f64, expected: f64, tolerance: f64) {
        assert!(
            (actual - expected).abs() < tolerance,
            "expected {} ± {}, got {}",
            expected,
            tolerance,
            actual
        );
    }

    #[test]
    fn test_scenario_caffeine_half_life() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();

        let level = agg
            .active_level(&log, &CAFFEINE.into(), t0() + Duration::hours(5))
            .unwrap();
        assert_close(level, 47.5, 1e-9);

        let level = agg
            .active_level(&log, &CAFFEINE.into(), t0() + Duration::hours(10))
            .unwrap();
        assert_close(level, 23.75, 1e-9);
    }

    #[test]
    fn test_scenario_theanine_half_life() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(L_THEANINE, 200.0, t0())).unwrap();

        let level = agg
            .active_level(&log, &L_THEANINE.into(), t0() + Duration::minutes(40))
            .unwrap();
        assert_close(level, 100.0, 1e-9);
    }

    #[test]
    fn test_scenario_water_half_hour() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(WATER, 250.0, t0())).unwrap();

        let level = agg
            .active_level(&log, &WATER.into(), t0() + Duration::minutes(30))
            .unwrap();
        assert_close(level, 176.78, 0.01);
    }

    #[test]
    fn test_dose_in_future_contributes_nothing() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();

        let level = agg
            .active_level(&log, &CAFFEINE.into(), t0() - Duration::minutes(1))
            .unwrap();
        assert_eq!(level, 0.0);
    }

    #[test]
    fn test_no_doses_is_zero() {
        let (agg, log) = setup();
        let level = agg.active_level(&log, &WATER.into(), t0()).unwrap();
        assert_eq!(level, 0.0);
    }

    #[test]
    fn test_overlapping_doses_add() {
        let (agg, mut log) = setup();
        let t1 = t0() + Duration::hours(2);
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();
        log.append(DoseEvent::new(CAFFEINE, 60.0, t1)).unwrap();

        let at = t0() + Duration::hours(3);
        let h = Duration::hours(5);
        let expected = residual(95.0, t0(), at, h) + residual(60.0, t1, at, h);

        let level = agg.active_level(&log, &CAFFEINE.into(), at).unwrap();
        assert_close(level, expected, 1e-9);

        let fraction = agg.fraction_of_reference(&log, &CAFFEINE.into(), at).unwrap();
        assert!(fraction > 1.0);
    }

    #[test]
    fn test_simultaneous_doses_sum() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(WATER, 250.0, t0())).unwrap();
        log.append(DoseEvent::new(WATER, 250.0, t0())).unwrap();

        let level = agg
            .active_level(&log, &WATER.into(), t0() + Duration::hours(1))
            .unwrap();
        assert_close(level, 250.0, 1e-9);
    }

    #[test]
    fn test_level_never_increases_without_new_doses() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();
        log.append(DoseEvent::new(CAFFEINE, 50.0, t0() + Duration::minutes(30)))
            .unwrap();

        let start = t0() + Duration::minutes(30);
        let mut previous = f64::INFINITY;
        for minutes in (0..600).step_by(7) {
            let level = agg
                .active_level(&log, &CAFFEINE.into(), start + Duration::minutes(minutes))
                .unwrap();
            assert!(level <= previous, "level rose to {} after {}m", level, minutes);
            previous = level;
        }
    }

    #[test]
    fn test_lookback_excludes_old_doses() {
        let registry = Arc::new(Registry::builtin());
        let mut log = DoseLog::open(MemoryDoseStore::new(), registry.clone()).unwrap();
        let agg = LevelAggregator::new(registry, Duration::hours(1)).unwrap();

        log.append(DoseEvent::new(WATER, 250.0, t0())).unwrap();
        let level = agg
            .active_level(&log, &WATER.into(), t0() + Duration::minutes(61))
            .unwrap();
        assert_eq!(level, 0.0);
    }

    #[test]
    fn test_unknown_substance_is_an_error() {
        let (agg, log) = setup();
        let err = agg.active_level(&log, &"nicotine".into(), t0()).unwrap_err();
        assert!(matches!(err, Error::UnknownSubstance(_)));
    }

    #[test]
    fn test_rejects_non_positive_lookback() {
        let err = LevelAggregator::new(Arc::new(Registry::builtin()), Duration::zero()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rejects_oversized_lookback() {
        let err = LevelAggregator::new(
            Arc::new(Registry::builtin()),
            Duration::days(MAX_LOOKBACK_DAYS + 1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_window_near_start_of_time() {
        let (agg, log) = setup();
        let level = agg
            .active_level(&log, &WATER.into(), DateTime::<Utc>::MIN_UTC)
            .unwrap();
        assert_eq!(level, 0.0);
    }

    #[test]
    fn test_snapshot_all_covers_registry() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();

        let snapshots = agg.snapshot_all(&log, t0() + Duration::minutes(10));
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].substance, CAFFEINE.into());
        assert!(snapshots[0].current_amount > 0.0);
        assert_eq!(
            snapshots[0].expected_peak_at,
            Some(t0() + Duration::minutes(45))
        );
        assert_eq!(snapshots[2].current_amount, 0.0);
        assert_eq!(snapshots[2].expected_peak_at, None);
    }

    #[test]
    fn test_peak_time_disappears_once_passed() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 95.0, t0())).unwrap();

        let snapshot = agg
            .snapshot(&log, &CAFFEINE.into(), t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(snapshot.expected_peak_at, None);
    }

    #[test]
    fn test_time_until_below() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(CAFFEINE, 100.0, t0())).unwrap();

        let wait = agg
            .time_until_below(&log, &CAFFEINE.into(), t0(), 25.0)
            .unwrap()
            .unwrap();
        // Two half-lives
        assert!((wait - Duration::hours(10)).num_milliseconds().abs() <= 1);

        let already = agg
            .time_until_below(&log, &CAFFEINE.into(), t0(), 150.0)
            .unwrap();
        assert_eq!(already, Some(Duration::zero()));

        let never = agg
            .time_until_below(&log, &CAFFEINE.into(), t0(), 0.0)
            .unwrap();
        assert_eq!(never, None);
    }

    #[test]
    fn test_project_samples_curve() {
        let (agg, mut log) = setup();
        log.append(DoseEvent::new(WATER, 250.0, t0())).unwrap();

        let curve = agg
            .project(&log, &WATER.into(), t0(), Duration::hours(2), Duration::hours(1))
            .unwrap();
        assert_eq!(curve.len(), 3);
        assert_close(curve[0].1, 250.0, 1e-9);
        assert_close(curve[1].1, 125.0, 1e-9);
        assert_close(curve[2].1, 62.5, 1e-9);

        assert!(agg
            .project(&log, &WATER.into(), t0(), Duration::hours(2), Duration::zero())
            .is_err());
        assert!(matches!(
            agg.project(
                &log,
                &WATER.into(),
                t0(),
                Duration::hours(1),
                Duration::microseconds(500)
            ),
            Err(Error::Validation(_))
        ));
    }
}
