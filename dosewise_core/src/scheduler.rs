//! Recomputation scheduling.
//!
//! [`Tracker`] is the engine instance: it owns the dose log, the aggregator
//! and the insight engine behind a single mutex, so log appends and
//! recomputations never interleave. Every recomputation publishes a complete
//! [`LevelReport`] by swapping an `Arc`; readers only ever see whole reports.
//!
//! The periodic tick runs on a background thread only while the tracker is
//! started *and* at least one [`Subscription`] is alive. The first
//! subscriber starts the ticker, the last one to drop cancels it.
//!
//! Each subscriber holds at most one undelivered report: a newer report
//! replaces one that has not been picked up yet.
//!
//! Lock order: core, then observers, then published.

use crate::aggregator::LevelAggregator;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, EngineSettings};
use crate::insight::{InsightEngine, SynergyRule};
use crate::registry::Registry;
use crate::store::{DoseLog, DoseStore, JsonlDoseStore};
use crate::{LevelReport, Result};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Handle to a running engine
///
/// Cloning the handle shares the same engine.
#[derive(Clone)]
pub struct Tracker {
    pub(crate) shared: Arc<Shared>,
}

/// Mutable state, only touched under the core mutex
pub(crate) struct Core {
    pub(crate) log: DoseLog<Box<dyn DoseStore>>,
    pub(crate) aggregator: LevelAggregator,
    insights: InsightEngine,
    generation: u64,
}

pub(crate) struct Shared {
    pub(crate) core: Mutex<Core>,
    published: RwLock<Arc<LevelReport>>,
    observers: Mutex<Observers>,
    pub(crate) clock: Arc<dyn Clock>,
    registry: Arc<Registry>,
    tick_interval: std::time::Duration,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    senders: Vec<Observer>,
    started: bool,
    ticker: Option<Ticker>,
}

/// Publishing end of one subscription's single-slot queue
struct Observer {
    id: u64,
    tx: Sender<Arc<LevelReport>>,
    // Lets the publisher evict a report the subscriber never picked up
    stale: Receiver<Arc<LevelReport>>,
}

impl Observer {
    fn offer(&self, report: Arc<LevelReport>) {
        if let Err(TrySendError::Full(report)) = self.tx.try_send(report) {
            let _ = self.stale.try_recv();
            let _ = self.tx.try_send(report);
        }
    }
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Ticker {
    fn spawn(shared: &Arc<Shared>) -> Option<Ticker> {
        let (stop, stop_rx) = channel::bounded::<()>(1);
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let interval = shared.tick_interval;

        let spawned = thread::Builder::new()
            .name("dosewise-ticker".into())
            .spawn(move || {
                tracing::info!("Ticker started (interval: {:?})", interval);
                let ticks = channel::tick(interval);
                loop {
                    channel::select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticks) -> _ => {
                            let Some(shared) = weak.upgrade() else { break };
                            shared.recompute();
                        }
                    }
                }
                tracing::info!("Ticker stopped");
            });

        match spawned {
            Ok(handle) => Some(Ticker { stop, handle }),
            Err(e) => {
                tracing::error!("Failed to start ticker thread: {}", e);
                None
            }
        }
    }

    /// Stop the thread and wait for it; must not be called with any engine
    /// lock held
    fn cancel(self) {
        let _ = self.stop.send(());
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            tracing::error!("Ticker thread panicked");
        }
    }
}

impl Shared {
    fn recompute(&self) -> Arc<LevelReport> {
        let mut core = self.core.lock();
        self.publish_locked(&mut core)
    }

    /// Recompute every snapshot and insight, then publish atomically
    ///
    /// Caller holds the core lock.
    pub(crate) fn publish_locked(&self, core: &mut Core) -> Arc<LevelReport> {
        let now = self.clock.now();
        let snapshots = core.aggregator.snapshot_all(&core.log, now);
        let insights = core.insights.evaluate(&snapshots);
        core.generation += 1;

        let report = Arc::new(LevelReport {
            generation: core.generation,
            computed_at: now,
            snapshots,
            insights,
        });

        // Hold the observers lock across the swap so a concurrent subscribe
        // sees either the old report and this broadcast, or only the new one
        let observers = self.observers.lock();
        *self.published.write() = report.clone();
        for observer in &observers.senders {
            observer.offer(report.clone());
        }
        drop(observers);

        tracing::debug!(
            "Published report {} ({} insights)",
            report.generation,
            report.insights.len()
        );
        report
    }

    pub(crate) fn published(&self) -> Arc<LevelReport> {
        self.published.read().clone()
    }

    fn unsubscribe(&self, id: u64) {
        let ticker = {
            let mut observers = self.observers.lock();
            observers.senders.retain(|observer| observer.id != id);
            tracing::debug!("Observer {} left ({} remaining)", id, observers.senders.len());
            if observers.senders.is_empty() {
                observers.ticker.take()
            } else {
                None
            }
        };

        if let Some(ticker) = ticker {
            ticker.cancel();
        }
    }
}

impl Tracker {
    /// Build an engine over `store`
    ///
    /// Fails with a configuration error if the rule table or settings do
    /// not match the registry. An initial report is published before
    /// returning, so [`Tracker::current_snapshots`] is always valid.
    pub fn new(
        store: impl DoseStore + 'static,
        registry: Arc<Registry>,
        rules: Vec<SynergyRule>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if settings.tick_interval.is_zero() {
            return Err(crate::Error::Configuration(
                "tick interval must be positive".into(),
            ));
        }

        let insights = InsightEngine::new(rules, &registry)?;
        let aggregator = LevelAggregator::new(registry.clone(), settings.lookback)?;
        let store: Box<dyn DoseStore> = Box::new(store);
        let log = DoseLog::open(store, registry.clone())?;

        let core = Core {
            log,
            aggregator,
            insights,
            generation: 0,
        };

        tracing::info!(
            "Tracker ready: {} substances, {} rules, {} logged doses",
            registry.len(),
            core.insights.len(),
            core.log.len()
        );

        let placeholder = Arc::new(LevelReport {
            generation: 0,
            computed_at: clock.now(),
            snapshots: Vec::new(),
            insights: Vec::new(),
        });

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            published: RwLock::new(placeholder),
            observers: Mutex::new(Observers::default()),
            clock,
            registry,
            tick_interval: settings.tick_interval,
        });
        shared.recompute();

        Ok(Self { shared })
    }

    /// Build an engine from a loaded config, backed by the JSONL dose log
    /// in the configured data directory
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Arc::new(config.build_registry()?);
        let settings = config.engine_settings()?;
        let store = JsonlDoseStore::open(config.dose_log_path())?;
        Self::new(store, registry, config.build_rules(), settings, clock)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Enable periodic ticking; it actually runs once someone subscribes
    pub fn start(&self) {
        let mut observers = self.shared.observers.lock();
        observers.started = true;
        if !observers.senders.is_empty() && observers.ticker.is_none() {
            observers.ticker = Ticker::spawn(&self.shared);
        }
        tracing::info!("Tracker started");
    }

    /// Disable periodic ticking and wait for the ticker to finish
    pub fn stop(&self) {
        let ticker = {
            let mut observers = self.shared.observers.lock();
            observers.started = false;
            observers.ticker.take()
        };
        if let Some(ticker) = ticker {
            ticker.cancel();
        }
        tracing::info!("Tracker stopped");
    }

    /// Attach an observer; the current report is delivered immediately
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = channel::bounded(1);
        let mut observers = self.shared.observers.lock();

        let id = observers.next_id;
        observers.next_id += 1;

        let _ = tx.try_send(self.shared.published());
        observers.senders.push(Observer {
            id,
            tx,
            stale: rx.clone(),
        });

        if observers.started && observers.ticker.is_none() {
            observers.ticker = Ticker::spawn(&self.shared);
        }
        tracing::debug!("Observer {} joined ({} total)", id, observers.senders.len());

        Subscription {
            id,
            updates: rx,
            shared: self.shared.clone(),
        }
    }

    /// Recompute now, outside the regular tick
    pub fn refresh(&self) -> Arc<LevelReport> {
        self.shared.recompute()
    }

    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().senders.len()
    }

    pub fn is_started(&self) -> bool {
        self.shared.observers.lock().started
    }

    /// Whether the periodic ticker thread is currently running
    pub fn is_ticking(&self) -> bool {
        self.shared.observers.lock().ticker.is_some()
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        self.shared.tick_interval
    }
}

/// Observer handle; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    updates: Receiver<Arc<LevelReport>>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Block until the next report is published
    pub fn recv(&self) -> Option<Arc<LevelReport>> {
        self.updates.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Arc<LevelReport>> {
        self.updates.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Arc<LevelReport>> {
        self.updates.try_recv().ok()
    }

    /// Drain pending reports, keeping only the newest
    pub fn latest(&self) -> Option<Arc<LevelReport>> {
        self.updates.try_iter().last()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::insight::builtin_rules;
    use crate::registry::{CAFFEINE, L_THEANINE};
    use crate::store::MemoryDoseStore;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()
    }

    fn tracker(clock: Arc<ManualClock>, tick: StdDuration) -> Tracker {
        crate::logging::init_test();
        let settings = EngineSettings {
            tick_interval: tick,
            ..EngineSettings::default()
        };
        Tracker::new(
            MemoryDoseStore::new(),
            Arc::new(Registry::builtin()),
            builtin_rules(),
            settings,
            clock,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_report_is_published() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_secs(60));
        let report = tracker.current_snapshots();
        assert_eq!(report.generation, 1);
        assert_eq!(report.snapshots.len(), 3);
        assert!(report.insights.is_empty());
    }

    #[test]
    fn test_no_ticker_without_observers() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_millis(10));
        tracker.start();
        assert!(tracker.is_started());
        assert!(!tracker.is_ticking());

        thread::sleep(StdDuration::from_millis(50));
        assert_eq!(tracker.current_snapshots().generation, 1);
    }

    #[test]
    fn test_ticker_follows_subscriptions() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_millis(10));
        tracker.start();

        let first = tracker.subscribe();
        let second = tracker.subscribe();
        assert!(tracker.is_ticking());
        assert_eq!(tracker.observer_count(), 2);

        drop(first);
        assert!(tracker.is_ticking());

        drop(second);
        assert!(!tracker.is_ticking());
        assert_eq!(tracker.observer_count(), 0);
    }

    #[test]
    fn test_subscribe_before_start() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_millis(10));

        let _sub = tracker.subscribe();
        assert!(!tracker.is_ticking());

        tracker.start();
        assert!(tracker.is_ticking());

        tracker.stop();
        assert!(!tracker.is_ticking());
    }

    #[test]
    fn test_tick_publishes_decayed_levels() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock.clone(), StdDuration::from_millis(10));
        tracker.log_dose(&CAFFEINE.into(), 95.0, None).unwrap();
        tracker.start();

        let sub = tracker.subscribe();
        let current = sub.recv_timeout(StdDuration::from_secs(1)).unwrap();
        let level = current.snapshot(&CAFFEINE.into()).unwrap().current_amount;
        assert!((level - 95.0).abs() < 1e-9);

        clock.advance(Duration::hours(5));
        // Skip any tick that raced with the clock change
        let ticked = loop {
            let report = sub.recv_timeout(StdDuration::from_secs(2)).unwrap();
            if report.computed_at == t0() + Duration::hours(5) {
                break report;
            }
        };
        assert!(ticked.generation > current.generation);
        let level = ticked.snapshot(&CAFFEINE.into()).unwrap().current_amount;
        assert!((level - 47.5).abs() < 1e-9, "got {}", level);
    }

    #[test]
    fn test_log_dose_notifies_observers_immediately() {
        let clock = Arc::new(ManualClock::new(t0()));
        // Long interval: only the log trigger can publish during the test
        let tracker = tracker(clock, StdDuration::from_secs(3600));
        tracker.start();

        let sub = tracker.subscribe();
        let initial = sub.recv_timeout(StdDuration::from_secs(1)).unwrap();

        tracker.log_dose(&L_THEANINE.into(), 200.0, None).unwrap();
        let update = sub.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert_eq!(update.generation, initial.generation + 1);
        assert!(update.snapshot(&L_THEANINE.into()).unwrap().current_amount > 0.0);
    }

    #[test]
    fn test_idle_subscriber_queue_stays_bounded() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_millis(1));
        tracker.start();

        // Subscribed only to keep the ticker alive; never receives
        let sub = tracker.subscribe();
        thread::sleep(StdDuration::from_millis(100));
        for _ in 0..50 {
            tracker.refresh();
        }

        tracker.stop();

        assert!(sub.updates.len() <= 1);
        let newest = sub.latest().unwrap();
        assert!(newest.generation > 50);
        assert_eq!(newest.generation, tracker.current_snapshots().generation);
    }

    #[test]
    fn test_subscriber_never_sees_a_generation_twice() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock, StdDuration::from_secs(3600));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let refresher = {
            let tracker = tracker.clone();
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(std::sync::atomic::Ordering::Relaxed) {
                    tracker.refresh();
                }
            })
        };

        for _ in 0..200 {
            let sub = tracker.subscribe();
            let first = sub.recv_timeout(StdDuration::from_secs(1)).unwrap();
            let second = sub.recv_timeout(StdDuration::from_secs(1)).unwrap();
            assert!(
                second.generation > first.generation,
                "generation {} delivered after {}",
                second.generation,
                first.generation
            );
        }

        done.store(true, std::sync::atomic::Ordering::Relaxed);
        refresher.join().unwrap();
    }

    #[test]
    fn test_refresh_uses_clock() {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = tracker(clock.clone(), StdDuration::from_secs(60));
        clock.advance(Duration::minutes(3));
        let report = tracker.refresh();
        assert_eq!(report.computed_at, t0() + Duration::minutes(3));
        assert_eq!(report.generation, 2);
    }

    #[test]
    fn test_configuration_error_aborts_construction() {
        let clock = Arc::new(ManualClock::new(t0()));
        let rules = vec![SynergyRule {
            kind: "unknown".into(),
            tone: crate::InsightTone::Caution,
            message: "-".into(),
            requires: vec![crate::insight::Requirement::active("nicotine")],
        }];
        let result = Tracker::new(
            MemoryDoseStore::new(),
            Arc::new(Registry::builtin()),
            rules,
            EngineSettings::default(),
            clock,
        );
        assert!(matches!(result, Err(crate::Error::Configuration(_))));
    }
}
