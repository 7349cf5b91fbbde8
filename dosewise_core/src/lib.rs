#![forbid(unsafe_code)]

//! Core engine for the Dosewise substance tracker.
//!
//! This crate provides:
//! - Domain types (substances, dose events, snapshots, insights)
//! - Decay model registry and level aggregation
//! - Data-driven synergy insight rules
//! - Durable dose log (JSONL) and CSV export
//! - The recomputation scheduler and query facade ([`Tracker`])

pub mod types;
pub mod error;
pub mod clock;
pub mod registry;
pub mod config;
pub mod logging;
pub mod store;
pub mod aggregator;
pub mod insight;
pub mod scheduler;
pub mod facade;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::Registry;
pub use config::{Config, EngineSettings};
pub use store::{DoseLog, DoseStore, JsonlDoseStore, MemoryDoseStore};
pub use aggregator::LevelAggregator;
pub use insight::{builtin_rules, InsightEngine, Requirement, SynergyRule};
pub use scheduler::{Subscription, Tracker};
pub use facade::{format_amount, format_duration, DisplayDose};
