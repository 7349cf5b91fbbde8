//! Durable, append-only dose log.
//!
//! Dose events are appended to a JSONL (JSON Lines) file with file locking
//! and an fsync per record. [`DoseLog`] validates events against the
//! registry and keeps an in-memory index ordered by timestamp for replay
//! and windowed queries.

use crate::registry::Registry;
use crate::{DoseEvent, Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Durable store contract consumed by the dose log
pub trait DoseStore: Send {
    /// Durably append one event; on error nothing is considered committed
    fn put(&mut self, event: &DoseEvent) -> Result<()>;

    /// Replay every committed event
    fn get_all(&self) -> Result<Vec<DoseEvent>>;
}

impl<T: DoseStore + ?Sized> DoseStore for Box<T> {
    fn put(&mut self, event: &DoseEvent) -> Result<()> {
        (**self).put(event)
    }

    fn get_all(&self) -> Result<Vec<DoseEvent>> {
        (**self).get_all()
    }
}

/// JSONL-based dose store with file locking
pub struct JsonlDoseStore {
    path: PathBuf,
}

impl JsonlDoseStore {
    /// Open (or lazily create) a store at `path`, repairing a torn last record
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { path: path.into() };
        store.ensure_parent_dir()?;
        store.repair_torn_tail()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Drop a partially written trailing record left behind by a crash
    fn repair_torn_tail(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.lock_exclusive()?;
        let result = truncate_torn_tail(&mut file, &self.path);
        file.unlock()?;
        result.map(|_| ())
    }
}

/// Cut `file` back to its last complete line; caller holds the lock
///
/// Returns the resulting length.
fn truncate_torn_tail(file: &mut File, path: &Path) -> Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    file.seek(SeekFrom::Start(0))?;
    let mut contents = Vec::with_capacity(len as usize);
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0) as u64;

    tracing::warn!(
        "Dose log {:?} ends with a torn record ({} bytes), truncating",
        path,
        len - keep
    );
    file.set_len(keep)?;
    file.sync_all()?;
    Ok(keep)
}

impl DoseStore for JsonlDoseStore {
    fn put(&mut self, event: &DoseEvent) -> Result<()> {
        self.ensure_parent_dir()?;

        // Encode before touching the file so a bad record never reaches disk
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;
        let result = append_record(&mut file, &self.path, line.as_bytes());
        file.unlock()?;
        result?;

        tracing::debug!("Appended dose {} to {:?}", event.id, self.path);
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<DoseEvent>> {
        read_events(&self.path)
    }
}

/// Append one encoded record to a locked file
///
/// A record is only ever appended after a newline. If the write or the sync
/// fails, the file is cut back to where it was so a retry starts clean.
fn append_record(file: &mut File, path: &Path, line: &[u8]) -> Result<()> {
    let len_before = truncate_torn_tail(file, path)?;

    // One write per record, then force it to disk before reporting success
    let written = file.write_all(line).and_then(|_| file.sync_data());
    if let Err(e) = written {
        if let Err(rollback) = file.set_len(len_before) {
            tracing::error!("Failed to roll back partial record in {:?}: {}", path, rollback);
        }
        return Err(e.into());
    }
    Ok(())
}

/// Read all dose events from a JSONL file
///
/// Unparseable lines are skipped with a warning rather than failing replay.
pub fn read_events(path: &Path) -> Result<Vec<DoseEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut events = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<DoseEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Skipping unreadable dose at line {}: {}", line_num + 1, e);
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} doses from {:?}", events.len(), path);
    Ok(events)
}

/// Non-durable store, for tests and throwaway sessions
#[derive(Debug, Default)]
pub struct MemoryDoseStore {
    events: Vec<DoseEvent>,
}

impl MemoryDoseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DoseStore for MemoryDoseStore {
    fn put(&mut self, event: &DoseEvent) -> Result<()> {
        self.events.push(event.clone());
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<DoseEvent>> {
        Ok(self.events.clone())
    }
}

/// Validated dose log over a durable store
///
/// All events are indexed in memory in ascending timestamp order; ties
/// keep append order.
pub struct DoseLog<S: DoseStore> {
    store: S,
    registry: Arc<Registry>,
    events: Vec<DoseEvent>,
    ids: HashSet<Uuid>,
}

impl<S: DoseStore> DoseLog<S> {
    /// Replay the store into a new log
    pub fn open(store: S, registry: Arc<Registry>) -> Result<Self> {
        let mut events = store.get_all()?;

        // A record replayed twice counts once
        let mut ids = HashSet::with_capacity(events.len());
        let before = events.len();
        events.retain(|e| ids.insert(e.id));
        if events.len() < before {
            tracing::warn!(
                "Ignoring {} duplicate dose records",
                before - events.len()
            );
        }

        // Stable sort keeps append order among equal timestamps
        events.sort_by_key(|e| e.timestamp);

        let unknown = events
            .iter()
            .filter(|e| !registry.contains(&e.substance))
            .count();
        if unknown > 0 {
            tracing::warn!(
                "{} logged doses reference substances that are no longer registered",
                unknown
            );
        }

        tracing::info!("Opened dose log with {} events", events.len());
        Ok(Self {
            store,
            registry,
            events,
            ids,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Validate and durably append an event
    pub fn append(&mut self, event: DoseEvent) -> Result<()> {
        self.validate(&event)?;
        self.store.put(&event)?;

        let pos = self
            .events
            .partition_point(|e| e.timestamp <= event.timestamp);
        self.ids.insert(event.id);
        self.events.insert(pos, event);
        Ok(())
    }

    fn validate(&self, event: &DoseEvent) -> Result<()> {
        if !event.amount.is_finite() {
            return Err(Error::Validation(format!(
                "amount must be a finite number, got {}",
                event.amount
            )));
        }
        if event.amount < 0.0 {
            return Err(Error::Validation(format!(
                "amount must not be negative, got {}",
                event.amount
            )));
        }
        if !self.registry.contains(&event.substance) {
            return Err(Error::Validation(format!(
                "unknown substance '{}'",
                event.substance
            )));
        }
        if self.ids.contains(&event.id) {
            return Err(Error::Validation(format!(
                "dose {} is already logged",
                event.id
            )));
        }
        Ok(())
    }

    /// Every event, oldest first
    ///
    /// The iterator is lazy and `Clone`, so it can be restarted.
    pub fn all_events(&self) -> std::slice::Iter<'_, DoseEvent> {
        self.events.iter()
    }

    /// Events with `timestamp >= cutoff`, oldest first
    pub fn events_since(&self, cutoff: DateTime<Utc>) -> std::slice::Iter<'_, DoseEvent> {
        let start = self.events.partition_point(|e| e.timestamp < cutoff);
        self.events[start..].iter()
    }

    /// Events with `from <= timestamp <= to`, oldest first
    pub fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> std::slice::Iter<'_, DoseEvent> {
        let start = self.events.partition_point(|e| e.timestamp < from);
        let end = self.events.partition_point(|e| e.timestamp <= to).max(start);
        self.events[start..end].iter()
    }

    /// Whether a dose with this id is already in the log
    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
