//! CSV export and import of the dose log.
//!
//! Exports are written to a temporary file in the destination directory,
//! synced, and then renamed over the target, so a reader never sees a
//! half-written export.

use crate::{DoseEvent, DoseSource, Error, Result, SubstanceId};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use uuid::Uuid;

/// A row in the CSV file
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    id: String,
    substance: String,
    amount: f64,
    timestamp: String,
    source: Option<String>,
}

impl From<&DoseEvent> for CsvRow {
    fn from(event: &DoseEvent) -> Self {
        CsvRow {
            id: event.id.to_string(),
            substance: event.substance.to_string(),
            amount: event.amount,
            timestamp: event.timestamp.to_rfc3339(),
            source: event.source.map(|s| source_name(s).to_string()),
        }
    }
}

impl TryFrom<CsvRow> for DoseEvent {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| Error::Validation(format!("Invalid UUID: {}", e)))?;

        let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
            .map_err(|e| Error::Validation(format!("Invalid timestamp: {}", e)))?
            .with_timezone(&Utc);

        let source = match row.source.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(parse_source(name)?),
        };

        Ok(DoseEvent {
            id,
            substance: SubstanceId::new(row.substance),
            amount: row.amount,
            timestamp,
            source,
        })
    }
}

fn source_name(source: DoseSource) -> &'static str {
    match source {
        DoseSource::Manual => "manual",
        DoseSource::QuickAdd => "quick_add",
        DoseSource::Import => "import",
    }
}

fn parse_source(name: &str) -> Result<DoseSource> {
    match name.to_lowercase().as_str() {
        "manual" => Ok(DoseSource::Manual),
        "quick_add" => Ok(DoseSource::QuickAdd),
        "import" => Ok(DoseSource::Import),
        other => Err(Error::Validation(format!("Unknown dose source '{}'", other))),
    }
}

/// Write `events` to `path` as CSV with a header row
///
/// Returns the number of rows written.
pub fn export_csv<'a>(
    events: impl IntoIterator<Item = &'a DoseEvent>,
    path: &Path,
) -> Result<usize> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    let mut count = 0;
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(temp.as_file());
        for event in events {
            writer.serialize(CsvRow::from(event))?;
            count += 1;
        }
        writer.flush()?;
    }

    // An empty export still gets a header line
    if count == 0 {
        temp.as_file().write_all(b"id,substance,amount,timestamp,source\n")?;
    }

    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| Error::Storage(e.error))?;

    tracing::info!("Exported {} doses to {:?}", count, path);
    Ok(count)
}

/// Read dose events back from a CSV export
///
/// Rows that cannot be parsed are skipped with a warning.
pub fn read_csv(path: &Path) -> Result<Vec<DoseEvent>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut events = Vec::new();
    for (idx, result) in reader.deserialize::<CsvRow>().enumerate() {
        match result {
            Ok(row) => match DoseEvent::try_from(row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping CSV row {}: {}", idx + 1, e),
            },
            Err(e) => {
                tracing::warn!("Failed to deserialize CSV row {}: {}", idx + 1, e);
            }
        }
    }

    tracing::debug!("Read {} doses from {:?}", events.len(), path);
    Ok(events)
}
