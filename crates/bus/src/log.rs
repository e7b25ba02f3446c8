//! JSONL event log - append-only copy of every published envelope
//!
//! Events are partitioned by tenant and by the UTC day of the envelope
//! timestamp: `<base>/<tenant>/<YYYY-MM-DD>.jsonl`. One tenant's history can
//! be read or archived without scanning anyone else's.

use crate::error::BusError;
use crate::event::PublishedEvent;
use crate::subscriber::EventSubscriber;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The file a tenant is currently appending to
struct DayFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

impl DayFile {
    fn open(dir: &Path, date: NaiveDate) -> Result<Self, BusError> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.jsonl", date.format("%Y-%m-%d"))))?;

        Ok(Self {
            date,
            writer: BufWriter::new(file),
        })
    }
}

/// Append-only JSONL event log with one open file per tenant
pub struct EventLog {
    base_path: PathBuf,
    open: HashMap<String, DayFile>,
}

impl EventLog {
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self, BusError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            open: HashMap::new(),
        })
    }

    /// Append an event to its tenant's file for the envelope's day
    pub fn append(&mut self, event: &PublishedEvent) -> Result<(), BusError> {
        let tenant_id = &event.envelope.tenant_id;
        let date = event.envelope.ts.date_naive();
        let dir = self.base_path.join(partition_name(tenant_id));

        let day = match self.open.entry(tenant_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().date != date {
                    let mut previous = slot.insert(DayFile::open(&dir, date)?);
                    previous.writer.flush()?;
                }
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(DayFile::open(&dir, date)?),
        };

        serde_json::to_writer(&mut day.writer, event)?;
        day.writer.write_all(b"\n")?;
        day.writer.flush()?;
        Ok(())
    }

    /// Every logged event of one tenant, oldest day first, in append order
    pub fn read_tenant(&self, tenant_id: &str) -> Result<Vec<PublishedEvent>, BusError> {
        let dir = self.base_path.join(partition_name(tenant_id));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut events = read_partition(&dir)?;
        // Distinct ids can share a sanitized directory name.
        events.retain(|e| e.envelope.tenant_id == tenant_id);
        Ok(events)
    }

    /// Every logged event across tenants, ordered by envelope timestamp
    pub fn read_all(&self) -> Result<Vec<PublishedEvent>, BusError> {
        let mut events = Vec::new();
        for dir in sorted_entries(&self.base_path, |path| path.is_dir())? {
            events.extend(read_partition(&dir)?);
        }

        events.sort_by_key(|e| e.envelope.ts);
        Ok(events)
    }

    /// Flush and release every open file
    pub fn close(&mut self) -> Result<(), BusError> {
        for day in self.open.values_mut() {
            day.writer.flush()?;
        }
        self.open.clear();
        Ok(())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to flush event log");
        }
    }
}

/// Directory name for a tenant; anything outside `[A-Za-z0-9_-]` becomes `_`
/// so an id can never address a path outside the log
fn partition_name(tenant_id: &str) -> String {
    let name: String = tenant_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, BusError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_partition(dir: &Path) -> Result<Vec<PublishedEvent>, BusError> {
    let mut events = Vec::new();
    for path in sorted_entries(dir, |path| path.extension().is_some_and(|ext| ext == "jsonl"))? {
        for line in BufReader::new(File::open(&path)?).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                events.push(serde_json::from_str(&line)?);
            }
        }
    }
    Ok(events)
}

/// Bus subscriber that appends every event to an [`EventLog`]
pub struct EventLogSubscriber {
    log: Mutex<EventLog>,
}

impl EventLogSubscriber {
    pub fn new(log: EventLog) -> Self {
        Self {
            log: Mutex::new(log),
        }
    }

    pub fn open(base_path: impl AsRef<Path>) -> Result<Self, BusError> {
        Ok(Self::new(EventLog::new(base_path)?))
    }
}

#[async_trait]
impl EventSubscriber for EventLogSubscriber {
    fn name(&self) -> &str {
        "event_log"
    }

    async fn handle(&self, event: &PublishedEvent) -> Result<(), BusError> {
        let mut log = self.log.lock().map_err(|_| BusError::SubscriberFailed {
            name: self.name().to_string(),
            reason: "event log lock poisoned".to_string(),
        })?;
        log.append(event)
    }
}
