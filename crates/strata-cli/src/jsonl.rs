//! JSON-lines producer
//!
//! One object per line:
//!
//! ```text
//! {"content": "...", "id": "fact::1", "level": "concept", "timestamp": "2024-05-01T12:00:00Z"}
//! ```
//!
//! Only `content` is required. A missing id is derived from the content so
//! re-running the same file deduplicates. Entries with a timestamp at or
//! before the namespace high-water mark are skipped on incremental runs.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use strata_core::{
    IngestItem, IngestPayload, Level, LinkSpec, MemoryError, ProgressMark, SourceProducer,
    deterministic_id,
};

use crate::encoder::Encoder;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Entry {
    #[serde(default)]
    id: Option<String>,
    content: String,
    /// Prefix for derived ids
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    level: Option<Level>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    links: Vec<LinkSpec>,
}

impl Entry {
    fn id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => deterministic_id(self.kind.as_deref().unwrap_or("fact"), &self.content),
        }
    }
}

pub struct JsonlProducer<'a> {
    path: PathBuf,
    namespace: String,
    encoder: &'a dyn Encoder,
    default_level: Level,
}

impl<'a> JsonlProducer<'a> {
    pub fn new(
        path: impl Into<PathBuf>,
        namespace: impl Into<String>,
        encoder: &'a dyn Encoder,
        default_level: Level,
    ) -> Self {
        Self {
            path: path.into(),
            namespace: namespace.into(),
            encoder,
            default_level,
        }
    }

    fn read_entries(&self) -> strata_core::Result<Vec<Entry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: Entry = serde_json::from_str(&line).map_err(|e| {
                MemoryError::Validation(format!(
                    "{}:{}: {}",
                    self.path.display(),
                    number + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn to_item(&self, entry: Entry) -> strata_core::Result<IngestItem> {
        let id = entry.id();
        let vector = self
            .encoder
            .encode(&entry.content)
            .map_err(|e| MemoryError::Validation(format!("cannot encode {}: {}", id, e)))?;

        let mut item = IngestItem::new(
            id,
            entry.content,
            vector,
            entry.level.unwrap_or(self.default_level),
        );
        item.payload = IngestPayload {
            parent_id: entry.parent_id,
            importance: entry.importance,
            links: entry.links,
            source_timestamp: entry.timestamp,
        };
        Ok(item)
    }
}

impl SourceProducer for JsonlProducer<'_> {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn validate_source(&self) -> strata_core::Result<()> {
        if !self.path.is_file() {
            return Err(MemoryError::Validation(format!(
                "{} is not a readable file",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn extract_batch(&self, since: Option<&ProgressMark>) -> strata_core::Result<Vec<IngestItem>> {
        let entries = self.read_entries()?;
        let total = entries.len();

        let items = entries
            .into_iter()
            .filter(|entry| match (since, entry.timestamp) {
                (Some(mark), Some(ts)) => ts > mark.last_timestamp,
                _ => true,
            })
            .map(|entry| self.to_item(entry))
            .collect::<strata_core::Result<Vec<_>>>()?;

        tracing::debug!(
            path = %self.path.display(),
            total,
            selected = items.len(),
            "Read JSON lines"
        );
        Ok(items)
    }

    fn latest_processed(&self) -> Option<ProgressMark> {
        let entries = self.read_entries().ok()?;
        entries.iter().rev().find_map(|entry| {
            entry.timestamp.map(|ts| ProgressMark {
                last_id: entry.id(),
                last_timestamp: ts,
            })
        })
    }
}
