//! Per-image row state and the persisted result store.
//!
//! Rows move through a closed transition set: `pending -> generating ->
//! {success, error}`, with `error -> generating` on resubmit. A successful
//! row is terminal. Only the batch runner drives status transitions; callers
//! may toggle `selected` freely.

use crate::client::ImageMetadata;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Generating,
    Success,
    Error,
}

/// One image's unit of generation work and its result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Opaque unique id, assigned at creation and never reused
    pub id: String,
    pub filename: String,
    pub file_size_bytes: u64,
    /// Embedded preview (base64 data URL), present once generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
    pub keywords_csv: String,
    pub status: RowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub selected: bool,
    /// Stamped when generation is attempted, not when it completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

impl Row {
    fn new(id: String, filename: String, file_size_bytes: u64, preview: Option<String>) -> Self {
        Self {
            id,
            filename,
            file_size_bytes,
            preview,
            title: String::new(),
            description: String::new(),
            keywords_csv: String::new(),
            status: RowStatus::Pending,
            error: None,
            selected: false,
            generated_at: None,
        }
    }

    /// Enter `generating`. Legal from `pending` and from `error` (resubmit);
    /// a successful row never re-enters the pipeline.
    pub fn begin_generating(&mut self) -> Result<()> {
        match self.status {
            RowStatus::Pending | RowStatus::Error => {
                self.status = RowStatus::Generating;
                self.error = None;
                self.generated_at = Some(Utc::now());
                Ok(())
            }
            RowStatus::Generating => Err(Error::Validation(format!(
                "row {} is already generating",
                self.id
            ))),
            RowStatus::Success => Err(Error::Validation(format!(
                "row {} already succeeded",
                self.id
            ))),
        }
    }

    /// Settle the row with generated metadata. Legal only from `generating`.
    pub fn complete_success(&mut self, metadata: ImageMetadata) -> Result<()> {
        if self.status != RowStatus::Generating {
            return Err(Error::Validation(format!(
                "row {} cannot succeed from {:?}",
                self.id, self.status
            )));
        }
        self.title = metadata.title;
        self.description = metadata.description;
        self.keywords_csv = metadata.keywords.join(", ");
        self.status = RowStatus::Success;
        self.error = None;
        Ok(())
    }

    /// Settle the row with a failure message. Legal only from `generating`.
    pub fn complete_error(&mut self, reason: String) -> Result<()> {
        if self.status != RowStatus::Generating {
            return Err(Error::Validation(format!(
                "row {} cannot fail from {:?}",
                self.id, self.status
            )));
        }
        self.status = RowStatus::Error;
        self.error = Some(reason);
        Ok(())
    }

    /// Eligible for CSV export: terminal success with all fields present.
    pub fn is_exportable(&self) -> bool {
        self.status == RowStatus::Success
            && !self.title.is_empty()
            && !self.description.is_empty()
            && !self.keywords_csv.is_empty()
    }
}

/// Ordered mapping from row id to row state, persisted to local storage
pub struct ResultStore {
    rows: Vec<Row>,
    store_path: PathBuf,
    keep_previews: bool,
    id_counter: u64,
}

impl ResultStore {
    pub fn new(state_dir: PathBuf, keep_previews: bool) -> Self {
        Self {
            rows: Vec::new(),
            store_path: state_dir.join("rows.json"),
            keep_previews,
            id_counter: 0,
        }
    }

    /// Load persisted rows if a store file exists.
    pub async fn load(state_dir: PathBuf, keep_previews: bool) -> Self {
        let mut store = Self::new(state_dir, keep_previews);
        match tokio::fs::read_to_string(&store.store_path).await {
            Ok(content) => match serde_json::from_str::<Vec<Row>>(&content) {
                Ok(rows) => {
                    debug!("Loaded {} persisted rows", rows.len());
                    store.id_counter = rows.len() as u64;
                    store.rows = rows;
                }
                Err(e) => warn!("Failed to parse persisted rows, starting empty: {}", e),
            },
            Err(_) => debug!("No persisted rows at {}", store.store_path.display()),
        }
        store
    }

    /// Create a pending row. Duplicate filenames are rejected at intake.
    pub fn add_row(
        &mut self,
        filename: String,
        file_size_bytes: u64,
        preview: Option<String>,
    ) -> Result<&Row> {
        if self.rows.iter().any(|r| r.filename == filename) {
            return Err(Error::Validation(format!(
                "duplicate filename: {}",
                filename
            )));
        }

        self.id_counter += 1;
        let digest = md5::compute(format!("{}:{}", filename, self.id_counter).as_bytes());
        let id = format!("row-{:x}", digest);

        self.rows.push(Row::new(id, filename, file_size_bytes, preview));
        Ok(self.rows.last().unwrap())
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn get(&self, id: &str) -> Option<&Row> {
        self.rows.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Row> {
        self.rows.iter_mut().find(|r| r.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Row> {
        let index = self.rows.iter().position(|r| r.id == id)?;
        Some(self.rows.remove(index))
    }

    pub fn set_selected(&mut self, id: &str, selected: bool) -> bool {
        match self.get_mut(id) {
            Some(row) => {
                row.selected = selected;
                true
            }
            None => false,
        }
    }

    /// Ids of rows eligible for a generation run, in store order.
    pub fn generatable_ids(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|r| matches!(r.status, RowStatus::Pending | RowStatus::Error))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Persist rows to disk. On a failed write the payload degrades: first
    /// previews are dropped, then descriptions, before giving up. The
    /// in-memory state stays authoritative either way.
    pub async fn persist(&self) {
        let path = self.store_path.clone();
        self.persist_with(move |json| {
            let path = path.clone();
            async move { tokio::fs::write(&path, json).await }
        })
        .await;
    }

    async fn persist_with<F, Fut>(&self, mut write: F)
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = std::io::Result<()>>,
    {
        for level in [DegradeLevel::Full, DegradeLevel::NoPreviews, DegradeLevel::Essential] {
            match self.serialize_rows(level) {
                Ok(json) => match write(json).await {
                    Ok(()) => {
                        if level != DegradeLevel::Full {
                            warn!("Persisted rows with degraded payload ({:?})", level);
                        }
                        return;
                    }
                    Err(e) => {
                        warn!("Row persistence failed at {:?}: {}", level, e);
                    }
                },
                Err(e) => warn!("Row serialization failed at {:?}: {}", level, e),
            }
        }
        warn!("Giving up on row persistence; in-memory state remains authoritative");
    }

    fn serialize_rows(&self, level: DegradeLevel) -> serde_json::Result<String> {
        let rows: Vec<Row> = self
            .rows
            .iter()
            .map(|row| {
                let mut row = row.clone();
                // Previews are kept only for successful rows to bound size
                let keep = self.keep_previews
                    && row.status == RowStatus::Success
                    && level == DegradeLevel::Full;
                if !keep {
                    row.preview = None;
                }
                if level == DegradeLevel::Essential {
                    row.description = String::new();
                }
                row
            })
            .collect();
        serde_json::to_string_pretty(&rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DegradeLevel {
    Full,
    NoPreviews,
    Essential,
}
