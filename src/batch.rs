//! Batch orchestrator: sequences per-image generation calls.
//!
//! Rows are processed strictly sequentially, one call in flight at a time,
//! to respect provider rate limits. Within a row, credentials are tried in
//! round-robin order starting from the last credential that worked, so a
//! newly exhausted credential is not hammered first on every row. Only quota
//! errors rotate credentials; any other failure settles the row immediately.

use crate::client::{ImageMetadata, MetadataClient};
use crate::config::{PacingConfig, ValidationRules};
use crate::keywords;
use crate::resolver::ResolvedModel;
use crate::store::ResultStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Image payload for one row, keyed by row id in the batch call
#[derive(Debug, Clone)]
pub struct ImageSource {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Aggregate progress snapshot, recomputed on every row-state transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
}

/// Outcome counters for a finished batch run
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Rows that failed because every credential hit its quota
    pub quota_exhausted: usize,
    pub cancelled: bool,
}

/// Pacing policy applied after each row settles. Injected so the orchestrator
/// is testable without wall-clock waits.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn after_success(&self);
    async fn after_failure(&self);
}

/// Real pacing: short delay after success, longer backoff after failure
pub struct TokioPacer {
    success_delay: Duration,
    failure_delay: Duration,
}

impl TokioPacer {
    pub fn new(config: &PacingConfig) -> Self {
        Self {
            success_delay: Duration::from_millis(config.success_delay_ms),
            failure_delay: Duration::from_millis(config.failure_delay_ms),
        }
    }
}

#[async_trait]
impl Pacer for TokioPacer {
    async fn after_success(&self) {
        tokio::time::sleep(self.success_delay).await;
    }

    async fn after_failure(&self) {
        tokio::time::sleep(self.failure_delay).await;
    }
}

/// No-delay pacing for tests
pub struct NoopPacer;

#[async_trait]
impl Pacer for NoopPacer {
    async fn after_success(&self) {}
    async fn after_failure(&self) {}
}

type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

/// Sequencing engine for a generation run
pub struct BatchRunner {
    client: Arc<dyn MetadataClient>,
    pacer: Arc<dyn Pacer>,
    rules: ValidationRules,
    cancel: Arc<AtomicBool>,
    on_progress: Option<ProgressCallback>,
}

impl BatchRunner {
    pub fn new(client: Arc<dyn MetadataClient>, pacer: Arc<dyn Pacer>, rules: ValidationRules) -> Self {
        Self {
            client,
            pacer,
            rules,
            cancel: Arc::new(AtomicBool::new(false)),
            on_progress: None,
        }
    }

    /// Observe progress snapshots as rows settle.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    /// Token honored at each suspension point; setting it abandons rows that
    /// have not started yet.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn emit(&self, progress: Progress) {
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }

    /// Run a batch over `row_ids` in the exact order supplied.
    ///
    /// A single row's failure never aborts the batch. The last-known-good
    /// credential index is run-state here, not ambient storage, so repeated
    /// runs never share hidden state.
    pub async fn run(
        &self,
        store: &mut ResultStore,
        row_ids: &[String],
        images: &HashMap<String, ImageSource>,
        credentials: &[String],
        model: &ResolvedModel,
    ) -> Result<BatchSummary> {
        if credentials.is_empty() {
            return Err(Error::Validation("no credentials configured".to_string()));
        }
        if row_ids.is_empty() {
            return Err(Error::Validation("no rows selected for generation".to_string()));
        }

        let mut summary = BatchSummary {
            total: row_ids.len(),
            ..Default::default()
        };
        let mut progress = Progress {
            total: row_ids.len(),
            ..Default::default()
        };
        self.emit(progress);

        info!(
            "Starting batch: {} rows, {} credential(s), model {}",
            row_ids.len(),
            credentials.len(),
            model.model_id
        );

        // Run-state, not a global: survives across rows within this batch only
        let mut last_good: usize = 0;
        let row_count = row_ids.len();

        for (position, row_id) in row_ids.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                info!("Batch cancelled after {} of {} rows", position, row_count);
                summary.cancelled = true;
                break;
            }

            let filename = match store.get_mut(row_id) {
                Some(row) => match row.begin_generating() {
                    Ok(()) => row.filename.clone(),
                    Err(e) => {
                        warn!("Skipping row {}: {}", row_id, e);
                        summary.failed += 1;
                        progress.failed += 1;
                        self.emit(progress);
                        continue;
                    }
                },
                None => {
                    warn!("Row {} vanished from the store, skipping", row_id);
                    summary.failed += 1;
                    progress.failed += 1;
                    self.emit(progress);
                    continue;
                }
            };

            progress.in_progress = 1;
            self.emit(progress);
            debug!("Row {}/{}: {}", position + 1, row_count, filename);

            let outcome = match images.get(row_id) {
                Some(source) => {
                    self.generate_with_rotation(source, credentials, model, &mut last_good)
                        .await
                }
                None => RowOutcome::Failed("image data unavailable".to_string()),
            };

            let row = store
                .get_mut(row_id)
                .ok_or_else(|| Error::Storage(format!("row {} removed mid-batch", row_id)))?;

            let settled_ok = match outcome {
                RowOutcome::Succeeded(metadata) => {
                    let issues = keywords::advisory_issues(&metadata, &self.rules);
                    for issue in &issues {
                        warn!("{}: advisory validation: {}", filename, issue);
                    }
                    row.complete_success(metadata)?;
                    summary.succeeded += 1;
                    progress.completed += 1;
                    true
                }
                RowOutcome::Failed(reason) => {
                    warn!("{}: {}", filename, reason);
                    row.complete_error(reason)?;
                    summary.failed += 1;
                    progress.failed += 1;
                    false
                }
                RowOutcome::QuotaExhausted => {
                    let reason = format!(
                        "all {} credential(s) exhausted their quota",
                        credentials.len()
                    );
                    warn!("{}: {}", filename, reason);
                    row.complete_error(reason)?;
                    summary.failed += 1;
                    summary.quota_exhausted += 1;
                    progress.failed += 1;
                    false
                }
            };

            progress.in_progress = 0;
            self.emit(progress);
            store.persist().await;

            // Pace before the next row starts, not after the last one
            if position + 1 < row_count && !self.cancel.load(Ordering::Relaxed) {
                if settled_ok {
                    self.pacer.after_success().await;
                } else {
                    self.pacer.after_failure().await;
                }
            }
        }

        info!(
            "Batch finished: {} succeeded, {} failed ({} quota-exhausted)",
            summary.succeeded, summary.failed, summary.quota_exhausted
        );
        self.emit(Progress::default());

        Ok(summary)
    }

    /// Try each credential once, round-robin from the last-known-good index.
    /// Quota errors advance to the next candidate; anything else settles the
    /// row immediately since retrying a different credential cannot help.
    async fn generate_with_rotation(
        &self,
        source: &ImageSource,
        credentials: &[String],
        model: &ResolvedModel,
        last_good: &mut usize,
    ) -> RowOutcome {
        let count = credentials.len();

        for attempt in 0..count {
            if self.cancel.load(Ordering::Relaxed) {
                return RowOutcome::Failed("batch cancelled".to_string());
            }

            let index = (*last_good + attempt) % count;
            match self
                .client
                .generate(&credentials[index], model, &source.bytes, &source.mime_type)
                .await
            {
                Ok(mut metadata) => {
                    metadata.keywords = keywords::normalize(&metadata.keywords);
                    *last_good = index;
                    return RowOutcome::Succeeded(metadata);
                }
                Err(e) if e.is_quota() => {
                    debug!(
                        "Credential {} of {} hit quota, rotating: {}",
                        index + 1,
                        count,
                        e
                    );
                }
                Err(e) => return RowOutcome::Failed(e.to_string()),
            }
        }

        RowOutcome::QuotaExhausted
    }
}

enum RowOutcome {
    Succeeded(ImageMetadata),
    Failed(String),
    QuotaExhausted,
}
