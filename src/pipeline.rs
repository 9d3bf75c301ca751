//! Two-phase upload workflow over the external collaborators.
//!
//! `draft` stores the bytes, registers a NEW entry and returns statistics plus
//! an opaque token. `import` later claims the entry, re-reads the stored object
//! and moves the entry to USED or FAILED. `predict` reads the same object.

use crate::draft::{analyze_draft, DraftStats};
use crate::import::{import_rows, ImportConfig, ImportTally, Provenance};
use crate::predict::{collect_cycle, PredictRequest, Predictor, SohPrediction};
use crate::records::RecordStore;
use crate::registry::{Completion, UploadEntry, UploadRegistry};
use crate::scan::RowScanner;
use crate::store::{object_key, ObjectStore};
use crate::{build_csv_reader, CsvMeta, IngestError, IngestResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{error, info, warn};

/// Raw upload as received from the client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Draft handed back after the first scan.
#[derive(Debug, Clone, Serialize)]
pub struct Draft {
    pub upload_token: String,
    pub row_count: u64,
    pub cycle_count: i64,
    pub last_record_at: DateTime<Utc>,
}

pub struct Ingestor {
    objects: Arc<dyn ObjectStore>,
    registry: Arc<dyn UploadRegistry>,
    records: Arc<dyn RecordStore>,
    config: ImportConfig,
}

/// A registry claim held for the length of one import.
///
/// Settles to USED or FAILED. Dropped unsettled, as when the import future is
/// cancelled, it marks the entry FAILED.
struct ImportClaim<'a> {
    registry: &'a dyn UploadRegistry,
    token: String,
    settled: bool,
}

impl<'a> ImportClaim<'a> {
    fn acquire(registry: &'a dyn UploadRegistry, token: &str) -> IngestResult<Self> {
        registry.claim(token)?;
        Ok(Self {
            registry,
            token: token.to_string(),
            settled: false,
        })
    }

    fn complete(mut self, completion: Completion) -> IngestResult<()> {
        self.settled = true;
        self.registry.mark_used(&self.token, completion)
    }

    fn fail(mut self) {
        self.settled = true;
        mark_failed_logged(self.registry, &self.token);
    }
}

impl Drop for ImportClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(token = %self.token, "import abandoned");
            mark_failed_logged(self.registry, &self.token);
        }
    }
}

/// Logs a failed status write instead of returning it.
fn mark_failed_logged(registry: &dyn UploadRegistry, token: &str) {
    if let Err(e) = registry.mark_failed(token) {
        error!(token, error = %e, "could not mark upload failed");
    }
}

fn meta_for(entry: &UploadEntry) -> CsvMeta {
    CsvMeta::new(entry.content_type.as_deref(), entry.file_name.as_deref())
}

impl Ingestor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        registry: Arc<dyn UploadRegistry>,
        records: Arc<dyn RecordStore>,
        config: ImportConfig,
    ) -> Self {
        Self {
            objects,
            registry,
            records,
            config,
        }
    }

    async fn open(&self, entry: &UploadEntry) -> IngestResult<RowScanner<Box<dyn AsyncRead + Unpin + Send>>> {
        let meta = meta_for(entry);
        let raw = self.objects.get(&entry.storage_key).await?;
        Ok(RowScanner::with_meta(build_csv_reader(raw, &meta), &meta))
    }

    fn lookup(&self, token: &str) -> IngestResult<UploadEntry> {
        let token = token.trim();
        if token.is_empty() {
            return Err(IngestError::MissingToken);
        }
        let entry = self
            .registry
            .find(token)?
            .ok_or_else(|| IngestError::TokenNotFound(token.to_string()))?;
        if entry.storage_key.trim().is_empty() {
            return Err(IngestError::MissingStorageKey(token.to_string()));
        }
        Ok(entry)
    }

    /// Phase one: store, register, scan once.
    pub async fn draft(&self, upload: Upload) -> IngestResult<Draft> {
        if upload.body.is_empty() {
            return Err(IngestError::EmptyUpload);
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let key = object_key(&token, Utc::now().date_naive());
        self.objects.put(&key, upload.body.clone()).await?;

        let mut entry = UploadEntry::new(&token, &key);
        entry.file_name = upload.file_name;
        entry.file_size = upload.body.len() as u64;
        entry.content_type = upload.content_type;
        entry.checksum = crc32fast::hash(&upload.body);
        self.registry.insert(&entry)?;
        info!(token = %token, key = %key, bytes = entry.file_size, "upload registered");

        let stats = match self.scan_draft(&entry).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(token = %token, error = %e, "draft scan failed");
                mark_failed_logged(self.registry.as_ref(), &token);
                return Err(e);
            }
        };
        let cycle_count = stats.cycle_count();
        self.registry
            .record_stats(&token, stats.row_count, cycle_count)?;
        info!(token = %token, rows = stats.row_count, cycles = cycle_count, "draft ready");

        Ok(Draft {
            upload_token: token,
            row_count: stats.row_count,
            cycle_count,
            last_record_at: Utc::now(),
        })
    }

    async fn scan_draft(&self, entry: &UploadEntry) -> IngestResult<DraftStats> {
        let mut scanner = self.open(entry).await?;
        analyze_draft(&mut scanner).await
    }

    /// Phase two: import every valid row of the stored upload into `ledger_id`.
    pub async fn import(&self, token: &str, ledger_id: i64) -> IngestResult<ImportTally> {
        let entry = self.lookup(token)?;
        let claim = ImportClaim::acquire(self.registry.as_ref(), &entry.token)?;

        let prov = Provenance {
            ledger_id,
            source_file: entry.file_name.clone(),
            upload_batch: entry.token.clone(),
        };
        let result = match self.open(&entry).await {
            Ok(mut scanner) => import_rows(&mut scanner, self.records.as_ref(), &prov, self.config).await,
            Err(e) => Err(e),
        };

        let tally = match result {
            Ok(tally) => tally,
            Err(e) => {
                error!(token = %entry.token, error = %e, "import failed");
                claim.fail();
                return Err(e);
            }
        };

        claim.complete(Completion {
            ledger_id,
            row_count: tally.accepted,
            used_at: Utc::now(),
        })?;
        info!(
            token = %entry.token,
            ledger_id,
            accepted = tally.accepted,
            skipped = tally.skipped,
            "import complete"
        );
        Ok(tally)
    }

    /// Predict SOH for one cycle of the upload behind `token`.
    pub async fn predict(
        &self,
        token: &str,
        cycle: i64,
        predictor: &dyn Predictor,
    ) -> IngestResult<SohPrediction> {
        let entry = self.lookup(token)?;
        let mut scanner = self.open(&entry).await?;
        let series = collect_cycle(&mut scanner, cycle).await?;
        info!(token = %entry.token, cycle, points = series.len(), "cycle series collected");
        predictor.predict(&PredictRequest::from_series(&series)).await
    }

    pub fn status(&self, token: &str) -> IngestResult<UploadEntry> {
        self.lookup(token)
    }
}
