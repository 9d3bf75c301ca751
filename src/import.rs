//! Second-pass import: positional row parsing and bounded batch flushes.

use crate::records::{BatteryRecord, RecordStore};
use crate::scan::{parse_float, parse_int, DataRow, RowScanner, MIN_FIELDS};
use crate::IngestResult;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info};

pub const DEFAULT_IMPORT_BATCH: usize = 2000;

#[derive(Debug, Clone, Copy)]
pub struct ImportConfig {
    /// records buffered before one bulk write
    pub batch_size: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_IMPORT_BATCH,
        }
    }
}

/// Where accepted records are attributed.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub ledger_id: i64,
    pub source_file: Option<String>,
    pub upload_batch: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportTally {
    pub accepted: u64,
    pub skipped: u64,
    pub flushes: u64,
}

/// Parse the six positional fields
/// `cycle, time_min, voltage, current, temp, capacity`.
///
/// `None` when the row is short or any of the first four fails to parse.
/// Temp and capacity may be absent.
pub fn parse_record(row: &DataRow, prov: &Provenance) -> Option<BatteryRecord> {
    if row.fields.len() < MIN_FIELDS {
        return None;
    }
    let f = &row.fields;
    Some(BatteryRecord {
        ledger_id: prov.ledger_id,
        cycle: parse_int(&f[0])?,
        time_min: parse_float(&f[1])?,
        voltage: parse_float(&f[2])?,
        current: parse_float(&f[3])?,
        temp: parse_float(&f[4]),
        capacity: parse_float(&f[5]),
        source_file: prov.source_file.clone(),
        upload_batch: prov.upload_batch.clone(),
    })
}

/// Scan all rows into `store` in batches of `config.batch_size`.
///
/// A read or write error aborts immediately; batches flushed before it stay
/// written.
pub async fn import_rows<R>(
    scanner: &mut RowScanner<R>,
    store: &dyn RecordStore,
    prov: &Provenance,
    config: ImportConfig,
) -> IngestResult<ImportTally>
where
    R: AsyncRead + Unpin,
{
    let batch_size = config.batch_size.max(1);
    let mut tally = ImportTally::default();
    let mut batch: Vec<BatteryRecord> = Vec::with_capacity(batch_size);

    while let Some(row) = scanner.next_row().await? {
        let Some(record) = parse_record(&row, prov) else {
            debug!(
                line = row.line_no,
                fields = row.fields.len(),
                "skipping row with missing key fields"
            );
            tally.skipped += 1;
            continue;
        };
        batch.push(record);

        if batch.len() >= batch_size {
            flush(store, &mut batch, &mut tally)?;
        }
    }
    if !batch.is_empty() {
        flush(store, &mut batch, &mut tally)?;
    }

    Ok(tally)
}

fn flush(
    store: &dyn RecordStore,
    batch: &mut Vec<BatteryRecord>,
    tally: &mut ImportTally,
) -> IngestResult<()> {
    store.insert_batch(batch)?;
    tally.accepted += batch.len() as u64;
    tally.flushes += 1;
    info!(rows = batch.len(), total = tally.accepted, "flushed record batch");
    batch.clear();
    Ok(())
}
