//! Lightweight first pass over an upload: row count and a cycle estimate.

use crate::scan::{parse_int, RowScanner, COL_CYCLE};
use crate::IngestResult;
use serde::Serialize;
use tokio::io::AsyncRead;

/// Result of one draft scan. Rows themselves are never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DraftStats {
    /// non-blank lines after the header
    pub row_count: u64,
    /// largest parseable value in the Cycle column, if any
    pub max_cycle: Option<i64>,
}

impl DraftStats {
    /// Max cycle when one was seen, otherwise the row count.
    pub fn cycle_count(&self) -> i64 {
        self.max_cycle
            .unwrap_or_else(|| i64::try_from(self.row_count).unwrap_or(i64::MAX))
    }
}

/// Scan every data row once, keeping a high-water mark of the Cycle column.
///
/// Unparseable cycle values are dirty data: they count as rows but never move
/// the maximum. A file without a Cycle column falls back to the row count.
pub async fn analyze_draft<R>(scanner: &mut RowScanner<R>) -> IngestResult<DraftStats>
where
    R: AsyncRead + Unpin,
{
    let cycle_col = scanner.header().await?.and_then(|h| h.get(COL_CYCLE));

    let mut row_count = 0u64;
    let mut max_cycle: Option<i64> = None;
    while let Some(row) = scanner.next_row().await? {
        row_count += 1;
        let Some(cycle) = cycle_col.and_then(|c| row.field(c)).and_then(parse_int) else {
            continue;
        };
        if max_cycle.map_or(true, |m| cycle > m) {
            max_cycle = Some(cycle);
        }
    }

    Ok(DraftStats {
        row_count,
        max_cycle,
    })
}
