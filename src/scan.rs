//! Line tokenizing, header resolution and the streaming row scanner.
//!
//! Every consumer (draft, import, prediction, simulation) reads through
//! [`RowScanner`], so they all agree on blank-line skipping, header detection
//! and the comma-then-tab delimiter fallback.

use crate::{CsvMeta, IngestError, IngestResult, LineCodec};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tracing::debug;

/// A comma split with fewer fields than this is retried on tabs.
pub const MIN_FIELDS: usize = 6;

pub const COL_CYCLE: &str = "Cycle";
pub const COL_TIME_MIN: &str = "Time_Min";
pub const COL_VOLTAGE: &str = "Voltage";
pub const COL_CURRENT: &str = "Current";
pub const COL_TEMP: &str = "Temp";
pub const COL_CAPACITY: &str = "Capacity";

/// Split a line on commas, or on tabs when commas yield fewer than [`MIN_FIELDS`].
/// Fields are trimmed.
pub fn split_fields(line: &str) -> Vec<String> {
    let mut fields: Vec<&str> = line.split(',').collect();
    if fields.len() < MIN_FIELDS {
        fields = line.split('\t').collect();
    }
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

/// Integer parse of a trimmed field; empty or malformed yields `None`.
pub fn parse_int(field: &str) -> Option<i64> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    field.parse().ok()
}

/// Float parse of a trimmed field; empty or malformed yields `None`.
pub fn parse_float(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    field.parse().ok()
}

/// Column name -> zero-based index, built from the header line.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl HeaderMap {
    pub fn from_fields(fields: &[String]) -> Self {
        let names: Vec<String> = fields.iter().map(|f| f.trim().to_string()).collect();
        let mut index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            // a repeated name resolves to its last occurrence
            index.insert(name.clone(), i);
        }
        Self { names, index }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exact lookup by trimmed name.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Exact lookup first, then the first case-insensitive match.
    pub fn get_ignore_case(&self, name: &str) -> Option<usize> {
        self.get(name).or_else(|| {
            self.names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(name))
        })
    }

    /// Like [`HeaderMap::get_ignore_case`] but a missing column is a business error.
    pub fn require(&self, name: &str) -> IngestResult<usize> {
        self.get_ignore_case(name)
            .ok_or_else(|| IngestError::MissingColumn(name.to_string()))
    }
}

/// One non-blank, non-header line.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// 1-based physical line number in the source
    pub line_no: usize,
    pub fields: Vec<String>,
}

impl DataRow {
    pub fn field(&self, idx: usize) -> Option<&str> {
        self.fields.get(idx).map(String::as_str)
    }
}

/// Single-pass scanner over a byte stream. Not restartable: the reader is consumed.
pub struct RowScanner<R> {
    lines: FramedRead<R, LineCodec>,
    line_no: usize,
    header: Option<HeaderMap>,
    header_read: bool,
}

impl<R> RowScanner<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self::with_charset(reader, encoding_rs::UTF_8)
    }

    pub fn with_meta(reader: R, meta: &CsvMeta) -> Self {
        Self::with_charset(reader, meta.charset())
    }

    pub fn with_charset(reader: R, charset: &'static encoding_rs::Encoding) -> Self {
        Self {
            lines: FramedRead::new(reader, LineCodec::new(charset)),
            line_no: 0,
            header: None,
            header_read: false,
        }
    }

    async fn next_line(&mut self) -> IngestResult<Option<(usize, String)>> {
        while let Some(line) = self.lines.next().await {
            let line = line?;
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some((self.line_no, trimmed.to_string())));
        }
        Ok(None)
    }

    /// The header, reading it on first call. `None` when the stream has no
    /// non-blank line at all.
    pub async fn header(&mut self) -> IngestResult<Option<&HeaderMap>> {
        if !self.header_read {
            self.header_read = true;
            if let Some((line_no, line)) = self.next_line().await? {
                let header = HeaderMap::from_fields(&split_fields(&line));
                debug!(line_no, columns = header.len(), "csv header detected");
                self.header = Some(header);
            }
        }
        Ok(self.header.as_ref())
    }

    /// Header or [`IngestError::EmptyCsv`].
    pub async fn require_header(&mut self) -> IngestResult<HeaderMap> {
        match self.header().await? {
            Some(h) => Ok(h.clone()),
            None => Err(IngestError::EmptyCsv),
        }
    }

    /// Next data row; the header is consumed first if still pending.
    pub async fn next_row(&mut self) -> IngestResult<Option<DataRow>> {
        if !self.header_read {
            self.header().await?;
        }
        Ok(self.next_line().await?.map(|(line_no, line)| DataRow {
            line_no,
            fields: split_fields(&line),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_split_with_enough_fields() {
        let f = split_fields("1, 0.5 ,3.7,1.0,25,2.0");
        assert_eq!(f, vec!["1", "0.5", "3.7", "1.0", "25", "2.0"]);
    }

    #[test]
    fn falls_back_to_tab_when_commas_are_short() {
        let f = split_fields("1\t0.5\t3.7\t1.0\t25\t2.0");
        assert_eq!(f.len(), 6);
        assert_eq!(f[2], "3.7");
    }

    #[test]
    fn short_line_without_tabs_stays_one_field() {
        assert_eq!(split_fields("a,b"), vec!["a,b"]);
    }

    #[test]
    fn explicit_optional_parsing() {
        assert_eq!(parse_int(" 42 "), Some(42));
        assert_eq!(parse_int("4.2"), None);
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_float("3.70"), Some(3.7));
        assert_eq!(parse_float("x"), None);
    }

    #[test]
    fn header_lookup() {
        let fields: Vec<String> = ["Cycle", " Time_Min ", "voltage"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let h = HeaderMap::from_fields(&fields);
        assert_eq!(h.get("Cycle"), Some(0));
        assert_eq!(h.get("Time_Min"), Some(1));
        assert_eq!(h.get("Voltage"), None);
        assert_eq!(h.get_ignore_case("Voltage"), Some(2));
        assert!(matches!(h.require("Temp"), Err(IngestError::MissingColumn(c)) if c == "Temp"));
    }

    #[tokio::test]
    async fn scanner_skips_blanks_and_splits_header() {
        let data = "\n  \nCycle,Time_Min,Voltage,Current,Temp,Capacity\n\n1,0,3.7,1,25,2\r\n2,0,3.6,1,25,1.9";
        let mut scanner = RowScanner::new(data.as_bytes());
        let header = scanner.require_header().await.unwrap();
        assert_eq!(header.get("Capacity"), Some(5));

        let first = scanner.next_row().await.unwrap().unwrap();
        assert_eq!(first.line_no, 5);
        assert_eq!(first.field(0), Some("1"));
        let second = scanner.next_row().await.unwrap().unwrap();
        assert_eq!(second.field(5), Some("1.9"));
        assert!(scanner.next_row().await.unwrap().is_none());
    }
}
