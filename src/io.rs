use crate::IngestResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};

/// What we know about a stored or local CSV before reading it.
#[derive(Debug, Clone)]
pub struct CsvMeta {
    /// e.g. "text/csv; charset=gbk" or "application/gzip"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// original filename (used for extension fallback)
    pub name_hint: String,
}

impl Default for CsvMeta {
    fn default() -> Self {
        Self {
            content_type: "text/csv".into(),
            content_encoding: String::new(),
            name_hint: String::new(),
        }
    }
}

impl CsvMeta {
    pub fn new(content_type: Option<&str>, name_hint: Option<&str>) -> Self {
        Self {
            content_type: content_type.unwrap_or("text/csv").to_string(),
            content_encoding: String::new(),
            name_hint: name_hint.unwrap_or_default().to_string(),
        }
    }

    /// Charset named by a `charset=` parameter of the content type, UTF-8 otherwise.
    /// Lines are framed on the `\n` byte, so only ASCII-compatible charsets are honoured.
    pub fn charset(&self) -> &'static encoding_rs::Encoding {
        self.content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .and_then(|(_, v)| encoding_rs::Encoding::for_label(v.trim().trim_matches('"').as_bytes()))
            .filter(|enc| enc.is_ascii_compatible())
            .unwrap_or(encoding_rs::UTF_8)
    }

    fn mime(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    fn is_gzip(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "gzip")
            || matches!(self.mime().as_str(), "application/gzip" | "application/x-gzip")
            || self.name_hint.ends_with(".gz")
    }

    fn is_zstd(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "zstd")
            || self.mime() == "application/zstd"
            || self.name_hint.ends_with(".zst")
    }
}

/// Wrap a raw byte source with decompression chosen from `meta`.
/// Charset decoding happens later, per line, in [`crate::LineCodec`].
pub fn build_csv_reader<R>(raw: R, meta: &CsvMeta) -> Box<dyn AsyncRead + Unpin + Send>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(1 << 16, raw);
    if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    }
}

/// Build a reader from a local file path (meta from extension only).
pub async fn reader_from_path(path: &Path) -> IngestResult<(Box<dyn AsyncRead + Unpin + Send>, CsvMeta)> {
    let file = File::open(path).await?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let mut meta = CsvMeta {
        name_hint: name,
        ..Default::default()
    };

    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match ext {
        "gz" => {
            meta.content_type = "application/gzip".into();
            meta.content_encoding = "gzip".into();
        }
        "zst" => {
            meta.content_type = "application/zstd".into();
            meta.content_encoding = "zstd".into();
        }
        _ => {}
    }

    let reader = build_csv_reader(file, &meta);
    Ok((reader, meta))
}
