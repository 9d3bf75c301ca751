//! Paced replay of archived CSV files into a time-series sink.
//!
//! Each channel is its own tokio task: `Idle -> Running -> Completed | Aborted`.
//! Channels share nothing but a [`StopSignal`], polled once per row.

use crate::scan::{
    parse_float, parse_int, DataRow, HeaderMap, RowScanner, COL_CAPACITY, COL_CURRENT, COL_CYCLE,
    COL_TEMP, COL_TIME_MIN, COL_VOLTAGE,
};
use crate::{reader_from_path, IngestError, IngestResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_FLUSH_SIZE: usize = 500;
pub const DEFAULT_PACE: Duration = Duration::from_millis(50);
pub const DEFAULT_BATCH_ID: &str = "batch1";
pub const MEASUREMENT: &str = "battery_metrics";

/// Cross-channel stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// points buffered before one sink write
    pub flush_size: usize,
    /// pause after every flush
    pub pace: Duration,
    /// `batch_id` tag on every point
    pub batch_id: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            flush_size: DEFAULT_FLUSH_SIZE,
            pace: DEFAULT_PACE,
            batch_id: DEFAULT_BATCH_ID.to_string(),
        }
    }
}

/// One replayed row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub cell_id: String,
    pub batch_id: String,
    pub cycle_index: i64,
    pub voltage: f64,
    pub current: f64,
    pub temperature: Option<f64>,
    pub capacity: Option<f64>,
    /// unix epoch milliseconds
    pub timestamp_ms: i64,
}

fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, ',' | ' ' | '=' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl SeriesPoint {
    /// InfluxDB line protocol, millisecond timestamp.
    pub fn to_line_protocol(&self, measurement: &str) -> String {
        let mut line = format!(
            "{},cell_id={},batch_id={},cycle_index={} voltage={},current={}",
            measurement.replace(',', "\\,").replace(' ', "\\ "),
            escape_tag(&self.cell_id),
            escape_tag(&self.batch_id),
            self.cycle_index,
            self.voltage,
            self.current,
        );
        if let Some(t) = self.temperature {
            let _ = write!(line, ",temperature={t}");
        }
        if let Some(c) = self.capacity {
            let _ = write!(line, ",capacity={c}");
        }
        let _ = write!(line, " {}", self.timestamp_ms);
        line
    }
}

/// Destination of replayed points. One call per flushed buffer, in order.
#[async_trait]
pub trait SeriesSink: Send + Sync {
    async fn write(&self, points: &[SeriesPoint]) -> IngestResult<()>;
}

/// Keeps every write in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    writes: Mutex<Vec<Vec<SeriesPoint>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<Vec<SeriesPoint>> {
        self.writes.lock().clone()
    }

    pub fn points_for(&self, cell_id: &str) -> Vec<SeriesPoint> {
        self.writes
            .lock()
            .iter()
            .flatten()
            .filter(|p| p.cell_id == cell_id)
            .cloned()
            .collect()
    }

    pub fn total_points(&self) -> usize {
        self.writes.lock().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl SeriesSink for MemorySink {
    async fn write(&self, points: &[SeriesPoint]) -> IngestResult<()> {
        self.writes.lock().push(points.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

/// InfluxDB v2 `/api/v2/write` over HTTP.
#[derive(Clone)]
pub struct InfluxSink {
    client: Client,
    config: InfluxConfig,
}

impl InfluxSink {
    pub fn new(config: InfluxConfig) -> IngestResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl SeriesSink for InfluxSink {
    async fn write(&self, points: &[SeriesPoint]) -> IngestResult<()> {
        let body = points
            .iter()
            .map(|p| p.to_line_protocol(MEASUREMENT))
            .collect::<Vec<_>>()
            .join("\n");
        let url = format!("{}/api/v2/write", self.config.url.trim_end_matches('/'));
        let resp = self
            .client
            .post(url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", "ms"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.config.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(IngestError::Sink(format!("write {status}: {text}")));
        }
        Ok(())
    }
}

/// What to replay and under which target id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub path: PathBuf,
    pub target_id: String,
}

impl ChannelSpec {
    pub fn new(path: impl Into<PathBuf>, target_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target_id: target_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Idle,
    Running,
    Completed,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub target_id: String,
    pub state: ChannelState,
    pub points_written: u64,
    pub rows_skipped: u64,
    pub flushes: u64,
}

struct SimColumns {
    cycle: usize,
    time_min: usize,
    voltage: usize,
    current: usize,
    temp: Option<usize>,
    capacity: Option<usize>,
}

impl SimColumns {
    fn resolve(header: &HeaderMap) -> IngestResult<Self> {
        Ok(Self {
            cycle: header.require(COL_CYCLE)?,
            time_min: header.require(COL_TIME_MIN)?,
            voltage: header.require(COL_VOLTAGE)?,
            current: header.require(COL_CURRENT)?,
            temp: header.get_ignore_case(COL_TEMP),
            capacity: header.get_ignore_case(COL_CAPACITY),
        })
    }
}

fn finite(field: Option<&str>) -> Option<f64> {
    field.and_then(parse_float).filter(|v| v.is_finite())
}

struct Channel {
    spec: ChannelSpec,
    state: ChannelState,
    points_written: u64,
    rows_skipped: u64,
    flushes: u64,
}

impl Channel {
    fn new(spec: ChannelSpec) -> Self {
        Self {
            spec,
            state: ChannelState::Idle,
            points_written: 0,
            rows_skipped: 0,
            flushes: 0,
        }
    }

    async fn run(mut self, sink: &dyn SeriesSink, signal: &StopSignal, config: &SimulationConfig) -> ChannelReport {
        self.state = ChannelState::Running;
        info!(
            target_id = %self.spec.target_id,
            path = %self.spec.path.display(),
            "simulation channel started"
        );

        self.state = match self.replay(sink, signal, config).await {
            Ok(false) => ChannelState::Completed,
            Ok(true) => ChannelState::Aborted(AbortReason::Stopped),
            Err(e) => {
                error!(target_id = %self.spec.target_id, error = %e, "simulation channel failed");
                ChannelState::Aborted(AbortReason::Failed(e.to_string()))
            }
        };
        info!(
            target_id = %self.spec.target_id,
            state = ?self.state,
            points = self.points_written,
            skipped = self.rows_skipped,
            "simulation channel finished"
        );

        ChannelReport {
            target_id: self.spec.target_id,
            state: self.state,
            points_written: self.points_written,
            rows_skipped: self.rows_skipped,
            flushes: self.flushes,
        }
    }

    /// `Ok(true)` when the stop signal ended the replay early.
    async fn replay(&mut self, sink: &dyn SeriesSink, signal: &StopSignal, config: &SimulationConfig) -> IngestResult<bool> {
        let (reader, meta) = reader_from_path(&self.spec.path).await?;
        let mut scanner = RowScanner::with_meta(reader, &meta);
        let header = scanner.require_header().await?;
        let cols = SimColumns::resolve(&header)?;

        let flush_size = config.flush_size.max(1);
        let started_ms = Utc::now().timestamp_millis();
        let mut buffer: Vec<SeriesPoint> = Vec::with_capacity(flush_size);
        let mut stopped = false;

        while let Some(row) = scanner.next_row().await? {
            if signal.is_stop_requested() {
                stopped = true;
                break;
            }
            let Some(point) = self.point(&row, &cols, config, started_ms) else {
                self.rows_skipped += 1;
                continue;
            };
            buffer.push(point);

            if buffer.len() >= flush_size {
                self.flush(sink, &mut buffer).await?;
                tokio::time::sleep(config.pace).await;
            }
        }
        if !buffer.is_empty() {
            self.flush(sink, &mut buffer).await?;
        }
        if stopped {
            warn!(target_id = %self.spec.target_id, "simulation channel stopped on request");
        }
        Ok(stopped)
    }

    fn point(&self, row: &DataRow, cols: &SimColumns, config: &SimulationConfig, started_ms: i64) -> Option<SeriesPoint> {
        let cycle_index = row.field(cols.cycle).and_then(parse_int)?;
        let time_min = finite(row.field(cols.time_min))?;
        let voltage = finite(row.field(cols.voltage))?;
        let current = finite(row.field(cols.current))?;
        let offset_ms = (time_min * 60.0 * 1000.0).round() as i64;

        Some(SeriesPoint {
            cell_id: self.spec.target_id.clone(),
            batch_id: config.batch_id.clone(),
            cycle_index,
            voltage,
            current,
            temperature: cols.temp.and_then(|i| finite(row.field(i))),
            capacity: cols.capacity.and_then(|i| finite(row.field(i))),
            timestamp_ms: started_ms.saturating_add(offset_ms),
        })
    }

    async fn flush(&mut self, sink: &dyn SeriesSink, buffer: &mut Vec<SeriesPoint>) -> IngestResult<()> {
        sink.write(buffer).await?;
        self.points_written += buffer.len() as u64;
        self.flushes += 1;
        debug!(target_id = %self.spec.target_id, points = buffer.len(), "flushed series points");
        buffer.clear();
        Ok(())
    }
}

/// Launches replay channels against one sink and one shared stop signal.
pub struct SimulationEngine {
    sink: Arc<dyn SeriesSink>,
    signal: StopSignal,
    config: SimulationConfig,
}

impl SimulationEngine {
    pub fn new(sink: Arc<dyn SeriesSink>, config: SimulationConfig) -> Self {
        Self {
            sink,
            signal: StopSignal::new(),
            config,
        }
    }

    pub fn signal(&self) -> StopSignal {
        self.signal.clone()
    }

    /// Clear the stop signal and start one channel.
    pub fn launch(&self, spec: ChannelSpec) -> JoinHandle<ChannelReport> {
        self.signal.clear();
        self.spawn(spec)
    }

    /// Clear the stop signal once and start every channel.
    pub fn launch_all(&self, specs: impl IntoIterator<Item = ChannelSpec>) -> Vec<JoinHandle<ChannelReport>> {
        self.signal.clear();
        specs.into_iter().map(|spec| self.spawn(spec)).collect()
    }

    /// Ask every running channel to stop at its next row.
    pub fn stop(&self) {
        self.signal.request_stop();
        info!("simulation stop requested");
    }

    fn spawn(&self, spec: ChannelSpec) -> JoinHandle<ChannelReport> {
        let sink = Arc::clone(&self.sink);
        let signal = self.signal.clone();
        let config = self.config.clone();
        tokio::spawn(async move { Channel::new(spec).run(sink.as_ref(), &signal, &config).await })
    }
}
