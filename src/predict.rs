//! SOH prediction bridge: one cycle, four channels, 128 points each.

use crate::resample::{resample, TARGET_LEN};
use crate::scan::{parse_float, parse_int, RowScanner, COL_CURRENT, COL_CYCLE, COL_TEMP, COL_TIME_MIN, COL_VOLTAGE};
use crate::{IngestError, IngestResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info};

/// Success sentinel in the service's `code` field.
pub const SUCCESS_CODE: i64 = 200;

/// Raw per-channel values of one cycle, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSeries {
    pub time: Vec<f64>,
    pub current: Vec<f64>,
    pub voltage: Vec<f64>,
    pub temp: Vec<f64>,
}

impl CycleSeries {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Request body: four channels resampled to [`TARGET_LEN`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictRequest {
    pub time: Vec<f64>,
    pub current: Vec<f64>,
    pub voltage: Vec<f64>,
    pub temp: Vec<f64>,
}

impl PredictRequest {
    pub fn from_series(series: &CycleSeries) -> Self {
        Self {
            time: resample(&series.time, TARGET_LEN),
            current: resample(&series.current, TARGET_LEN),
            voltage: resample(&series.voltage, TARGET_LEN),
            temp: resample(&series.temp, TARGET_LEN),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictResponse {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<PredictData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictData {
    #[serde(default)]
    pub soh: Option<f64>,
    #[serde(default)]
    pub health_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SohPrediction {
    pub soh: f64,
    pub health_status: Option<String>,
}

impl PredictResponse {
    /// Success only with `code == 200` and a `data.soh` value.
    pub fn into_prediction(self) -> IngestResult<SohPrediction> {
        if self.code != SUCCESS_CODE {
            return Err(IngestError::Predictor(format!(
                "service returned code {}: {}",
                self.code,
                self.msg.unwrap_or_default()
            )));
        }
        let data = self
            .data
            .ok_or_else(|| IngestError::Predictor("response has no data".into()))?;
        let soh = data
            .soh
            .ok_or_else(|| IngestError::Predictor("response has no soh field".into()))?;
        Ok(SohPrediction {
            soh,
            health_status: data.health_status,
        })
    }
}

/// Collect the four channels for rows whose Cycle equals `cycle`.
///
/// Rows with any unparseable channel are skipped. No matching rows is
/// [`IngestError::NoRowsForCycle`].
pub async fn collect_cycle<R>(scanner: &mut RowScanner<R>, cycle: i64) -> IngestResult<CycleSeries>
where
    R: AsyncRead + Unpin,
{
    let header = scanner.require_header().await?;
    let idx_cycle = header.require(COL_CYCLE)?;
    let idx_time = header.require(COL_TIME_MIN)?;
    let idx_voltage = header.require(COL_VOLTAGE)?;
    let idx_current = header.require(COL_CURRENT)?;
    let idx_temp = header.require(COL_TEMP)?;

    let mut series = CycleSeries::default();
    while let Some(row) = scanner.next_row().await? {
        if row.field(idx_cycle).and_then(parse_int) != Some(cycle) {
            continue;
        }
        let values = (
            row.field(idx_time).and_then(parse_float),
            row.field(idx_voltage).and_then(parse_float),
            row.field(idx_current).and_then(parse_float),
            row.field(idx_temp).and_then(parse_float),
        );
        let (Some(t), Some(v), Some(c), Some(tp)) = values else {
            debug!(line = row.line_no, "skipping unparseable row in cycle");
            continue;
        };
        series.time.push(t);
        series.voltage.push(v);
        series.current.push(c);
        series.temp.push(tp);
    }

    if series.is_empty() {
        return Err(IngestError::NoRowsForCycle(cycle));
    }
    Ok(series)
}

/// A remote SOH model. One call, no retry.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: &PredictRequest) -> IngestResult<SohPrediction>;
}

/// HTTP client for `POST {base_url}/predict`.
#[derive(Clone)]
pub struct SohClient {
    client: Client,
    base_url: String,
}

impl SohClient {
    pub fn new(base_url: impl Into<String>) -> IngestResult<Self> {
        let base_url: String = base_url.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[inline]
    fn url(&self) -> String {
        format!("{}/predict", self.base_url)
    }
}

#[async_trait]
impl Predictor for SohClient {
    async fn predict(&self, request: &PredictRequest) -> IngestResult<SohPrediction> {
        let resp = self.client.post(self.url()).json(request).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(IngestError::Predictor(format!("HTTP {status}: {text}")));
        }

        let body = resp.bytes().await?;
        if body.is_empty() {
            return Err(IngestError::Predictor("empty response body".into()));
        }
        let parsed: PredictResponse = serde_json::from_slice(&body)?;
        let prediction = parsed.into_prediction()?;
        info!(soh = prediction.soh, "soh prediction received");
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> IngestResult<SohPrediction> {
        serde_json::from_str::<PredictResponse>(json)
            .unwrap()
            .into_prediction()
    }

    #[test]
    fn accepts_success_body() {
        let p = parse(r#"{"code":200,"msg":"ok","data":{"soh":91.5,"health_status":"good"}}"#).unwrap();
        assert_eq!(p.soh, 91.5);
        assert_eq!(p.health_status.as_deref(), Some("good"));
    }

    #[test]
    fn rejects_non_success_code_and_missing_fields() {
        assert!(parse(r#"{"code":500,"msg":"boom","data":{"soh":91.5}}"#).is_err());
        assert!(parse(r#"{"code":200,"msg":"ok"}"#).is_err());
        assert!(parse(r#"{"code":200,"msg":"ok","data":{"health_status":"good"}}"#).is_err());
    }

    #[test]
    fn request_has_fixed_length_channels() {
        let series = CycleSeries {
            time: vec![0.0, 1.0, 2.0],
            current: vec![1.0; 3],
            voltage: vec![3.7, 3.6, 3.5],
            temp: vec![25.0; 3],
        };
        let req = PredictRequest::from_series(&series);
        for ch in [&req.time, &req.current, &req.voltage, &req.temp] {
            assert_eq!(ch.len(), TARGET_LEN);
        }
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("temp").is_some());
    }
}
