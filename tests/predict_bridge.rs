use async_trait::async_trait;
use bytes::Bytes;
use cellstream::import::ImportConfig;
use cellstream::predict::{PredictRequest, Predictor, SohClient, SohPrediction};
use cellstream::records::MemoryRecordStore;
use cellstream::registry::MemoryRegistry;
use cellstream::resample::TARGET_LEN;
use cellstream::store::MemoryObjectStore;
use cellstream::{IngestError, IngestResult, Ingestor, Upload};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Records the request and answers with a fixed SOH.
#[derive(Default)]
struct CapturingPredictor {
    seen: Mutex<Option<PredictRequest>>,
}

#[async_trait]
impl Predictor for CapturingPredictor {
    async fn predict(&self, request: &PredictRequest) -> IngestResult<SohPrediction> {
        *self.seen.lock() = Some(request.clone());
        Ok(SohPrediction {
            soh: 88.0,
            health_status: Some("good".into()),
        })
    }
}

fn ingestor() -> Ingestor {
    Ingestor::new(
        Arc::new(MemoryObjectStore::new()),
        Arc::new(MemoryRegistry::new()),
        Arc::new(MemoryRecordStore::new()),
        ImportConfig::default(),
    )
}

async fn drafted(ingestor: &Ingestor, body: &str) -> anyhow::Result<String> {
    let draft = ingestor
        .draft(Upload {
            file_name: Some("cells.csv".into()),
            content_type: None,
            body: Bytes::from(body.to_string()),
        })
        .await?;
    Ok(draft.upload_token)
}

fn two_cycle_csv() -> String {
    let mut s = String::from("cycle,time_min,voltage,current,temp,capacity\n");
    for i in 0..10 {
        s.push_str(&format!("1,{i},3.{i},1.0,25.0,2.0\n"));
    }
    // unparseable voltage in the selected cycle is skipped
    s.push_str("2,0,oops,1.0,26.0,1.9\n");
    for i in 0..4 {
        s.push_str(&format!("2,{i},4.0,-1.0,26.0,1.9\n"));
    }
    s
}

#[tokio::test]
async fn resamples_only_the_selected_cycle() -> anyhow::Result<()> {
    let ingestor = ingestor();
    let token = drafted(&ingestor, &two_cycle_csv()).await?;
    let predictor = CapturingPredictor::default();

    let prediction = ingestor.predict(&token, 2, &predictor).await?;
    assert_eq!(prediction.soh, 88.0);

    let req = predictor.seen.lock().clone().expect("request sent");
    assert_eq!(req.time.len(), TARGET_LEN);
    assert_eq!(req.voltage.len(), TARGET_LEN);
    assert!(req.voltage.iter().all(|v| (v - 4.0).abs() < 1e-9));
    assert!(req.current.iter().all(|c| (c + 1.0).abs() < 1e-9));
    assert_eq!(req.time[0], 0.0);
    assert!((req.time[TARGET_LEN - 1] - 3.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn missing_cycle_is_a_business_error() -> anyhow::Result<()> {
    let ingestor = ingestor();
    let token = drafted(&ingestor, &two_cycle_csv()).await?;
    let err = ingestor
        .predict(&token, 99, &CapturingPredictor::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NoRowsForCycle(99)));
    assert!(err.is_validation());
    Ok(())
}

#[tokio::test]
async fn missing_temp_column_is_reported() -> anyhow::Result<()> {
    let ingestor = ingestor();
    let token = drafted(&ingestor, "Cycle,Time_Min,Voltage,Current,Capacity,Extra\n1,0,3.7,1,2,0\n").await?;
    let err = ingestor
        .predict(&token, 1, &CapturingPredictor::default())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::MissingColumn(c) if c == "Temp"));
    Ok(())
}

/// One-shot HTTP responder; returns the base URL.
async fn serve_once(status: &'static str, body: &'static str) -> anyhow::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        // read headers, then exactly Content-Length bytes of body
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let resp = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = sock.write_all(resp.as_bytes()).await;
        let _ = sock.shutdown().await;
    });
    Ok(format!("http://{addr}"))
}

fn flat_request() -> PredictRequest {
    PredictRequest {
        time: vec![0.0; TARGET_LEN],
        current: vec![1.0; TARGET_LEN],
        voltage: vec![3.7; TARGET_LEN],
        temp: vec![25.0; TARGET_LEN],
    }
}

#[tokio::test]
async fn client_parses_success_response() -> anyhow::Result<()> {
    let url = serve_once(
        "200 OK",
        r#"{"code":200,"msg":"success","data":{"soh":93.25,"health_status":"Healthy"}}"#,
    )
    .await?;
    let prediction = SohClient::new(url)?.predict(&flat_request()).await?;
    assert_eq!(prediction.soh, 93.25);
    assert_eq!(prediction.health_status.as_deref(), Some("Healthy"));
    Ok(())
}

#[tokio::test]
async fn client_surfaces_service_errors() -> anyhow::Result<()> {
    let url = serve_once("500 Internal Server Error", r#"{"error":"model not loaded"}"#).await?;
    let err = SohClient::new(url)?.predict(&flat_request()).await.unwrap_err();
    assert!(matches!(err, IngestError::Predictor(_)));

    let url = serve_once("200 OK", r#"{"code":400,"msg":"bad input","data":null}"#).await?;
    let err = SohClient::new(url)?.predict(&flat_request()).await.unwrap_err();
    assert!(matches!(err, IngestError::Predictor(m) if m.contains("bad input")));
    Ok(())
}
