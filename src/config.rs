//! Runtime configuration from environment variables.

use crate::import::ImportConfig;
use crate::sim::{InfluxConfig, SimulationConfig, DEFAULT_BATCH_ID, DEFAULT_FLUSH_SIZE, DEFAULT_PACE};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "./data/objects";
pub const DEFAULT_DB_PATH: &str = "./data/cellstream.db";
pub const DEFAULT_PREDICTOR_URL: &str = "http://localhost:5000";

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub predictor_url: String,
    pub import: ImportConfig,
    pub simulation: SimulationConfig,
    /// `None` unless `INFLUX_URL` is set
    pub influx: Option<InfluxConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset, unparseable or zero numbers use defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let positive = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|&v| v > 0)
        };

        let influx = lookup("INFLUX_URL").map(|url| InfluxConfig {
            url,
            org: lookup("INFLUX_ORG").unwrap_or_default(),
            bucket: lookup("INFLUX_BUCKET").unwrap_or_default(),
            token: lookup("INFLUX_TOKEN").unwrap_or_default(),
        });

        Self {
            data_dir: lookup("CELLSTREAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            db_path: lookup("CELLSTREAM_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            predictor_url: lookup("CELLSTREAM_PREDICTOR_URL")
                .unwrap_or_else(|| DEFAULT_PREDICTOR_URL.to_string()),
            import: ImportConfig {
                batch_size: positive("CELLSTREAM_IMPORT_BATCH")
                    .map(|v| v as usize)
                    .unwrap_or(ImportConfig::default().batch_size),
            },
            simulation: SimulationConfig {
                flush_size: positive("CELLSTREAM_SIM_FLUSH")
                    .map(|v| v as usize)
                    .unwrap_or(DEFAULT_FLUSH_SIZE),
                pace: positive("CELLSTREAM_SIM_PACE_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_PACE),
                batch_id: lookup("CELLSTREAM_SIM_BATCH_ID")
                    .unwrap_or_else(|| DEFAULT_BATCH_ID.to_string()),
            },
            influx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_and_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CELLSTREAM_IMPORT_BATCH", "100"),
            ("CELLSTREAM_SIM_FLUSH", "0"),
            ("CELLSTREAM_SIM_PACE_MS", "abc"),
            ("INFLUX_URL", "http://influx:8086"),
        ]
        .into_iter()
        .collect();
        let cfg = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.import.batch_size, 100);
        assert_eq!(cfg.simulation.flush_size, DEFAULT_FLUSH_SIZE);
        assert_eq!(cfg.simulation.pace, DEFAULT_PACE);
        assert_eq!(cfg.simulation.batch_id, DEFAULT_BATCH_ID);
        assert_eq!(cfg.predictor_url, DEFAULT_PREDICTOR_URL);
        assert_eq!(cfg.influx.map(|i| i.url).as_deref(), Some("http://influx:8086"));
    }
}
