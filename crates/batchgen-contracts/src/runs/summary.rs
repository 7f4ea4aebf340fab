use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::batches::{Batch, BatchStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_batches: u64,
    pub total_results_normal: u64,
    pub total_results_pro: u64,
    pub failures: Vec<Map<String, Value>>,
}

impl SessionSummary {
    /// Tallies results and failed batches from a store snapshot.
    pub fn from_batches(
        session_id: impl Into<String>,
        started_at: impl Into<String>,
        batches: &[Batch],
    ) -> Self {
        let failures = batches
            .iter()
            .filter(|batch| batch.status == BatchStatus::Error)
            .map(|batch| {
                let mut row = Map::new();
                row.insert("batch_id".to_string(), Value::String(batch.id.to_string()));
                row.insert("name".to_string(), Value::String(batch.name.clone()));
                if let Some(failure) = &batch.error {
                    row.insert(
                        "kind".to_string(),
                        Value::String(failure.kind.as_str().to_string()),
                    );
                    row.insert("error".to_string(), Value::String(failure.message.clone()));
                }
                row
            })
            .collect();
        Self {
            session_id: session_id.into(),
            started_at: started_at.into(),
            finished_at: now_utc_iso(),
            total_batches: batches.len() as u64,
            total_results_normal: batches
                .iter()
                .map(|batch| batch.results_normal.len() as u64)
                .sum(),
            total_results_pro: batches
                .iter()
                .map(|batch| batch.results_pro.len() as u64)
                .sum(),
            failures,
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
