// src/services/vector.rs

//! Vector store upserts.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{ChunkRecord, VectorStoreConfig};
use crate::utils::http::create_api_client;

const API_VERSION: &str = "2025-01";

/// Receives batches of text chunks.
#[async_trait]
pub trait VectorSink: Send + Sync {
    async fn upsert(&self, records: &[ChunkRecord]) -> Result<()>;
}

/// Pinecone integrated-embedding index, fed through the records API.
pub struct PineconeSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    text_field: String,
}

impl PineconeSink {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let host = config.host.trim().trim_end_matches('/');
        if host.is_empty() {
            return Err(AppError::config("vector_store.host is not set"));
        }
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AppError::config("PINECONE_API_KEY is not set"))?;

        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };

        Ok(Self {
            client: create_api_client(config)?,
            endpoint: format!("{base}/records/namespaces/{}/upsert", config.namespace),
            api_key,
            text_field: config.text_field.clone(),
        })
    }

    /// Newline-delimited JSON body for a batch.
    fn body(&self, records: &[ChunkRecord]) -> Result<String> {
        let mut body = String::new();
        for record in records {
            let mut fields = match serde_json::to_value(&record.metadata)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            fields.insert("_id".into(), Value::String(record.id().to_string()));
            fields.insert(self.text_field.clone(), Value::String(record.text.clone()));
            body.push_str(&serde_json::to_string(&fields)?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl VectorSink for PineconeSink {
    async fn upsert(&self, records: &[ChunkRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(self.body(records)?)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::VectorStore(format!(
                "upsert of {} records failed with HTTP {}: {}",
                records.len(),
                status.as_u16(),
                detail.trim()
            )));
        }

        log::debug!("Upserted {} records", records.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VectorStoreConfig {
        VectorStoreConfig {
            host: "judgments-abc123.svc.pinecone.io/".into(),
            api_key: Some("key".into()),
            ..VectorStoreConfig::default()
        }
    }

    #[test]
    fn endpoint_uses_namespace() {
        let sink = PineconeSink::new(&config()).unwrap();
        assert_eq!(
            sink.endpoint,
            "https://judgments-abc123.svc.pinecone.io/records/namespaces/judgments/upsert"
        );
    }

    #[test]
    fn missing_credentials_are_config_errors() {
        let mut cfg = config();
        cfg.api_key = None;
        assert!(matches!(PineconeSink::new(&cfg), Err(AppError::Config(_))));

        let mut cfg = config();
        cfg.host = String::new();
        assert!(matches!(PineconeSink::new(&cfg), Err(AppError::Config(_))));
    }

    #[test]
    fn body_is_one_json_record_per_line() {
        let sink = PineconeSink::new(&config()).unwrap();
        let records = vec![
            ChunkRecord::new("documents/a.pdf", "A", 0, "first".into(), 200),
            ChunkRecord::new("documents/a.pdf", "A", 1, "second".into(), 200),
        ];

        let body = sink.body(&records).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["_id"], "documents/a.pdf-1");
        assert_eq!(lines[1]["chunk_text"], "second");
        assert_eq!(lines[1]["source"], "documents/a.pdf");
        assert_eq!(lines[1]["chunk_index"], 1);
    }
}
