use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{EventWriter, WriteError};
use crate::events::Event;

/// Publica un mensaje ya serializado en un bus (Kafka, Pub/Sub...).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), WriteError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), WriteError> {
        (**self).publish(key, payload).await
    }
}

/// Writer hacia un bus de mensajes. Por defecto omite stdout/stderr/system logs
/// para acotar el tamaño de los mensajes.
pub struct BusWriter<P> {
    publisher: P,
    include_logs: bool,
}

impl<P: Publisher> BusWriter<P> {
    pub fn new(publisher: P) -> Self {
        BusWriter {
            publisher,
            include_logs: false,
        }
    }

    pub fn include_logs(mut self, yes: bool) -> Self {
        self.include_logs = yes;
        self
    }
}

#[async_trait]
impl<P: Publisher> EventWriter for BusWriter<P> {
    async fn write_event(&self, ev: &Event) -> Result<(), WriteError> {
        if ev.kind.is_log() && !self.include_logs {
            return Ok(());
        }
        let body = serde_json::to_vec(ev).map_err(|e| WriteError::Other(e.to_string()))?;
        self.publisher.publish(&ev.id, &body).await
    }
}

fn http_error(e: reqwest::Error) -> WriteError {
    WriteError::Transient(e.to_string())
}

fn status_error(status: reqwest::StatusCode, body: String) -> WriteError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        WriteError::Transient(format!("{status}: {body}"))
    } else {
        WriteError::Other(format!("{status}: {body}"))
    }
}

/// Kafka vía REST proxy (`POST {base}/topics/{topic}`).
pub struct KafkaRestPublisher {
    http: reqwest::Client,
    url: String,
}

impl KafkaRestPublisher {
    pub fn new(base: &str, topic: &str) -> Result<Self, WriteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WriteError::Other(e.to_string()))?;
        Ok(KafkaRestPublisher {
            http,
            url: format!("{}/topics/{}", base.trim_end_matches('/'), topic),
        })
    }
}

#[async_trait]
impl Publisher for KafkaRestPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), WriteError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| WriteError::Other(e.to_string()))?;
        let resp = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/vnd.kafka.json.v2+json")
            .json(&json!({ "records": [{ "key": key, "value": value }] }))
            .send()
            .await
            .map_err(http_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(status_error(status, resp.text().await.unwrap_or_default()));
        }
        Ok(())
    }
}

/// Google Pub/Sub vía REST (`topics/{topic}:publish`, datos en base64).
pub struct PubSubPublisher {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl PubSubPublisher {
    pub fn new(endpoint: &str, project: &str, topic: &str, token: &str) -> Result<Self, WriteError> {
        let endpoint = if endpoint.is_empty() {
            "https://pubsub.googleapis.com"
        } else {
            endpoint
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WriteError::Other(e.to_string()))?;
        Ok(PubSubPublisher {
            http,
            url: format!(
                "{}/v1/projects/{}/topics/{}:publish",
                endpoint.trim_end_matches('/'),
                project,
                topic
            ),
            token: token.to_owned(),
        })
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), WriteError> {
        let mut req = self.http.post(&self.url).json(&json!({
            "messages": [{
                "data": STANDARD.encode(payload),
                "attributes": { "id": key },
                "orderingKey": key,
            }]
        }));
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.map_err(http_error)?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(status_error(status, resp.text().await.unwrap_or_default()));
        }
        Ok(())
    }
}
