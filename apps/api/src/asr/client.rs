//! Client for the managed ASR (speech recognition) vendor.
//!
//! The vendor is driven through two calls: `submit` to start a transcription
//! keyed by our task id, and `query` to read its status and result.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::AsrConfig;
use crate::tasks::TaskStatus;

#[derive(Debug, Error)]
pub enum AsrError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ASR vendor error (status {status}): {message}")]
    Api { status: u16, message: String },
}

/// Vendor status as reported by `query`, already mapped onto our states.
#[derive(Debug, Clone, PartialEq)]
pub enum VendorStatus {
    Processing,
    Completed(Value),
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    app_id: &'a str,
    task_id: Uuid,
}

/// Maps the vendor's free-form status string onto the task state machine.
/// Unknown values are treated as still running.
pub fn map_vendor_status(status: &str) -> TaskStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "completed" | "complete" | "success" | "succeeded" | "done" => TaskStatus::Completed,
        "failed" | "failure" | "error" | "cancelled" | "canceled" => TaskStatus::Failed,
        _ => TaskStatus::Processing,
    }
}

/// Builds the submit body: the fixed fields plus every caller option,
/// with the fixed fields taking precedence.
pub fn submit_body(
    app_id: &str,
    task_id: Uuid,
    audio_url: &str,
    audio_format: &str,
    options: &Value,
) -> Value {
    let mut body = match options {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    body.insert("appId".to_string(), Value::from(app_id));
    body.insert("audioUrl".to_string(), Value::from(audio_url));
    body.insert("audioFormat".to_string(), Value::from(audio_format));
    body.insert("taskId".to_string(), Value::from(task_id.to_string()));
    Value::Object(body)
}

#[derive(Clone)]
pub struct AsrClient {
    client: Client,
    base_url: String,
    app_id: String,
    access_token: String,
}

impl AsrClient {
    pub fn new(config: &AsrConfig) -> Result<Self, AsrError> {
        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            base_url: config.base_url.clone(),
            app_id: config.app_id.clone(),
            access_token: config.access_token.clone(),
        })
    }

    /// Starts a transcription. Any 2xx reply counts as accepted.
    pub async fn submit(
        &self,
        task_id: Uuid,
        audio_url: &str,
        audio_format: &str,
        options: &Value,
    ) -> Result<(), AsrError> {
        let body = submit_body(&self.app_id, task_id, audio_url, audio_format, options);

        let response = self
            .client
            .post(format!("{}/submit", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AsrError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!("ASR vendor accepted task {task_id}");
        Ok(())
    }

    pub async fn query(&self, task_id: Uuid) -> Result<VendorStatus, AsrError> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .bearer_auth(&self.access_token)
            .json(&QueryRequest {
                app_id: &self.app_id,
                task_id,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AsrError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: QueryResponse = response.json().await?;
        debug!("ASR vendor status for {task_id}: {}", body.status);

        Ok(match map_vendor_status(&body.status) {
            TaskStatus::Completed => VendorStatus::Completed(body.result.unwrap_or(Value::Null)),
            TaskStatus::Failed => VendorStatus::Failed(
                body.message
                    .unwrap_or_else(|| format!("vendor status {}", body.status)),
            ),
            _ => VendorStatus::Processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_vendor_status() {
        assert_eq!(map_vendor_status("completed"), TaskStatus::Completed);
        assert_eq!(map_vendor_status("SUCCESS"), TaskStatus::Completed);
        assert_eq!(map_vendor_status("failed"), TaskStatus::Failed);
        assert_eq!(map_vendor_status("error"), TaskStatus::Failed);
        assert_eq!(map_vendor_status("queued"), TaskStatus::Processing);
        assert_eq!(map_vendor_status("running"), TaskStatus::Processing);
        assert_eq!(map_vendor_status("something-new"), TaskStatus::Processing);
    }

    #[test]
    fn test_submit_body_merges_options() {
        let id = Uuid::nil();
        let body = submit_body(
            "app-1",
            id,
            "https://cdn.example.com/a.mp3",
            "mp3",
            &json!({"enableItn": true, "language": "zh-CN"}),
        );
        assert_eq!(body["appId"], "app-1");
        assert_eq!(body["audioFormat"], "mp3");
        assert_eq!(body["taskId"], id.to_string());
        assert_eq!(body["enableItn"], true);
        assert_eq!(body["language"], "zh-CN");
    }

    #[test]
    fn test_submit_body_fixed_fields_win() {
        let body = submit_body("app-1", Uuid::nil(), "u", "wav", &json!({"appId": "spoofed"}));
        assert_eq!(body["appId"], "app-1");
    }
}
