/// Workflow client: the single point of entry for calls to the LLM workflow engine.
///
/// No other module talks to the engine directly. Callers go through
/// [`crate::workflow::invoker`], which adds billing and execution history.
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Workflow engine error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Workflow failed: {0}")]
    Failed(String),

    #[error("Workflow engine unavailable after {retries} retries")]
    Exhausted { retries: u32 },
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    inputs: &'a Value,
    user: String,
    response_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct EngineError {
    message: String,
}

#[derive(Clone)]
pub struct WorkflowClient {
    client: Client,
    api_url: String,
}

impl WorkflowClient {
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, WorkflowError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_url,
        })
    }

    /// Runs a workflow in blocking mode and returns its `data` payload.
    /// Retries on 429, 5xx and transport errors with exponential backoff.
    pub async fn run(&self, api_key: &str, inputs: &Value, user_id: Uuid) -> Result<Value, WorkflowError> {
        let request_body = RunRequest {
            inputs,
            user: user_id.to_string(),
            response_mode: "blocking",
        };

        let mut last_error: Option<WorkflowError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                warn!(
                    "Workflow call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(&self.api_url)
                .bearer_auth(api_key)
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(WorkflowError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Workflow engine returned {}: {}", status, body);
                last_error = Some(WorkflowError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<EngineError>(&body)
                    .map(|e| e.message)
                    .unwrap_or(body);
                return Err(WorkflowError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let body: Value = response.json().await?;
            debug!("Workflow call succeeded");
            return interpret_response(body);
        }

        Err(last_error.unwrap_or(WorkflowError::Exhausted {
            retries: MAX_RETRIES,
        }))
    }
}

/// 1s, 2s, 4s...
fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(1000 * (1 << (attempt.saturating_sub(1)).min(6)))
}

/// A 2xx body can still carry a failed run. The payload is `data` when
/// present, otherwise the whole body.
pub fn interpret_response(body: Value) -> Result<Value, WorkflowError> {
    if let Some(error) = body.get("error").and_then(Value::as_str) {
        if !error.is_empty() {
            return Err(WorkflowError::Failed(error.to_string()));
        }
    }

    let data = match body {
        Value::Object(mut map) => map.remove("data").unwrap_or(Value::Object(map)),
        other => other,
    };

    if data.get("status").and_then(Value::as_str) == Some("failed") {
        let message = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("workflow reported failure")
            .to_string();
        return Err(WorkflowError::Failed(message));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_payload_is_unwrapped() {
        let body = json!({"data": {"status": "succeeded", "outputs": {"score": 82}}});
        let data = interpret_response(body).unwrap();
        assert_eq!(data["outputs"]["score"], 82);
    }

    #[test]
    fn test_body_without_data_is_returned_whole() {
        let body = json!({"answer": "hi"});
        assert_eq!(interpret_response(body.clone()).unwrap(), body);
    }

    #[test]
    fn test_top_level_error_string_fails() {
        let err = interpret_response(json!({"error": "quota exceeded"})).unwrap_err();
        assert!(matches!(err, WorkflowError::Failed(m) if m == "quota exceeded"));
    }

    #[test]
    fn test_failed_run_status_fails() {
        let err = interpret_response(json!({"data": {"status": "failed", "error": "node 3 timed out"}}))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Failed(m) if m == "node 3 timed out"));
    }

    #[test]
    fn test_empty_error_string_is_ignored() {
        assert!(interpret_response(json!({"error": "", "data": {"ok": true}})).is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
    }
}
