use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Renderer error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Renderer returned an empty document")]
    Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest<'a> {
    task_id: Uuid,
    render_url: &'a str,
}

/// Client for the headless PDF renderer. The renderer loads `render_url`,
/// which points back at this service, and answers with the PDF body.
#[derive(Clone)]
pub struct RendererClient {
    client: Client,
    url: String,
}

impl RendererClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, RenderError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url,
        })
    }

    pub async fn render(&self, task_id: Uuid, render_url: &str) -> Result<Bytes, RenderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&RenderRequest {
                task_id,
                render_url,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RenderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(RenderError::Empty);
        }
        Ok(body)
    }
}
