use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{TryStreamExt, stream};
use reqwest::header::{ACCEPT, HeaderValue};
use tracing::{debug, warn};

use super::{ByteStream, GenerationClient, GenerationRequest};
use crate::errors::GenerationError;

/// Streams generations from an HTTP endpoint answering with
/// `text/event-stream`.
pub struct HttpGenerationClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError> {
        debug!(endpoint = %self.endpoint, model = %request.model, is_edit = request.is_edit, "opening generation stream");

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "generation service rejected request");
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| GenerationError::Transport(e.to_string()));
        Ok(Box::pin(stream))
    }
}

enum ScriptedResponse {
    Body(String),
    Status { status: u16, body: String },
}

/// Answers each request with a recorded stream body, split into fixed-size
/// chunks. Used for offline replays and by tests.
pub struct ReplayGenerationClient {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<GenerationRequest>>,
    chunk_size: usize,
}

impl Default for ReplayGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayGenerationClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_size: 64,
        }
    }

    /// Read a recorded body from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recorded stream {}", path.display()))?;
        let client = Self::new();
        client.push_body(body);
        Ok(client)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn push_body(&self, body: impl Into<String>) {
        self.lock_responses()
            .push_back(ScriptedResponse::Body(body.into()));
    }

    pub fn push_status(&self, status: u16, body: impl Into<String>) {
        self.lock_responses().push_back(ScriptedResponse::Status {
            status,
            body: body.into(),
        });
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_responses(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedResponse>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn chunks(&self, body: &str) -> Vec<Result<Bytes, GenerationError>> {
        body.as_bytes()
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect()
    }
}

/// Format records as `data:` lines of an event stream.
pub fn event_stream_body(records: &[serde_json::Value]) -> String {
    records
        .iter()
        .map(|record| format!("data: {record}\n\n"))
        .collect()
}

#[async_trait]
impl GenerationClient for ReplayGenerationClient {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let next = self.lock_responses().pop_front();
        match next {
            Some(ScriptedResponse::Body(body)) => Ok(Box::pin(stream::iter(self.chunks(&body)))),
            Some(ScriptedResponse::Status { status, body }) => {
                Err(GenerationError::Status { status, body })
            }
            None => Err(GenerationError::Service(
                "no recorded response left to replay".to_string(),
            )),
        }
    }
}
