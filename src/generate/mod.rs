//! Requests to the generation service and the raw byte stream it answers
//! with.

pub mod client;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;
use tokio_util::io::StreamReader;

pub use client::{HttpGenerationClient, ReplayGenerationClient};

use crate::context::{ContextEntry, Role};
use crate::errors::GenerationError;

/// Response body of the generation service, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GenerationError>> + Send>>;

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Longest silence tolerated between two lines of the stream
    pub idle_timeout: Duration,
    /// Budget for file contents in the request's file listing
    pub max_context_bytes: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000/api/generate-ai-code-stream".to_string(),
            model: "openai/gpt-4o".to_string(),
            api_key: None,
            idle_timeout: Duration::from_secs(120),
            max_context_bytes: 32_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedFile {
    pub path: String,
    /// Left out once the listing exceeds its byte budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTurn {
    pub role: Role,
    pub text: String,
    pub applied_paths: Vec<String>,
}

impl From<ContextEntry> for RecentTurn {
    fn from(entry: ContextEntry) -> Self {
        Self {
            role: entry.role,
            text: entry.text,
            applied_paths: entry.applied_paths,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    pub file_listing: Vec<ListedFile>,
    pub recent_turns: Vec<RecentTurn>,
}

/// Body POSTed to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
    pub context: RequestContext,
    pub is_edit: bool,
}

/// List every file, with contents until `budget` bytes are used up and by
/// path only after that.
pub fn bounded_listing(files: &BTreeMap<String, String>, budget: usize) -> Vec<ListedFile> {
    let mut used = 0usize;
    files
        .iter()
        .map(|(path, content)| {
            if used + content.len() <= budget {
                used += content.len();
                ListedFile {
                    path: path.clone(),
                    content: Some(content.clone()),
                }
            } else {
                ListedFile {
                    path: path.clone(),
                    content: None,
                }
            }
        })
        .collect()
}

/// Opens a stream against the generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn open_stream(&self, request: &GenerationRequest) -> Result<ByteStream, GenerationError>;
}

/// Longest stream line kept in memory. Longer lines are dropped.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Line reader over a [`ByteStream`] with an idle timeout between reads.
///
/// Lines are decoded lossily: a stray invalid byte costs one replacement
/// character, not the turn. Lines over the length cap are skipped whole.
pub struct GenerationStream {
    reader: Pin<Box<dyn AsyncBufRead + Send>>,
    idle_timeout: Duration,
    max_line_bytes: usize,
}

enum Scan {
    Newline,
    Partial,
    Eof,
}

impl GenerationStream {
    pub fn new(body: ByteStream, idle_timeout: Duration) -> Self {
        let reader = StreamReader::new(body.map_err(|e| std::io::Error::other(e.to_string())));
        Self {
            reader: Box::pin(reader),
            idle_timeout,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// The next line, or `None` once the body is exhausted.
    pub async fn next_line(&mut self) -> Result<Option<String>, GenerationError> {
        let mut line = Vec::new();
        let mut read_any = false;
        let mut oversized = false;
        loop {
            let filled =
                tokio::time::timeout(self.idle_timeout, AsyncBufReadExt::fill_buf(&mut self.reader))
                    .await;
            let available = match filled {
                Ok(Ok(available)) => available,
                Ok(Err(e)) => return Err(GenerationError::Transport(e.to_string())),
                Err(_) => return Err(GenerationError::IdleTimeout(self.idle_timeout)),
            };

            let (segment, scan) = if available.is_empty() {
                (available, Scan::Eof)
            } else if let Some(end) = available.iter().position(|&b| b == b'\n') {
                (&available[..end], Scan::Newline)
            } else {
                (available, Scan::Partial)
            };
            if !oversized {
                if line.len() + segment.len() > self.max_line_bytes {
                    oversized = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(segment);
                }
            }
            let consumed = segment.len() + usize::from(matches!(scan, Scan::Newline));
            AsyncBufReadExt::consume(&mut self.reader, consumed);
            read_any |= consumed > 0;

            match scan {
                Scan::Partial => continue,
                Scan::Newline if oversized => {
                    warn!(limit = self.max_line_bytes, "skipping oversized stream line");
                    oversized = false;
                    read_any = false;
                }
                Scan::Newline => return Ok(Some(decode_line(line))),
                Scan::Eof if oversized => {
                    warn!(limit = self.max_line_bytes, "skipping oversized stream line");
                    return Ok(None);
                }
                Scan::Eof if !read_any => return Ok(None),
                Scan::Eof => return Ok(Some(decode_line(line))),
            }
        }
    }
}

fn decode_line(mut bytes: Vec<u8>) -> String {
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e.utf8_error(), "stream line is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}
