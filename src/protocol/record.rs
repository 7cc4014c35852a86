//! Wire records of the generation stream and the assembler that turns them
//! into [`ProtocolEvent`]s.
//!
//! The service answers with newline-delimited `data: <json>` lines:
//!
//! ```text
//! data: {"type":"status","message":"Generating code..."}
//! data: {"type":"stream","text":"<file path=\"src/App.jsx\">","raw":true}
//! data: {"type":"complete","generatedCode":"...","explanation":"Built a counter"}
//! ```

use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::parser::ProtocolEventParser;
use super::types::ProtocolEvent;

/// One record of the generation stream. The set of record types is closed;
/// anything else fails to deserialize and is skipped by the assembler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationRecord {
    Status {
        message: String,
    },
    Thinking {
        text: String,
    },
    Conversation {
        text: String,
    },
    Stream {
        text: String,
        #[serde(default = "default_raw")]
        raw: bool,
    },
    Complete {
        #[serde(default, rename = "generatedCode")]
        generated_code: Option<String>,
        #[serde(default)]
        explanation: Option<String>,
    },
    Error {
        #[serde(alias = "message")]
        error: String,
    },
}

fn default_raw() -> bool {
    true
}

/// Outcome of decoding one line of the stream body.
#[derive(Debug, PartialEq)]
pub enum LineRecord {
    Record(GenerationRecord),
    /// Blank lines, comments, `[DONE]` and non-`data` fields.
    Ignored,
    /// A `data:` payload that is not a known record.
    Unknown(String),
}

/// Decode one line of the stream body.
pub fn decode_line(line: &str) -> LineRecord {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.starts_with(':') {
        return LineRecord::Ignored;
    }
    let Some(payload) = line.strip_prefix("data:") else {
        return LineRecord::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return LineRecord::Ignored;
    }
    match serde_json::from_str::<GenerationRecord>(payload) {
        Ok(record) => LineRecord::Record(record),
        Err(_) => LineRecord::Unknown(payload.to_string()),
    }
}

/// Feeds stream records through a [`ProtocolEventParser`] and adds the
/// record-level events (`status`, `complete`, `error`) in arrival order.
pub struct EventAssembler {
    parser: Option<ProtocolEventParser>,
    saw_stream_text: bool,
    completed: bool,
}

impl Default for EventAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventAssembler {
    pub fn new() -> Self {
        Self {
            parser: Some(ProtocolEventParser::new()),
            saw_stream_text: false,
            completed: false,
        }
    }

    /// True once a `complete` record has been seen. Later records are ignored.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Decode and apply one line of the stream body.
    pub fn push_line(&mut self, line: &str) -> Vec<ProtocolEvent> {
        match decode_line(line) {
            LineRecord::Record(record) => self.push_record(record),
            LineRecord::Ignored => Vec::new(),
            LineRecord::Unknown(payload) => {
                let kind = serde_json::from_str::<serde_json::Value>(&payload)
                    .ok()
                    .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));
                match kind {
                    Some(kind) => debug!(record_type = %kind, "skipping unknown stream record"),
                    None => warn!(payload_len = payload.len(), "skipping undecodable stream line"),
                }
                Vec::new()
            }
        }
    }

    pub fn push_record(&mut self, record: GenerationRecord) -> Vec<ProtocolEvent> {
        if self.completed {
            trace!("ignoring record after completion");
            return Vec::new();
        }
        match record {
            GenerationRecord::Status { message } => vec![ProtocolEvent::Status { message }],
            GenerationRecord::Thinking { text } => vec![ProtocolEvent::Thinking { delta: text }],
            GenerationRecord::Conversation { text } => {
                // Conversation echoes that carry file markup duplicate the stream.
                if text.contains("<file") || text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![ProtocolEvent::Narration { text }]
                }
            }
            GenerationRecord::Stream { text, .. } => {
                if !text.is_empty() {
                    self.saw_stream_text = true;
                }
                match self.parser.as_mut() {
                    Some(parser) => parser.feed(&text),
                    None => Vec::new(),
                }
            }
            GenerationRecord::Complete {
                generated_code,
                explanation,
            } => {
                let mut events = Vec::new();
                if !self.saw_stream_text
                    && let Some(code) = generated_code.as_deref()
                    && let Some(parser) = self.parser.as_mut()
                {
                    debug!(bytes = code.len(), "no streamed text, parsing completion payload");
                    events.extend(parser.feed(code));
                }
                events.extend(self.finish_parser());
                events.push(ProtocolEvent::Complete {
                    summary: explanation.unwrap_or_default(),
                });
                self.completed = true;
                events
            }
            GenerationRecord::Error { error } => vec![ProtocolEvent::Error { message: error }],
        }
    }

    /// Close the stream. Without a prior `complete` record this is an implicit
    /// completion: the parser is flushed and an empty `Complete` is emitted.
    pub fn finish(mut self) -> Vec<ProtocolEvent> {
        if self.completed {
            return Vec::new();
        }
        debug!("stream ended without a complete record");
        let mut events = self.finish_parser();
        events.push(ProtocolEvent::Complete {
            summary: String::new(),
        });
        self.completed = true;
        events
    }

    fn finish_parser(&mut self) -> Vec<ProtocolEvent> {
        self.parser.take().map(ProtocolEventParser::finish).unwrap_or_default()
    }
}
