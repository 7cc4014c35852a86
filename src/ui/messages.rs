//! Messages pushed to the UI collaborator (terminal reporter, WebSocket
//! clients) over a `broadcast::Sender<String>` of JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::apply::{ProgressSnapshot, RunStatus};
use crate::context::Role;
use crate::protocol::ProtocolEvent;
use crate::sandbox::SandboxSession;

/// Capacity of the UI broadcast channel.
pub const UI_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UiMessage {
    Chat {
        role: Role,
        text: String,
    },
    Status {
        message: String,
    },
    Thinking {
        delta: String,
    },
    Narration {
        text: String,
    },
    FileStreaming {
        path: String,
    },
    FileReady {
        path: String,
        size_bytes: usize,
        truncated: bool,
    },
    PackageRequested {
        name: String,
    },
    SandboxCreated {
        session: SandboxSession,
    },
    SessionReplaced {
        previous: String,
        current: String,
    },
    RunProgress {
        snapshot: ProgressSnapshot,
    },
    PreviewReady {
        session_id: String,
        url: String,
        /// Cache-busting token appended to the preview URL
        token: i64,
    },
    TurnCompleted {
        status: RunStatus,
        summary: String,
        applied_paths: Vec<String>,
        failed_paths: BTreeMap<String, String>,
        warnings: Vec<String>,
    },
    TurnFailed {
        error: String,
    },
}

impl UiMessage {
    /// The UI-facing counterpart of a protocol event. `Complete` is reported
    /// through `TurnCompleted` instead.
    pub fn from_event(event: &ProtocolEvent) -> Option<Self> {
        match event {
            ProtocolEvent::Status { message } => Some(UiMessage::Status {
                message: message.clone(),
            }),
            ProtocolEvent::Thinking { delta } => Some(UiMessage::Thinking {
                delta: delta.clone(),
            }),
            ProtocolEvent::Narration { text } => Some(UiMessage::Narration { text: text.clone() }),
            ProtocolEvent::FileOpen { path } => Some(UiMessage::FileStreaming { path: path.clone() }),
            ProtocolEvent::FileChunk { .. } => None,
            ProtocolEvent::FileClose {
                path,
                content,
                truncated,
            } => Some(UiMessage::FileReady {
                path: path.clone(),
                size_bytes: content.len(),
                truncated: *truncated,
            }),
            ProtocolEvent::Package { name } => Some(UiMessage::PackageRequested { name: name.clone() }),
            ProtocolEvent::Complete { .. } => None,
            ProtocolEvent::Error { message } => Some(UiMessage::Chat {
                role: Role::Error,
                text: message.clone(),
            }),
        }
    }

    /// Preview URL with the cache-busting token applied.
    pub fn preview_href(url: &str, token: i64) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}t={token}")
    }
}

/// Serialize and broadcast a UiMessage to every subscriber.
/// Returns silently even if nobody is listening.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &UiMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize UiMessage");
        }
    }
}

pub fn ui_channel() -> broadcast::Sender<String> {
    broadcast::channel(UI_CHANNEL_CAPACITY).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::RunStage;

    #[test]
    fn test_preview_ready_serialization() {
        let msg = UiMessage::PreviewReady {
            session_id: "mem-1".into(),
            url: "http://mem-1.sandbox.local".into(),
            token: 1700000000000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"PreviewReady\""));
        assert!(json.contains("\"data\""));
        assert!(json.contains("\"token\":1700000000000"));
    }

    #[test]
    fn test_run_progress_serialization() {
        let msg = UiMessage::RunProgress {
            snapshot: ProgressSnapshot {
                run_id: "r1".into(),
                session_id: "s1".into(),
                stage: RunStage::Writing,
                applied_paths: vec!["src/App.jsx".into()],
                failed_paths: BTreeMap::new(),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "RunProgress");
        assert_eq!(value["data"]["snapshot"]["stage"]["stage"], "writing");
        assert_eq!(value["data"]["snapshot"]["applied_paths"][0], "src/App.jsx");
    }

    #[test]
    fn test_from_event_mapping() {
        let ready = UiMessage::from_event(&ProtocolEvent::FileClose {
            path: "a.js".into(),
            content: "abc".into(),
            truncated: true,
        });
        assert_eq!(
            ready,
            Some(UiMessage::FileReady {
                path: "a.js".into(),
                size_bytes: 3,
                truncated: true
            })
        );
        assert!(
            UiMessage::from_event(&ProtocolEvent::FileChunk {
                path: "a.js".into(),
                delta: "x".into()
            })
            .is_none()
        );
        assert!(matches!(
            UiMessage::from_event(&ProtocolEvent::Error {
                message: "bad".into()
            }),
            Some(UiMessage::Chat {
                role: Role::Error,
                ..
            })
        ));
    }

    #[test]
    fn test_preview_href() {
        assert_eq!(UiMessage::preview_href("http://x", 5), "http://x?t=5");
        assert_eq!(UiMessage::preview_href("http://x?a=1", 5), "http://x?a=1&t=5");
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_is_silent() {
        let tx = ui_channel();
        broadcast_message(&tx, &UiMessage::Status { message: "hi".into() });

        let mut rx = tx.subscribe();
        broadcast_message(&tx, &UiMessage::Status { message: "hi".into() });
        let json = rx.recv().await.unwrap();
        let back: UiMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UiMessage::Status { message: "hi".into() });
    }
}
