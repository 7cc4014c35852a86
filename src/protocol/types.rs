//! Protocol event and artifact types.

use serde::{Deserialize, Serialize};

/// One event reconstructed from a generation stream.
///
/// For any path `p`, a `FileOpen(p)` is followed by zero or more
/// `FileChunk(p)` and exactly one `FileClose(p)`, with nothing for `p` in
/// between from another file region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    Status {
        message: String,
    },
    Thinking {
        delta: String,
    },
    Narration {
        text: String,
    },
    FileOpen {
        path: String,
    },
    FileChunk {
        path: String,
        delta: String,
    },
    FileClose {
        path: String,
        content: String,
        /// The stream ended before the closing tag arrived.
        #[serde(default)]
        truncated: bool,
    },
    /// Extra package requested by a `<package>` or `<packages>` tag.
    Package {
        name: String,
    },
    Complete {
        summary: String,
    },
    Error {
        message: String,
    },
}

impl ProtocolEvent {
    /// The artifact carried by a `FileClose`, if this is one.
    pub fn artifact(&self) -> Option<FileArtifact> {
        match self {
            ProtocolEvent::FileClose {
                path,
                content,
                truncated,
            } => Some(FileArtifact::new(path.clone(), content.clone()).with_truncated(*truncated)),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProtocolEvent::Error { .. })
    }
}

/// A complete file extracted from a generation stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileArtifact {
    pub path: String,
    pub content: String,
    pub size_bytes: usize,
    #[serde(default)]
    pub truncated: bool,
}

impl FileArtifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            size_bytes: content.len(),
            content,
            truncated: false,
        }
    }

    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_from_file_close() {
        let event = ProtocolEvent::FileClose {
            path: "src/App.jsx".into(),
            content: "export default 1;\n".into(),
            truncated: false,
        };
        let artifact = event.artifact().unwrap();
        assert_eq!(artifact.path, "src/App.jsx");
        assert_eq!(artifact.size_bytes, 18);
        assert!(!artifact.truncated);
    }

    #[test]
    fn test_artifact_only_from_file_close() {
        let event = ProtocolEvent::FileOpen {
            path: "src/App.jsx".into(),
        };
        assert!(event.artifact().is_none());
    }

    #[test]
    fn test_size_counts_bytes_not_chars() {
        let artifact = FileArtifact::new("a.txt", "héllo");
        assert_eq!(artifact.size_bytes, 6);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ProtocolEvent::FileChunk {
            path: "a.js".into(),
            delta: "x".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_chunk");
        assert_eq!(json["path"], "a.js");
    }
}
