//! Incremental lexer for the embedded tag protocol.
//!
//! Recognized constructs:
//! - `<file path="src/App.jsx">…</file>` - a file region
//! - `<status>…</status>` - a status line
//! - `<thinking>…</thinking>` - model reasoning
//! - `<package>name</package>`, `<packages>a, b</packages>` - extra packages
//!
//! Everything else, including unknown or malformed tags, is narration.
//!
//! Input is buffered until a construct is unambiguous, and streaming deltas
//! (narration, thinking, file chunks) are cut at line breaks and construct
//! boundaries only. The emitted sequence is therefore identical however the
//! input is split into chunks.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, trace};

use super::types::ProtocolEvent;
use crate::paths::normalize_artifact_path;

/// Longest tag body we buffer before deciding a `<` is literal text.
const MAX_TAG_LEN: usize = 512;

const FILE_CLOSE_TAG: &str = "</file>";

static TAG_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*)(\s.*)?$").unwrap());

static ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectiveKind {
    Status,
    Thinking,
    Package,
    Packages,
}

impl DirectiveKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Self::Status),
            "thinking" => Some(Self::Thinking),
            "package" => Some(Self::Package),
            "packages" => Some(Self::Packages),
            _ => None,
        }
    }

    fn close_tag(self) -> &'static str {
        match self {
            Self::Status => "</status>",
            Self::Thinking => "</thinking>",
            Self::Package => "</package>",
            Self::Packages => "</packages>",
        }
    }
}

enum OpenTag {
    File { path: String, self_closing: bool },
    Directive(DirectiveKind),
}

/// An open file region. `path` is `None` when the announced path was
/// rejected; the body is then consumed and dropped.
struct FileRegion {
    path: Option<String>,
    content: String,
    line: String,
    at_start: bool,
}

impl FileRegion {
    fn new(path: Option<String>) -> Self {
        Self {
            path,
            content: String::new(),
            line: String::new(),
            at_start: true,
        }
    }

    fn push(&mut self, text: &str, out: &mut Vec<ProtocolEvent>) {
        let Some(path) = &self.path else { return };
        self.content.push_str(text);
        self.line.push_str(text);
        while let Some(nl) = self.line.find('\n') {
            let delta: String = self.line.drain(..=nl).collect();
            out.push(ProtocolEvent::FileChunk {
                path: path.clone(),
                delta,
            });
        }
    }

    fn close(self, truncated: bool, out: &mut Vec<ProtocolEvent>) {
        let Some(path) = self.path else { return };
        if !self.line.is_empty() {
            out.push(ProtocolEvent::FileChunk {
                path: path.clone(),
                delta: self.line,
            });
        }
        if truncated {
            out.push(ProtocolEvent::FileClose {
                path: path.clone(),
                content: self.content,
                truncated: true,
            });
            out.push(ProtocolEvent::Error {
                message: format!("Stream ended inside {path}; its content may be incomplete"),
            });
        } else {
            out.push(ProtocolEvent::FileClose {
                path,
                content: self.content,
                truncated: false,
            });
        }
    }
}

enum LexState {
    /// Plain text between constructs.
    Narration,
    /// `pending` starts with a `<` whose construct is not decided yet.
    Tag,
    FileBody(FileRegion),
    Directive { kind: DirectiveKind, text: String },
}

/// Turns raw generation text into [`ProtocolEvent`]s as it arrives.
///
/// One parser per stream. Feed chunks in arrival order with
/// [`feed`](Self::feed) and call [`finish`](Self::finish) once at the end.
pub struct ProtocolEventParser {
    state: LexState,
    pending: String,
    narration: String,
}

impl Default for ProtocolEventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEventParser {
    pub fn new() -> Self {
        Self {
            state: LexState::Narration,
            pending: String::new(),
            narration: String::new(),
        }
    }

    /// Consume the next chunk and return every event it made unambiguous.
    pub fn feed(&mut self, chunk: &str) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        self.pending.push_str(chunk);
        while self.step(false, &mut out) {}
        out
    }

    /// Flush everything still buffered. An open file region is force-closed
    /// and reported with an `Error` event.
    pub fn finish(mut self) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        while self.step(true, &mut out) {}

        match std::mem::replace(&mut self.state, LexState::Narration) {
            LexState::FileBody(region) => {
                if let Some(path) = &region.path {
                    debug!(path = %path, "stream ended inside a file region");
                }
                region.close(true, &mut out);
            }
            LexState::Directive { kind, text } => {
                Self::close_directive(kind, text, &mut out);
            }
            LexState::Narration | LexState::Tag => {}
        }
        self.flush_narration(&mut out);
        out
    }

    /// Advance the state machine once. Returns false when nothing more can
    /// be decided with the input buffered so far.
    fn step(&mut self, at_end: bool, out: &mut Vec<ProtocolEvent>) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        match self.state {
            LexState::Narration => self.step_narration(out),
            LexState::Tag => self.step_tag(at_end, out),
            LexState::FileBody(_) => self.step_file_body(at_end, out),
            LexState::Directive { .. } => self.step_directive(at_end, out),
        }
    }

    fn step_narration(&mut self, out: &mut Vec<ProtocolEvent>) -> bool {
        match self.pending.find('<') {
            None => {
                let text = std::mem::take(&mut self.pending);
                self.push_narration(&text, out);
            }
            Some(0) => self.state = LexState::Tag,
            Some(idx) => {
                let text: String = self.pending.drain(..idx).collect();
                self.push_narration(&text, out);
                self.state = LexState::Tag;
            }
        }
        true
    }

    fn step_tag(&mut self, at_end: bool, out: &mut Vec<ProtocolEvent>) -> bool {
        let rest = &self.pending[1..];
        let terminator = rest
            .char_indices()
            .take_while(|(idx, _)| *idx <= MAX_TAG_LEN)
            .find(|(_, c)| matches!(c, '>' | '<' | '\n'));

        match terminator {
            Some((idx, '>')) => {
                let tag_text = rest[..idx].to_string();
                let consumed = idx + 2;
                match parse_open_tag(&tag_text) {
                    Some(tag) => {
                        self.pending.drain(..consumed);
                        self.flush_narration(out);
                        self.open_construct(tag, out);
                    }
                    None => {
                        let literal: String = self.pending.drain(..consumed).collect();
                        trace!(tag = %literal, "treating unknown tag as narration");
                        self.push_narration(&literal, out);
                        self.state = LexState::Narration;
                    }
                }
                true
            }
            Some(_) => {
                self.literal_angle(out);
                true
            }
            None if at_end || rest.len() > MAX_TAG_LEN => {
                self.literal_angle(out);
                true
            }
            None => false,
        }
    }

    fn literal_angle(&mut self, out: &mut Vec<ProtocolEvent>) {
        self.pending.drain(..1);
        self.push_narration("<", out);
        self.state = LexState::Narration;
    }

    fn open_construct(&mut self, tag: OpenTag, out: &mut Vec<ProtocolEvent>) {
        match tag {
            OpenTag::File { path, self_closing } => {
                let region = match normalize_artifact_path(&path) {
                    Ok(normalized) => {
                        out.push(ProtocolEvent::FileOpen {
                            path: normalized.clone(),
                        });
                        FileRegion::new(Some(normalized))
                    }
                    Err(e) => {
                        debug!(path = %path, error = %e, "rejecting file region");
                        out.push(ProtocolEvent::Error {
                            message: format!("Rejected file path {path:?}: {e}"),
                        });
                        FileRegion::new(None)
                    }
                };
                if self_closing {
                    region.close(false, out);
                    self.state = LexState::Narration;
                } else {
                    self.state = LexState::FileBody(region);
                }
            }
            OpenTag::Directive(kind) => {
                self.state = LexState::Directive {
                    kind,
                    text: String::new(),
                };
            }
        }
    }

    fn step_file_body(&mut self, at_end: bool, out: &mut Vec<ProtocolEvent>) -> bool {
        let LexState::FileBody(region) = &mut self.state else {
            return false;
        };

        if region.at_start {
            if self.pending.starts_with("\r\n") {
                self.pending.drain(..2);
            } else if self.pending.starts_with('\n') {
                self.pending.drain(..1);
            } else if self.pending == "\r" && !at_end {
                return false;
            }
            region.at_start = false;
            return true;
        }

        match self.pending.find(FILE_CLOSE_TAG) {
            Some(idx) => {
                let body: String = self.pending.drain(..idx + FILE_CLOSE_TAG.len()).collect();
                region.push(&body[..idx], out);
                if let LexState::FileBody(region) =
                    std::mem::replace(&mut self.state, LexState::Narration)
                {
                    region.close(false, out);
                }
                true
            }
            None => {
                let safe = safe_prefix_len(&self.pending, FILE_CLOSE_TAG, at_end);
                if safe == 0 {
                    return false;
                }
                let body: String = self.pending.drain(..safe).collect();
                region.push(&body, out);
                true
            }
        }
    }

    fn step_directive(&mut self, at_end: bool, out: &mut Vec<ProtocolEvent>) -> bool {
        let LexState::Directive { kind, text } = &mut self.state else {
            return false;
        };
        let kind = *kind;
        let close = kind.close_tag();

        match self.pending.find(close) {
            Some(idx) => {
                let body: String = self.pending.drain(..idx + close.len()).collect();
                text.push_str(&body[..idx]);
                let text = std::mem::take(text);
                Self::emit_thinking_lines(kind, &text, out);
                let rest = match kind {
                    DirectiveKind::Thinking => text.rsplit_once('\n').map_or(text.clone(), |(_, tail)| tail.to_string()),
                    _ => text,
                };
                Self::close_directive(kind, rest, out);
                self.state = LexState::Narration;
                true
            }
            None => {
                let safe = safe_prefix_len(&self.pending, close, at_end);
                if safe == 0 {
                    return false;
                }
                let body: String = self.pending.drain(..safe).collect();
                text.push_str(&body);
                if kind == DirectiveKind::Thinking {
                    while let Some(nl) = text.find('\n') {
                        let line: String = text.drain(..=nl).collect();
                        if !line.trim().is_empty() {
                            out.push(ProtocolEvent::Thinking { delta: line });
                        }
                    }
                }
                true
            }
        }
    }

    /// Thinking text that arrived together with its closing tag still has to
    /// be cut at line breaks.
    fn emit_thinking_lines(kind: DirectiveKind, text: &str, out: &mut Vec<ProtocolEvent>) {
        if kind != DirectiveKind::Thinking {
            return;
        }
        let Some((head, _)) = text.rsplit_once('\n') else {
            return;
        };
        for line in head.split_inclusive('\n') {
            let line = if line.ends_with('\n') {
                line.to_string()
            } else {
                format!("{line}\n")
            };
            if !line.trim().is_empty() {
                out.push(ProtocolEvent::Thinking { delta: line });
            }
        }
    }

    fn close_directive(kind: DirectiveKind, text: String, out: &mut Vec<ProtocolEvent>) {
        match kind {
            DirectiveKind::Status => {
                let message = text.trim();
                if !message.is_empty() {
                    out.push(ProtocolEvent::Status {
                        message: message.to_string(),
                    });
                }
            }
            DirectiveKind::Thinking => {
                if !text.trim().is_empty() {
                    out.push(ProtocolEvent::Thinking { delta: text });
                }
            }
            DirectiveKind::Package | DirectiveKind::Packages => {
                for name in text
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|n| !n.is_empty())
                {
                    out.push(ProtocolEvent::Package {
                        name: name.to_string(),
                    });
                }
            }
        }
    }

    fn push_narration(&mut self, text: &str, out: &mut Vec<ProtocolEvent>) {
        self.narration.push_str(text);
        while let Some(nl) = self.narration.find('\n') {
            let line: String = self.narration.drain(..=nl).collect();
            if !line.trim().is_empty() {
                out.push(ProtocolEvent::Narration { text: line });
            }
        }
    }

    fn flush_narration(&mut self, out: &mut Vec<ProtocolEvent>) {
        let text = std::mem::take(&mut self.narration);
        if !text.trim().is_empty() {
            out.push(ProtocolEvent::Narration { text });
        }
    }
}

/// Parse the inside of `<...>` into a recognized opening tag.
fn parse_open_tag(tag_text: &str) -> Option<OpenTag> {
    let trimmed = tag_text.trim_end();
    let (body, self_closing) = match trimmed.strip_suffix('/') {
        Some(body) => (body, true),
        None => (trimmed, false),
    };
    let caps = TAG_NAME_REGEX.captures(body)?;
    let name = caps.get(1)?.as_str();
    let attrs = caps.get(2).map_or("", |m| m.as_str());

    if name == "file" {
        let path = ATTR_REGEX
            .captures_iter(attrs)
            .find(|c| &c[1] == "path")
            .and_then(|c| c.get(2).or_else(|| c.get(3)))
            .map(|m| m.as_str().to_string())?;
        if path.trim().is_empty() {
            return None;
        }
        return Some(OpenTag::File { path, self_closing });
    }

    if self_closing || !attrs.trim().is_empty() {
        return None;
    }
    DirectiveKind::from_name(name).map(OpenTag::Directive)
}

/// How much of `buffer` can be consumed without possibly cutting `close_tag`
/// in half. At end of input everything can.
fn safe_prefix_len(buffer: &str, close_tag: &str, at_end: bool) -> usize {
    if at_end {
        return buffer.len();
    }
    for keep in (1..close_tag.len()).rev() {
        if buffer.ends_with(&close_tag[..keep]) {
            return buffer.len() - keep;
        }
    }
    buffer.len()
}

/// Parse a complete text in one go.
pub fn parse_all(text: &str) -> Vec<ProtocolEvent> {
    let mut parser = ProtocolEventParser::new();
    let mut events = parser.feed(text);
    events.extend(parser.finish());
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::FileArtifact;

    const SAMPLE: &str = "Here is your app.\n\
<status>Generating files</status>\n\
<thinking>Plan the layout\nThen style it</thinking>\n\
<file path=\"src/App.jsx\">\n\
import './App.css';\n\
export default function App() {\n\
return <div className=\"app\">Hi</div>;\n\
}\n\
</file>\n\
<file path=\"/src/App.css\">\n\
.app { color: red; }\n\
</file>\n\
A < B and <unknown>tag</unknown> stay text.\n\
<packages>react-router-dom, axios</packages>\n\
Done!";

    fn parse_in_chunks(text: &str, sizes: &[usize]) -> Vec<ProtocolEvent> {
        let chars: Vec<char> = text.chars().collect();
        let mut parser = ProtocolEventParser::new();
        let mut events = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < chars.len() {
            let size = sizes[i % sizes.len()].max(1);
            let end = (pos + size).min(chars.len());
            let chunk: String = chars[pos..end].iter().collect();
            events.extend(parser.feed(&chunk));
            pos = end;
            i += 1;
        }
        events.extend(parser.finish());
        events
    }

    fn artifacts(events: &[ProtocolEvent]) -> Vec<FileArtifact> {
        events.iter().filter_map(ProtocolEvent::artifact).collect()
    }

    #[test]
    fn test_parse_single_file() {
        let events = parse_all("<file path=\"a.js\">const x = 1;\n</file>");
        assert_eq!(
            events,
            vec![
                ProtocolEvent::FileOpen { path: "a.js".into() },
                ProtocolEvent::FileChunk {
                    path: "a.js".into(),
                    delta: "const x = 1;\n".into()
                },
                ProtocolEvent::FileClose {
                    path: "a.js".into(),
                    content: "const x = 1;\n".into(),
                    truncated: false
                },
            ]
        );
    }

    #[test]
    fn test_sample_artifacts() {
        let events = parse_all(SAMPLE);
        let files = artifacts(&events);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/App.jsx");
        assert_eq!(
            files[0].content,
            "import './App.css';\nexport default function App() {\nreturn <div className=\"app\">Hi</div>;\n}\n"
        );
        assert_eq!(files[1].path, "src/App.css");
        assert_eq!(files[1].content, ".app { color: red; }\n");
    }

    #[test]
    fn test_sample_directives_and_narration() {
        let events = parse_all(SAMPLE);

        let narration: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::Narration { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            narration,
            vec![
                "Here is your app.\n",
                "A < B and <unknown>tag</unknown> stay text.\n",
                "Done!"
            ]
        );

        assert!(events.contains(&ProtocolEvent::Status {
            message: "Generating files".into()
        }));
        let thinking: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::Thinking { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(thinking, vec!["Plan the layout\n", "Then style it"]);

        let packages: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProtocolEvent::Package { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(packages, vec!["react-router-dom", "axios"]);
        assert!(!events.iter().any(ProtocolEvent::is_error));
    }

    #[test]
    fn test_chunk_boundary_invariance_every_two_way_split() {
        let whole = parse_all(SAMPLE);
        let chars: Vec<char> = SAMPLE.chars().collect();
        for split in 1..chars.len() {
            let head: String = chars[..split].iter().collect();
            let tail: String = chars[split..].iter().collect();
            let mut parser = ProtocolEventParser::new();
            let mut events = parser.feed(&head);
            events.extend(parser.feed(&tail));
            events.extend(parser.finish());
            assert_eq!(events, whole, "split at char {split}");
        }
    }

    #[test]
    fn test_chunk_boundary_invariance_token_sized_chunks() {
        let whole = parse_all(SAMPLE);
        for sizes in [&[1][..], &[2], &[3, 1, 4, 1, 5], &[7, 2], &[16], &[64, 3]] {
            assert_eq!(parse_in_chunks(SAMPLE, sizes), whole, "chunk sizes {sizes:?}");
        }
    }

    #[test]
    fn test_truncated_stream_force_closes_file() {
        let mut parser = ProtocolEventParser::new();
        let mut events = parser.feed("<file path=\"a.js\">const x = 1");
        events.extend(parser.finish());

        let closes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::FileClose { .. }))
            .collect();
        assert_eq!(closes.len(), 1);
        assert_eq!(
            closes[0],
            &ProtocolEvent::FileClose {
                path: "a.js".into(),
                content: "const x = 1".into(),
                truncated: true
            }
        );
        assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
    }

    #[test]
    fn test_truncated_inside_partial_close_tag_keeps_text() {
        let mut parser = ProtocolEventParser::new();
        let mut events = parser.feed("<file path=\"a.js\">x</fi");
        events.extend(parser.finish());
        let files = artifacts(&events);
        assert_eq!(files[0].content, "x</fi");
        assert!(files[0].truncated);
    }

    #[test]
    fn test_close_tag_split_across_chunks() {
        let mut parser = ProtocolEventParser::new();
        let mut events = parser.feed("<file path=\"a.js\">let a = 1;</fi");
        assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::FileClose { .. })));
        events.extend(parser.feed("le>after"));
        events.extend(parser.finish());
        let files = artifacts(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "let a = 1;");
        assert!(!files[0].truncated);
        assert!(events.contains(&ProtocolEvent::Narration { text: "after".into() }));
    }

    #[test]
    fn test_open_tag_split_inside_attribute() {
        let mut parser = ProtocolEventParser::new();
        let mut events = parser.feed("<file pa");
        assert!(events.is_empty());
        events.extend(parser.feed("th=\"src/ma"));
        assert!(events.is_empty());
        events.extend(parser.feed("in.js\">ok</file>"));
        events.extend(parser.finish());
        assert_eq!(artifacts(&events)[0].path, "src/main.js");
    }

    #[test]
    fn test_leading_newline_after_open_tag_is_dropped() {
        let files = artifacts(&parse_all("<file path=\"a.txt\">\r\nline\n</file>"));
        assert_eq!(files[0].content, "line\n");
    }

    #[test]
    fn test_single_quoted_path() {
        let files = artifacts(&parse_all("<file path='b.css'>body{}</file>"));
        assert_eq!(files[0].path, "b.css");
    }

    #[test]
    fn test_self_closing_file_is_empty_artifact() {
        let files = artifacts(&parse_all("<file path=\"src/.gitkeep\"/>"));
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "");
    }

    #[test]
    fn test_file_without_path_is_narration() {
        let events = parse_all("<file>oops</file>\n");
        assert!(artifacts(&events).is_empty());
        assert_eq!(
            events,
            vec![ProtocolEvent::Narration {
                text: "<file>oops</file>\n".into()
            }]
        );
    }

    #[test]
    fn test_traversal_path_is_rejected_and_body_dropped() {
        let events = parse_all("<file path=\"../../etc/passwd\">root::0:0</file>after\n");
        assert!(artifacts(&events).is_empty());
        assert!(!events.iter().any(|e| matches!(e, ProtocolEvent::FileOpen { .. })));
        assert_eq!(events.iter().filter(|e| e.is_error()).count(), 1);
        assert!(events.contains(&ProtocolEvent::Narration { text: "after\n".into() }));
    }

    #[test]
    fn test_jsx_inside_file_body_is_content() {
        let body = "const el = <section><h1>Hi</h1></section>;\n";
        let files = artifacts(&parse_all(&format!("<file path=\"a.jsx\">{body}</file>")));
        assert_eq!(files[0].content, body);
    }

    #[test]
    fn test_later_file_with_same_path_is_a_separate_artifact() {
        let files = artifacts(&parse_all(
            "<file path=\"/src/App.js\">one</file><file path=\"src/App.js\">two</file>",
        ));
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].content, "two");
    }

    #[test]
    fn test_open_close_pairing_invariant() {
        let events = parse_in_chunks(SAMPLE, &[3]);
        let mut open: Option<String> = None;
        for event in &events {
            match event {
                ProtocolEvent::FileOpen { path } => {
                    assert!(open.is_none(), "nested FileOpen");
                    open = Some(path.clone());
                }
                ProtocolEvent::FileChunk { path, .. } => {
                    assert_eq!(open.as_ref(), Some(path));
                }
                ProtocolEvent::FileClose { path, .. } => {
                    assert_eq!(open.take().as_ref(), Some(path));
                }
                _ => {}
            }
        }
        assert!(open.is_none());
    }

    #[test]
    fn test_chunks_concatenate_to_content() {
        let events = parse_all(SAMPLE);
        let mut joined = String::new();
        for event in &events {
            if let ProtocolEvent::FileChunk { path, delta } = event
                && path == "src/App.jsx"
            {
                joined.push_str(delta);
            }
        }
        assert_eq!(joined, artifacts(&events)[0].content);
    }

    #[test]
    fn test_stray_angle_bracket_waits_then_resolves_as_text() {
        let mut parser = ProtocolEventParser::new();
        let events = parser.feed("if a <");
        assert!(events.is_empty());
        let mut events = parser.feed(" b then c\n");
        events.extend(parser.finish());
        assert_eq!(
            events,
            vec![ProtocolEvent::Narration {
                text: "if a < b then c\n".into()
            }]
        );
    }

    #[test]
    fn test_overlong_tag_is_literal() {
        let long = format!("<{}>\n", "x".repeat(MAX_TAG_LEN + 10));
        let events = parse_all(&long);
        assert_eq!(events, vec![ProtocolEvent::Narration { text: long.clone() }]);
    }

    #[test]
    fn test_empty_status_is_ignored() {
        assert!(parse_all("<status>   </status>").is_empty());
    }

    #[test]
    fn test_unterminated_status_flushes_at_finish() {
        let events = parse_all("<status>Installing");
        assert_eq!(
            events,
            vec![ProtocolEvent::Status {
                message: "Installing".into()
            }]
        );
    }

    #[test]
    fn test_safe_prefix_len() {
        assert_eq!(safe_prefix_len("abc</fi", FILE_CLOSE_TAG, false), 3);
        assert_eq!(safe_prefix_len("abc<", FILE_CLOSE_TAG, false), 3);
        assert_eq!(safe_prefix_len("abc", FILE_CLOSE_TAG, false), 3);
        assert_eq!(safe_prefix_len("abc</fi", FILE_CLOSE_TAG, true), 7);
    }
}
