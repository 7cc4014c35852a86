//! Offline protocol inspection: `kiln parse`.

use std::path::Path;

use anyhow::{Context, Result};

use kiln::protocol::{EventAssembler, ProtocolEvent, ProtocolEventParser};

/// Split `text` into pieces of at most `size` characters. Zero means one piece.
fn chunks(text: &str, size: usize) -> Vec<String> {
    if size == 0 {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(String::from_iter).collect()
}

fn is_event_stream(text: &str) -> bool {
    text.lines().any(|line| line.starts_with("data:"))
}

pub fn events_for(text: &str, chunk_size: usize) -> Vec<ProtocolEvent> {
    let mut events = Vec::new();
    if is_event_stream(text) {
        let mut assembler = EventAssembler::new();
        for line in text.lines() {
            events.extend(assembler.push_line(line));
        }
        events.extend(assembler.finish());
    } else {
        let mut parser = ProtocolEventParser::new();
        for chunk in chunks(text, chunk_size) {
            events.extend(parser.feed(&chunk));
        }
        events.extend(parser.finish());
    }
    events
}

pub fn cmd_parse(file: &Path, chunk_size: usize) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    for event in events_for(&text, chunk_size) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
