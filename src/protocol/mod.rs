//! Generation stream protocol: typed events, the incremental tag lexer and
//! the wire-record assembler.

pub mod parser;
pub mod record;
pub mod types;

pub use parser::{ProtocolEventParser, parse_all};
pub use record::{EventAssembler, GenerationRecord, LineRecord, decode_line};
pub use types::{FileArtifact, ProtocolEvent};
