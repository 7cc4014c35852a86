//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `turn`   | `Turn`, `Chat`   |
//! | `serve`  | `Serve`          |
//! | `parse`  | `Parse`          |
//! | `config` | `Config`         |

pub mod config;
pub mod parse;
pub mod serve;
pub mod turn;

pub use config::cmd_config;
pub use parse::cmd_parse;
pub use serve::cmd_serve;
pub use turn::{TurnArgs, cmd_chat, cmd_turn};
