pub mod icons;
pub mod messages;
pub mod progress;

pub use messages::{UI_CHANNEL_CAPACITY, UiMessage, broadcast_message, ui_channel};
pub use progress::{TurnReporter, UiMode};
