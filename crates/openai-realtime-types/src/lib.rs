//! Serde models for the realtime conversation protocol.
pub mod audio;
pub mod content;
pub mod events;
pub mod session;
pub mod tools;

pub use content::{Item, MessageItem, MessageRole};
pub use events::{ClientEvent, ServerEvent};
pub use session::Session;
