//! Session persistence: the append-only JSONL session log and the
//! read-only store over past session logs.

pub mod log;
pub mod store;

pub use log::{LogRecord, SessionLog};
pub use store::{MessagePreview, SessionInfo, SessionStore};
