//! Shared value types for `textlog`: channel identity, message tokens,
//! log entries and the pending-message wire shapes.

pub mod channel;
pub mod entry;
pub mod pending;
pub mod token;
