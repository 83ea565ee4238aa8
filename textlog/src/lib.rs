//! `textlog`: exactly-once logging of instant-message text channels.
//!
//! Every attached channel gets a session that prepares it through an
//! [`chain::ActionChain`], reconciles the channel's pending queue against
//! the acknowledgment index and then logs live traffic, so that each message
//! is persisted once no matter which path observes it first.

pub mod chain;
pub mod channel;
pub mod config;
pub mod observer;
pub mod replay;
pub mod transport;
