//! Channel identity types.
//!
//! A text channel is identified by its transport object path and by the
//! account that owns it. Contacts and rooms are addressed through
//! transport-scoped [`Handle`]s that only mean something relative to the
//! connection that issued them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport object path of a text channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelPath(String);

impl ChannelPath {
    /// Creates a channel path from its string form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the string form of this path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object path of the account owning a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountPath(String);

impl AccountPath {
    /// Creates an account path from its string form.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Returns the string form of this path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-scoped handle naming a contact or a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Wraps a raw handle value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of entity a channel's target handle names.
///
/// Only [`HandleKind::Contact`] (one-to-one) and [`HandleKind::Room`]
/// (chatroom) channels are logged; the remaining kinds are unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    /// Anonymous channel without a target handle.
    None,
    /// A single remote contact.
    Contact,
    /// A multi-party room.
    Room,
    /// A server-side contact list.
    List,
    /// A user-defined contact group.
    Group,
}

impl HandleKind {
    /// Whether channels targeting this kind can be logged.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::Contact | Self::Room)
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Contact => "contact",
            Self::Room => "room",
            Self::List => "list",
            Self::Group => "group",
        };
        f.write_str(name)
    }
}

/// Resolved metadata for a contact handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRef {
    /// Handle the contact was resolved from.
    pub handle: Handle,
    /// Protocol-level identifier (e.g. `alice@example.com`).
    pub identifier: String,
    /// Human readable alias.
    pub alias: String,
    /// Opaque avatar token, if the contact advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_token: Option<String>,
}

impl ContactRef {
    /// Creates a contact without an avatar token.
    pub fn new(handle: Handle, identifier: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            handle,
            identifier: identifier.into(),
            alias: alias.into(),
            avatar_token: None,
        }
    }
}

impl fmt::Display for ContactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identifier, self.alias)
    }
}
