//! Chat command vocabulary carried in the envelope's command field.
//!
//! | command          | direction            | payload                  |
//! |------------------|----------------------|--------------------------|
//! | `reg:`           | peer → server        | nickname                 |
//! | `dereg:`         | peer → server        | nickname                 |
//! | `update:`        | server → peer        | [`DirectorySnapshot`]    |
//! | `MSG:<nickname>` | peer → peer / server | `"<sender>: <text>"`     |
//! | `resp:`          | server → peer        | [`Reply`]                |
//!
//! [`DirectorySnapshot`]: crate::snapshot::DirectorySnapshot

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Register,
    Deregister,
    Update,
    Message { to: String },
    Reply,
}

impl Command {
    pub fn message(to: impl Into<String>) -> Self {
        Command::Message { to: to.into() }
    }

    /// Parse a `verb:argument` command string.
    pub fn parse(raw: &str) -> Result<Self, WireError> {
        let (verb, arg) = raw.split_once(':').unwrap_or((raw, ""));
        match verb {
            "reg" => Ok(Command::Register),
            "dereg" => Ok(Command::Deregister),
            "update" => Ok(Command::Update),
            "resp" => Ok(Command::Reply),
            "MSG" if !arg.is_empty() => Ok(Command::Message { to: arg.to_string() }),
            _ => Err(WireError::UnknownCommand(raw.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register => f.write_str("reg:"),
            Command::Deregister => f.write_str("dereg:"),
            Command::Update => f.write_str("update:"),
            Command::Message { to } => write!(f, "MSG:{to}"),
            Command::Reply => f.write_str("resp:"),
        }
    }
}

/// Server answer to a peer request, sent as the payload of `resp:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Registered,
    Reactivated,
    NameTaken { nickname: String },
    InvalidNickname { nickname: String },
    Deregistered,
    UnknownNickname { nickname: String },
    NotOwner { nickname: String },
    Delivered { recipient: String },
    Queued { recipient: String },
    NoSuchRecipient { recipient: String },
}

/// Format a chat line as it travels in a `MSG:` payload.
pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{sender}: {text}")
}

/// Split a chat line back into sender and text.
pub fn split_chat_line(line: &str) -> Option<(&str, &str)> {
    line.split_once(": ")
}

/// Nicknames are non-empty, at most 32 bytes, and cannot contain `:` or
/// whitespace (the nickname ends up inside `MSG:<nickname>`).
pub fn valid_nickname(nickname: &str) -> bool {
    !nickname.is_empty()
        && nickname.len() <= 32
        && !nickname.chars().any(|c| c == ':' || c.is_whitespace())
}
