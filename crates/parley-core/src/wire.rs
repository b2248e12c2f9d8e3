//! Parley wire format: what travels inside one UDP datagram.
//!
//! A data unit is a compact JSON array:
//!
//!   [sequence, command, payload, digest]
//!
//! `digest` is the lowercase hex BLAKE3 hash of the JSON encoding of
//! `[sequence, command, payload]`. The receiver recomputes it over the decoded
//! values; a mismatch silently discards the unit and no ACK is sent.
//!
//! An acknowledgment is not an envelope. It is the bare text `ACK:<sequence>`.
//! A plain `ACK` is also accepted and acknowledges whatever the receiver has
//! outstanding towards that source.

use serde_json::Value;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Literal that opens every acknowledgment unit.
pub const ACK: &str = "ACK";

/// Largest UDP payload over IPv4. Encoded units above this are refused.
pub const MAX_DATAGRAM: usize = 65507;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One unit of application data exchanged over the reliable channel.
///
/// The digest is not stored: it is computed on encode and verified on decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sender-assigned marker. Retransmissions reuse it.
    pub sequence: u64,
    /// `verb:argument` command string. The transport does not inspect it.
    pub command: String,
    /// Any JSON value.
    pub payload: Value,
}

impl Envelope {
    pub fn new(sequence: u64, command: impl Into<String>, payload: Value) -> Self {
        Self {
            sequence,
            command: command.into(),
            payload,
        }
    }

    /// Integrity digest over sequence, command and payload.
    pub fn digest(&self) -> Result<String, WireError> {
        digest_of(self.sequence, &self.command, &self.payload)
    }

    /// Serialize to datagram bytes, digest appended.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let digest = self.digest()?;
        let bytes = serde_json::to_vec(&(self.sequence, &self.command, &self.payload, &digest))
            .map_err(WireError::Encode)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(WireError::Oversized(bytes.len()));
        }
        Ok(bytes)
    }
}

fn digest_of(sequence: u64, command: &str, payload: &Value) -> Result<String, WireError> {
    let body = serde_json::to_vec(&(sequence, command, payload)).map_err(WireError::Encode)?;
    Ok(hex::encode(blake3::hash(&body).as_bytes()))
}

// ── Units ─────────────────────────────────────────────────────────────────────

/// A decoded datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    /// Verified data envelope.
    Data(Envelope),
    /// Acknowledgment. `None` for a bare `ACK`.
    Ack(Option<u64>),
}

/// Encode the acknowledgment for `sequence`.
pub fn encode_ack(sequence: u64) -> Vec<u8> {
    format!("{ACK}:{sequence}").into_bytes()
}

/// Decode and verify one datagram.
pub fn decode(datagram: &[u8]) -> Result<Unit, WireError> {
    if let Some(rest) = datagram.strip_prefix(ACK.as_bytes()) {
        return match rest {
            [] => Ok(Unit::Ack(None)),
            [b':', digits @ ..] => std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|seq| Unit::Ack(Some(seq)))
                .ok_or(WireError::Malformed("acknowledgment sequence is not a number")),
            _ => Err(WireError::Malformed("trailing bytes after ACK")),
        };
    }

    let (sequence, command, payload, received): (u64, String, Value, String) =
        serde_json::from_slice(datagram).map_err(WireError::Decode)?;

    let computed = digest_of(sequence, &command, &payload)?;
    if computed != received {
        return Err(WireError::IntegrityMismatch { received, computed });
    }

    Ok(Unit::Data(Envelope {
        sequence,
        command,
        payload,
    }))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when producing or interpreting wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode unit: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode unit: {0}")]
    Decode(serde_json::Error),

    #[error("malformed unit: {0}")]
    Malformed(&'static str),

    #[error("integrity digest mismatch (received {received}, computed {computed})")]
    IntegrityMismatch { received: String, computed: String },

    #[error("encoded unit is {0} bytes, exceeds maximum {}", MAX_DATAGRAM)]
    Oversized(usize),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
