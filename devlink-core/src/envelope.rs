//! Message envelope (`<timestamp>,<kind>[,<fields>]`) and control tokens.

/// Acknowledgement written back after every read batch that held a complete frame.
pub const HEARTBEAT: &str = "HEARTBEAT";

/// Handshake request: asks the peer to send its `DEVICE_INFO` header.
pub const WHOAREYOU: &str = "WHOAREYOU";

/// Kind of the discovery header message.
pub const DEVICE_INFO: &str = "DEVICE_INFO";

/// Parsed header of one frame. `rest` is opaque to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub timestamp: i64,
    pub kind: &'a str,
    pub rest: Option<&'a str>,
}

impl Envelope<'_> {
    pub fn is_device_info(&self) -> bool {
        self.kind == DEVICE_INFO
    }
}

/// Parse the envelope header of a frame.
pub fn parse_envelope(message: &str) -> Result<Envelope<'_>, EnvelopeError> {
    let mut fields = message.splitn(3, ',');
    let timestamp = fields.next().unwrap_or_default().trim();
    let kind = fields.next().ok_or(EnvelopeError::MissingKind)?.trim();
    let timestamp = timestamp
        .parse::<i64>()
        .map_err(|_| EnvelopeError::Timestamp(timestamp.to_owned()))?;
    Ok(Envelope {
        timestamp,
        kind,
        rest: fields.next(),
    })
}

/// Frame whose header could not be parsed. The frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope has no kind field")]
    MissingKind,
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
}
