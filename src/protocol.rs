use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const DEFAULT_MULTICAST_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 0), 9999);
pub const MAX_DATAGRAM_SIZE: usize = 8192;
pub const FALLBACK_PORT: u16 = 30099;
/// Terminates one envelope on the fallback channel.
pub const RECORD_DELIMITER: u8 = b'\n';

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown clipboard kind {0}")]
    UnknownKind(u8),
    #[error("legacy text content is not base64-encoded UTF-8")]
    LegacyText,
}

/// What the clipboard writer should do with `content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Kind {
    #[default]
    Text,
    /// Base64 of a PNG image.
    Image,
}

impl From<Kind> for u8 {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Text => 0,
            Kind::Image => 1,
        }
    }
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Kind::Text),
            1 => Ok(Kind::Image),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Text => f.write_str("text"),
            Kind::Image => f.write_str("image"),
        }
    }
}

/// One clipboard snapshot as it travels over UDP and over the fallback channel.
///
/// Decoding also accepts the capitalized `Content`, `Length` and `Type` fields
/// of older peers, whose text content is base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    pub content: String,
    pub length: usize,
    pub kind: Kind,
    /// Set when `content` was withheld and must be fetched over the fallback channel.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub pointer: bool,
}

/// Envelope as read off the wire, before legacy fields are normalized.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "Content")]
    legacy_content: Option<String>,
    #[serde(default, alias = "Length")]
    length: usize,
    #[serde(default, alias = "Type")]
    kind: Kind,
    #[serde(default)]
    pointer: bool,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let mut envelope = Envelope {
            content: wire.content.unwrap_or_default(),
            length: wire.length,
            kind: wire.kind,
            pointer: wire.pointer,
        };
        let Some(legacy) = wire.legacy_content else {
            return Ok(envelope);
        };
        if !envelope.content.is_empty() {
            return Ok(envelope);
        }

        match envelope.kind {
            // Images were already base64 of a PNG.
            Kind::Image => envelope.content = legacy,
            Kind::Text if !legacy.is_empty() => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(legacy.as_bytes())
                    .map_err(|_| ProtocolError::LegacyText)?;
                envelope.content =
                    String::from_utf8(bytes).map_err(|_| ProtocolError::LegacyText)?;
                envelope.length = envelope.content.len();
            }
            Kind::Text => {}
        }
        Ok(envelope)
    }
}

impl Envelope {
    pub fn new(content: String, kind: Kind) -> Self {
        Self {
            length: content.len(),
            content,
            kind,
            pointer: false,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(content.into(), Kind::Text)
    }

    pub fn image(encoded: impl Into<String>) -> Self {
        Self::new(encoded.into(), Kind::Image)
    }

    /// Same snapshot with the content withheld. `length` keeps the true size.
    pub fn to_pointer(&self) -> Self {
        Self {
            content: String::new(),
            length: self.length,
            kind: self.kind,
            pointer: true,
        }
    }

    /// Whether the receiver has to fetch the content over the fallback channel.
    ///
    /// Peers that predate the `pointer` tag are recognised by a length above
    /// the datagram limit.
    pub fn is_pointer(&self, max_datagram: usize) -> bool {
        self.pointer || (self.content.is_empty() && self.length > max_datagram)
    }

    pub fn is_empty(&self) -> bool {
        !self.pointer && self.content.is_empty() && self.length == 0
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings, integers and bools always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encoded envelope followed by the record delimiter.
    pub fn frame(&self) -> Vec<u8> {
        let mut buf = self.encode();
        buf.push(RECORD_DELIMITER);
        buf
    }
}
