//! Line protocol spoken by the rotating-stage controller.
//!
//! Protocol Overview:
//! - Transport: newline-delimited ASCII over a serial byte stream
//! - `ready|<anything>` (controller → host): stage reached its home position
//! - `capturar|<degrees>` (controller → host): take an image at this angle
//! - `ok\n` (host → controller): acknowledge, the controller may advance
//!
//! Parsing is pure and never fails: a line the host does not understand becomes
//! [`HandshakeEvent::Unknown`] and a capture request whose angle cannot be read
//! still requests a capture, with the angle left unknown.

use std::fmt;

/// Literal acknowledgment the controller waits for before advancing.
pub const ACK_TOKEN: &str = "ok\n";

const READY_PREFIX: &str = "ready";
const CAPTURE_KEYWORD: &str = "capturar";
const FIELD_SEPARATOR: char = '|';

/// One decoded line from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    /// Stage is at its home position.
    Ready,
    /// Controller requests a capture; `angle` is `None` when the controller did not
    /// supply a parseable angle.
    CaptureRequest { angle: Option<f64> },
    /// Anything else. Logged by the caller, never acted upon.
    Unknown { raw: String },
}

/// Decode one controller line.
///
/// Leading/trailing whitespace and either newline convention are ignored.
pub fn parse_line(raw: &str) -> HandshakeEvent {
    let line = raw.trim();

    if line.starts_with(READY_PREFIX) {
        return HandshakeEvent::Ready;
    }

    if let Some(rest) = line.strip_prefix(CAPTURE_KEYWORD) {
        if rest.is_empty() {
            return HandshakeEvent::CaptureRequest { angle: None };
        }
        if let Some(payload) = rest.strip_prefix(FIELD_SEPARATOR) {
            let angle = payload
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|angle| angle.is_finite());
            return HandshakeEvent::CaptureRequest { angle };
        }
    }

    HandshakeEvent::Unknown {
        raw: line.to_string(),
    }
}

/// Wire form of an event, without the trailing newline.
impl fmt::Display for HandshakeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "{READY_PREFIX}{FIELD_SEPARATOR}"),
            Self::CaptureRequest { angle: Some(angle) } => {
                write!(f, "{CAPTURE_KEYWORD}{FIELD_SEPARATOR}{angle}")
            }
            Self::CaptureRequest { angle: None } => {
                write!(f, "{CAPTURE_KEYWORD}{FIELD_SEPARATOR}")
            }
            Self::Unknown { raw } => f.write_str(raw),
        }
    }
}
