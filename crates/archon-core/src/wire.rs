//! The Archon line protocol: `>II<text>\n` out, `<II<text>\n` / `?II\n` /
//! `<II<binary>` in.
//!
//! This module only builds and classifies frames; it knows nothing about
//! sockets. `archon-client` owns the socket and the request/reply
//! correlation table.

use crate::error::{ArchonError, ArchonResult};

/// A framed outbound command: `>` + 2 hex digit id + literal text + `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// The 2-hex-digit wire id, `0x01..=0xFF`.
    pub id: u8,
    /// The literal command text, e.g. `"STATUS"` or `"WCONFIG0042KEY=1"`.
    pub text: String,
}

impl CommandFrame {
    /// Builds a new command frame. `id` must be non-zero; callers get ids
    /// from [`crate::ids::CommandIdAllocator`].
    #[must_use]
    pub fn new(id: u8, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }

    /// Serializes the frame to the bytes written on the wire.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.text.len() + 4);
        buf.push(b'>');
        buf.extend_from_slice(format!("{:02X}", self.id).as_bytes());
        buf.extend_from_slice(self.text.as_bytes());
        buf.push(b'\n');
        buf
    }
}

/// A classified inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFrame {
    /// `<II<payload>\n` — success, text payload.
    AckText {
        /// The 2-hex-digit wire id this reply answers.
        id: u8,
        /// The payload text, without the leading `<II` or trailing `\n`.
        payload: String,
    },
    /// `<II` followed by exactly `len` binary bytes, no trailing newline.
    /// Used only for `FETCH` replies; the length comes from a prior `FRAME`
    /// buffer-descriptor poll, not from the frame itself.
    AckBinary {
        /// The 2-hex-digit wire id this reply answers.
        id: u8,
        /// The raw payload bytes.
        payload: Vec<u8>,
    },
    /// `?II\n` — the controller rejected the command.
    Nak {
        /// The 2-hex-digit wire id this reply answers.
        id: u8,
    },
}

impl ReplyFrame {
    /// The wire id every variant carries.
    #[must_use]
    pub fn id(&self) -> u8 {
        match self {
            ReplyFrame::AckText { id, .. }
            | ReplyFrame::AckBinary { id, .. }
            | ReplyFrame::Nak { id } => *id,
        }
    }
}

/// Parses one complete text line (already split on `\n` by the caller) into
/// a [`ReplyFrame::AckText`] or [`ReplyFrame::Nak`].
///
/// # Errors
///
/// Returns [`ArchonError::Protocol`] if the line does not start with `<` or
/// `?`, or if the id is not two valid hex digits.
pub fn classify_text_line(line: &str, controller: &str) -> ArchonResult<ReplyFrame> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 {
        return Err(ArchonError::Protocol {
            controller: controller.to_string(),
            message: format!("reply line too short: {line:?}"),
        });
    }
    let marker = bytes[0];
    let id = parse_hex_id(&line[1..3], controller)?;
    match marker {
        b'<' => Ok(ReplyFrame::AckText {
            id,
            payload: line[3..].to_string(),
        }),
        b'?' => Ok(ReplyFrame::Nak { id }),
        other => Err(ArchonError::Protocol {
            controller: controller.to_string(),
            message: format!("unexpected reply marker {:?}", other as char),
        }),
    }
}

/// Parses the two-character `<II` header that precedes a binary `FETCH`
/// payload, returning the id the subsequent raw bytes are addressed to.
///
/// # Errors
///
/// Returns [`ArchonError::Protocol`] if the header is malformed.
pub fn parse_binary_header(header: &[u8; 3], controller: &str) -> ArchonResult<u8> {
    if header[0] != b'<' {
        return Err(ArchonError::Protocol {
            controller: controller.to_string(),
            message: "FETCH reply missing '<' marker".into(),
        });
    }
    let id_str = std::str::from_utf8(&header[1..3]).map_err(|_| ArchonError::Protocol {
        controller: controller.to_string(),
        message: "FETCH id bytes are not valid UTF-8".into(),
    })?;
    parse_hex_id(id_str, controller)
}

fn parse_hex_id(s: &str, controller: &str) -> ArchonResult<u8> {
    u8::from_str_radix(s, 16).map_err(|_| ArchonError::Protocol {
        controller: controller.to_string(),
        message: format!("invalid hex command id {s:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_frame() {
        let frame = CommandFrame::new(0x1A, "STATUS");
        assert_eq!(frame.encode(), b">1ASTATUS\n");
    }

    #[test]
    fn classifies_ack_text() {
        let frame = classify_text_line("<1AOK\n", "ccd1").unwrap();
        assert_eq!(
            frame,
            ReplyFrame::AckText {
                id: 0x1A,
                payload: "OK\n".to_string()
            }
        );
    }

    #[test]
    fn classifies_nak() {
        let frame = classify_text_line("?1A\n", "ccd1").unwrap();
        assert_eq!(frame, ReplyFrame::Nak { id: 0x1A });
    }

    #[test]
    fn rejects_bad_marker() {
        let err = classify_text_line("#1Aoops\n", "ccd1").unwrap_err();
        assert!(matches!(err, ArchonError::Protocol { .. }));
    }

    #[test]
    fn parses_binary_header() {
        let id = parse_binary_header(b"<2F", "ccd1").unwrap();
        assert_eq!(id, 0x2F);
    }
}
