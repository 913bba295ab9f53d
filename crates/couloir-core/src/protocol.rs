//! Line-oriented control protocol carried inline on the relay port,
//! before any HTTP bytes. One frame per CRLF-terminated line:
//! `TAG <json payload> <id>`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CouloirError, Result};

pub const TAG_OPEN: &str = "OPEN_COULOIR";
pub const TAG_JOIN: &str = "JOIN_COULOIR";
pub const TAG_STREAM: &str = "STREAM";
pub const TAG_ACK: &str = "ACK";

const TAGS: [&str; 4] = [TAG_OPEN, TAG_JOIN, TAG_STREAM, TAG_ACK];

/// Hard cap on a single control line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn opened(host: String, key: String) -> Self {
        Self {
            host: Some(host),
            key: Some(key),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open { payload: OpenPayload, id: u64 },
    Join { payload: JoinPayload, id: u64 },
    /// Relay → exposer: the next bytes are a raw client request. One-way,
    /// never acknowledged.
    Stream { id: u64 },
    Ack { payload: AckPayload, id: u64 },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Frame::Open { id, .. }
            | Frame::Join { id, .. }
            | Frame::Stream { id }
            | Frame::Ack { id, .. } => *id,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Frame::Open { .. } => TAG_OPEN,
            Frame::Join { .. } => TAG_JOIN,
            Frame::Stream { .. } => TAG_STREAM,
            Frame::Ack { .. } => TAG_ACK,
        }
    }

    /// Encode as a single CRLF-terminated line.
    pub fn encode(&self) -> Result<String> {
        let json = match self {
            Frame::Open { payload, .. } => serde_json::to_string(payload),
            Frame::Join { payload, .. } => serde_json::to_string(payload),
            Frame::Stream { .. } => Ok("{}".to_string()),
            Frame::Ack { payload, .. } => serde_json::to_string(payload),
        }
        .map_err(|e| CouloirError::Protocol(format!("unencodable payload: {e}")))?;
        Ok(format!("{} {} {}\r\n", self.tag(), json, self.id()))
    }

    /// Parse one control line. Trailing CRLF is accepted and ignored.
    pub fn parse(line: &str) -> Result<Frame> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (tag, rest) = line
            .split_once(' ')
            .ok_or_else(|| CouloirError::Protocol(format!("truncated control line: {line:?}")))?;
        // The JSON payload may itself contain spaces; the id is the last token.
        let (json, id) = rest
            .rsplit_once(' ')
            .ok_or_else(|| CouloirError::Protocol(format!("missing id in control line: {line:?}")))?;
        let id: u64 = id
            .parse()
            .map_err(|_| CouloirError::Protocol(format!("bad id in control line: {line:?}")))?;
        let payload_err =
            |e: serde_json::Error| CouloirError::Protocol(format!("bad {tag} payload: {e}"));
        match tag {
            TAG_OPEN => Ok(Frame::Open {
                payload: serde_json::from_str(json).map_err(payload_err)?,
                id,
            }),
            TAG_JOIN => Ok(Frame::Join {
                payload: serde_json::from_str(json).map_err(payload_err)?,
                id,
            }),
            TAG_STREAM => Ok(Frame::Stream { id }),
            TAG_ACK => Ok(Frame::Ack {
                payload: serde_json::from_str(json).map_err(payload_err)?,
                id,
            }),
            other => Err(CouloirError::Protocol(format!(
                "unknown control tag {other}"
            ))),
        }
    }
}

/// True while `buf` is (a prefix of) a control line: a known tag followed by
/// a space, or the beginning of one. Used to classify a socket from its
/// first bytes without waiting for a full line.
pub fn is_control_preface(buf: &[u8]) -> bool {
    TAGS.iter().any(|tag| {
        let tag = tag.as_bytes();
        if buf.len() <= tag.len() {
            tag.starts_with(buf)
        } else {
            buf.starts_with(tag) && buf[tag.len()] == b' '
        }
    })
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = frame.encode()?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end-of-stream before any bytes
/// of the next line.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE_BYTES {
        return Err(CouloirError::Protocol("oversized control line".to_string()));
    }
    Frame::parse(&line).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_round_trip() {
        let frame = Frame::Open {
            payload: OpenPayload {
                host: Some("demo.my.test".to_string()),
                password: None,
            },
            id: 7,
        };
        let line = frame.encode().unwrap();
        assert!(line.starts_with("OPEN_COULOIR {"));
        assert!(line.ends_with(" 7\r\n"));
        assert_eq!(Frame::parse(&line).unwrap(), frame);
    }

    #[test]
    fn test_open_empty_payload() {
        let frame = Frame::parse("OPEN_COULOIR {} 1\r\n").unwrap();
        assert_eq!(
            frame,
            Frame::Open {
                payload: OpenPayload::default(),
                id: 1
            }
        );
    }

    #[test]
    fn test_join_round_trip() {
        let frame = Frame::Join {
            payload: JoinPayload {
                key: "ab".repeat(24),
            },
            id: 2,
        };
        assert_eq!(Frame::parse(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_stream_encoding() {
        let frame = Frame::Stream { id: 42 };
        assert_eq!(frame.encode().unwrap(), "STREAM {} 42\r\n");
        assert_eq!(Frame::parse("STREAM {} 42").unwrap(), frame);
    }

    #[test]
    fn test_ack_error_payload() {
        let frame = Frame::Ack {
            payload: AckPayload::error("Couloir host x.my.test is already opened"),
            id: 3,
        };
        let line = frame.encode().unwrap();
        assert!(line.contains(r#"{"error":"Couloir host x.my.test is already opened"}"#));
        assert_eq!(Frame::parse(&line).unwrap(), frame);
    }

    #[test]
    fn test_payload_with_spaces_survives_id_split() {
        let line = r#"ACK {"error":"Invalid couloir key. Please restart your couloir client."} 9"#;
        let frame = Frame::parse(line).unwrap();
        assert_eq!(frame.id(), 9);
        match frame {
            Frame::Ack { payload, .. } => assert!(payload.error.unwrap().contains("restart")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(Frame::parse("GARBAGE {} 1").is_err());
        assert!(Frame::parse("GET / HTTP/1.1").is_err());
    }

    #[test]
    fn test_missing_id_rejected() {
        assert!(Frame::parse("OPEN_COULOIR {}").is_err());
        assert!(Frame::parse("OPEN_COULOIR").is_err());
    }

    #[test]
    fn test_control_preface_detection() {
        assert!(is_control_preface(b"OPEN_COULOIR {} 1\r\n"));
        assert!(is_control_preface(b"OPEN_CO"));
        assert!(is_control_preface(b"J"));
        assert!(is_control_preface(b"STREAM {} 1"));
        assert!(!is_control_preface(b"STREAMX"));
        assert!(!is_control_preface(b"GET / HTTP/1.1\r\n"));
        assert!(!is_control_preface(b"GARBAGE\r\n"));
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        let (mut a, b) = tokio::io::duplex(1024);
        let frame = Frame::Join {
            payload: JoinPayload {
                key: "00".repeat(24),
            },
            id: 5,
        };
        write_frame(&mut a, &frame).await.unwrap();
        drop(a);
        let mut reader = tokio::io::BufReader::new(b);
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(frame));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }
}
