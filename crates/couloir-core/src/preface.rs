//! First-bytes inspection. Every socket accepted by the relay is classified
//! from its preface: exposers always start with a control line, HTTP clients
//! with a request line. Anything else is rejected.

use crate::error::{CouloirError, Result};
use crate::protocol;

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// A complete control line is buffered.
    Control,
    /// A complete HTTP request head is buffered.
    Http,
    /// Cannot decide yet; keep reading.
    Incomplete,
    /// The preface is neither a control line nor an HTTP request.
    Invalid,
}

/// Classify a buffered preface. Decides as early as possible: a buffer that
/// can no longer be the prefix of a control tag or an HTTP method token is
/// invalid without waiting for more bytes.
pub fn classify(buf: &[u8]) -> Classification {
    if buf.is_empty() {
        return Classification::Incomplete;
    }
    if protocol::is_control_preface(buf) {
        return if find_crlf(buf).is_some() {
            Classification::Control
        } else {
            Classification::Incomplete
        };
    }
    if starts_with_http_method(buf) {
        return if head_len(buf).is_some() {
            Classification::Http
        } else {
            Classification::Incomplete
        };
    }
    Classification::Invalid
}

fn starts_with_http_method(buf: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| {
        let method = method.as_bytes();
        if buf.len() <= method.len() {
            method.starts_with(buf)
        } else {
            buf.starts_with(method) && buf[method.len()] == b' '
        }
    })
}

pub fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Length of the request head including the terminating `\r\n\r\n`, if the
/// buffer holds a complete one.
pub fn head_len(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Extract the Host header from a buffered request head, lowercased and with
/// any `:port` suffix removed.
pub fn host_from_head(head: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(head)
        .map_err(|_| CouloirError::InvalidProtocol("request head is not valid UTF-8".to_string()))?;
    for line in text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                let host = strip_port(value.trim());
                if host.is_empty() {
                    break;
                }
                return Ok(host.to_ascii_lowercase());
            }
        }
    }
    Err(CouloirError::InvalidProtocol(
        "missing Host header".to_string(),
    ))
}

/// `host:port` → `host`. Bracketed IPv6 literals keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[..=end];
        }
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Replace the Host header value in a buffered request head. Everything else
/// is forwarded verbatim; a head without a Host header comes back unchanged.
pub fn rewrite_host(head: &[u8], new_host: &str) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(head) else {
        return head.to_vec();
    };
    let mut rewritten = false;
    let lines: Vec<String> = text
        .split("\r\n")
        .enumerate()
        .map(|(i, line)| {
            if i == 0 || rewritten {
                return line.to_string();
            }
            if let Some((name, _)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("host") {
                    rewritten = true;
                    return format!("{name}: {new_host}");
                }
            }
            line.to_string()
        })
        .collect();
    lines.join("\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_control_line() {
        assert_eq!(classify(b"OPEN_COULOIR {} 1\r\n"), Classification::Control);
        assert_eq!(classify(b"JOIN_COULOIR"), Classification::Incomplete);
        assert_eq!(classify(b"OPEN_COULOIR {} 1"), Classification::Incomplete);
    }

    #[test]
    fn test_classify_http_head() {
        assert_eq!(
            classify(b"GET / HTTP/1.1\r\nHost: a.my.test\r\n\r\n"),
            Classification::Http
        );
        assert_eq!(
            classify(b"GET / HTTP/1.1\r\nHost: a.my.test\r\n"),
            Classification::Incomplete
        );
        assert_eq!(classify(b"GE"), Classification::Incomplete);
        assert_eq!(classify(b"POST /x HT"), Classification::Incomplete);
    }

    #[test]
    fn test_classify_invalid_early() {
        // No continuation of these bytes can become a control tag or an
        // HTTP method, so the verdict does not wait for a CRLF.
        assert_eq!(classify(b"GARBAGE"), Classification::Invalid);
        assert_eq!(classify(b"GARBAGE\r\n"), Classification::Invalid);
        assert_eq!(classify(b"\x16\x03\x01"), Classification::Invalid);
        assert_eq!(classify(b"STREAMX"), Classification::Invalid);
    }

    #[test]
    fn test_classify_empty() {
        assert_eq!(classify(b""), Classification::Incomplete);
    }

    #[test]
    fn test_head_len() {
        let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nbody";
        assert_eq!(head_len(head), Some(27));
        assert_eq!(head_len(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_host_extraction() {
        let head = b"GET /p?q=1 HTTP/1.1\r\nUser-Agent: curl\r\nHost: Demo.My.Test\r\n\r\n";
        assert_eq!(host_from_head(head).unwrap(), "demo.my.test");
    }

    #[test]
    fn test_host_port_stripped() {
        let head = b"GET / HTTP/1.1\r\nHost: demo.my.test:8080\r\n\r\n";
        assert_eq!(host_from_head(head).unwrap(), "demo.my.test");
    }

    #[test]
    fn test_host_missing() {
        assert!(host_from_head(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("my.test"), "my.test");
        assert_eq!(strip_port("my.test:443"), "my.test");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("my.test:notaport"), "my.test:notaport");
    }

    #[test]
    fn test_rewrite_host() {
        let head = b"GET / HTTP/1.1\r\nHost: demo.my.test\r\nAccept: */*\r\n\r\n";
        let rewritten = rewrite_host(head, "internal.local");
        assert_eq!(
            rewritten,
            b"GET / HTTP/1.1\r\nHost: internal.local\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_rewrite_host_only_touches_host() {
        let head = b"GET /a:b HTTP/1.1\r\nX-Host: keep\r\nhost: old\r\n\r\n";
        let rewritten = rewrite_host(head, "new");
        assert_eq!(
            rewritten,
            b"GET /a:b HTTP/1.1\r\nX-Host: keep\r\nhost: new\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_rewrite_host_without_host_header() {
        let head = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert_eq!(rewrite_host(head, "new"), head.to_vec());
    }
}
