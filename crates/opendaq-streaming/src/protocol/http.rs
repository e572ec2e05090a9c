// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal HTTP/1.1 handling for the WebSocket upgrade and the JSON
//! control channel.

use crate::error::{Error, Result};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed HTTP request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// `Upgrade: websocket` together with a `Sec-WebSocket-Key`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.to_ascii_lowercase().contains("websocket"))
            .unwrap_or(false);
        upgrade && self.header("sec-websocket-key").is_some()
    }
}

/// A parsed HTTP response (client side).
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
}

/// Split a head into its start line and headers.
fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>)> {
    let text =
        std::str::from_utf8(head).map_err(|_| Error::protocol("HTTP head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::protocol("missing HTTP start line"))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("malformed header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((start_line, headers))
}

fn content_length(headers: &[(String, String)]) -> Result<usize> {
    match find_header(headers, "content-length") {
        Some(v) => v
            .parse()
            .map_err(|_| Error::protocol(format!("invalid Content-Length: {}", v))),
        None => Ok(0),
    }
}

/// Offset one past the body; a Content-Length that overflows is malformed.
fn message_end(body_start: usize, headers: &[(String, String)]) -> Result<usize> {
    let body_len = content_length(headers)?;
    body_start
        .checked_add(body_len)
        .ok_or_else(|| Error::protocol(format!("Content-Length out of range: {}", body_len)))
}

/// Try to parse one request from the start of `buf`.
///
/// Returns `Ok(None)` while the request is incomplete and
/// `Ok(Some((request, consumed)))` once it is whole. Requests larger than
/// `max_size` are rejected.
pub fn parse_request(buf: &[u8], max_size: usize) -> Result<Option<(HttpRequest, usize)>> {
    let Some(head_end) = find_head_end(buf) else {
        if buf.len() >= max_size {
            return Err(Error::protocol("HTTP request head too large"));
        }
        return Ok(None);
    };

    let (start_line, headers) = parse_head(&buf[..head_end])?;
    let mut parts = start_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::protocol(format!(
            "malformed request line: {}",
            start_line
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(Error::protocol(format!("unsupported version: {}", version)));
    }

    let body_start = head_end + HEAD_TERMINATOR.len();
    let total = message_end(body_start, &headers)?;
    if total > max_size {
        return Err(Error::protocol(format!(
            "HTTP request too large: {} > {}",
            total, max_size
        )));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let request = HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        body: buf[body_start..total].to_vec(),
    };
    Ok(Some((request, total)))
}

/// Try to parse one response from the start of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<Option<(HttpResponse, usize)>> {
    let Some(head_end) = find_head_end(buf) else {
        return Ok(None);
    };

    let (status_line, headers) = parse_head(&buf[..head_end])?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::protocol(format!("malformed status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let body_start = head_end + HEAD_TERMINATOR.len();
    let total = message_end(body_start, &headers)?;
    if buf.len() < total {
        return Ok(None);
    }

    let response = HttpResponse {
        status,
        reason,
        headers,
        body: buf[body_start..total].to_vec(),
    };
    Ok(Some((response, total)))
}

/// `101 Switching Protocols` reply to an upgrade request.
pub fn upgrade_response(accept: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
    .into_bytes()
}

/// Plain status response; the connection is closed after it.
pub fn status_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    )
    .into_bytes()
}

/// Upgrade request sent by the client handler.
pub fn upgrade_request(host: &str, port: u16, key: &str, client_id: &str) -> Vec<u8> {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: opendaq-streaming/{}\r\n\
         X-Client-Id: {}\r\n\r\n",
        host,
        port,
        key,
        env!("CARGO_PKG_VERSION"),
        client_id
    )
    .into_bytes()
}

/// JSON POST used on the control channel.
pub fn post_request(host: &str, port: u16, body: &[u8]) -> Vec<u8> {
    let mut request = format!(
        "POST / HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        host,
        port,
        body.len()
    )
    .into_bytes();
    request.extend_from_slice(body);
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &str = "GET / HTTP/1.1\r\nHost: localhost:7414\r\nUpgrade: websocket\r\n\
                           Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                           Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn test_parse_upgrade_request() {
        let (request, consumed) = parse_request(UPGRADE.as_bytes(), 4096).unwrap().unwrap();
        assert_eq!(consumed, UPGRADE.len());
        assert_eq!(request.method, "GET");
        assert!(request.is_websocket_upgrade());
        assert_eq!(
            request.header("SEC-WEBSOCKET-KEY"),
            Some("dGhlIHNhbXBsZSBub25jZQ==")
        );
    }

    #[test]
    fn test_partial_request() {
        let bytes = UPGRADE.as_bytes();
        assert!(parse_request(&bytes[..20], 4096).unwrap().is_none());
    }

    #[test]
    fn test_post_with_body() {
        let body = br#"{"method":"abc.subscribe","params":["x"]}"#;
        let raw = post_request("localhost", 7438, body);

        assert!(parse_request(&raw[..raw.len() - 1], 4096)
            .unwrap()
            .is_none());

        let (request, _) = parse_request(&raw, 4096).unwrap().unwrap();
        assert_eq!(request.method, "POST");
        assert!(!request.is_websocket_upgrade());
        assert_eq!(request.body, body);
    }

    #[test]
    fn test_oversized_head_rejected() {
        let junk = vec![b'a'; 600];
        assert!(parse_request(&junk, 512).is_err());
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(parse_request(b"HELLO\r\n\r\n", 512).is_err());
        assert!(parse_request(b"GET / FTP/1.0\r\n\r\n", 512).is_err());
    }

    #[test]
    fn test_overflowing_content_length_rejected() {
        let request = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(parse_request(request, 4096).is_err());

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(parse_response(response).is_err());
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = upgrade_response("abc=");
        let (response, consumed) = parse_response(&raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(response.status, 101);
        assert_eq!(response.header("sec-websocket-accept"), Some("abc="));
    }

    #[test]
    fn test_status_response() {
        let raw = status_response(400, "Bad Request");
        let (response, _) = parse_response(&raw).unwrap().unwrap();
        assert_eq!(response.status, 400);
        assert_eq!(response.reason, "Bad Request");
    }
}
