//! HTTP/1.x request parser.
//!
//! Requests accumulate across receives. A request is complete once the blank
//! line after the headers has arrived, plus `Content-Length` bytes of body
//! when that header is present.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

/// Largest request (head and body) accepted on a connection.
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    TooLarge,
    MalformedRequestLine,
    InvalidContentLength,
    InvalidUtf8,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooLarge => write!(f, "request exceeds {} bytes", MAX_REQUEST_LEN),
            ParseError::MalformedRequestLine => write!(f, "malformed request line"),
            ParseError::InvalidContentLength => write!(f, "invalid Content-Length"),
            ParseError::InvalidUtf8 => write!(f, "request head is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    /// Request target without the query string.
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Path parameters filled in by the router.
    pub params: HashMap<String, String>,
}

impl Request {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// Per-connection request accumulator.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: BytesMut,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete request, if one is buffered.
    pub fn next_request(&mut self) -> Result<Option<Request>, ParseError> {
        let Some(head_end) = find_head_end(&self.buf) else {
            if self.buf.len() > MAX_REQUEST_LEN {
                return Err(ParseError::TooLarge);
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&self.buf[..head_end]).map_err(|_| ParseError::InvalidUtf8)?;
        let mut request = parse_head(head)?;

        let body_len = match request.header("Content-Length") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidContentLength)?,
            None => 0,
        };
        if head_end.saturating_add(body_len) > MAX_REQUEST_LEN {
            return Err(ParseError::TooLarge);
        }
        if self.buf.len() < head_end + body_len {
            return Ok(None);
        }

        self.buf.advance(head_end);
        request.body = self.buf.split_to(body_len).freeze();
        Ok(Some(request))
    }
}

/// Offset just past the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut start = 0;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        let line = &buf[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && start > 0 {
            return Some(end + 1);
        }
        start = end + 1;
    }
    None
}

fn parse_head(head: &str) -> Result<Request, ParseError> {
    let mut lines = head.lines();

    let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::MalformedRequestLine);
    };
    if !version.starts_with("HTTP/") {
        return Err(ParseError::MalformedRequestLine);
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (target, None),
    };

    // Lines without a colon are ignored
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(Request {
        method: method.to_string(),
        path: path.to_string(),
        query,
        version: version.to_string(),
        headers,
        body: Bytes::new(),
        params: HashMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Option<Request>, ParseError> {
        let mut parser = RequestParser::new();
        parser.extend(raw);
        parser.next_request()
    }

    #[test]
    fn test_parse_get() {
        let req = parse(b"GET /customers/42?verbose=1 HTTP/1.1\r\nHost: localhost\r\nX-Trace :  abc \r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/customers/42");
        assert_eq!(req.query.as_deref(), Some("verbose=1"));
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.header("X-Trace"), Some("abc"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let mut parser = RequestParser::new();
        parser.extend(b"POST /customers HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel");
        assert_eq!(parser.next_request().unwrap().map(|r| r.method), None);

        parser.extend(b"loGET / HTTP/1.1\r\n\r\n");
        let req = parser.next_request().unwrap().unwrap();
        assert_eq!(&req.body[..], b"hello");

        // Pipelined follow-up is kept
        let next = parser.next_request().unwrap().unwrap();
        assert_eq!(next.method, "GET");
        assert_eq!(next.path, "/");
    }

    #[test]
    fn test_incomplete_head() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap().is_none());
        assert!(parse(b"").unwrap().is_none());
    }

    #[test]
    fn test_bare_newlines() {
        let req = parse(b"GET /a HTTP/1.0\nAccept: */*\n\n").unwrap().unwrap();
        assert_eq!(req.path, "/a");
        assert_eq!(req.header("accept"), Some("*/*"));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(
            parse(b"GET /\r\n\r\n").unwrap_err(),
            ParseError::MalformedRequestLine
        );
        assert_eq!(
            parse(b"GET / FTP/1.0\r\n\r\n").unwrap_err(),
            ParseError::MalformedRequestLine
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n").unwrap_err(),
            ParseError::InvalidContentLength
        );
        assert_eq!(
            parse(b"GET /\xff HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::InvalidUtf8
        );
    }

    #[test]
    fn test_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_REQUEST_LEN));
        assert_eq!(parse(&raw).unwrap_err(), ParseError::TooLarge);

        let declared = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_REQUEST_LEN);
        assert_eq!(parse(declared.as_bytes()).unwrap_err(), ParseError::TooLarge);
    }
}
