//! Pure, buffer-level parsing of HTTP/1.x heads and body framing.
//!
//! Nothing in here touches a socket; [`crate::http::framer`] drives these
//! functions as bytes arrive.

use crate::error::Error;
use crate::http::headers::HeaderMap;
use crate::http::request::Method;
use crate::http::response::StatusCode;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidStatus,
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::MalformedMessage(format!("{e:?}"))
    }
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    Empty,
    /// Exactly this many bytes.
    Length(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Everything until the peer closes (responses only).
    UntilClose,
}

/// Start line and headers of a request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HeaderMap,
}

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}

/// Parses a header block (everything before the blank line) of a request.
pub fn parse_request_head(block: &[u8]) -> Result<RequestHead, ParseError> {
    let text = std::str::from_utf8(block).map_err(|_| ParseError::InvalidRequest)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || path.is_empty() || !is_http_version(version) {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    let headers = parse_header_lines(lines)?;

    Ok(RequestHead {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Parses a header block of a response.
pub fn parse_response_head(block: &[u8]) -> Result<ResponseHead, ParseError> {
    let text = std::str::from_utf8(block).map_err(|_| ParseError::InvalidStatus)?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().ok_or(ParseError::InvalidStatus)?;
    // Reason phrase may contain spaces or be missing entirely.
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().ok_or(ParseError::InvalidStatus)?;
    let code = parts.next().ok_or(ParseError::InvalidStatus)?;

    if !is_http_version(version) || code.len() != 3 {
        return Err(ParseError::InvalidStatus);
    }
    let code: u16 = code.parse().map_err(|_| ParseError::InvalidStatus)?;
    if !(100..=999).contains(&code) {
        return Err(ParseError::InvalidStatus);
    }

    let headers = parse_header_lines(lines)?;

    Ok(ResponseHead {
        version: version.to_string(),
        status: StatusCode::from_u16(code),
        headers,
    })
}

/// Parses `Name: value` lines. Used for both heads and chunked trailers.
pub fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        // obsolete line folding
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(ParseError::InvalidHeader);
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        if key.is_empty() || key.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    Ok(headers)
}

fn is_http_version(v: &str) -> bool {
    matches!(v, "HTTP/1.0" | "HTTP/1.1")
}

fn declared_length(headers: &HeaderMap) -> Result<Option<usize>, ParseError> {
    let mut length = None;
    for value in headers.get_all("Content-Length") {
        let n: usize = value
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
            _ => length = Some(n),
        }
    }
    Ok(length)
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.contains_token("Transfer-Encoding", "chunked")
}

/// Selects request body framing: a positive Content-Length first, then
/// chunked encoding, otherwise no body.
pub fn request_framing(headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
    match declared_length(headers)? {
        Some(n) if n > 0 => Ok(BodyFraming::Length(n)),
        _ if is_chunked(headers) => Ok(BodyFraming::Chunked),
        _ => Ok(BodyFraming::Empty),
    }
}

/// Selects response body framing. Responses to HEAD and 1xx/204/304
/// responses never carry a body; a response with neither length nor
/// chunking runs until the peer closes.
pub fn response_framing(
    headers: &HeaderMap,
    status: StatusCode,
    request_method: Method,
) -> Result<BodyFraming, ParseError> {
    if request_method == Method::HEAD || status.forbids_body() {
        return Ok(BodyFraming::Empty);
    }
    match declared_length(headers)? {
        Some(n) if n > 0 => Ok(BodyFraming::Length(n)),
        _ if is_chunked(headers) => Ok(BodyFraming::Chunked),
        Some(_) => Ok(BodyFraming::Empty),
        None => Ok(BodyFraming::UntilClose),
    }
}
