//! Message serialization.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::headers::HeaderMap;
use crate::http::request::Request;
use crate::http::response::Response;

pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        resp.version,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let may_have_body = !resp.status.forbids_body();
    let body: &[u8] = if may_have_body { &resp.body } else { &[] };
    write_head_and_body(
        &mut buf,
        &resp.headers,
        body,
        &resp.trailers,
        resp.chunked && may_have_body,
        may_have_body,
    );
    buf
}

pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + req.body.len());

    let path = if req.path.is_empty() { "/" } else { &req.path };
    let request_line = format!("{} {} {}\r\n", req.method, path, req.version);
    buf.extend_from_slice(request_line.as_bytes());

    write_head_and_body(
        &mut buf,
        &req.headers,
        &req.body,
        &req.trailers,
        req.chunked,
        !req.body.is_empty(),
    );
    buf
}

/// Headers go out in insertion order with their original case. A chunked
/// message drops Content-Length and is re-encoded as a single data chunk;
/// otherwise the body is written verbatim.
fn write_head_and_body(
    buf: &mut Vec<u8>,
    headers: &HeaderMap,
    body: &[u8],
    trailers: &HeaderMap,
    chunked: bool,
    needs_length: bool,
) {
    for (k, v) in headers.iter() {
        if chunked && k.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write_header(buf, k, v);
    }

    if chunked {
        if !headers.contains_token("Transfer-Encoding", "chunked") {
            write_header(buf, "Transfer-Encoding", "chunked");
        }
    } else if needs_length
        && !headers.contains("Content-Length")
        && !headers.contains("Transfer-Encoding")
    {
        write_header(buf, "Content-Length", &body.len().to_string());
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    if !chunked {
        buf.extend_from_slice(body);
        return;
    }

    if !body.is_empty() {
        buf.extend_from_slice(format!("{:X}\r\n", body.len()).as_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"0\r\n");
    for (k, v) in trailers.iter() {
        write_header(buf, k, v);
    }
    buf.extend_from_slice(b"\r\n");
}

fn write_header(buf: &mut Vec<u8>, key: &str, value: &str) {
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// A fully serialized message and how much of it has reached the stream.
pub struct MessageWriter {
    buffer: Vec<u8>,
    written: usize,
}

impl MessageWriter {
    pub fn for_response(response: &Response) -> Self {
        Self {
            buffer: serialize_response(response),
            written: 0,
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self {
            buffer: serialize_request(request),
            written: 0,
        }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.buffer.len()
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        while self.written < self.buffer.len() {
            let n = stream
                .write(&self.buffer[self.written..])
                .await?;

            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }

            self.written += n;
        }

        stream.flush().await
    }
}
