//! Streaming message framer.
//!
//! Turns a byte stream into complete HTTP messages. Bytes read past the
//! end of one message stay buffered as look-ahead for the next message on
//! a persistent connection.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, Result};
use crate::http::chunked::ChunkDecoder;
use crate::http::headers::HeaderMap;
use crate::http::parser::{
    find_headers_end, parse_request_head, parse_response_head, request_framing,
    response_framing, BodyFraming,
};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::MessageWriter;

const READ_CHUNK: usize = 8192;

/// Size caps applied while framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingLimits {
    pub max_header_bytes: usize,
    pub max_chunk_line_bytes: usize,
    pub max_chunk_size: usize,
    pub max_body_bytes: usize,
}

impl Default for FramingLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_chunk_line_bytes: 1024,
            max_chunk_size: 16 * 1024 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

pub struct MessageFramer<S> {
    stream: S,
    buffer: BytesMut,
    limits: FramingLimits,
    bytes_received: u64,
}

impl<S> MessageFramer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, limits: FramingLimits) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            limits,
            bytes_received: 0,
        }
    }

    pub fn limits(&self) -> &FramingLimits {
        &self.limits
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Look-ahead bytes already read but not yet consumed by a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes received from the stream so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// One read from the stream into the look-ahead buffer. `Ok(0)` is EOF.
    async fn fill(&mut self, deadline: Instant) -> Result<usize> {
        self.buffer.reserve(READ_CHUNK);
        match timeout_at(deadline, self.stream.read_buf(&mut self.buffer)).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(e)) => Err(Error::Connection(e)),
            Ok(Ok(n)) => {
                self.bytes_received += n as u64;
                Ok(n)
            }
        }
    }

    /// Waits until at least one byte is buffered. Returns `false` on a clean
    /// EOF with nothing buffered. Safe to cancel: no bytes are lost.
    pub async fn wait_for_data(&mut self, deadline: Instant) -> Result<bool> {
        while self.buffer.is_empty() {
            if self.fill(deadline).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reads until the blank line ending the header block and splits the
    /// block off the buffer. `None` means the peer closed before sending
    /// anything.
    async fn read_head(&mut self, deadline: Instant) -> Result<Option<Bytes>> {
        let mut scanned = 0;
        loop {
            // Tolerate stray CRLFs between pipelined messages.
            while self.buffer.starts_with(b"\r\n") {
                self.buffer.advance(2);
            }

            if let Some(end) = find_headers_end(&self.buffer[scanned..]).map(|p| p + scanned) {
                if end > self.limits.max_header_bytes {
                    return Err(Error::HeaderTooLarge);
                }
                let block = self.buffer.split_to(end + 4).freeze();
                return Ok(Some(block.slice(..end)));
            }
            if self.buffer.len() > self.limits.max_header_bytes + 3 {
                return Err(Error::HeaderTooLarge);
            }
            // The boundary may straddle the previous scan end.
            scanned = self.buffer.len().saturating_sub(3);

            if self.fill(deadline).await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::closed_mid_message());
            }
        }
    }

    /// Reads one complete request. `Ok(None)` means the peer closed the
    /// connection cleanly between messages.
    pub async fn read_request(&mut self, deadline: Instant) -> Result<Option<Request>> {
        let Some(block) = self.read_head(deadline).await? else {
            return Ok(None);
        };
        let head = parse_request_head(&block)?;
        let framing = request_framing(&head.headers)?;
        let (body, trailers) = self.read_body(framing, deadline).await?;

        Ok(Some(Request {
            method: head.method,
            path: head.path,
            version: head.version,
            headers: head.headers,
            body,
            trailers,
            chunked: framing == BodyFraming::Chunked,
        }))
    }

    /// Reads one complete response to a request made with `method`.
    /// Interim 1xx responses (other than 101) are skipped.
    pub async fn read_response(&mut self, deadline: Instant, method: Method) -> Result<Response> {
        loop {
            let block = self
                .read_head(deadline)
                .await?
                .ok_or_else(Error::closed_mid_message)?;
            let head = parse_response_head(&block)?;

            if head.status.is_informational() && head.status.as_u16() != 101 {
                tracing::trace!(status = head.status.as_u16(), "Skipping interim response");
                continue;
            }

            let framing = response_framing(&head.headers, head.status, method)?;
            let (body, trailers) = self.read_body(framing, deadline).await?;

            return Ok(Response {
                status: head.status,
                version: head.version,
                headers: head.headers,
                body,
                trailers,
                chunked: framing == BodyFraming::Chunked,
            });
        }
    }

    async fn read_body(
        &mut self,
        framing: BodyFraming,
        deadline: Instant,
    ) -> Result<(Bytes, HeaderMap)> {
        match framing {
            BodyFraming::Empty => Ok((Bytes::new(), HeaderMap::new())),
            BodyFraming::Length(n) => {
                if n > self.limits.max_body_bytes {
                    return Err(Error::BodyTooLarge);
                }
                while self.buffer.len() < n {
                    if self.fill(deadline).await? == 0 {
                        return Err(Error::closed_mid_message());
                    }
                }
                Ok((self.buffer.split_to(n).freeze(), HeaderMap::new()))
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkDecoder::new(&self.limits);
                while !decoder.decode(&mut self.buffer)? {
                    match self.fill(deadline).await {
                        Ok(0) => return Err(Error::closed_mid_message()),
                        Ok(_) => {}
                        Err(Error::Timeout) if decoder.mid_chunk() => {
                            return Err(Error::MalformedChunk(format!(
                                "{} bytes of declared chunk missing at deadline",
                                decoder.remaining()
                            )));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(decoder.finish())
            }
            BodyFraming::UntilClose => {
                loop {
                    if self.buffer.len() > self.limits.max_body_bytes {
                        return Err(Error::BodyTooLarge);
                    }
                    if self.fill(deadline).await? == 0 {
                        break;
                    }
                }
                Ok((self.buffer.split().freeze(), HeaderMap::new()))
            }
        }
    }

    pub async fn write_response(&mut self, response: &Response) -> Result<()> {
        MessageWriter::for_response(response)
            .write_to_stream(&mut self.stream)
            .await?;
        Ok(())
    }

    pub async fn write_request(&mut self, request: &Request) -> Result<()> {
        MessageWriter::for_request(request)
            .write_to_stream(&mut self.stream)
            .await?;
        Ok(())
    }
}
