//! Resumable decoder for `Transfer-Encoding: chunked` bodies.
//!
//! The decoder consumes bytes from a caller-owned buffer and keeps its
//! position between calls, so a body delivered in arbitrary fragments
//! decodes the same as one delivered in a single read.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::http::framer::FramingLimits;
use crate::http::headers::HeaderMap;
use crate::http::parser::parse_header_lines;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPhase {
    /// Waiting for a `<hex-size>[;ext]\r\n` line.
    SizeLine,
    /// Inside chunk data.
    Data,
    /// Waiting for the CRLF that closes a data chunk.
    DataEnd,
    /// After the zero-size chunk, reading trailer lines.
    Trailer,
    Done,
}

#[derive(Debug)]
pub struct ChunkDecoder {
    phase: ChunkPhase,
    remaining: usize,
    body: BytesMut,
    trailers: HeaderMap,
    trailer_bytes: usize,
    max_line: usize,
    max_chunk: usize,
    max_body: usize,
    max_trailer: usize,
}

impl ChunkDecoder {
    pub fn new(limits: &FramingLimits) -> Self {
        Self {
            phase: ChunkPhase::SizeLine,
            remaining: 0,
            body: BytesMut::new(),
            trailers: HeaderMap::new(),
            trailer_bytes: 0,
            max_line: limits.max_chunk_line_bytes,
            max_chunk: limits.max_chunk_size,
            max_body: limits.max_body_bytes,
            max_trailer: limits.max_header_bytes,
        }
    }

    pub fn phase(&self) -> ChunkPhase {
        self.phase
    }

    /// Bytes still owed by the current data chunk.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Whether the decoder stopped partway through a declared chunk.
    pub fn mid_chunk(&self) -> bool {
        matches!(self.phase, ChunkPhase::Data | ChunkPhase::DataEnd)
    }

    /// Consumes as much of `buf` as possible. Returns `Ok(true)` once the
    /// terminating chunk and final CRLF have been consumed; bytes past that
    /// point are left in `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<bool> {
        loop {
            match self.phase {
                ChunkPhase::SizeLine => {
                    let Some(line) = take_line(buf, self.max_line)? else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&line, self.max_chunk)?;
                    if size == 0 {
                        self.phase = ChunkPhase::Trailer;
                    } else {
                        if self.body.len() + size > self.max_body {
                            return Err(Error::BodyTooLarge);
                        }
                        self.remaining = size;
                        self.body.reserve(size);
                        self.phase = ChunkPhase::Data;
                    }
                }
                ChunkPhase::Data => {
                    if buf.is_empty() {
                        return Ok(false);
                    }
                    let n = self.remaining.min(buf.len());
                    self.body.extend_from_slice(&buf[..n]);
                    buf.advance(n);
                    self.remaining -= n;
                    if self.remaining == 0 {
                        self.phase = ChunkPhase::DataEnd;
                    }
                }
                ChunkPhase::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::MalformedChunk(
                            "chunk data longer than declared size".to_string(),
                        ));
                    }
                    buf.advance(2);
                    self.phase = ChunkPhase::SizeLine;
                }
                ChunkPhase::Trailer => {
                    let budget = self.max_trailer.saturating_sub(self.trailer_bytes);
                    let line = match take_line(buf, budget) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(false),
                        Err(Error::ChunkTooLarge) => return Err(Error::HeaderTooLarge),
                        Err(e) => return Err(e),
                    };
                    if line.is_empty() {
                        self.phase = ChunkPhase::Done;
                        return Ok(true);
                    }
                    self.trailer_bytes += line.len() + 2;
                    let text = std::str::from_utf8(&line)
                        .map_err(|_| Error::MalformedChunk("trailer is not UTF-8".to_string()))?;
                    let parsed = parse_header_lines(std::iter::once(text))
                        .map_err(|_| Error::MalformedChunk(format!("bad trailer line {text:?}")))?;
                    for (k, v) in parsed.iter() {
                        self.trailers.append(k, v);
                    }
                }
                ChunkPhase::Done => return Ok(true),
            }
        }
    }

    /// Hands back the assembled body and any trailers.
    pub fn finish(self) -> (Bytes, HeaderMap) {
        (self.body.freeze(), self.trailers)
    }
}

/// Splits off one CRLF-terminated line (without the CRLF). A line that
/// grows past `max` without a terminator is rejected.
fn take_line(buf: &mut BytesMut, max: usize) -> Result<Option<Bytes>> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) if pos > max => Err(Error::ChunkTooLarge),
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > max + 1 => Err(Error::ChunkTooLarge),
        None => Ok(None),
    }
}

/// Parses the hexadecimal size at the start of a chunk-size line,
/// ignoring any `;extension`.
pub fn parse_chunk_size(line: &[u8], max_chunk: usize) -> Result<usize> {
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(line)
        .trim_ascii_end();

    if digits.is_empty() {
        return Err(Error::MalformedChunk("empty chunk size".to_string()));
    }

    let mut size: usize = 0;
    for &b in digits {
        let digit = (b as char)
            .to_digit(16)
            .ok_or_else(|| {
                Error::MalformedChunk(format!(
                    "invalid chunk size {:?}",
                    String::from_utf8_lossy(digits)
                ))
            })?;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as usize))
            .ok_or(Error::ChunkTooLarge)?;
    }

    if size > max_chunk {
        return Err(Error::ChunkTooLarge);
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkDecoder {
        ChunkDecoder::new(&FramingLimits::default())
    }

    #[test]
    fn hex_sizes_are_case_insensitive() {
        assert_eq!(parse_chunk_size(b"1a", 1 << 20).unwrap(), 26);
        assert_eq!(parse_chunk_size(b"1A;name=value", 1 << 20).unwrap(), 26);
        assert_eq!(parse_chunk_size(b"4 ;ext", 1 << 20).unwrap(), 4);
    }

    #[test]
    fn signed_size_rejected() {
        assert!(matches!(
            parse_chunk_size(b"-1", 1 << 20),
            Err(Error::MalformedChunk(_))
        ));
        assert!(matches!(
            parse_chunk_size(b"+1", 1 << 20),
            Err(Error::MalformedChunk(_))
        ));
    }

    #[test]
    fn leading_whitespace_rejected() {
        for line in [&b" 4"[..], &b" 4 "[..], &b"\t4;x"[..]] {
            assert!(matches!(
                parse_chunk_size(line, 1 << 20),
                Err(Error::MalformedChunk(_))
            ));
        }
    }

    #[test]
    fn overflowing_size_is_too_large() {
        assert!(matches!(
            parse_chunk_size(b"FFFFFFFFFFFFFFFFF", usize::MAX),
            Err(Error::ChunkTooLarge)
        ));
    }

    #[test]
    fn resumes_across_fragments() {
        let mut d = decoder();
        let mut buf = BytesMut::new();

        for piece in [&b"4\r\nWi"[..], b"ki\r", b"\n0\r\n", b"\r\n"] {
            buf.extend_from_slice(piece);
            if d.decode(&mut buf).unwrap() {
                break;
            }
        }

        assert_eq!(d.phase(), ChunkPhase::Done);
        let (body, _) = d.finish();
        assert_eq!(&body[..], b"Wiki");
    }

    #[test]
    fn trailers_collected() {
        let mut d = decoder();
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n0\r\nX-Checksum: 42\r\n\r\nrest"[..]);
        assert!(d.decode(&mut buf).unwrap());
        assert_eq!(&buf[..], b"rest");

        let (body, trailers) = d.finish();
        assert_eq!(&body[..], b"abc");
        assert_eq!(trailers.get("x-checksum"), Some("42"));
    }

    #[test]
    fn missing_crlf_after_data_is_malformed() {
        let mut d = decoder();
        let mut buf = BytesMut::from(&b"2\r\nabc\r\n"[..]);
        assert!(matches!(d.decode(&mut buf), Err(Error::MalformedChunk(_))));
    }
}
