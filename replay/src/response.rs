//! Response framing and decoding
//!
//! The transport asks [`message_len`] after every read whether a whole
//! response is buffered. Once reading stops, [`decode`] turns whatever was
//! read into an [`InboundMessage`]. Both are best effort: bytes that do not
//! parse as HTTP are read until the peer closes and are never an error.

use std::str::from_utf8;

use httparse::Status;

/// Number of headers to allocate on a stack
const MIN_HEADERS: usize = 16;
/// A hard limit on the number of headers
const MAX_HEADERS: usize = 1024;

/// How the response body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Fixed(usize),
    Chunked,
    Eof,
}

/// A response read back from the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    version: u8,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body_kind: BodyKind,
    body: Vec<u8>,
    complete: bool,
}

impl InboundMessage {
    /// `HTTP/1.0` or `HTTP/1.1`
    pub fn version(&self) -> &'static str {
        if self.version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Headers in the order they were received
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First header with this name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_kind(&self) -> BodyKind {
        self.body_kind
    }

    /// Body with any chunked framing removed
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// False when the peer closed before the framing said we were done
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

struct Head {
    version: u8,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    body_kind: BodyKind,
    /// Bytes up to and including the blank line, interim responses included
    len: usize,
}

enum Chunks {
    Complete(usize),
    Partial,
    Invalid,
}

/// Length of the complete response at the start of `buf`, or `None` while
/// more bytes (or the peer closing) are needed
pub(crate) fn message_len(buf: &[u8], is_head: bool) -> Option<usize> {
    let head = match parse_head(buf, is_head) {
        Ok(Some(head)) => head,
        // Still waiting for the header block, or not HTTP at all
        Ok(None) | Err(_) => return None,
    };
    let body = &buf[head.len..];
    match head.body_kind {
        BodyKind::Fixed(n) if body.len() >= n => Some(head.len + n),
        BodyKind::Fixed(_) | BodyKind::Eof => None,
        BodyKind::Chunked => match walk_chunks(body, |_| {}) {
            Chunks::Complete(n) => Some(head.len + n),
            Chunks::Partial => None,
            // No point waiting for more chunks after broken framing
            Chunks::Invalid => Some(buf.len()),
        },
    }
}

/// Decode the bytes read for one response
///
/// Returns `None` when the bytes do not start with a complete HTTP status
/// line and header block.
pub fn decode(buf: &[u8], is_head: bool) -> Option<InboundMessage> {
    let head = parse_head(buf, is_head).ok()??;
    let rest = &buf[head.len..];

    let (body, complete) = match head.body_kind {
        BodyKind::Fixed(n) => (rest[..n.min(rest.len())].to_vec(), rest.len() >= n),
        BodyKind::Chunked => {
            let mut body = Vec::new();
            let done = walk_chunks(rest, |data| body.extend_from_slice(data));
            (body, matches!(done, Chunks::Complete(_)))
        }
        BodyKind::Eof => (rest.to_vec(), true),
    };

    Some(InboundMessage {
        version: head.version,
        status: head.status,
        reason: head.reason,
        headers: head.headers,
        body_kind: head.body_kind,
        body,
        complete,
    })
}

/// Reassemble a complete chunked body, `None` if the framing is broken or
/// the terminating chunk is missing
pub fn dechunk(data: &[u8]) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    match walk_chunks(data, |chunk| body.extend_from_slice(chunk)) {
        Chunks::Complete(_) => Some(body),
        Chunks::Partial | Chunks::Invalid => None,
    }
}

fn parse_head(buf: &[u8], is_head: bool) -> Result<Option<Head>, httparse::Error> {
    let mut offset = 0;
    loop {
        let mut vec;
        let mut headers = [httparse::EMPTY_HEADER; MIN_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);
        let mut result = raw.parse(&buf[offset..]);
        if matches!(result, Err(httparse::Error::TooManyHeaders)) {
            vec = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
            raw = httparse::Response::new(&mut vec);
            result = raw.parse(&buf[offset..]);
        }
        let bytes = match result? {
            Status::Complete(bytes) => bytes,
            Status::Partial => return Ok(None),
        };
        let code = raw.code.unwrap_or_default();

        // Interim responses (100 Continue and friends) precede the real one
        if (100..200).contains(&code) && code != 101 {
            offset += bytes;
            continue;
        }

        let headers: Vec<(String, String)> = raw
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();

        return Ok(Some(Head {
            version: raw.version.unwrap_or(1),
            status: code,
            reason: raw.reason.unwrap_or_default().to_string(),
            body_kind: scan_headers(is_head, code, raw.headers),
            headers,
            len: offset + bytes,
        }));
    }
}

/// Body length algorithm from RFC 7230 §3.3.3:
///
/// 1. HEAD, 1xx, 204, 304 -- no body
/// 2. Last transfer coding is chunked -> Chunked
/// 3. Content-Length -> Fixed
/// 4. Else Eof
fn scan_headers(is_head: bool, code: u16, headers: &[httparse::Header]) -> BodyKind {
    if is_head || (100..200).contains(&code) || code == 204 || code == 304 {
        return BodyKind::Fixed(0);
    }
    let mut result = BodyKind::Eof;
    for header in headers {
        if header.name.eq_ignore_ascii_case("Transfer-Encoding") {
            let last = header.value.split(|&b| b == b',').last().unwrap_or_default();
            if trim(last).eq_ignore_ascii_case(b"chunked") {
                result = BodyKind::Chunked;
            }
        } else if header.name.eq_ignore_ascii_case("Content-Length") && result == BodyKind::Eof {
            // Bad lengths fall back to reading until close
            if let Some(len) = from_utf8(header.value).ok().and_then(|s| s.trim().parse().ok()) {
                result = BodyKind::Fixed(len);
            }
        }
    }
    result
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &value[start..end]
}

fn walk_chunks(buf: &[u8], mut data: impl FnMut(&[u8])) -> Chunks {
    let mut pos = 0;
    loop {
        let (bytes, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(Status::Complete(parsed)) => parsed,
            Ok(Status::Partial) => return Chunks::Partial,
            Err(_) => return Chunks::Invalid,
        };
        pos += bytes;

        if size == 0 {
            // Trailers are consumed and dropped
            let mut trailers = [httparse::EMPTY_HEADER; MIN_HEADERS];
            return match httparse::parse_headers(&buf[pos..], &mut trailers) {
                Ok(Status::Complete((n, _))) => Chunks::Complete(pos + n),
                Ok(Status::Partial) => Chunks::Partial,
                Err(_) => Chunks::Invalid,
            };
        }

        let size = match usize::try_from(size) {
            Ok(size) => size,
            Err(_) => return Chunks::Invalid,
        };
        let end = pos.saturating_add(size);
        if buf.len() < end.saturating_add(2) {
            data(&buf[pos..end.min(buf.len())]);
            return Chunks::Partial;
        }
        data(&buf[pos..end]);
        if &buf[end..end + 2] != b"\r\n" {
            return Chunks::Invalid;
        }
        pos = end + 2;
    }
}
