//! Raw HTTP response decoding.
//!
//! The tap relay captures upstream responses exactly as they appear on the
//! wire, so bodies still carry their transfer framing (chunked records) and
//! content codings (gzip et al.). This module undoes both layers:
//!
//! 1. If the response declared a non-negative content length, the body is
//!    already complete and is passed through as a single segment.
//! 2. Otherwise the transfer encodings are undone in reverse declaration
//!    order; `chunked` framing splits the body into one segment per record.
//! 3. The content encodings are then undone in reverse declaration order,
//!    each segment independently.
//!
//! All functions are pure; failures are per-response and never affect the
//! rest of the stream.

use std::io::Read;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Decoded body: one byte buffer per transfer record.
pub type DecodedBody = Vec<Vec<u8>>;

/// Errors produced while decoding a single response.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A header line expected in the raw dump was not found.
    #[error("header not found: {0}")]
    HeaderMissing(&'static str),

    /// The raw dump has no header/body boundary.
    #[error("response has no header terminator")]
    MissingHeaderBoundary,

    /// The status line could not be parsed.
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    /// A chunk-size line was not valid hexadecimal.
    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    /// The body ended in the middle of a chunked record.
    #[error("chunked body ended mid-record")]
    TruncatedChunk,

    /// An encoding token we do not decode (`compress`, `br`, ...).
    #[error("unsupported encoding: {0:?}")]
    UnsupportedEncoding(String),

    /// A compressed segment could not be inflated.
    #[error("corrupt {encoding} stream: {source}")]
    Inflate {
        encoding: &'static str,
        source: std::io::Error,
    },
}

/// Result type for decode operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

static CONTENT_TYPE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)content-type:\s*([^\r\n]+)\r\n").unwrap());
static CONTENT_ENCODING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)content-encoding:\s*([^\r\n]+)\r\n").unwrap());
static TRANSFER_ENCODING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)transfer-encoding:\s*([^\r\n]+)\r\n").unwrap());
static CONTENT_LENGTH_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)content-length:\s*(\d+)\r\n").unwrap());

/// Splits a raw response dump at the header terminator.
///
/// Returns the header block (including the terminating blank line's CRLF)
/// and the raw body bytes.
pub fn split_response(raw: &[u8]) -> Result<(&[u8], &[u8])> {
    let boundary = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(DecodeError::MissingHeaderBoundary)?;
    Ok((&raw[..boundary + 4], &raw[boundary + 4..]))
}

/// Parses the status code out of the first line of a header block.
pub fn status_code(head: &str) -> Result<u16> {
    let line = head.lines().next().unwrap_or_default();
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| DecodeError::MalformedStatusLine(line.to_string()))
}

/// Extracts the media type from the `Content-Type` header line.
///
/// Parameters after `;` (charset and friends) are stripped, so
/// `text/plain; charset=UTF-8` compares equal to `text/plain`. Absence of
/// the header is an error: the caller only asks once it expects to decode.
pub fn content_type(head: &str) -> Result<String> {
    let captures = CONTENT_TYPE_LINE
        .captures(head)
        .ok_or(DecodeError::HeaderMissing("Content-Type"))?;
    let value = captures[1].trim();
    let media = value.split(';').next().unwrap_or(value);
    Ok(media.trim().to_ascii_lowercase())
}

/// Extracts the `Content-Encoding` token list, outermost last.
///
/// A missing header yields an empty list: no content decoding is applied.
pub fn content_encodings(head: &str) -> Vec<String> {
    encoding_list(&CONTENT_ENCODING_LINE, head)
}

/// Extracts the `Transfer-Encoding` token list, outermost last.
pub fn transfer_encodings(head: &str) -> Vec<String> {
    encoding_list(&TRANSFER_ENCODING_LINE, head)
}

/// Extracts the declared content length, `-1` when not declared.
///
/// A negative value tells [`decode_body`] that the body must be
/// transfer-decoded to recover its boundaries.
pub fn declared_content_length(head: &str) -> i64 {
    CONTENT_LENGTH_LINE
        .captures(head)
        .and_then(|captures| captures[1].parse().ok())
        .unwrap_or(-1)
}

fn encoding_list(line: &Regex, head: &str) -> Vec<String> {
    match line.captures(head) {
        Some(captures) => captures[1]
            .split(',')
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect(),
        None => Vec::new(),
    }
}

/// Decodes a raw body into its plaintext segments.
///
/// `content_length` is the declared length (negative = not declared). The
/// encoding lists are in declaration order; both are applied in reverse,
/// matching the convention that the outermost encoding is declared last.
pub fn decode_body(
    body: &[u8],
    content_length: i64,
    transfer_encodings: &[String],
    content_encodings: &[String],
) -> Result<DecodedBody> {
    // A declared length means the body is already a complete payload; the
    // chunked parser must not run.
    if content_length >= 0 {
        return Ok(vec![body.to_vec()]);
    }

    let mut segments: DecodedBody = vec![body.to_vec()];
    for encoding in transfer_encodings.iter().rev() {
        segments = match encoding.as_str() {
            "chunked" => {
                let mut unframed = Vec::new();
                for segment in &segments {
                    unframed.extend(decode_chunked(segment)?);
                }
                unframed
            }
            // Transfer codings other than chunked share the content-coding
            // transforms (TE gzip is byte-identical to CE gzip).
            other => segments
                .into_iter()
                .map(|segment| decode_segment(segment, other))
                .collect::<Result<_>>()?,
        };
    }

    for encoding in content_encodings.iter().rev() {
        segments = segments
            .into_iter()
            .map(|segment| decode_segment(segment, encoding))
            .collect::<Result<_>>()?;
    }

    Ok(segments)
}

/// Parses `<hex-size>\r\n<payload>\r\n` records into segments.
///
/// A size of zero terminates the stream; trailing headers after it are
/// ignored. A size line that is not valid hex, or a body that ends inside a
/// record, fails the whole response.
fn decode_chunked(body: &[u8]) -> Result<DecodedBody> {
    let mut segments = Vec::new();
    let mut pos = 0;
    loop {
        let rest = body.get(pos..).ok_or(DecodeError::TruncatedChunk)?;
        let line_end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(DecodeError::TruncatedChunk)?;
        let line = &rest[..line_end];
        let size_text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned()))?
            .trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| DecodeError::InvalidChunkSize(size_text.to_string()))?;
        pos += line_end + 2;
        if size == 0 {
            return Ok(segments);
        }
        let payload = body
            .get(pos..pos + size)
            .ok_or(DecodeError::TruncatedChunk)?;
        segments.push(payload.to_vec());
        // Skip the CRLF that closes the record.
        pos += size + 2;
    }
}

/// Undoes one content coding on one segment.
fn decode_segment(segment: Vec<u8>, encoding: &str) -> Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut decoded = Vec::new();
            flate2::read::MultiGzDecoder::new(segment.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|source| DecodeError::Inflate {
                    encoding: "gzip",
                    source,
                })?;
            Ok(decoded)
        }
        "deflate" => {
            let mut decoded = Vec::new();
            flate2::read::ZlibDecoder::new(segment.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|source| DecodeError::Inflate {
                    encoding: "deflate",
                    source,
                })?;
            Ok(decoded)
        }
        "identity" => Ok(segment),
        other => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}
