use std::io::Read;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use hyper::{
    HeaderMap,
    header::{CONTENT_ENCODING, HeaderValue},
};
use thiserror::Error;

pub const ORIGIN_CONTENT_ENCODING: &str = "x-passeur-origin-content-encoding";
pub const ORIGIN_CONTENT_LENGTH: &str = "x-passeur-origin-content-length";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed {encoding} body: {source}")]
    Malformed {
        encoding: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Gzip,
    Deflate,
    Brotli,
}

impl Encoding {
    fn name(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Brotli => "br",
        }
    }

    fn detect(header: &str) -> Option<Self> {
        let tokens: Vec<String> = header.split(',').map(|t| t.trim().to_ascii_lowercase()).collect();
        let has = |name: &str| tokens.iter().any(|t| t == name);
        if has("gzip") || has("x-gzip") {
            Some(Encoding::Gzip)
        } else if has("deflate") {
            Some(Encoding::Deflate)
        } else if has("br") {
            Some(Encoding::Brotli)
        } else {
            None
        }
    }

    fn decode(self, body: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut decoded = Vec::new();
        let result = match self {
            Encoding::Gzip => GzDecoder::new(body).read_to_end(&mut decoded),
            Encoding::Deflate => ZlibDecoder::new(body).read_to_end(&mut decoded),
            Encoding::Brotli => brotli::Decompressor::new(body, 4096).read_to_end(&mut decoded),
        };
        result.map_err(|source| DecodeError::Malformed {
            encoding: self.name(),
            source,
        })?;
        Ok(decoded)
    }
}

/// Decodes a fully buffered upstream body and rewrites `headers` to match.
///
/// The raw length is always recorded in `x-passeur-origin-content-length`.
/// When a known encoding is removed, its original value moves to
/// `x-passeur-origin-content-encoding`. Empty bodies and unknown encodings
/// are returned untouched.
pub fn decode_body(headers: &mut HeaderMap, body: Bytes) -> Result<Bytes, DecodeError> {
    headers.insert(ORIGIN_CONTENT_LENGTH, HeaderValue::from(body.len()));

    let Some(original) = headers.get(CONTENT_ENCODING).cloned() else {
        return Ok(body);
    };
    let Some(encoding) = original.to_str().ok().and_then(Encoding::detect) else {
        return Ok(body);
    };
    if body.is_empty() {
        return Ok(body);
    }

    headers.remove(CONTENT_ENCODING);
    headers.insert(ORIGIN_CONTENT_ENCODING, original);
    Ok(Bytes::from(encoding.decode(&body)?))
}
