//! File Delivery Module
//!
//! Serves regular files out of the jail, either by streaming the bytes directly or by
//! handing the transfer back to the fronting proxy with `X-Accel-Redirect`.
//! Direct delivery honours `If-Modified-Since`, `If-Range` and single byte ranges.

use crate::path_translator::normalize_path;
use crate::{ProxyError, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Response, StatusCode};
use std::io::SeekFrom;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Body type of every response this service produces
pub type ResponseBody = BoxBody<Bytes, std::io::Error>;

/// Header naming the internal location the proxy should deliver
pub const ACCEL_REDIRECT_HEADER: &str = "x-accel-redirect";

const OCTET_STREAM: &str = "application/octet-stream";

pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Range header parsing result
#[derive(Debug, Clone, PartialEq)]
pub enum RangeParseResult {
    /// Exactly one satisfiable range
    SingleRange(ByteRange),
    /// More than one range; served as a full response
    MultipleRanges(Vec<ByteRange>),
    /// Well-formed but lies entirely beyond the end of the file
    Unsatisfiable,
    /// Malformed header; ignored
    Invalid(String),
}

/// Parse a `Range` header against a file of `content_length` bytes.
///
/// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. Ends past the file are
/// clamped to the last byte.
pub fn parse_range_header(range_header: &str, content_length: u64) -> RangeParseResult {
    let ranges_str = match range_header.trim().strip_prefix("bytes=") {
        Some(rest) => rest,
        None => {
            return RangeParseResult::Invalid("Range header must start with 'bytes='".to_string())
        }
    };

    let mut parsed = Vec::new();
    let mut unsatisfiable = 0usize;
    for spec in ranges_str.split(',').map(str::trim) {
        match parse_single_range(spec, content_length) {
            Ok(Some(range)) => parsed.push(range),
            Ok(None) => unsatisfiable += 1,
            Err(e) => {
                debug!("Range parse error '{}': {}", spec, e);
                return RangeParseResult::Invalid(e.to_string());
            }
        }
    }

    match parsed.len() {
        0 if unsatisfiable > 0 => RangeParseResult::Unsatisfiable,
        0 => RangeParseResult::Invalid("No range specifications found".to_string()),
        1 if unsatisfiable == 0 => RangeParseResult::SingleRange(parsed[0]),
        _ => RangeParseResult::MultipleRanges(parsed),
    }
}

/// `Ok(None)` means syntactically valid but outside the file
fn parse_single_range(spec: &str, content_length: u64) -> Result<Option<ByteRange>> {
    let (start_str, end_str) = spec.split_once('-').ok_or_else(|| {
        ProxyError::InvalidRange("Range specification must contain a dash".to_string())
    })?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    let parse = |s: &str, what: &str| {
        s.parse::<u64>()
            .map_err(|_| ProxyError::InvalidRange(format!("Invalid {} position '{}'", what, s)))
    };

    match (start_str.is_empty(), end_str.is_empty()) {
        (false, false) => {
            let start = parse(start_str, "start")?;
            let end = parse(end_str, "end")?;
            if start > end {
                return Err(ProxyError::InvalidRange(
                    "Start position cannot be greater than end position".to_string(),
                ));
            }
            if start >= content_length {
                return Ok(None);
            }
            Ok(Some(ByteRange {
                start,
                end: end.min(content_length - 1),
            }))
        }
        (false, true) => {
            let start = parse(start_str, "start")?;
            if start >= content_length {
                return Ok(None);
            }
            Ok(Some(ByteRange {
                start,
                end: content_length - 1,
            }))
        }
        (true, false) => {
            let suffix = parse(end_str, "suffix")?;
            if suffix == 0 || content_length == 0 {
                return Ok(None);
            }
            Ok(Some(ByteRange {
                start: content_length.saturating_sub(suffix),
                end: content_length - 1,
            }))
        }
        (true, true) => Err(ProxyError::InvalidRange(
            "Empty range specification".to_string(),
        )),
    }
}

/// Best-effort content type from the file extension, empty when unknown
pub fn guess_content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_default()
}

/// Response handing delivery of `relative_path` to the proxy
pub fn accel_redirect_response(
    accel_root: &str,
    relative_path: &str,
    local_path: &Path,
) -> Result<Response<ResponseBody>> {
    let location = normalize_path(&format!("{}/{}", accel_root, relative_path));
    debug!("X-Accel-Redirect {} -> {}", local_path.display(), location);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(ACCEL_REDIRECT_HEADER, location);
    let content_type = guess_content_type(local_path);
    if !content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(empty_body())
        .map_err(|e| ProxyError::HttpError(e.to_string()))
}

/// Whole seconds since the epoch; HTTP dates carry no finer precision
fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

/// True when the client's copy is current
fn not_modified(method: &Method, headers: &HeaderMap, modified: SystemTime) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return false;
    }
    match header_date(headers, header::IF_MODIFIED_SINCE) {
        Some(since) => unix_seconds(modified) <= unix_seconds(since),
        None => false,
    }
}

/// `If-Range` keeps the range only when it carries a date not older than the file.
/// No entity tags are issued, so any tag fails the precondition.
fn if_range_allows(headers: &HeaderMap, modified: SystemTime) -> bool {
    match headers.get(header::IF_RANGE) {
        None => true,
        Some(_) => match header_date(headers, header::IF_RANGE) {
            Some(date) => unix_seconds(modified) <= unix_seconds(date),
            None => false,
        },
    }
}

/// Stream a regular file honouring conditional and range headers
pub async fn serve_file(
    local_path: &Path,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response<ResponseBody>> {
    let metadata = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| ProxyError::NotFound(e.to_string()))?;
    let length = metadata.len();
    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);

    let content_type = match guess_content_type(local_path) {
        ct if ct.is_empty() => OCTET_STREAM.to_string(),
        ct => ct,
    };
    let last_modified = httpdate::fmt_http_date(modified);

    let base = || {
        Response::builder()
            .header(header::LAST_MODIFIED, last_modified.as_str())
            .header(header::ACCEPT_RANGES, "bytes")
    };

    if not_modified(method, headers, modified) {
        debug!("{} not modified", local_path.display());
        return base()
            .status(StatusCode::NOT_MODIFIED)
            .body(empty_body())
            .map_err(|e| ProxyError::HttpError(e.to_string()));
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if if_range_allows(headers, modified) => {
            match parse_range_header(value, length) {
                RangeParseResult::SingleRange(range) => Some(range),
                RangeParseResult::Unsatisfiable => {
                    debug!("Unsatisfiable range '{}' for {} bytes", value, length);
                    return base()
                        .status(StatusCode::RANGE_NOT_SATISFIABLE)
                        .header(header::CONTENT_RANGE, format!("bytes */{}", length))
                        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                        .body(full_body(format!("invalid range: {}", value)))
                        .map_err(|e| ProxyError::HttpError(e.to_string()));
                }
                RangeParseResult::MultipleRanges(_) | RangeParseResult::Invalid(_) => None,
            }
        }
        _ => None,
    };

    let (status, start, body_len) = match range {
        Some(range) => (StatusCode::PARTIAL_CONTENT, range.start, range.len()),
        None => (StatusCode::OK, 0, length),
    };

    let mut builder = base()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body_len);
    if let Some(range) = range {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, length),
        );
    }

    let body = if method == Method::HEAD {
        empty_body()
    } else {
        let mut file = tokio::fs::File::open(local_path).await?;
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        let stream = ReaderStream::new(file.take(body_len)).map_ok(Frame::data);
        BoxBody::new(StreamBody::new(stream))
    };

    builder
        .body(body)
        .map_err(|e| ProxyError::HttpError(e.to_string()))
}
