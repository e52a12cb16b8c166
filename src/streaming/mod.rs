//! Byte-range file streaming for library videos.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Read buffer for streamed bodies.
const STREAM_CHUNK: usize = 64 * 1024;

const VIDEO_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("webm", "video/webm"),
    ("ogg", "video/ogg"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("wmv", "video/x-ms-wmv"),
    ("flv", "video/x-flv"),
    ("mpg", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("3gp", "video/3gpp"),
    ("ts", "video/mp2t"),
    ("m2ts", "video/mp2t"),
];

/// An inclusive byte range inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed range header")]
    Malformed,
    #[error("range not satisfiable for {size} bytes")]
    Unsatisfiable { size: u64 },
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("path escapes the library root")]
    Forbidden,
    #[error("file not found")]
    NotFound,
    #[error("not a regular file")]
    NotAFile,
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
}

/// Parse a single-range `Range` header against a file of `size` bytes.
///
/// Accepts `bytes=S-E`, `bytes=S-` and the suffix form `bytes=-N`. Ranges that
/// start or end past the file, and multi-range requests, are unsatisfiable.
///
/// # Errors
///
/// [`RangeError::Malformed`] when the header cannot be parsed,
/// [`RangeError::Unsatisfiable`] when it does not fit the file.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, RangeError> {
    let ranges = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?
        .trim();
    if ranges.contains(',') {
        return Err(RangeError::Unsatisfiable { size });
    }
    let (start, end) = ranges.split_once('-').ok_or(RangeError::Malformed)?;
    let parse = |s: &str| s.trim().parse::<u64>().map_err(|_| RangeError::Malformed);

    let range = match (start.trim(), end.trim()) {
        ("", "") => return Err(RangeError::Malformed),
        ("", suffix) => {
            let n = parse(suffix)?;
            if n == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable { size });
            }
            ByteRange {
                start: size.saturating_sub(n),
                end: size - 1,
            }
        }
        (start, "") => ByteRange {
            start: parse(start)?,
            end: size.saturating_sub(1),
        },
        (start, end) => ByteRange {
            start: parse(start)?,
            end: parse(end)?,
        },
    };

    if range.start >= size || range.end >= size || range.start > range.end {
        return Err(RangeError::Unsatisfiable { size });
    }
    Ok(range)
}

/// Content type by extension, falling back to `mime_guess` and then MP4.
#[must_use]
pub fn content_type(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if let Some((_, mime)) = VIDEO_TYPES.iter().find(|(e, _)| *e == ext) {
        return (*mime).to_string();
    }
    mime_guess::from_path(path)
        .first()
        .map_or_else(|| "video/mp4".to_string(), |m| m.to_string())
}

/// Resolve `relative` inside `root`, refusing anything that lands outside it.
///
/// # Errors
///
/// [`StreamError::Forbidden`] for `..`, absolute paths, or symlinks leading
/// out of the root; [`StreamError::NotFound`] when the file does not exist.
pub async fn resolve_in_library(root: &Path, relative: &str) -> Result<PathBuf, StreamError> {
    let relative = Path::new(relative.trim_start_matches(['/', '\\']));
    if relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(StreamError::Forbidden);
    }

    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|_| StreamError::NotFound)?;
    let full = tokio::fs::canonicalize(root.join(relative))
        .await
        .map_err(|_| StreamError::NotFound)?;
    if !full.starts_with(&root) {
        return Err(StreamError::Forbidden);
    }
    Ok(full)
}

/// Stream `path`, honouring an optional `Range` header.
///
/// # Errors
///
/// Returns a [`StreamError`] for missing files, directories, and bad ranges.
pub async fn serve_file(path: &Path, range: Option<&str>) -> Result<Response, StreamError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StreamError::NotFound),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Err(StreamError::NotAFile);
    }
    let size = metadata.len();
    let mime = content_type(path);
    let mut file = tokio::fs::File::open(path).await?;

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes");

    let Some(range) = range else {
        debug!(path = %path.display(), size, "Streaming full file");
        let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_CHUNK));
        return Ok(builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size.to_string())
            .body(body)
            .map_err(std::io::Error::other)?);
    };

    let range = parse_range(range, size)?;
    file.seek(SeekFrom::Start(range.start)).await?;
    debug!(path = %path.display(), start = range.start, end = range.end, size, "Streaming range");

    let body = Body::from_stream(ReaderStream::with_capacity(file.take(range.length()), STREAM_CHUNK));
    Ok(builder
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_LENGTH, range.length().to_string())
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, size),
        )
        .body(body)
        .map_err(std::io::Error::other)?)
}

/// `Content-Range` value for a 416 response.
#[must_use]
pub fn unsatisfied_range(size: u64) -> HeaderValue {
    HeaderValue::from_str(&format!("bytes */{size}")).unwrap_or(HeaderValue::from_static("bytes */0"))
}
