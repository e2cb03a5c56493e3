//! Higher-level helpers for applications storing user files

use crate::sniff::detect_content_type;
use crate::Bucket;
use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use blobfs_driver::{
    BlobError, ListObject, ListOptions, Result, WriterOptions, DEFAULT_CONTENT_TYPE,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

/// Served inline; everything else is a download
const INLINE_CONTENT_TYPES: &[&str] = &[
    "image/png",
    "image/jpg",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "image/x-icon",
    "image/bmp",
    "video/webm",
    "video/mp4",
    "video/3gpp",
    "video/quicktime",
    "video/x-ms-wmv",
    "audio/basic",
    "audio/aiff",
    "audio/mpeg",
    "audio/midi",
    "audio/mp3",
    "audio/wave",
    "audio/wav",
    "audio/x-wav",
    "audio/x-mpeg",
    "audio/x-m4a",
    "audio/aac",
    "application/pdf",
    "application/x-pdf",
];

/// Types sniffed wrongly as plain text, keyed by extension
const EXTENSION_CONTENT_TYPES: &[(&str, &str)] = &[
    ("svg", "image/svg+xml"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("mjs", "text/javascript"),
];

pub const SERVE_CSP: &str = "default-src 'none'; media-src 'self'; style-src 'unsafe-inline'; sandbox";
pub const SERVE_CACHE_CONTROL: &str = "max-age=2592000, stale-while-revalidate=86400";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parsed `Range` header against a blob of known size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Only single ranges are honored; anything else serves the full blob
fn parse_range(value: Option<&str>, size: u64) -> ByteRange {
    let Some(ranges) = value.and_then(|v| v.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return match end.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if size == 0 => ByteRange::Unsatisfiable,
            Ok(suffix) => ByteRange::Partial {
                start: size.saturating_sub(suffix),
                end: size - 1,
            },
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => Some(end),
            _ => return ByteRange::Full,
        }
    };

    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
        start,
        end: end.map_or(size - 1, |e| e.min(size - 1)),
    }
}

fn extension(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    file.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

fn content_disposition(disposition: &str, name: &str) -> String {
    if name.is_ascii() && !name.chars().any(char::is_control) {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{}; filename=\"{}\"", disposition, escaped)
    } else {
        format!(
            "{}; filename*=UTF-8''{}",
            disposition,
            urlencoding::encode(name)
        )
    }
}

fn http_date(time: DateTime<Utc>) -> String {
    time.format(HTTP_DATE_FORMAT).to_string()
}

impl Bucket {
    /// Store `data` at `key` with a detected content type
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload(&self, data: &[u8], key: &str) -> Result<()> {
        let sniffed = detect_content_type(data);
        // Sniffing can't tell text formats apart; the extension can
        let content_type = if sniffed.starts_with("text/plain") || sniffed == DEFAULT_CONTENT_TYPE {
            mime_guess::from_path(key).first_raw().unwrap_or(sniffed)
        } else {
            sniffed
        };

        let opts = WriterOptions::default().with_content_type(content_type);
        self.write_all(key, data, opts).await
    }

    /// Every object whose key starts with `prefix`
    pub async fn list_all(&self, prefix: &str) -> Result<Vec<ListObject>> {
        self.list(ListOptions::new().with_prefix(prefix))
            .collect()
            .await
    }

    /// Whether `dir` holds no objects
    pub async fn is_empty_dir(&self, dir: &str) -> Result<bool> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let (objects, _) = self
            .list_page(None, 1, ListOptions::new().with_prefix(prefix).with_delimiter("/"))
            .await?;
        Ok(objects.is_empty())
    }

    /// Delete every object whose key starts with `prefix`.
    ///
    /// Returns the failures; an empty list means everything was deleted.
    /// When `prefix` ends with `/`, directories emptied by the deletion
    /// are removed too, deepest first.
    #[instrument(skip(self))]
    pub async fn delete_prefix(&self, prefix: &str) -> Vec<BlobError> {
        if prefix.is_empty() {
            return vec![BlobError::Validation("prefix must not be empty".into())];
        }

        let mut failures = Vec::new();
        let mut dirs = BTreeSet::new();
        let mut iter = self.list(ListOptions::new().with_prefix(prefix));
        loop {
            let obj = match iter.next().await {
                Ok(Some(obj)) => obj,
                Ok(None) => break,
                Err(err) => {
                    failures.push(err);
                    break;
                }
            };

            if let Err(err) = self.delete(&obj.key).await {
                failures.push(err);
                continue;
            }

            if prefix.ends_with('/') {
                let mut parent = obj.key.as_str();
                while let Some((dir, _)) = parent.rsplit_once('/') {
                    if dir.len() + 1 < prefix.len() || dir.is_empty() {
                        break;
                    }
                    dirs.insert(dir.to_string());
                    parent = dir;
                }
            }
        }

        if failures.is_empty() {
            let mut dirs: Vec<String> = dirs.into_iter().collect();
            dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
            for dir in dirs {
                // Only empty directories can be removed; other drivers
                // report them as missing
                if let Err(err) = self.delete(&dir).await {
                    debug!(%dir, error = %err, "directory not removed");
                }
            }
        }

        failures
    }

    /// HTTP response streaming the blob at `key`.
    ///
    /// `download_name` names the file in `Content-Disposition`; `range` is
    /// the request's `Range` header. Images, audio, video and PDFs are
    /// served inline unless `force_attachment` is set.
    #[instrument(skip(self))]
    pub async fn serve(
        &self,
        key: &str,
        download_name: &str,
        range: Option<&str>,
        force_attachment: bool,
    ) -> Result<Response<Body>> {
        let attrs = self.attributes(key).await?;

        let name = if download_name.is_empty() {
            key.rsplit('/').next().unwrap_or(key)
        } else {
            download_name
        };
        let content_type = extension(name)
            .and_then(|ext| {
                EXTENSION_CONTENT_TYPES
                    .iter()
                    .find(|(e, _)| *e == ext)
                    .map(|(_, ct)| *ct)
            })
            .unwrap_or(attrs.content_type.as_str());
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        let disposition = if !force_attachment && INLINE_CONTENT_TYPES.contains(&essence) {
            "inline"
        } else {
            "attachment"
        };

        let mut builder = Response::builder()
            .header(header::CONTENT_TYPE, header_value(content_type)?)
            .header(
                header::CONTENT_DISPOSITION,
                header_value(&content_disposition(disposition, name))?,
            )
            .header(header::CONTENT_SECURITY_POLICY, SERVE_CSP)
            .header(
                header::CACHE_CONTROL,
                header_value(attrs.cache_control.as_deref().unwrap_or(SERVE_CACHE_CONTROL))?,
            )
            .header(header::ACCEPT_RANGES, "bytes");
        if let Some(mod_time) = attrs.mod_time {
            builder = builder.header(header::LAST_MODIFIED, header_value(&http_date(mod_time))?);
        }
        if !attrs.etag.is_empty() {
            builder = builder.header(header::ETAG, header_value(&attrs.etag)?);
        }

        let (status, offset, length) = match parse_range(range, attrs.size) {
            ByteRange::Full => (StatusCode::OK, 0, attrs.size),
            ByteRange::Partial { start, end } => {
                builder = builder.header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, attrs.size),
                );
                (StatusCode::PARTIAL_CONTENT, start, end - start + 1)
            }
            ByteRange::Unsatisfiable => {
                return builder
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", attrs.size))
                    .body(Body::empty())
                    .map_err(|e| BlobError::Validation(e.to_string()));
            }
        };

        let reader = self
            .new_range_reader(key, offset as i64, length as i64)
            .await?;
        builder
            .status(status)
            .header(header::CONTENT_LENGTH, length)
            .body(Body::from_stream(ReaderStream::new(reader)))
            .map_err(|e| BlobError::Validation(e.to_string()))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| BlobError::Validation(format!("header value {:?}: {}", value, e)))
}
