//! Value types exchanged between drivers and the bucket facade

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Default number of results per listing page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Content type used when none is known
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Attributes of a stored blob
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// Never empty for an existing blob
    pub content_type: String,
    /// User metadata; keys are lower-case
    pub metadata: BTreeMap<String, String>,
    pub create_time: Option<DateTime<Utc>>,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: u64,
    /// MD5 of the content, when the backend knows it
    pub md5: Option<Vec<u8>>,
    pub etag: String,
}

/// One listing entry.
///
/// Directory entries produced by a delimiter only carry `key` and `is_dir`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObject {
    pub key: String,
    pub mod_time: Option<DateTime<Utc>>,
    pub size: u64,
    pub md5: Option<Vec<u8>>,
    pub is_dir: bool,
}

impl ListObject {
    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            is_dir: true,
            ..Default::default()
        }
    }
}

/// One page of listing results in key order
#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ListObject>,
    /// Opaque token for the next page; `None` on the last page
    pub next_page_token: Option<String>,
}

/// Listing options
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Only keys starting with this prefix
    pub prefix: String,
    /// Collapse keys sharing everything up to the first delimiter after the
    /// prefix into one directory entry
    pub delimiter: String,
    /// Maximum results per page; `0` means [`DEFAULT_PAGE_SIZE`]
    pub page_size: usize,
    /// Token returned by the previous page
    pub page_token: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }

    /// Page size with the default applied
    pub fn effective_page_size(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// Options for writing a blob
#[derive(Clone, Debug, Default)]
pub struct WriterOptions {
    /// Upload chunk size; `0` lets the driver choose
    pub buffer_size: usize,
    /// Parallel chunk uploads; `0` lets the driver choose
    pub max_concurrency: usize,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// Content type; detected from the first bytes when empty
    pub content_type: Option<String>,
    /// Expected MD5 of the written bytes
    pub content_md5: Option<Vec<u8>>,
    pub metadata: BTreeMap<String, String>,
    /// Never sniff the content type; fall back to
    /// [`DEFAULT_CONTENT_TYPE`] instead
    pub disable_content_type_detection: bool,
}

impl WriterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_md5(mut self, md5: impl Into<Vec<u8>>) -> Self {
        self.content_md5 = Some(md5.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    pub fn with_content_disposition(mut self, value: impl Into<String>) -> Self {
        self.content_disposition = Some(value.into());
        self
    }
}

/// Attributes available as soon as a reader is opened
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaderAttributes {
    pub content_type: String,
    pub mod_time: Option<DateTime<Utc>>,
    /// Size of the whole blob, not of the requested range
    pub size: u64,
}
