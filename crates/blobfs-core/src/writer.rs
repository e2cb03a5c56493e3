//! Blob writer with content type sniffing and MD5 verification

use crate::sniff::{detect_content_type, SNIFF_LEN};
use blobfs_driver::{BlobError, Driver, DriverWriter, Result, WriterOptions, DEFAULT_CONTENT_TYPE};
use md5::{Digest, Md5};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

const READ_FROM_BUFFER_SIZE: usize = 32 * 1024;

enum State {
    /// Content type still unknown; holds the bytes to sniff
    Buffering(Vec<u8>),
    Open(Box<dyn DriverWriter>),
    Closed,
}

/// Writes one blob.
///
/// Nothing is stored until [`Writer::close`] succeeds. Dropping a writer
/// without closing it discards everything written.
pub struct Writer {
    driver: Arc<dyn Driver>,
    key: String,
    opts: WriterOptions,
    state: State,
    hasher: Md5,
}

impl Writer {
    pub(crate) async fn open(driver: Arc<dyn Driver>, key: &str, opts: WriterOptions) -> Result<Self> {
        let mut opts = opts;
        opts.metadata = normalize_metadata(opts.metadata)?;
        opts.content_type = match opts.content_type.take() {
            Some(ct) if !ct.is_empty() => Some(normalize_content_type(&ct)?),
            _ if opts.disable_content_type_detection => Some(DEFAULT_CONTENT_TYPE.to_string()),
            _ => None,
        };

        let mut writer = Self {
            driver,
            key: key.to_string(),
            opts,
            state: State::Buffering(Vec::new()),
            hasher: Md5::new(),
        };
        if let Some(content_type) = writer.opts.content_type.clone() {
            let opened = writer.open_driver(&content_type, &[]).await?;
            writer.state = State::Open(opened);
        }
        Ok(writer)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append `buf` to the blob. On error none of `buf` is taken.
    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Closed => return Err(BlobError::Closed),
            State::Open(writer) => writer
                .write(buf)
                .await
                .map_err(|e| self.driver.normalize_error(e).with_key(&self.key))?,
            State::Buffering(pending) => {
                let held = pending.len();
                pending.extend_from_slice(buf);
                if pending.len() >= SNIFF_LEN {
                    if let Err(err) = self.open_pending().await {
                        if let State::Buffering(pending) = &mut self.state {
                            pending.truncate(held);
                        }
                        return Err(err);
                    }
                }
            }
        }
        self.hasher.update(buf);
        Ok(())
    }

    /// Copy everything from `reader` into the blob. Returns the number of
    /// bytes copied; the writer stays open.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; READ_FROM_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Commit the blob.
    ///
    /// With `content_md5` set, the digest of everything written must
    /// match; otherwise the write is discarded and
    /// [`BlobError::Integrity`] returned.
    pub async fn close(&mut self) -> Result<()> {
        if matches!(self.state, State::Buffering(_)) {
            self.open_pending().await?;
        }

        let mut writer = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(writer) => writer,
            _ => return Err(BlobError::Closed),
        };

        let actual = std::mem::take(&mut self.hasher).finalize().to_vec();
        if let Some(expected) = &self.opts.content_md5 {
            if *expected != actual {
                if let Err(err) = writer.abort().await {
                    warn!(key = %self.key, error = %err, "failed to abort write");
                }
                return Err(BlobError::Integrity {
                    expected: hex::encode(expected),
                    actual: hex::encode(&actual),
                });
            }
        }

        writer
            .close()
            .await
            .map_err(|e| self.driver.normalize_error(e).with_key(&self.key))?;
        debug!(key = %self.key, "blob written");
        Ok(())
    }

    /// Sniff the buffered bytes and hand them to a driver writer. They stay
    /// buffered if that fails.
    async fn open_pending(&mut self) -> Result<()> {
        let State::Buffering(pending) = &mut self.state else {
            return Ok(());
        };
        let pending = std::mem::take(pending);
        let content_type = detect_content_type(&pending);
        match self.open_driver(content_type, &pending).await {
            Ok(writer) => {
                self.state = State::Open(writer);
                Ok(())
            }
            Err(err) => {
                self.state = State::Buffering(pending);
                Err(err)
            }
        }
    }

    async fn open_driver(
        &mut self,
        content_type: &str,
        pending: &[u8],
    ) -> Result<Box<dyn DriverWriter>> {
        let mut writer = self
            .driver
            .new_typed_writer(&self.key, content_type, &self.opts)
            .await
            .map_err(|e| self.driver.normalize_error(e).with_key(&self.key))?;
        if !pending.is_empty() {
            writer
                .write(pending)
                .await
                .map_err(|e| self.driver.normalize_error(e).with_key(&self.key))?;
        }
        Ok(writer)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !matches!(self.state, State::Closed) {
            warn!(key = %self.key, "writer dropped without close; discarding write");
        }
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Buffering(_) => "buffering",
            State::Open(_) => "open",
            State::Closed => "closed",
        };
        f.debug_struct("Writer")
            .field("key", &self.key)
            .field("state", &state)
            .finish_non_exhaustive()
    }
}

/// Lower-case metadata keys, rejecting empty keys and keys that collide
fn normalize_metadata(metadata: BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(BlobError::Validation("metadata key must not be empty".into()));
        }
        let lower = key.to_lowercase();
        if out.insert(lower, value).is_some() {
            return Err(BlobError::Validation(format!(
                "duplicate case-insensitive metadata key {:?}",
                key
            )));
        }
    }
    Ok(out)
}

/// Parse a content type and print it in canonical form
fn normalize_content_type(content_type: &str) -> Result<String> {
    let parsed: mime::Mime = content_type.parse().map_err(|e| {
        BlobError::Validation(format!("invalid content type {:?}: {}", content_type, e))
    })?;
    let mut out = parsed.essence_str().to_string();
    for (name, value) in parsed.params() {
        out.push_str(&format!("; {}={}", name, quote_param(value.as_str())));
    }
    Ok(out)
}

/// A parameter value as a token, or quoted when it isn't one
fn quote_param(value: &str) -> Cow<'_, str> {
    let is_token = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?=".contains(&b));
    if is_token {
        return Cow::Borrowed(value);
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}
