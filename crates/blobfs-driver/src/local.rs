//! Local filesystem driver.
//!
//! Every blob is a file at its escaped key below the root directory.
//! Attributes the filesystem can't hold live next to it in a JSON sidecar
//! named `<file>.attrs`. Writes go to a temp file first and are renamed
//! into place on close, so readers never see a partial blob.

use crate::escape::{hex_escape, hex_unescape, is_dot_segment_end};
use crate::{
    Attributes, BlobError, Driver, DriverReader, DriverWriter, ListObject, ListOptions,
    ListPage, ReaderAttributes, Result, WriterOptions, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Extension of attribute sidecar files
pub const ATTRS_EXT: &str = ".attrs";

/// Name prefix of in-progress writes
pub const TEMP_PREFIX: &str = ".blobfs-tmp-";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Where blob attributes are kept
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MetadataMode {
    /// JSON sidecar next to each blob
    #[default]
    Sidecar,
    /// Don't store attributes; content type always reads as
    /// `application/octet-stream`
    Skip,
}

/// Options for [`LocalDriver::open`]
#[derive(Clone, Debug)]
pub struct LocalOptions {
    pub metadata: MetadataMode,
    /// Create the root directory when it doesn't exist
    pub create_dir: bool,
    /// Keep temp files next to the destination instead of the system temp
    /// directory. Use this when the temp directory is on another filesystem.
    pub no_temp_dir: bool,
    /// Permission bits for created directories (Unix only)
    pub dir_mode: u32,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            metadata: MetadataMode::Sidecar,
            create_dir: false,
            no_temp_dir: false,
            dir_mode: 0o777,
        }
    }
}

impl LocalOptions {
    pub fn with_metadata(mut self, mode: MetadataMode) -> Self {
        self.metadata = mode;
        self
    }

    pub fn with_create_dir(mut self, create: bool) -> Self {
        self.create_dir = create;
        self
    }

    pub fn with_no_temp_dir(mut self, no_temp_dir: bool) -> Self {
        self.no_temp_dir = no_temp_dir;
        self
    }

    pub fn with_dir_mode(mut self, mode: u32) -> Self {
        self.dir_mode = mode;
        self
    }
}

/// Escape `key` into a relative path below the root.
///
/// Escaped are control characters, a native separator other than `/`,
/// leading, trailing and repeated slashes, a slash after `..`, and the
/// dots of `.` and `..` segments, so every key maps to a distinct file
/// inside the root.
pub fn escape_key(key: &str) -> Cow<'_, str> {
    hex_escape(key, |chars, i| {
        let c = chars[i];
        if (c as u32) < 32 {
            return true;
        }
        if std::path::MAIN_SEPARATOR != '/' && c == std::path::MAIN_SEPARATOR {
            return true;
        }
        if c == '/' {
            if i == 0 || i == chars.len() - 1 || chars[i - 1] == '/' {
                return true;
            }
            if i >= 2 && chars[i - 1] == '.' && chars[i - 2] == '.' {
                return true;
            }
        }
        if is_dot_segment_end(chars, i) {
            return true;
        }
        cfg!(windows) && matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*')
    })
}

/// Reverse [`escape_key`]
pub fn unescape_key(path: &str) -> Cow<'_, str> {
    hex_unescape(path)
}

/// Attributes stored in the sidecar file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct XAttrs {
    #[serde(rename = "user.cache_control", default)]
    cache_control: String,
    #[serde(rename = "user.content_disposition", default)]
    content_disposition: String,
    #[serde(rename = "user.content_encoding", default)]
    content_encoding: String,
    #[serde(rename = "user.content_language", default)]
    content_language: String,
    #[serde(rename = "user.content_type", default)]
    content_type: String,
    #[serde(rename = "user.metadata", default)]
    metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
}

impl XAttrs {
    fn content_type(&self) -> String {
        if self.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            self.content_type.clone()
        }
    }

    fn md5(&self) -> Option<Vec<u8>> {
        self.md5.as_deref().and_then(|m| BASE64.decode(m).ok())
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Driver storing blobs as files below a root directory
#[derive(Clone, Debug)]
pub struct LocalDriver {
    root: PathBuf,
    opts: LocalOptions,
}

impl LocalDriver {
    /// Open the driver on `dir`, which must be a directory
    pub fn open(dir: impl AsRef<Path>, opts: LocalOptions) -> Result<Self> {
        let dir = dir.as_ref();
        if opts.create_dir {
            create_dirs(dir, opts.dir_mode)?;
        }

        let meta = std::fs::metadata(dir)?;
        if !meta.is_dir() {
            return Err(BlobError::Validation(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let root = std::fs::canonicalize(dir)?;
        debug!(root = %root.display(), "opened local driver");
        Ok(Self { root, opts })
    }

    /// The canonical root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(BlobError::Validation("key must not be empty".into()));
        }
        if self.opts.metadata == MetadataMode::Sidecar && key.ends_with(ATTRS_EXT) {
            return Err(BlobError::Validation(format!(
                "key {:?} ends in reserved extension {}",
                key, ATTRS_EXT
            )));
        }

        let escaped = escape_key(key);
        let name = escaped.rsplit('/').next().unwrap_or(&escaped);
        if name.starts_with(TEMP_PREFIX) {
            return Err(BlobError::Validation(format!(
                "key {:?} uses reserved prefix {}",
                key, TEMP_PREFIX
            )));
        }
        Ok(self.root.join(escaped.as_ref()))
    }
}

#[async_trait]
impl Driver for LocalDriver {
    #[instrument(skip(self))]
    async fn attributes(&self, key: &str) -> Result<Attributes> {
        let path = self.path_for(key)?;
        let mode = self.opts.metadata;
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Attributes> {
            let meta = std::fs::metadata(&path)?;
            if meta.is_dir() {
                return Err(BlobError::not_found(key));
            }
            let xa = load_attrs(&path, mode)?;
            Ok(Attributes {
                md5: xa.md5(),
                content_type: xa.content_type(),
                cache_control: non_empty(xa.cache_control),
                content_disposition: non_empty(xa.content_disposition),
                content_encoding: non_empty(xa.content_encoding),
                content_language: non_empty(xa.content_language),
                metadata: xa.metadata,
                create_time: meta.created().ok().map(DateTime::<Utc>::from),
                mod_time: meta.modified().ok().map(DateTime::<Utc>::from),
                size: meta.len(),
                etag: etag(&meta),
            })
        })
        .await?
    }

    #[instrument(skip(self))]
    async fn list_paged(&self, opts: &ListOptions) -> Result<ListPage> {
        let root = self.root.clone();
        let opts = opts.clone();
        let mode = self.opts.metadata;
        tokio::task::spawn_blocking(move || list_blocking(&root, &opts, mode)).await?
    }

    #[instrument(skip(self))]
    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DriverReader> {
        let path = self.path_for(key)?;
        let mode = self.opts.metadata;
        let key = key.to_string();

        let (file, attributes) = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let meta = file.metadata()?;
            if meta.is_dir() {
                return Err(BlobError::not_found(key));
            }
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }
            let xa = load_attrs(&path, mode)?;
            let attributes = ReaderAttributes {
                content_type: xa.content_type(),
                mod_time: meta.modified().ok().map(DateTime::<Utc>::from),
                size: meta.len(),
            };
            Ok::<_, BlobError>((file, attributes))
        })
        .await??;

        let file = tokio::fs::File::from_std(file);
        let body: Pin<Box<dyn AsyncRead + Send>> = match length {
            Some(length) => Box::pin(file.take(length)),
            None => Box::pin(file),
        };
        Ok(DriverReader { attributes, body })
    }

    #[instrument(skip(self, opts))]
    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>> {
        let path = self.path_for(key)?;
        let parent = parent_dir(&path).to_path_buf();
        let temp_dir = if self.opts.no_temp_dir {
            parent.clone()
        } else {
            std::env::temp_dir()
        };
        let dir_mode = self.opts.dir_mode;

        let (file, temp) = tokio::task::spawn_blocking(move || {
            create_dirs(&parent, dir_mode)?;
            create_temp(&temp_dir)
        })
        .await??;

        let attrs = match self.opts.metadata {
            MetadataMode::Sidecar => Some(XAttrs {
                cache_control: opts.cache_control.clone().unwrap_or_default(),
                content_disposition: opts.content_disposition.clone().unwrap_or_default(),
                content_encoding: opts.content_encoding.clone().unwrap_or_default(),
                content_language: opts.content_language.clone().unwrap_or_default(),
                content_type: content_type.to_string(),
                metadata: opts.metadata.clone(),
                md5: None,
            }),
            MetadataMode::Skip => None,
        };

        Ok(Box::new(LocalWriter {
            file: Some(tokio::fs::File::from_std(file)),
            temp: Some(temp),
            path,
            hasher: Md5::new(),
            size: 0,
            attrs,
            expected_md5: opts.content_md5.clone(),
            dir_mode,
        }))
    }

    #[instrument(skip(self))]
    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        let attrs = self.attributes(src).await?;
        let mut reader = self.new_range_reader(src, 0, None).await?;

        let opts = WriterOptions {
            cache_control: attrs.cache_control,
            content_disposition: attrs.content_disposition,
            content_encoding: attrs.content_encoding,
            content_language: attrs.content_language,
            metadata: attrs.metadata,
            ..Default::default()
        };
        let mut writer = self
            .new_typed_writer(dst, &attrs.content_type, &opts)
            .await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = reader.body.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(&buf[..n]).await?;
        }
        writer.close().await
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let mode = self.opts.metadata;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let meta = std::fs::metadata(&path)?;
            if meta.is_dir() {
                std::fs::remove_dir(&path)?;
                return Ok(());
            }

            std::fs::remove_file(&path)?;
            if mode == MetadataMode::Sidecar {
                match std::fs::remove_file(sidecar_path(&path)) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
            }
            Ok(())
        })
        .await?
    }

    fn normalize_error(&self, err: BlobError) -> BlobError {
        match err {
            BlobError::Io(e) if e.kind() == io::ErrorKind::NotFound => BlobError::NotFound {
                key: String::new(),
                source: Some(Box::new(BlobError::Io(e))),
            },
            other => other,
        }
    }
}

/// Pending write. Dropping it before `close` removes the temp file.
struct LocalWriter {
    file: Option<tokio::fs::File>,
    temp: Option<TempPath>,
    path: PathBuf,
    hasher: Md5,
    size: u64,
    attrs: Option<XAttrs>,
    expected_md5: Option<Vec<u8>>,
    dir_mode: u32,
}

#[async_trait]
impl DriverWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(BlobError::Closed)?;
        file.write_all(buf).await?;
        self.hasher.update(buf);
        self.size += buf.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self.file.take().ok_or(BlobError::Closed)?;
        let temp = self.temp.take().ok_or(BlobError::Closed)?;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let md5 = std::mem::take(&mut self.hasher).finalize().to_vec();
        if let Some(expected) = &self.expected_md5 {
            if *expected != md5 {
                return Err(BlobError::Integrity {
                    expected: hex::encode(expected),
                    actual: hex::encode(&md5),
                });
            }
        }

        let attrs = self.attrs.take().map(|mut attrs| {
            attrs.md5 = Some(BASE64.encode(&md5));
            attrs
        });
        let path = self.path.clone();
        let dir_mode = self.dir_mode;
        let size = self.size;

        tokio::task::spawn_blocking(move || commit(temp, &path, attrs.as_ref(), dir_mode))
            .await??;
        debug!(path = %self.path.display(), size, "committed blob");
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.file = None;
        if let Some(temp) = self.temp.take() {
            tokio::task::spawn_blocking(move || temp.close()).await??;
        }
        Ok(())
    }
}

/// Move a finished write into place: data first, then its sidecar. When
/// the sidecar can't be placed the previous data is put back.
fn commit(temp: TempPath, path: &Path, attrs: Option<&XAttrs>, dir_mode: u32) -> Result<()> {
    let dir = parent_dir(path);
    create_dirs(dir, dir_mode)?;

    let Some(attrs) = attrs else {
        return Ok(persist(temp, path)?);
    };
    let (mut file, sidecar) = create_temp(dir)?;
    serde_json::to_writer(&mut file, attrs)?;
    file.sync_all()?;

    let backup = set_aside(path)?;
    persist(temp, path)?;
    if let Err(err) = persist(sidecar, &sidecar_path(path)) {
        restore(backup, path);
        return Err(err.into());
    }
    Ok(())
}

/// Link the current data at `path` under a temp name, if there is any
fn set_aside(path: &Path) -> io::Result<Option<TempPath>> {
    let (file, backup) = create_temp(parent_dir(path))?;
    drop(file);
    std::fs::remove_file(&backup)?;
    match std::fs::hard_link(path, &backup) {
        Ok(()) => Ok(Some(backup)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "hard link failed, copying");
            std::fs::copy(path, &backup)?;
            Ok(Some(backup))
        }
    }
}

fn restore(backup: Option<TempPath>, path: &Path) {
    let restored = match backup {
        Some(backup) => backup.persist(path).map_err(|e| e.error),
        None => std::fs::remove_file(path),
    };
    if let Err(err) = restored {
        warn!(path = %path.display(), error = %err, "failed to restore previous blob");
    }
}

/// Rename `temp` to `dst`. When that fails (typically across
/// filesystems) copy into a temp file next to `dst` and rename that.
fn persist(temp: TempPath, dst: &Path) -> io::Result<()> {
    let temp = match temp.persist(dst) {
        Ok(()) => return Ok(()),
        Err(err) => {
            debug!(dst = %dst.display(), error = %err.error, "rename failed, copying");
            err.path
        }
    };

    let (file, sibling) = create_temp(parent_dir(dst))?;
    std::fs::copy(&temp, &sibling)?;
    file.sync_all()?;
    sibling.persist(dst).map_err(|e| e.error)
}

fn create_temp(dir: &Path) -> io::Result<(std::fs::File, TempPath)> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(&format!("{}.tmp", nanos))
        .tempfile_in(dir)?;
    Ok(temp.into_parts())
}

fn create_dirs(dir: &Path, mode: u32) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(ATTRS_EXT);
    PathBuf::from(name)
}

fn load_attrs(path: &Path, mode: MetadataMode) -> Result<XAttrs> {
    if mode == MetadataMode::Skip {
        return Ok(XAttrs::default());
    }
    match std::fs::read(sidecar_path(path)) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(XAttrs::default()),
        Err(e) => Err(e.into()),
    }
}

fn etag(meta: &Metadata) -> String {
    let nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("\"{:x}-{:x}\"", nanos, meta.len())
}

/// Relative path below the root as a `/`-separated string
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(unescape_key(&parts.join("/")).into_owned())
}

/// Where `key` collapses to under `delimiter`, if it does
fn collapse<'a>(key: &'a str, prefix: &str, delimiter: &str) -> Option<&'a str> {
    if delimiter.is_empty() {
        return None;
    }
    let rest = key.get(prefix.len()..)?;
    rest.find(delimiter)
        .map(|idx| &key[..prefix.len() + idx + delimiter.len()])
}

fn list_blocking(root: &Path, opts: &ListOptions, mode: MetadataMode) -> Result<ListPage> {
    let prefix = opts.prefix.as_str();
    let mut objects = Vec::new();
    let mut collapsed: HashSet<String> = HashSet::new();

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(err) => return Err(io::Error::from(err).into()),
        };
        let Some(key) = relative_key(root, entry.path()) else {
            continue;
        };

        if entry.file_type().is_dir() {
            let dir_key = format!("{}/", key);
            let can_match = dir_key.starts_with(prefix) || prefix.starts_with(&dir_key);
            let already_collapsed = dir_key.starts_with(prefix)
                && collapse(&dir_key, prefix, &opts.delimiter)
                    .is_some_and(|c| collapsed.contains(c));
            if !can_match || already_collapsed {
                walker.skip_current_dir();
            }
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if name.starts_with(TEMP_PREFIX)
            || (mode == MetadataMode::Sidecar && name.ends_with(ATTRS_EXT))
        {
            continue;
        }
        if !key.starts_with(prefix) {
            continue;
        }

        if let Some(dir) = collapse(&key, prefix, &opts.delimiter) {
            if collapsed.insert(dir.to_string()) {
                objects.push(ListObject::dir(dir));
            }
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(err) => return Err(io::Error::from(err).into()),
        };
        let md5 = load_attrs(entry.path(), mode)?.md5();
        objects.push(ListObject {
            key,
            mod_time: meta.modified().ok().map(DateTime::<Utc>::from),
            size: meta.len(),
            md5,
            is_dir: false,
        });
    }

    objects.sort_by(|a, b| a.key.cmp(&b.key));
    objects.dedup_by(|a, b| a.key == b.key);
    if let Some(token) = opts.page_token.as_deref() {
        objects.retain(|o| o.key.as_str() > token);
    }

    let page_size = opts.effective_page_size();
    let next_page_token = if objects.len() > page_size {
        objects.truncate(page_size);
        objects.last().map(|o| o.key.clone())
    } else {
        None
    };

    Ok(ListPage {
        objects,
        next_page_token,
    })
}
