//! S3 driver.
//!
//! Keys are stored as-is apart from the few sequences S3 or URL handling
//! would mangle, which are hex-escaped. Metadata keys and values are
//! percent-encoded so they survive as `x-amz-meta-*` headers.

use crate::escape::{hex_escape, hex_unescape, is_dot_segment_end, path_escape, url_unescape};
use crate::{
    Attributes, BlobError, Driver, DriverReader, DriverWriter, ListObject, ListOptions,
    ListPage, ReaderAttributes, Result, WriterOptions, DEFAULT_CONTENT_TYPE,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use blobfs_s3::{
    ListParams, ObjectInfo, S3Client, S3Config, S3Error, UploadOutput, Uploader,
    DEFAULT_MAX_CONCURRENCY, DEFAULT_MIN_PART_SIZE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_ENCODING,
    CONTENT_LANGUAGE, CONTENT_TYPE,
};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument};

/// Chunks buffered between a writer and its upload task
const WRITE_QUEUE_DEPTH: usize = 4;

/// Keys requested per S3 list call
const LIST_BATCH: u32 = 1000;

/// Escape `key` for use as an S3 object key
pub fn escape_key(key: &str) -> Cow<'_, str> {
    hex_escape(key, |chars, i| {
        (chars[i] as u32) < 32
            || (chars[i] == '/' && i >= 2 && chars[i - 1] == '.' && chars[i - 2] == '.')
            || is_dot_segment_end(chars, i)
    })
}

/// Reverse [`escape_key`]
pub fn unescape_key(key: &str) -> Cow<'_, str> {
    hex_unescape(key)
}

/// Escape a metadata key into a header-safe name
pub fn escape_metadata_key(key: &str) -> String {
    let encoded = path_escape(key);
    hex_escape(&encoded, |chars, i| matches!(chars[i], '@' | ':' | '='))
        .into_owned()
}

pub fn unescape_metadata_key(key: &str) -> String {
    url_unescape(&hex_unescape(key)).into_owned()
}

pub fn escape_metadata_value(value: &str) -> String {
    path_escape(value).into_owned()
}

pub fn unescape_metadata_value(value: &str) -> String {
    url_unescape(value).into_owned()
}

/// Escaped listing prefix, and whether results still need filtering.
///
/// A trailing `.` or `..` segment escapes differently depending on what
/// follows it, so such prefixes are listed from the enclosing directory.
fn list_prefix(prefix: &str) -> (String, bool) {
    let last = prefix.rsplit('/').next().unwrap_or(prefix);
    if last == "." || last == ".." {
        let head = &prefix[..prefix.len() - last.len()];
        (escape_key(head).into_owned(), true)
    } else {
        (escape_key(prefix).into_owned(), false)
    }
}

/// MD5 carried in a plain ETag. Multipart ETags aren't digests.
fn etag_md5(etag: &str) -> Option<Vec<u8>> {
    let inner = etag.strip_prefix('"')?.strip_suffix('"')?;
    let digest = hex::decode(inner).ok()?;
    (digest.len() == 16).then_some(digest)
}

fn content_type(info: &ObjectInfo) -> String {
    if info.content_type.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        info.content_type.clone()
    }
}

fn reader_attributes(info: &ObjectInfo) -> ReaderAttributes {
    ReaderAttributes {
        content_type: content_type(info),
        mod_time: info.last_modified,
        size: info.total_size(),
    }
}

fn is_not_found(err: &S3Error) -> bool {
    err.status() == Some(404)
        || matches!(err.code(), Some("NoSuchBucket" | "NoSuchKey" | "NotFound"))
}

/// Upload tuning used when [`WriterOptions`] leaves it open
#[derive(Clone, Debug)]
pub struct S3DriverOptions {
    pub min_part_size: usize,
    pub max_concurrency: usize,
}

impl Default for S3DriverOptions {
    fn default() -> Self {
        Self {
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

/// A complete listing, kept so later pages of it skip S3
struct ListSnapshot {
    prefix: String,
    delimiter: String,
    objects: Arc<Vec<ListObject>>,
}

/// Driver backed by one S3 bucket
#[derive(Clone)]
pub struct S3Driver {
    client: S3Client,
    opts: S3DriverOptions,
    snapshot: Arc<Mutex<Option<ListSnapshot>>>,
}

impl S3Driver {
    pub fn new(client: S3Client) -> Self {
        Self {
            client,
            opts: S3DriverOptions::default(),
            snapshot: Arc::default(),
        }
    }

    /// Build the client from `config`
    pub fn open(config: S3Config) -> Result<Self> {
        Ok(Self::new(S3Client::new(config)?))
    }

    pub fn with_options(mut self, opts: S3DriverOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    /// The kept listing, when `opts` continues it
    fn cached_listing(&self, opts: &ListOptions) -> Option<Arc<Vec<ListObject>>> {
        opts.page_token.as_ref()?;
        self.snapshot
            .lock()
            .as_ref()
            .filter(|s| s.prefix == opts.prefix && s.delimiter == opts.delimiter)
            .map(|s| s.objects.clone())
    }

    /// Every entry under the prefix, sorted by unescaped key.
    ///
    /// S3 orders by the escaped key, which disagrees with the unescaped
    /// order around escape sequences, so all of S3's pages are read first.
    async fn list_sorted(&self, opts: &ListOptions) -> Result<Vec<ListObject>> {
        let (prefix, filter) = list_prefix(&opts.prefix);
        let mut params = ListParams {
            prefix: (!prefix.is_empty()).then_some(prefix),
            delimiter: (!opts.delimiter.is_empty())
                .then(|| escape_key(&opts.delimiter).into_owned()),
            max_keys: Some(LIST_BATCH),
            ..Default::default()
        };

        let mut objects = Vec::new();
        loop {
            let result = self.client.list_objects(&params).await?;
            objects.extend(result.contents.iter().map(|c| ListObject {
                key: unescape_key(&c.key).into_owned(),
                mod_time: c.modified(),
                size: c.size,
                md5: etag_md5(&c.etag),
                is_dir: false,
            }));
            objects.extend(
                result
                    .common_prefixes
                    .iter()
                    .map(|p| ListObject::dir(unescape_key(&p.prefix))),
            );
            if !result.is_truncated || result.next_continuation_token.is_empty() {
                break;
            }
            debug!(listed = objects.len(), "listing continues");
            params.continuation_token = Some(result.next_continuation_token);
        }

        if filter {
            objects.retain(|o| o.key.starts_with(&opts.prefix));
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects.dedup_by(|a, b| a.key == b.key);
        Ok(objects)
    }
}

#[async_trait]
impl Driver for S3Driver {
    #[instrument(skip(self))]
    async fn attributes(&self, key: &str) -> Result<Attributes> {
        let info = self.client.head_object(&escape_key(key)).await?;

        let metadata = info
            .metadata
            .iter()
            .map(|(k, v)| (unescape_metadata_key(k), unescape_metadata_value(v)))
            .collect();
        Ok(Attributes {
            content_type: content_type(&info),
            size: info.total_size(),
            md5: etag_md5(&info.etag),
            mod_time: info.last_modified,
            create_time: None,
            metadata,
            cache_control: info.cache_control,
            content_disposition: info.content_disposition,
            content_encoding: info.content_encoding,
            content_language: info.content_language,
            etag: info.etag,
        })
    }

    #[instrument(skip(self))]
    async fn list_paged(&self, opts: &ListOptions) -> Result<ListPage> {
        let objects = match self.cached_listing(opts) {
            Some(objects) => objects,
            None => {
                let objects = Arc::new(self.list_sorted(opts).await?);
                *self.snapshot.lock() = Some(ListSnapshot {
                    prefix: opts.prefix.clone(),
                    delimiter: opts.delimiter.clone(),
                    objects: objects.clone(),
                });
                objects
            }
        };

        let start = match opts.page_token.as_deref() {
            Some(token) => objects.partition_point(|o| o.key.as_str() <= token),
            None => 0,
        };
        let end = start
            .saturating_add(opts.effective_page_size())
            .min(objects.len());
        let next_page_token = (end < objects.len()).then(|| objects[end - 1].key.clone());
        Ok(ListPage {
            objects: objects[start..end].to_vec(),
            next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn new_range_reader(
        &self,
        key: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<DriverReader> {
        let key = escape_key(key);
        if length == Some(0) {
            let info = self.client.head_object(&key).await?;
            return Ok(DriverReader::new(reader_attributes(&info), tokio::io::empty()));
        }

        let range = match (offset, length) {
            (0, None) => None,
            (offset, None) => Some(format!("bytes={}-", offset)),
            (offset, Some(length)) => {
                let last = offset.checked_add(length - 1).ok_or_else(|| {
                    BlobError::Validation(format!(
                        "range of {} bytes at offset {} overflows",
                        length, offset
                    ))
                })?;
                Some(format!("bytes={}-{}", offset, last))
            }
        };
        let output = self.client.get_object(&key, range.as_deref()).await?;
        let attributes = reader_attributes(&output.info);
        Ok(DriverReader::new(
            attributes,
            StreamReader::new(output.into_stream()),
        ))
    }

    #[instrument(skip(self, opts))]
    async fn new_typed_writer(
        &self,
        key: &str,
        content_type: &str,
        opts: &WriterOptions,
    ) -> Result<Box<dyn DriverWriter>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(content_type)?);
        for (name, value) in [
            (CACHE_CONTROL, &opts.cache_control),
            (CONTENT_DISPOSITION, &opts.content_disposition),
            (CONTENT_ENCODING, &opts.content_encoding),
            (CONTENT_LANGUAGE, &opts.content_language),
        ] {
            if let Some(value) = value {
                headers.insert(name, header_value(value)?);
            }
        }

        let mut metadata = BTreeMap::new();
        for (k, v) in &opts.metadata {
            let name = escape_metadata_key(k);
            HeaderName::from_bytes(format!("x-amz-meta-{}", name).as_bytes())
                .map_err(|e| BlobError::Validation(format!("metadata key {:?}: {}", k, e)))?;
            metadata.insert(name, escape_metadata_value(v));
        }

        let part_size = match opts.buffer_size {
            0 => self.opts.min_part_size,
            n => n,
        };
        let concurrency = match opts.max_concurrency {
            0 => self.opts.max_concurrency,
            n => n,
        };

        let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let done = Arc::new(AtomicBool::new(false));
        let payload = StreamReader::new(Box::pin(payload_stream(rx, done.clone())));

        let mut uploader = Uploader::new(self.client.clone(), escape_key(key), payload)
            .with_headers(headers)
            .with_metadata(metadata)
            .with_min_part_size(part_size)
            .with_max_concurrency(concurrency);
        if let Some(md5) = &opts.content_md5 {
            uploader = uploader.with_content_md5(BASE64.encode(md5));
        }

        let handle = tokio::spawn(async move { uploader.upload().await });
        Ok(Box::new(S3Writer {
            tx: Some(tx),
            done,
            handle: Some(handle),
        }))
    }

    #[instrument(skip(self))]
    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        self.client
            .copy_object(&escape_key(dst), &escape_key(src))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let key = escape_key(key);
        // DELETE succeeds for missing keys
        self.client.head_object(&key).await?;
        self.client.delete_object(&key).await?;
        Ok(())
    }

    fn normalize_error(&self, err: BlobError) -> BlobError {
        match err {
            BlobError::S3(e) if is_not_found(&e) => BlobError::NotFound {
                key: String::new(),
                source: Some(Box::new(BlobError::S3(e))),
            },
            other => other,
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| BlobError::Validation(format!("header value {:?}: {}", value, e)))
}

/// Turn the writer's channel into the upload payload. The stream only ends
/// cleanly once `done` is set; a closed channel without it is an error, so
/// the upload never commits a truncated object.
fn payload_stream(
    rx: mpsc::Receiver<Bytes>,
    done: Arc<AtomicBool>,
) -> impl futures::Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::unfold(Some((rx, done)), |state| async move {
        let (mut rx, done) = state?;
        match rx.recv().await {
            Some(chunk) => Some((Ok(chunk), Some((rx, done)))),
            None if done.load(Ordering::Acquire) => None,
            None => Some((
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "write aborted")),
                None,
            )),
        }
    })
}

/// Feeds an upload running on its own task
struct S3Writer {
    tx: Option<mpsc::Sender<Bytes>>,
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<blobfs_s3::Result<UploadOutput>>>,
}

impl S3Writer {
    async fn join(&mut self) -> Result<UploadOutput> {
        let handle = self.handle.take().ok_or(BlobError::Closed)?;
        Ok(handle.await??)
    }
}

#[async_trait]
impl DriverWriter for S3Writer {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(BlobError::Closed)?;
        if buf.is_empty() {
            return Ok(());
        }
        if tx.send(Bytes::copy_from_slice(buf)).await.is_err() {
            // The upload task stopped reading; report why
            self.tx = None;
            return match self.join().await {
                Err(err) => Err(err),
                Ok(_) => Err(BlobError::Io(io::Error::other("upload finished early"))),
            };
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(BlobError::Closed)?;
        self.done.store(true, Ordering::Release);
        drop(tx);

        let output = self.join().await?;
        debug!(etag = %output.etag, parts = output.parts, "upload finished");
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            // Without `done` the payload errors, so the upload stores nothing
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md5::{Digest, Md5};
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{
        body_bytes, header, method, path, query_param, query_param_is_missing,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn driver(server: &MockServer) -> S3Driver {
        S3Driver::open(
            S3Config::new(server.uri(), "test-bucket", "us-east-1")
                .with_credentials("AKID", "SECRET")
                .with_path_style(true),
        )
        .unwrap()
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("a/b c.txt"), "a/b c.txt");
        assert_eq!(escape_key("a//b/"), "a//b/");
        assert_eq!(escape_key("a\tb"), "a__0x9__b");
        assert_eq!(escape_key("../x"), ".__0x2e____0x2f__x");
        assert_eq!(escape_key("a/./b"), "a/__0x2e__/b");
        for key in ["../x", "a/./b", "..", "__0x20__"] {
            assert_eq!(unescape_key(&escape_key(key)), key);
        }
    }

    #[test]
    fn test_metadata_escaping() {
        assert_eq!(escape_metadata_key("owner"), "owner");
        assert_eq!(escape_metadata_key("a@b:c=d"), "a__0x40__b__0x3a__c__0x3d__d");
        assert_eq!(escape_metadata_key("with space"), "with%20space");
        assert_eq!(escape_metadata_value("héllo wörld"), "h%C3%A9llo%20w%C3%B6rld");

        for key in ["a@b:c=d", "with space", "__0x40__", "100%"] {
            assert_eq!(unescape_metadata_key(&escape_metadata_key(key)), key);
        }
        assert_eq!(unescape_metadata_value(&escape_metadata_value("héllo wörld")), "héllo wörld");
    }

    #[test]
    fn test_list_prefix() {
        assert_eq!(list_prefix("photos/"), ("photos/".to_string(), false));
        assert_eq!(list_prefix("a/."), ("a/".to_string(), true));
        assert_eq!(list_prefix(".."), (String::new(), true));
        assert_eq!(list_prefix("a/.x"), ("a/.x".to_string(), false));
    }

    #[test]
    fn test_etag_md5() {
        let digest = Md5::digest(b"hello").to_vec();
        assert_eq!(etag_md5(&format!("\"{}\"", hex::encode(&digest))), Some(digest));
        assert_eq!(etag_md5("\"5d41402abc4b2a76b9719d911017c592-3\""), None);
        assert_eq!(etag_md5("5d41402abc4b2a76b9719d911017c592"), None);
    }

    #[tokio::test]
    async fn test_attributes() {
        let server = MockServer::start().await;
        let digest = Md5::digest(b"hello world");
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/docs/a.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain")
                    .insert_header("content-length", "11")
                    .insert_header("etag", format!("\"{}\"", hex::encode(digest)).as_str())
                    .insert_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .insert_header("cache-control", "no-cache")
                    .insert_header("x-amz-meta-a__0x40__b", "x%20y"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let attrs = driver(&server).attributes("docs/a.txt").await.unwrap();
        assert_eq!(attrs.content_type, "text/plain");
        assert_eq!(attrs.size, 11);
        assert_eq!(attrs.md5, Some(digest.to_vec()));
        assert_eq!(attrs.cache_control.as_deref(), Some("no-cache"));
        assert_eq!(attrs.metadata.get("a@b").map(String::as_str), Some("x y"));
        assert!(attrs.mod_time.is_some());
    }

    #[tokio::test]
    async fn test_missing_key_normalizes_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let err = driver.attributes("missing").await.unwrap_err();
        assert!(matches!(err, BlobError::S3(_)));
        assert!(driver.normalize_error(err).is_not_found());

        let err = driver.delete("missing").await.unwrap_err();
        assert!(driver.normalize_error(err).is_not_found());

        let err = BlobError::S3(S3Error::Response(blobfs_s3::ResponseError {
            status: 403,
            code: "AccessDenied".into(),
            ..Default::default()
        }));
        assert!(!driver.normalize_error(err).is_not_found());
    }

    #[tokio::test]
    async fn test_range_reader() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-bucket/k"))
            .and(header("range", "bytes=2-4"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-type", "text/plain")
                    .insert_header("content-range", "bytes 2-4/11")
                    .set_body_bytes(b"llo".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut reader = driver(&server).new_range_reader("k", 2, Some(3)).await.unwrap();
        assert_eq!(reader.attributes.size, 11);
        assert_eq!(reader.attributes.content_type, "text/plain");
        let mut buf = Vec::new();
        reader.body.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"llo");
    }

    #[tokio::test]
    async fn test_zero_length_read_is_head_only() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/test-bucket/k"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-length", "11"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut reader = driver(&server).new_range_reader("k", 5, Some(0)).await.unwrap();
        assert_eq!(reader.attributes.size, 11);
        assert_eq!(reader.attributes.content_type, DEFAULT_CONTENT_TYPE);
        let mut buf = Vec::new();
        reader.body.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_list_merges_prefixes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-bucket/"))
            .and(query_param("list-type", "2"))
            .and(query_param("prefix", "photos/"))
            .and(query_param("delimiter", "/"))
            .and(query_param("max-keys", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult>\
                 <IsTruncated>false</IsTruncated>\
                 <Contents><Key>photos/index.html</Key><Size>12</Size>\
                 <ETag>\"5d41402abc4b2a76b9719d911017c592\"</ETag>\
                 <LastModified>2024-01-02T03:04:05.000Z</LastModified></Contents>\
                 <CommonPrefixes><Prefix>photos/2023/</Prefix></CommonPrefixes>\
                 </ListBucketResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let opts = ListOptions::new()
            .with_prefix("photos/")
            .with_delimiter("/")
            .with_page_size(1);
        let page = driver.list_paged(&opts).await.unwrap();
        assert_eq!(page.objects, vec![ListObject::dir("photos/2023/")]);
        assert_eq!(page.next_page_token.as_deref(), Some("photos/2023/"));

        // The second page comes from the kept listing
        let page = driver
            .list_paged(&opts.with_page_token(page.next_page_token))
            .await
            .unwrap();
        assert_eq!(page.next_page_token, None);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "photos/index.html");
        assert_eq!(page.objects[0].size, 12);
        assert!(page.objects[0].md5.is_some());
        assert!(page.objects[0].mod_time.is_some());
    }

    #[tokio::test]
    async fn test_list_orders_across_s3_pages() {
        let server = MockServer::start().await;
        // "a__0x1__" is "a\u{1}", which S3 sorts after "aZ"
        Mock::given(method("GET"))
            .and(path("/test-bucket/"))
            .and(query_param_is_missing("continuation-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult>\
                 <IsTruncated>true</IsTruncated>\
                 <NextContinuationToken>t1</NextContinuationToken>\
                 <Contents><Key>aZ</Key><Size>1</Size></Contents>\
                 </ListBucketResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/test-bucket/"))
            .and(query_param("continuation-token", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult>\
                 <IsTruncated>false</IsTruncated>\
                 <Contents><Key>a__0x1__</Key><Size>1</Size></Contents>\
                 </ListBucketResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let opts = ListOptions::new().with_page_size(1);
        let first = driver.list_paged(&opts).await.unwrap();
        assert_eq!(first.objects[0].key, "a\u{1}");
        assert_eq!(first.next_page_token.as_deref(), Some("a\u{1}"));

        let second = driver
            .list_paged(&opts.with_page_token(first.next_page_token))
            .await
            .unwrap();
        assert_eq!(second.objects[0].key, "aZ");
        assert_eq!(second.next_page_token, None);
    }

    #[tokio::test]
    async fn test_fresh_listing_rereads_s3() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test-bucket/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult>\
                 <IsTruncated>false</IsTruncated>\
                 <Contents><Key>k</Key><Size>1</Size></Contents>\
                 </ListBucketResult>",
            ))
            .expect(2)
            .mount(&server)
            .await;

        let driver = driver(&server);
        for _ in 0..2 {
            let page = driver.list_paged(&ListOptions::new()).await.unwrap();
            assert_eq!(page.objects.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_range_past_u64_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(206))
            .expect(0)
            .mount(&server)
            .await;

        let err = driver(&server)
            .new_range_reader("k", u64::MAX, Some(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BlobError::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn test_writer_single_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/docs/a.txt"))
            .and(header("content-type", "text/plain"))
            .and(header("x-amz-meta-owner", "alice%20b"))
            .and(header("content-md5", BASE64.encode(Md5::digest(b"hello world")).as_str()))
            .and(body_bytes(b"hello world".to_vec()))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"e\""))
            .expect(1)
            .mount(&server)
            .await;

        let opts = WriterOptions::default()
            .with_metadata("owner", "alice b")
            .with_content_md5(Md5::digest(b"hello world").to_vec());
        let mut w = driver(&server)
            .new_typed_writer("docs/a.txt", "text/plain", &opts)
            .await
            .unwrap();
        w.write(b"hello ").await.unwrap();
        w.write(b"").await.unwrap();
        w.write(b"world").await.unwrap();
        w.close().await.unwrap();

        assert!(matches!(w.close().await, Err(BlobError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_empty_object() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/empty"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"e\""))
            .expect(1)
            .mount(&server)
            .await;

        let mut w = driver(&server)
            .new_typed_writer("empty", "text/plain", &WriterOptions::default())
            .await
            .unwrap();
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_writer_uploads_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"e\""))
            .expect(0)
            .mount(&server)
            .await;

        let driver = driver(&server);
        let mut w = driver
            .new_typed_writer("k", "text/plain", &WriterOptions::default())
            .await
            .unwrap();
        w.write(b"partial").await.unwrap();
        w.abort().await.unwrap();
        assert!(matches!(w.write(b"more").await, Err(BlobError::Closed)));
    }

    #[tokio::test]
    async fn test_writer_multipart_with_buffer_size() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test-bucket/big"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><UploadId>u-1</UploadId>\
                 </InitiateMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/big"))
            .and(query_param("uploadId", "u-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"p\""))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/test-bucket/big"))
            .and(query_param("uploadId", "u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CompleteMultipartUploadResult><ETag>\"m-2\"</ETag>\
                 </CompleteMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let opts = WriterOptions {
            buffer_size: 8,
            max_concurrency: 1,
            ..Default::default()
        };
        let mut w = driver(&server)
            .new_typed_writer("big", "application/octet-stream", &opts)
            .await
            .unwrap();
        w.write(&[1u8; 10]).await.unwrap();
        w.write(&[2u8; 6]).await.unwrap();
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_copy() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/test-bucket/dst"))
            .and(header("x-amz-copy-source", "/test-bucket/src"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CopyObjectResult><ETag>\"e\"</ETag>\
                 <LastModified>2024-01-02T03:04:05.000Z</LastModified></CopyObjectResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        driver(&server).copy("dst", "src").await.unwrap();
    }
}
