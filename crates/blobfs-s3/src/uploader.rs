//! Single-request or multipart upload of a streaming payload

use crate::{MpPart, Result, S3Client, S3Error};
use bytes::Bytes;
use futures::future::try_join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Smallest part S3 accepts is 5 MiB; stay above it
pub const DEFAULT_MIN_PART_SIZE: usize = 6 * 1024 * 1024;

/// Parts uploaded at the same time
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// Result of a finished upload
#[derive(Clone, Debug, Default)]
pub struct UploadOutput {
    pub etag: String,
    /// Number of parts sent; `0` for a single-request upload
    pub parts: u32,
}

/// Uploads one payload to one key.
///
/// Payloads shorter than `min_part_size` go out as a single `PUT`,
/// everything else as a multipart upload with up to `max_concurrency`
/// parts in flight. An uploader can only be used once.
pub struct Uploader<R> {
    client: S3Client,
    key: String,
    payload: Option<R>,
    headers: HeaderMap,
    metadata: BTreeMap<String, String>,
    content_md5: Option<String>,
    min_part_size: usize,
    max_concurrency: usize,
}

impl<R> Uploader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(client: S3Client, key: impl Into<String>, payload: R) -> Self {
        Self {
            client,
            key: key.into(),
            payload: Some(payload),
            headers: HeaderMap::new(),
            metadata: BTreeMap::new(),
            content_md5: None,
            min_part_size: DEFAULT_MIN_PART_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Content headers (`content-type`, `cache-control`, ...) for the object
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// User metadata, sent as `x-amz-meta-*`. Keys and values must already
    /// be header-safe.
    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Base64 `Content-MD5`, checked by the store on single-request uploads
    pub fn with_content_md5(mut self, md5: impl Into<String>) -> Self {
        self.content_md5 = Some(md5.into());
        self
    }

    pub fn with_min_part_size(mut self, size: usize) -> Self {
        self.min_part_size = size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency.max(1);
        self
    }

    /// Run the upload
    pub async fn upload(&mut self) -> Result<UploadOutput> {
        let mut payload = self.payload.take().ok_or(S3Error::UsedUploader)?;

        let first = read_chunk(&mut payload, self.min_part_size).await?;
        if first.len() < self.min_part_size {
            debug!(key = %self.key, size = first.len(), "single request upload");
            let headers = self.request_headers(true)?;
            let etag = self.client.put_object(&self.key, headers, first.into()).await?;
            return Ok(UploadOutput { etag, parts: 0 });
        }

        debug!(key = %self.key, part_size = self.min_part_size, "multipart upload");
        let headers = self.request_headers(false)?;
        multipart(
            &self.client,
            &self.key,
            headers,
            first,
            payload,
            self.min_part_size,
            self.max_concurrency,
        )
        .await
    }

    fn request_headers(&self, with_md5: bool) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        for (key, value) in &self.metadata {
            let name = HeaderName::from_bytes(format!("x-amz-meta-{}", key).as_bytes())
                .map_err(|e| S3Error::InvalidRequest(format!("metadata key {:?}: {}", key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| S3Error::InvalidRequest(format!("metadata value {:?}: {}", value, e)))?;
            headers.insert(name, value);
        }
        if with_md5 {
            if let Some(md5) = &self.content_md5 {
                let value = HeaderValue::from_str(md5)
                    .map_err(|e| S3Error::InvalidRequest(format!("content md5: {}", e)))?;
                headers.insert("content-md5", value);
            }
        }
        Ok(headers)
    }
}

async fn multipart<R: AsyncRead + Unpin + Send>(
    client: &S3Client,
    key: &str,
    headers: HeaderMap,
    first: Vec<u8>,
    payload: R,
    part_size: usize,
    concurrency: usize,
) -> Result<UploadOutput> {
    let upload_id = client.create_multipart_upload(key, headers).await?;
    let mut guard = AbortGuard::new(client, key, &upload_id);

    let cursor = tokio::sync::Mutex::new(ChunkCursor {
        payload,
        pending: Some(first.into()),
        next_part: 1,
        part_size,
        exhausted: false,
    });
    let parts = parking_lot::Mutex::new(Vec::new());

    let workers = (0..concurrency).map(|_| upload_parts(client, key, &upload_id, &cursor, &parts));

    let joined = try_join_all(workers).await;
    let result = match joined {
        Ok(_) => {
            let mut parts = parts.into_inner();
            parts.sort_by_key(|p: &MpPart| p.part_number);
            client
                .complete_multipart_upload(key, &upload_id, &parts)
                .await
                .map(|done| UploadOutput {
                    etag: done.etag,
                    parts: parts.len() as u32,
                })
        }
        Err(err) => Err(err),
    };

    guard.disarm();
    match result {
        Ok(output) => Ok(output),
        Err(err) => {
            warn!(%key, %upload_id, error = %err, "aborting multipart upload");
            match client.abort_multipart_upload(key, &upload_id).await {
                Ok(()) => Err(err),
                Err(abort) => Err(S3Error::AbortFailed {
                    source: Box::new(err),
                    abort: Box::new(abort),
                }),
            }
        }
    }
}

/// Hands out numbered chunks of the payload, one caller at a time
struct ChunkCursor<R> {
    payload: R,
    pending: Option<Bytes>,
    next_part: u32,
    part_size: usize,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ChunkCursor<R> {
    async fn next_chunk(&mut self) -> Result<Option<(u32, Bytes)>> {
        let chunk = match self.pending.take() {
            Some(chunk) => chunk,
            None if self.exhausted => return Ok(None),
            None => {
                let chunk = read_chunk(&mut self.payload, self.part_size).await?;
                if chunk.len() < self.part_size {
                    self.exhausted = true;
                }
                if chunk.is_empty() {
                    return Ok(None);
                }
                chunk.into()
            }
        };

        let part_number = self.next_part;
        self.next_part += 1;
        Ok(Some((part_number, chunk)))
    }
}

async fn upload_parts<R: AsyncRead + Unpin>(
    client: &S3Client,
    key: &str,
    upload_id: &str,
    cursor: &tokio::sync::Mutex<ChunkCursor<R>>,
    parts: &parking_lot::Mutex<Vec<MpPart>>,
) -> Result<()> {
    loop {
        let claimed = cursor.lock().await.next_chunk().await?;
        let Some((part_number, chunk)) = claimed else {
            return Ok(());
        };

        let etag = client.upload_part(key, upload_id, part_number, chunk).await?;
        parts.lock().push(MpPart { part_number, etag });
    }
}

/// Reads until `size` bytes are buffered or the payload ends
async fn read_chunk<R: AsyncRead + Unpin>(payload: &mut R, size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size.min(DEFAULT_MIN_PART_SIZE));
    payload.take(size as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Aborts the multipart upload in the background if the upload future is
/// dropped before it finishes.
struct AbortGuard {
    pending: Option<(S3Client, String, String)>,
}

impl AbortGuard {
    fn new(client: &S3Client, key: &str, upload_id: &str) -> Self {
        Self {
            pending: Some((client.clone(), key.to_string(), upload_id.to_string())),
        }
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some((client, key, upload_id)) = self.pending.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%key, %upload_id, "no runtime to abort cancelled multipart upload");
            return;
        };
        handle.spawn(async move {
            if let Err(err) = client.abort_multipart_upload(&key, &upload_id).await {
                warn!(%key, %upload_id, error = %err, "failed to abort cancelled multipart upload");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::S3Config;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY_PATH: &str = "/test-bucket/upload.bin";

    fn client(server: &MockServer) -> S3Client {
        S3Client::new(
            S3Config::new(server.uri(), "test-bucket", "us-east-1")
                .with_credentials("AKID", "SECRET")
                .with_path_style(true),
        )
        .unwrap()
    }

    async fn mount_single_put(server: &MockServer, expected: u64) {
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param_is_missing("partNumber"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"single\""))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_init(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path(KEY_PATH))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><Bucket>test-bucket</Bucket>\
                 <Key>upload.bin</Key><UploadId>upload-1</UploadId>\
                 </InitiateMultipartUploadResult>",
            ))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_parts(server: &MockServer, status: u16, expected: impl Into<wiremock::Times>) {
        Mock::given(method("PUT"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(status).insert_header("etag", "\"part\""))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_complete(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CompleteMultipartUploadResult><Key>upload.bin</Key>\
                 <ETag>\"final-3\"</ETag></CompleteMultipartUploadResult>",
            ))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_abort(server: &MockServer, status: u16, expected: u64) {
        Mock::given(method("DELETE"))
            .and(path(KEY_PATH))
            .and(query_param("uploadId", "upload-1"))
            .respond_with(ResponseTemplate::new(status))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_below_min_part_size_is_single_put() {
        let server = MockServer::start().await;
        mount_single_put(&server, 1).await;
        mount_init(&server, 0).await;

        let payload = vec![7u8; 15];
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload.as_slice())
            .with_min_part_size(16);
        let output = uploader.upload().await.unwrap();

        assert_eq!(output.parts, 0);
        assert_eq!(output.etag, "\"single\"");
    }

    #[tokio::test]
    async fn test_exact_min_part_size_is_multipart() {
        let server = MockServer::start().await;
        mount_single_put(&server, 0).await;
        mount_init(&server, 1).await;
        mount_parts(&server, 200, 1u64).await;
        mount_complete(&server, 1).await;
        mount_abort(&server, 204, 0).await;

        let payload = vec![7u8; 16];
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload.as_slice())
            .with_min_part_size(16);
        let output = uploader.upload().await.unwrap();

        assert_eq!(output.parts, 1);
        assert_eq!(output.etag, "\"final-3\"");
    }

    #[tokio::test]
    async fn test_multipart_splits_payload_into_parts() {
        let server = MockServer::start().await;
        mount_init(&server, 1).await;
        mount_parts(&server, 200, 3u64).await;
        mount_complete(&server, 1).await;

        let payload = vec![1u8; 40];
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload.as_slice())
            .with_min_part_size(16)
            .with_max_concurrency(2);
        let output = uploader.upload().await.unwrap();

        assert_eq!(output.parts, 3);

        let requests = server.received_requests().await.unwrap();
        let complete = requests
            .iter()
            .find(|r| r.method.as_str() == "POST" && r.url.query() == Some("uploadId=upload-1"))
            .unwrap();
        let body = String::from_utf8_lossy(&complete.body);
        let first = body.find("<PartNumber>1</PartNumber>").unwrap();
        let second = body.find("<PartNumber>2</PartNumber>").unwrap();
        let third = body.find("<PartNumber>3</PartNumber>").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn test_part_failure_aborts_once() {
        let server = MockServer::start().await;
        mount_init(&server, 1).await;
        mount_parts(&server, 500, 1u64..).await;
        mount_complete(&server, 0).await;
        mount_abort(&server, 204, 1).await;

        let payload = vec![1u8; 64];
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload.as_slice())
            .with_min_part_size(16)
            .with_max_concurrency(2);
        let err = uploader.upload().await.unwrap_err();

        assert!(matches!(err, S3Error::Response(ref e) if e.status == 500), "{err}");
    }

    #[tokio::test]
    async fn test_abort_failure_is_joined() {
        let server = MockServer::start().await;
        mount_init(&server, 1).await;
        mount_parts(&server, 500, 1u64..).await;
        mount_abort(&server, 403, 1).await;

        let payload = vec![1u8; 32];
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload.as_slice())
            .with_min_part_size(16)
            .with_max_concurrency(1);
        let err = uploader.upload().await.unwrap_err();

        match err {
            S3Error::AbortFailed { source, abort } => {
                assert_eq!(source.status(), Some(500));
                assert_eq!(abort.status(), Some(403));
            }
            other => panic!("expected AbortFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_uploader_is_single_use() {
        let server = MockServer::start().await;
        mount_single_put(&server, 1).await;

        let payload: &[u8] = b"hello";
        let mut uploader = Uploader::new(client(&server), "upload.bin", payload);
        uploader.upload().await.unwrap();

        assert!(matches!(uploader.upload().await, Err(S3Error::UsedUploader)));
    }
}
