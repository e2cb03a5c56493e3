//! Signed S3 REST client

use crate::{
    signer::{uri_encode, Signer},
    types::*,
    ResponseError, Result, S3Config, S3Error,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, ETAG, RANGE},
    Body, Client, Method, Response,
};
use std::{io, sync::Arc};
use tracing::{debug, instrument};
use url::Url;

/// Query parameters for `ListObjectsV2`
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: Option<u32>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub encoding_type: Option<String>,
    pub fetch_owner: bool,
}

impl ListParams {
    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![("list-type", "2".to_string())];
        if let Some(prefix) = &self.prefix {
            query.push(("prefix", prefix.clone()));
        }
        if let Some(delimiter) = &self.delimiter {
            query.push(("delimiter", delimiter.clone()));
        }
        if let Some(max_keys) = self.max_keys {
            query.push(("max-keys", max_keys.to_string()));
        }
        if let Some(token) = &self.continuation_token {
            query.push(("continuation-token", token.clone()));
        }
        if let Some(start_after) = &self.start_after {
            query.push(("start-after", start_after.clone()));
        }
        if let Some(encoding) = &self.encoding_type {
            query.push(("encoding-type", encoding.clone()));
        }
        if self.fetch_owner {
            query.push(("fetch-owner", "true".to_string()));
        }
        query
    }
}

/// A streaming `GetObject` response
pub struct GetObjectOutput {
    pub info: ObjectInfo,
    response: Response,
}

impl GetObjectOutput {
    /// The body as a stream of byte chunks
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        self.response.bytes_stream().map_err(io::Error::other)
    }

    /// Buffer the whole body
    pub async fn bytes(self) -> Result<Bytes> {
        Ok(self.response.bytes().await?)
    }
}

/// Client bound to a single bucket. Cheap to clone.
#[derive(Clone)]
pub struct S3Client {
    config: Arc<S3Config>,
    signer: Signer,
    http: Client,
}

impl S3Client {
    /// Create a new client with the given configuration
    pub fn new(config: S3Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(S3Error::Http)?;
        let signer = Signer::new(&config.access_key, &config.secret_key, &config.region);

        Ok(Self {
            config: Arc::new(config),
            signer,
            http,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &S3Config {
        &self.config
    }

    /// Object URL for `key`, honoring path-style or virtual-hosted addressing
    pub fn url(&self, key: &str) -> Result<Url> {
        self.url_with_query(key, &[])
    }

    fn url_with_query(&self, key: &str, query: &[(&str, String)]) -> Result<Url> {
        let (scheme, host) = self.config.scheme_and_host();
        let path = encode_key(key);
        let mut url = if self.config.use_path_style {
            format!("{}://{}/{}/{}", scheme, host, uri_encode(&self.config.bucket), path)
        } else {
            format!("{}://{}.{}/{}", scheme, self.config.bucket, host, path)
        };

        if !query.is_empty() {
            let query = query
                .iter()
                .map(|(k, v)| {
                    if v.is_empty() {
                        uri_encode(k)
                    } else {
                        format!("{}={}", uri_encode(k), uri_encode(v))
                    }
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&query);
        }

        Url::parse(&url).map_err(|e| S3Error::InvalidRequest(format!("{}: {}", url, e)))
    }

    // ==================== Object Operations ====================

    /// Fetch object attributes
    #[instrument(skip(self))]
    pub async fn head_object(&self, key: &str) -> Result<ObjectInfo> {
        let url = self.url(key)?;
        let response = self.send(Method::HEAD, url, HeaderMap::new(), None).await?;
        Ok(ObjectInfo::from_headers(response.headers()))
    }

    /// Start streaming an object, optionally limited by a `Range` header value
    #[instrument(skip(self))]
    pub async fn get_object(&self, key: &str, range: Option<&str>) -> Result<GetObjectOutput> {
        let url = self.url(key)?;
        let mut headers = HeaderMap::new();
        if let Some(range) = range {
            headers.insert(RANGE, header_value(range)?);
        }

        let response = self.send(Method::GET, url, headers, None).await?;
        Ok(GetObjectOutput {
            info: ObjectInfo::from_headers(response.headers()),
            response,
        })
    }

    /// Upload an object in a single request
    #[instrument(skip(self, headers, body), fields(size = body.len()))]
    pub async fn put_object(&self, key: &str, headers: HeaderMap, body: Bytes) -> Result<String> {
        let url = self.url(key)?;
        let response = self.send(Method::PUT, url, headers, Some(body.into())).await?;
        Ok(etag_header(&response))
    }

    /// Server-side copy of `src` to `dst` within the bucket
    #[instrument(skip(self))]
    pub async fn copy_object(&self, dst: &str, src: &str) -> Result<CopyObjectResult> {
        let url = self.url(dst)?;
        let mut headers = HeaderMap::new();
        let source = format!("/{}/{}", uri_encode(&self.config.bucket), encode_key(src));
        headers.insert("x-amz-copy-source", header_value(&source)?);

        let response = self.send(Method::PUT, url, headers, None).await?;
        let text = read_body(response).await?;
        Ok(quick_xml::de::from_str(&text)?)
    }

    /// Delete an object
    #[instrument(skip(self))]
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let url = self.url(key)?;
        self.send(Method::DELETE, url, HeaderMap::new(), None).await?;
        Ok(())
    }

    /// One `ListObjectsV2` page
    #[instrument(skip(self))]
    pub async fn list_objects(&self, params: &ListParams) -> Result<ListBucketResult> {
        let url = self.url_with_query("", &params.to_query())?;
        let response = self.send(Method::GET, url, HeaderMap::new(), None).await?;
        let text = read_body(response).await?;

        let mut result: ListBucketResult = quick_xml::de::from_str(&text)?;
        result.decode_keys();
        Ok(result)
    }

    // ==================== Multipart Operations ====================

    /// Initiate a multipart upload and return its upload id
    #[instrument(skip(self, headers))]
    pub async fn create_multipart_upload(&self, key: &str, headers: HeaderMap) -> Result<String> {
        let url = self.url_with_query(key, &[("uploads", String::new())])?;
        let response = self.send(Method::POST, url, headers, None).await?;
        let text = read_body(response).await?;

        let result: InitiateMultipartUploadResult = quick_xml::de::from_str(&text)?;
        if result.upload_id.is_empty() {
            return Err(S3Error::InvalidResponse("missing UploadId".to_string()));
        }
        Ok(result.upload_id)
    }

    /// Upload one part and return its ETag
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let url = self.url_with_query(
            key,
            &[
                ("partNumber", part_number.to_string()),
                ("uploadId", upload_id.to_string()),
            ],
        )?;
        let response = self.send(Method::PUT, url, HeaderMap::new(), Some(body.into())).await?;

        let etag = etag_header(&response);
        if etag.is_empty() {
            return Err(S3Error::InvalidResponse(format!("missing ETag for part {}", part_number)));
        }
        Ok(etag)
    }

    /// Complete a multipart upload. `parts` must be sorted by part number.
    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[MpPart],
    ) -> Result<CompleteMultipartUploadResult> {
        let url = self.url_with_query(key, &[("uploadId", upload_id.to_string())])?;
        let xml = quick_xml::se::to_string(&CompleteMultipartUpload { parts })?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));

        let response = self.send(Method::POST, url, headers, Some(xml.into())).await?;
        let text = read_body(response).await?;
        Ok(quick_xml::de::from_str(&text)?)
    }

    /// Abort a multipart upload, discarding its parts
    #[instrument(skip(self))]
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        let url = self.url_with_query(key, &[("uploadId", upload_id.to_string())])?;
        self.send(Method::DELETE, url, HeaderMap::new(), None).await?;
        Ok(())
    }

    // ==================== Helper Methods ====================

    async fn send(
        &self,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: Option<Body>,
    ) -> Result<Response> {
        self.signer.sign(method.as_str(), &url, &mut headers, Utc::now())?;

        debug!("Sending {} request to {}", method, url);
        let mut req = self.http.request(method, url).headers(headers);
        if let Some(body) = body {
            req = req.body(body);
        }
        let response = req.send().await?;

        let status = response.status().as_u16();
        if status >= 400 {
            let body = response.bytes().await.unwrap_or_default();
            return Err(ResponseError::parse(status, &body).into());
        }

        Ok(response)
    }
}

/// Uri-encode every `/`-separated segment of a key
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| S3Error::InvalidRequest(format!("invalid header value {:?}: {}", value, e)))
}

fn etag_header(response: &Response) -> String {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Read a successful response body, treating an `<Error>` document as a
/// failure (copy and complete-upload can fail after sending `200 OK`).
async fn read_body(response: Response) -> Result<String> {
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    if root_element(&body).as_deref() == Some("Error") {
        return Err(ResponseError::parse(status, &body).into());
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn root_element(xml: &[u8]) -> Option<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => return None,
            Ok(_) => buf.clear(),
        }
    }
}
