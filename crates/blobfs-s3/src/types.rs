//! Request and response types for the S3 REST API

use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Object attributes decoded from `HEAD`/`GET` response headers
#[derive(Clone, Debug, Default)]
pub struct ObjectInfo {
    pub content_type: String,
    pub content_length: u64,
    /// Raw `Content-Range` header, present on ranged reads
    pub content_range: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// ETag as sent by the store, quotes included
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// `x-amz-meta-*` headers with the prefix stripped, still escaped
    pub metadata: BTreeMap<String, String>,
}

impl ObjectInfo {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let mut metadata = BTreeMap::new();
        for (name, value) in headers.iter() {
            if let Some(key) = name.as_str().strip_prefix("x-amz-meta-") {
                if let Ok(v) = value.to_str() {
                    metadata.insert(key.to_string(), v.to_string());
                }
            }
        }

        Self {
            content_type: text(header::CONTENT_TYPE).unwrap_or_default(),
            content_length: text(header::CONTENT_LENGTH)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            content_range: text(header::CONTENT_RANGE),
            cache_control: text(header::CACHE_CONTROL),
            content_disposition: text(header::CONTENT_DISPOSITION),
            content_encoding: text(header::CONTENT_ENCODING),
            content_language: text(header::CONTENT_LANGUAGE),
            etag: text(header::ETAG).unwrap_or_default(),
            last_modified: text(header::LAST_MODIFIED).and_then(|s| parse_http_date(&s)),
            metadata,
        }
    }

    /// Full object size, taken from `Content-Range` when the response is partial
    pub fn total_size(&self) -> u64 {
        self.content_range
            .as_deref()
            .and_then(|range| range.rsplit_once('/'))
            .and_then(|(_, total)| total.trim().parse().ok())
            .unwrap_or(self.content_length)
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_iso_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// `ListObjectsV2` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ListBucketResult {
    pub name: String,
    pub prefix: String,
    pub delimiter: String,
    pub max_keys: i64,
    pub key_count: i64,
    pub is_truncated: bool,
    pub encoding_type: String,
    pub continuation_token: String,
    pub next_continuation_token: String,
    pub start_after: String,
    pub contents: Vec<ListContent>,
    pub common_prefixes: Vec<CommonPrefix>,
}

impl ListBucketResult {
    /// Undo `encoding-type=url` on every key and prefix
    pub fn decode_keys(&mut self) {
        if !self.encoding_type.eq_ignore_ascii_case("url") {
            return;
        }
        let decode = |s: &mut String| {
            if let Ok(decoded) = urlencoding::decode(s) {
                *s = decoded.into_owned();
            }
        };
        for content in &mut self.contents {
            decode(&mut content.key);
        }
        for prefix in &mut self.common_prefixes {
            decode(&mut prefix.prefix);
        }
        decode(&mut self.prefix);
        decode(&mut self.delimiter);
        decode(&mut self.start_after);
    }
}

/// One object in a listing
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ListContent {
    pub key: String,
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    pub size: u64,
    pub storage_class: String,
}

impl ListContent {
    pub fn modified(&self) -> Option<DateTime<Utc>> {
        parse_iso_date(&self.last_modified)
    }
}

/// A collapsed key prefix in a delimited listing
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommonPrefix {
    pub prefix: String,
}

/// `CopyObject` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CopyObjectResult {
    #[serde(rename = "ETag")]
    pub etag: String,
    pub last_modified: String,
}

/// `CreateMultipartUpload` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InitiateMultipartUploadResult {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
}

/// `CompleteMultipartUpload` response
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompleteMultipartUploadResult {
    pub location: String,
    pub bucket: String,
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// One uploaded part of a multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MpPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// `CompleteMultipartUpload` request body
#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub(crate) struct CompleteMultipartUpload<'a> {
    #[serde(rename = "Part")]
    pub parts: &'a [MpPart],
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_list_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
    <Name>bucket</Name>
    <Prefix>photos/</Prefix>
    <KeyCount>3</KeyCount>
    <MaxKeys>1000</MaxKeys>
    <Delimiter>/</Delimiter>
    <IsTruncated>true</IsTruncated>
    <NextContinuationToken>token-2</NextContinuationToken>
    <Contents>
        <Key>photos/a.jpg</Key>
        <LastModified>2024-01-01T10:00:00.000Z</LastModified>
        <ETag>"9b2cf535f27731c974343645a3985328"</ETag>
        <Size>1024</Size>
        <StorageClass>STANDARD</StorageClass>
    </Contents>
    <Contents>
        <Key>photos/b.jpg</Key>
        <LastModified>2024-01-02T10:00:00.000Z</LastModified>
        <ETag>"d41d8cd98f00b204e9800998ecf8427e-2"</ETag>
        <Size>2048</Size>
    </Contents>
    <CommonPrefixes>
        <Prefix>photos/2024/</Prefix>
    </CommonPrefixes>
</ListBucketResult>"#;

        let result: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(result.name, "bucket");
        assert!(result.is_truncated);
        assert_eq!(result.next_continuation_token, "token-2");
        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.contents[0].key, "photos/a.jpg");
        assert_eq!(result.contents[1].size, 2048);
        assert!(result.contents[0].modified().is_some());
        assert_eq!(result.common_prefixes.len(), 1);
        assert_eq!(result.common_prefixes[0].prefix, "photos/2024/");
    }

    #[test]
    fn test_serialize_complete_request() {
        let parts = vec![
            MpPart { part_number: 1, etag: "a".into() },
            MpPart { part_number: 2, etag: "b".into() },
        ];
        let xml = quick_xml::se::to_string(&CompleteMultipartUpload { parts: &parts }).unwrap();
        assert_eq!(
            xml,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>a</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>b</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_object_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("image/png"));
        headers.insert("content-length", HeaderValue::from_static("10"));
        headers.insert("content-range", HeaderValue::from_static("bytes 0-9/4096"));
        headers.insert("etag", HeaderValue::from_static("\"abc\""));
        headers.insert(
            "last-modified",
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        headers.insert("x-amz-meta-owner", HeaderValue::from_static("alice"));

        let info = ObjectInfo::from_headers(&headers);
        assert_eq!(info.content_type, "image/png");
        assert_eq!(info.content_length, 10);
        assert_eq!(info.total_size(), 4096);
        assert_eq!(info.etag, "\"abc\"");
        assert!(info.last_modified.is_some());
        assert_eq!(info.metadata.get("owner").map(String::as_str), Some("alice"));
    }
}
