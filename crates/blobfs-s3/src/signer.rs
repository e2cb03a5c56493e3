//! AWS Signature Version 4 request signing

use crate::{Result, S3Error};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Payload hash sentinel used when the body is not hashed
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
const AMZ_DATE: &str = "x-amz-date";
const AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";

/// AWS `UriEncode`: keeps `A-Za-z0-9-._~`, everything else is percent
/// encoded with uppercase hex (space becomes `%20`).
pub fn uri_encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Signs requests for a single access key and region
#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
    region: String,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
        }
    }

    /// Add `host`, `x-amz-date`, `x-amz-content-sha256` (when missing) and
    /// `Authorization` to `headers`.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &mut HeaderMap,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(S3Error::InvalidRequest(format!("url without host: {}", url)))
            }
        };
        headers.insert(HOST, header_value(&host)?);

        if !headers.contains_key(AMZ_DATE) {
            let stamp = now.format("%Y%m%dT%H%M%SZ").to_string();
            headers.insert(AMZ_DATE, header_value(&stamp)?);
        }
        if !headers.contains_key(AMZ_CONTENT_SHA256) {
            headers.insert(AMZ_CONTENT_SHA256, HeaderValue::from_static(UNSIGNED_PAYLOAD));
        }

        let date_time = headers
            .get(AMZ_DATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        if date_time.len() < 8 {
            return Err(S3Error::InvalidRequest(format!("bad x-amz-date: {:?}", date_time)));
        }
        let date = &date_time[..8];
        let payload_hash = headers
            .get(AMZ_CONTENT_SHA256)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(UNSIGNED_PAYLOAD)
            .to_string();

        let (canonical_headers, signed_headers) = canonical_headers(headers);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.to_ascii_uppercase(),
            canonical_path(url),
            canonical_query(url),
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            date_time,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signing_key = self.signing_key(date);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_headers, signature
        );
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        Ok(())
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, SERVICE.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| S3Error::InvalidRequest(format!("invalid header value {:?}: {}", value, e)))
}

fn is_signed_header(name: &HeaderName) -> bool {
    name == HOST || name == CONTENT_TYPE || name.as_str().starts_with("x-amz-")
}

/// Returns the canonical header block and the `;`-joined signed header names.
fn canonical_headers(headers: &HeaderMap) -> (String, String) {
    let mut selected: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter().filter(|(name, _)| is_signed_header(name)) {
        let value = String::from_utf8_lossy(value.as_bytes());
        selected
            .entry(name.as_str())
            .or_default()
            .push(collapse_spaces(value.trim()));
    }

    let mut block = String::new();
    for (name, values) in &selected {
        block.push_str(name);
        block.push(':');
        block.push_str(&values.join(","));
        block.push('\n');
    }
    let signed = selected.keys().copied().collect::<Vec<_>>().join(";");

    (block, signed)
}

fn collapse_spaces(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_space = false;
    for c in value.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

fn canonical_path(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            let decoded = urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            uri_encode(&decoded)
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}
