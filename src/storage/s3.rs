//! S3-compatible object store backend.
//!
//! Speaks the S3 REST API directly with SigV4 request signing and
//! path-style addressing, which keeps it compatible with MinIO and other
//! self-hosted stores. Listing uses ListObjectsV2 (`start-after` on the
//! first page, continuation tokens afterwards); bulk deletion uses the
//! multi-object `POST /?delete` call in quiet mode so only per-object
//! errors come back.

use crate::models::ObjectInfo;
use crate::storage::traits::{DeleteFailure, Listing, ObjectStore};
use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Duration;

const SERVICE: &str = "s3";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";
const SIGNED_HEADERS_CHECKSUM: &str = "host;x-amz-checksum-sha256;x-amz-content-sha256;x-amz-date";

/// Object store backend for S3-compatible services.
pub struct S3Backend {
    endpoint: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
    page_size: u32,
    client: reqwest::blocking::Client,
}

impl S3Backend {
    /// Default region for stores that do not care about one (MinIO).
    pub const DEFAULT_REGION: &'static str = "us-east-1";

    /// Maximum keys per listing page.
    pub const DEFAULT_PAGE_SIZE: u32 = 1000;

    /// Maximum objects per bulk delete call (S3 API limit).
    pub const MAX_BULK_DELETE: usize = 1000;

    /// Creates a backend for `endpoint` (e.g. `http://127.0.0.1:9001`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a malformed endpoint and
    /// [`Error::Connectivity`] if the HTTP client cannot be built.
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str) -> Result<Self> {
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "S3 endpoint '{endpoint}' must start with http:// or https://"
                ))
            })?
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Connectivity {
                service: "s3",
                cause: e.to_string(),
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            host,
            region: Self::DEFAULT_REGION.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            page_size: Self::DEFAULT_PAGE_SIZE,
            client,
        })
    }

    /// Sets the region used in the signing scope.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets the listing page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] if the HTTP client cannot be rebuilt.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Connectivity {
                service: "s3",
                cause: e.to_string(),
            })?;
        Ok(self)
    }

    fn send_error(e: &reqwest::Error) -> Error {
        let kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else {
            "request"
        };
        Error::Connectivity {
            service: "s3",
            cause: format!("{kind} error: {e}"),
        }
    }

    /// Builds the SigV4 headers for one request.
    ///
    /// `canonical_uri` must already be percent-encoded; `query` must be
    /// sorted by key. When `checksum` is set it is sent and signed as
    /// `x-amz-checksum-sha256` (required by the bulk delete call).
    fn sign(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        payload: &[u8],
        checksum: Option<&str>,
    ) -> Vec<(String, String)> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(payload));

        let canonical_query = query
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k, true), percent_encode(v, true)))
            .collect::<Vec<_>>()
            .join("&");

        let (canonical_headers, signed_headers) = checksum.map_or_else(
            || {
                (
                    format!(
                        "host:{}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n",
                        self.host
                    ),
                    SIGNED_HEADERS,
                )
            },
            |sum| {
                (
                    format!(
                        "host:{}\nx-amz-checksum-sha256:{sum}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n",
                        self.host
                    ),
                    SIGNED_HEADERS_CHECKSUM,
                )
            },
        );

        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );
        let scope = format!("{datestamp}/{}/{SERVICE}/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            datestamp.as_bytes(),
        );
        let key = hmac_sha256(&key, self.region.as_bytes());
        let key = hmac_sha256(&key, SERVICE.as_bytes());
        let key = hmac_sha256(&key, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let mut headers = vec![
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-content-sha256".to_string(), payload_hash),
            (
                "authorization".to_string(),
                format!(
                    "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                    self.access_key
                ),
            ),
        ];
        if let Some(sum) = checksum {
            headers.push(("x-amz-checksum-sha256".to_string(), sum.to_string()));
        }
        headers
    }

    /// Fetches one ListObjectsV2 page.
    fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        start_after: Option<&str>,
        continuation: Option<&str>,
    ) -> Result<ListPage> {
        let mut query: Vec<(String, String)> = vec![
            ("list-type".to_string(), "2".to_string()),
            ("max-keys".to_string(), self.page_size.to_string()),
            ("prefix".to_string(), prefix.to_string()),
        ];
        if let Some(token) = continuation {
            query.push(("continuation-token".to_string(), token.to_string()));
        } else if let Some(after) = start_after {
            query.push(("start-after".to_string(), after.to_string()));
        }
        query.sort();

        let canonical_uri = format!("/{}", percent_encode(bucket, false));
        let headers = self.sign("GET", &canonical_uri, &query, b"", None);

        let mut request = self
            .client
            .get(format!("{}/{bucket}", self.endpoint))
            .query(&query);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().map_err(|e| Self::send_error(&e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(Error::Connectivity {
                service: "s3",
                cause: format!("listing failed with status {status}: {body}"),
            });
        }
        let body = response.text().map_err(|e| Self::send_error(&e))?;
        parse_list_response(&body)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// RFC 3986 percent-encoding as SigV4 requires; `/` is kept literal in URI
/// paths and encoded in query values.
fn percent_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            },
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Returns the text content of the first `<tag>...</tag>` in `xml`.
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml_unescape(&xml[start..end]))
}

/// Returns the inner content of every `<tag>...</tag>` section in `xml`.
fn xml_sections<'x>(xml: &'x str, tag: &str) -> Vec<&'x str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut sections = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let start = start + open.len();
        let Some(end) = rest[start..].find(&close) else {
            break;
        };
        sections.push(&rest[start..start + end]);
        rest = &rest[start + end + close.len()..];
    }
    sections
}

struct ListPage {
    objects: Vec<ObjectInfo>,
    next_token: Option<String>,
}

fn parse_list_response(body: &str) -> Result<ListPage> {
    let mut objects = Vec::new();
    for section in xml_sections(body, "Contents") {
        let path = xml_text(section, "Key")
            .ok_or_else(|| malformed_listing("Contents entry without Key"))?;
        let size = xml_text(section, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| malformed_listing("Contents entry without Size"))?;
        let last_modified = xml_text(section, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| malformed_listing("Contents entry without LastModified"))?;
        objects.push(ObjectInfo {
            path,
            size,
            last_modified,
        });
    }
    let truncated = xml_text(body, "IsTruncated").is_some_and(|s| s == "true");
    let next_token = if truncated {
        xml_text(body, "NextContinuationToken")
    } else {
        None
    };
    Ok(ListPage {
        objects,
        next_token,
    })
}

fn malformed_listing(detail: &str) -> Error {
    Error::Connectivity {
        service: "s3",
        cause: format!("malformed listing response: {detail}"),
    }
}

/// Lazy pull-based listing over ListObjectsV2 pages.
struct S3Listing<'a> {
    backend: &'a S3Backend,
    bucket: String,
    prefix: String,
    buffer: VecDeque<ObjectInfo>,
    next_token: Option<String>,
    exhausted: bool,
}

impl Iterator for S3Listing<'_> {
    type Item = Result<ObjectInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(obj) = self.buffer.pop_front() {
                return Some(Ok(obj));
            }
            if self.exhausted {
                return None;
            }
            match self.backend.list_page(
                &self.bucket,
                &self.prefix,
                None,
                self.next_token.as_deref(),
            ) {
                Ok(page) => {
                    self.buffer.extend(page.objects);
                    self.next_token = page.next_token;
                    if self.next_token.is_none() {
                        self.exhausted = true;
                    }
                    if self.buffer.is_empty() && self.exhausted {
                        return None;
                    }
                },
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                },
            }
        }
    }
}

impl ObjectStore for S3Backend {
    fn list(&self, bucket: &str, prefix: &str, start_after: Option<&str>) -> Result<Listing<'_>> {
        // Fetch the first page eagerly so an unreachable store fails the
        // session up front rather than mid-collect.
        let page = self.list_page(bucket, prefix, start_after, None)?;
        let exhausted = page.next_token.is_none();
        Ok(Box::new(S3Listing {
            backend: self,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            buffer: page.objects.into(),
            next_token: page.next_token,
            exhausted,
        }))
    }

    fn delete_many(&self, bucket: &str, paths: &[String]) -> Result<Vec<DeleteFailure>> {
        let mut failures = Vec::new();
        for chunk in paths.chunks(Self::MAX_BULK_DELETE) {
            let mut body = String::from("<Delete><Quiet>true</Quiet>");
            for path in chunk {
                body.push_str(&format!("<Object><Key>{}</Key></Object>", xml_escape(path)));
            }
            body.push_str("</Delete>");

            let checksum = BASE64.encode(Sha256::digest(body.as_bytes()));
            let query = vec![("delete".to_string(), String::new())];
            let canonical_uri = format!("/{}", percent_encode(bucket, false));
            let headers = self.sign("POST", &canonical_uri, &query, body.as_bytes(), Some(&checksum));

            let mut request = self
                .client
                .post(format!("{}/{bucket}?delete", self.endpoint))
                .body(body);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            let response = request.send().map_err(|e| Self::send_error(&e))?;
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().unwrap_or_default();
                return Err(Error::Connectivity {
                    service: "s3",
                    cause: format!("bulk delete failed with status {status}: {text}"),
                });
            }
            let text = response.text().map_err(|e| Self::send_error(&e))?;
            for section in xml_sections(&text, "Error") {
                let code = xml_text(section, "Code").unwrap_or_default();
                // Deleting an already-absent object is idempotent success.
                if code == "NoSuchKey" {
                    continue;
                }
                failures.push(DeleteFailure {
                    path: xml_text(section, "Key").unwrap_or_default(),
                    cause: format!(
                        "{code}: {}",
                        xml_text(section, "Message").unwrap_or_default()
                    ),
                });
            }
        }
        Ok(failures)
    }

    fn delete_one(&self, bucket: &str, path: &str) -> Result<()> {
        let canonical_uri = format!(
            "/{}/{}",
            percent_encode(bucket, false),
            percent_encode(path, false)
        );
        let headers = self.sign("DELETE", &canonical_uri, &[], b"", None);
        let mut request = self
            .client
            .delete(format!("{}/{bucket}/{path}", self.endpoint));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        // A timeout on one object is a per-object failure: the row stays
        // active and the next sweep retries it. Connect failures stay fatal.
        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                Error::Deletion {
                    path: path.to_string(),
                    cause: format!("timeout: {e}"),
                }
            } else {
                Self::send_error(&e)
            }
        })?;
        let status = response.status();
        // 404 means the object is already gone; deletion is idempotent.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Deletion {
                path: path.to_string(),
                cause: format!("status {status}"),
            })
        }
    }
}
