use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Method;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::backend::{UploadCredentials, is_retryable_error, is_retryable_status};
use crate::error::UploadError;

type HmacSha256 = Hmac<Sha256>;

static UPLOAD_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<UploadId>([^<]+)</UploadId>").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub checksum_sha256: String,
}

pub trait ObjectStore: Send + Sync {
    fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, UploadError>;
    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<CompletedPart, UploadError>;
    fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), UploadError>;
}

pub trait StorageConnector: Send + Sync {
    fn connect(&self, credentials: &UploadCredentials) -> Result<Box<dyn ObjectStore>, UploadError>;
}

#[derive(Debug, Clone)]
pub struct S3Connector {
    pub endpoint: Option<String>,
    pub accelerate: bool,
    pub max_retries: usize,
}

impl Default for S3Connector {
    fn default() -> Self {
        Self {
            endpoint: None,
            accelerate: false,
            max_retries: 3,
        }
    }
}

impl StorageConnector for S3Connector {
    fn connect(&self, credentials: &UploadCredentials) -> Result<Box<dyn ObjectStore>, UploadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| UploadError::Transfer(err.to_string()))?;
        let addressing = match &self.endpoint {
            Some(endpoint) => Addressing::PathStyle(endpoint.trim_end_matches('/').to_string()),
            None if self.accelerate => Addressing::Accelerate,
            None => Addressing::VirtualHosted,
        };
        Ok(Box::new(S3Client {
            client,
            credentials: credentials.clone(),
            addressing,
            max_retries: self.max_retries,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Addressing {
    VirtualHosted,
    Accelerate,
    PathStyle(String),
}

pub struct S3Client {
    client: Client,
    credentials: UploadCredentials,
    addressing: Addressing,
    max_retries: usize,
}

impl S3Client {
    fn url(&self, bucket: &str, key: &str) -> (String, String, String) {
        let key = uri_encode(key.trim_start_matches('/'), false);
        match &self.addressing {
            Addressing::VirtualHosted => {
                let host = format!("{bucket}.s3.{}.amazonaws.com", self.credentials.aws_region);
                let path = format!("/{key}");
                (format!("https://{host}{path}"), host, path)
            }
            Addressing::Accelerate => {
                let host = format!("{bucket}.s3-accelerate.amazonaws.com");
                let path = format!("/{key}");
                (format!("https://{host}{path}"), host, path)
            }
            Addressing::PathStyle(endpoint) => {
                let host = endpoint
                    .split_once("://")
                    .map(|(_, rest)| rest)
                    .unwrap_or(endpoint)
                    .to_string();
                let path = format!("/{bucket}/{key}");
                (format!("{endpoint}{path}"), host, path)
            }
        }
    }

    fn send(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &[(&str, &str)],
        extra_headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<Response, UploadError> {
        const BASE_DELAY_MS: u64 = 200;
        let (url, host, path) = self.url(bucket, key);
        let canonical_query = canonical_query(query);
        let full_url = if canonical_query.is_empty() {
            url
        } else {
            format!("{url}?{canonical_query}")
        };

        let mut attempt = 0usize;
        loop {
            let signed = sign_request(
                &self.credentials,
                method.as_str(),
                &host,
                &path,
                &canonical_query,
                extra_headers,
                body,
                Utc::now(),
            )?;
            let headers = to_header_map(&signed)?;
            let result = self
                .client
                .request(method.clone(), &full_url)
                .headers(headers)
                .body(body.to_vec())
                .send();
            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.max_retries && is_retryable_status(status) {
                        debug!(status, attempt, key, "retrying object storage request");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return check_status(resp);
                }
                Err(err) => {
                    if attempt < self.max_retries && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(UploadError::Transfer(err.to_string()));
                }
            }
        }
    }
}

impl ObjectStore for S3Client {
    fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, UploadError> {
        let response = self.send(
            Method::POST,
            bucket,
            key,
            &[("uploads", "")],
            &[("x-amz-checksum-algorithm", "SHA256".to_string())],
            &[],
        )?;
        let body = response
            .text()
            .map_err(|err| UploadError::Transfer(err.to_string()))?;
        parse_upload_id(&body)
            .ok_or_else(|| UploadError::Transfer(format!("no UploadId in response for {key}")))
    }

    fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: &[u8],
    ) -> Result<CompletedPart, UploadError> {
        let checksum_sha256 = BASE64.encode(Sha256::digest(body));
        let part = part_number.to_string();
        let response = self.send(
            Method::PUT,
            bucket,
            key,
            &[("partNumber", part.as_str()), ("uploadId", upload_id)],
            &[("x-amz-checksum-sha256", checksum_sha256.clone())],
            body,
        )?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| UploadError::Transfer(format!("no ETag for part {part_number} of {key}")))?
            .to_string();
        Ok(CompletedPart {
            part_number,
            etag,
            checksum_sha256,
        })
    }

    fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<(), UploadError> {
        let body = complete_body(parts);
        let response = self.send(
            Method::POST,
            bucket,
            key,
            &[("uploadId", upload_id)],
            &[("content-type", "application/xml".to_string())],
            body.as_bytes(),
        )?;
        // S3 may report a failed completion with a 200 status.
        let text = response
            .text()
            .map_err(|err| UploadError::Transfer(err.to_string()))?;
        if text.contains("<Error>") {
            return Err(UploadError::TransferStatus {
                status: 200,
                message: text,
            });
        }
        Ok(())
    }
}

fn check_status(response: Response) -> Result<Response, UploadError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .unwrap_or_else(|_| "object storage request failed".to_string());
    Err(UploadError::TransferStatus { status, message })
}

fn to_header_map(headers: &[(String, String)]) -> Result<HeaderMap, UploadError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if name == "host" {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| UploadError::Transfer(err.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|err| UploadError::Transfer(err.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub fn parse_upload_id(body: &str) -> Option<String> {
    UPLOAD_ID
        .captures(body)
        .map(|caps| caps[1].trim().to_string())
}

pub fn complete_body(parts: &[CompletedPart]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_by_key(|part| part.part_number);
    let mut body = String::from("<CompleteMultipartUpload>");
    for part in &sorted {
        body.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag><ChecksumSHA256>{}</ChecksumSHA256></Part>",
            part.part_number,
            xml_escape(&part.etag),
            part.checksum_sha256
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Returns the headers to send, `authorization` included. The `host` entry is
/// signed but left for the HTTP client to set.
#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    credentials: &UploadCredentials,
    method: &str,
    host: &str,
    path: &str,
    canonical_query: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>, UploadError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let payload_hash = hex::encode(Sha256::digest(body));

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.clone()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
    }
    for (name, value) in extra_headers {
        headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
    }
    headers.sort();

    let canonical_headers = headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect::<String>();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_request = format!(
        "{method}\n{path}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );

    let region = &credentials.aws_region;
    let scope = format!("{date}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );
    let key = signing_key(&credentials.secret_access_key, &date, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    headers.push((
        "authorization".to_string(),
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key_id
        ),
    ));
    Ok(headers)
}

pub fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<[u8; 32], UploadError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], UploadError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| UploadError::Transfer(format!("invalid signing key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs = query
        .iter()
        .map(|(key, value)| (uri_encode(key, true), uri_encode(value, true)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
