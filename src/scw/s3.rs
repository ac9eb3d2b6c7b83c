//! Object storage client
//!
//! Scaleway object storage speaks the S3 protocol at `https://s3.<region>.scw.cloud`.
//! Only the bucket-level calls the bucket resource needs are implemented: create, head,
//! delete, versioning, tagging, ACL, and enough of the object listing to empty a bucket.

use super::auth::Credentials;
use super::http::{RawResponse, ScwHttpClient};
use crate::error::{ApiError, ApiErrorBody, Error, Result};
use crate::locality::Region;
use chrono::Utc;
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

type HmacSha256 = Hmac<Sha256>;

/// Endpoint template, `{region}` is substituted
pub const DEFAULT_ENDPOINT: &str = "https://s3.{region}.scw.cloud";

// =============================================================================
// XML documents
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "VersioningConfiguration")]
pub struct VersioningConfiguration {
    #[serde(rename = "Status", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "Tagging")]
pub struct Tagging {
    #[serde(rename = "TagSet")]
    pub tag_set: TagSet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSet {
    #[serde(rename = "Tag", default)]
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
struct S3ErrorDocument {
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

/// One entry of a version listing (object version or delete marker)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectVersion {
    pub key: String,
    pub version_id: Option<String>,
}

/// One page of `GET /bucket?versions`
#[derive(Debug, Default, PartialEq)]
pub struct VersionListing {
    pub versions: Vec<ObjectVersion>,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
    pub is_truncated: bool,
}

/// Parse a version listing with an event reader: `Version` and `DeleteMarker`
/// elements interleave, which serde-based list mapping does not accept.
pub fn parse_version_listing(xml: &str) -> Result<VersionListing> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut listing = VersionListing::default();
    let mut current: Option<ObjectVersion> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                if name == "Version" || name == "DeleteMarker" {
                    current = Some(ObjectVersion::default());
                } else {
                    field = Some(name);
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| Error::Other(format!("invalid listing XML: {}", e)))?
                    .to_string();
                match (field.as_deref(), current.as_mut()) {
                    (Some("Key"), Some(entry)) => entry.key = value,
                    (Some("VersionId"), Some(entry)) => {
                        if value != "null" {
                            entry.version_id = Some(value)
                        }
                    }
                    (Some("IsTruncated"), None) => listing.is_truncated = value == "true",
                    (Some("NextKeyMarker"), None) => listing.next_key_marker = Some(value),
                    (Some("NextVersionIdMarker"), None) => {
                        listing.next_version_id_marker = Some(value)
                    }
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                let name = end.name();
                if name.as_ref() == b"Version" || name.as_ref() == b"DeleteMarker" {
                    if let Some(entry) = current.take() {
                        listing.versions.push(entry);
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Other(format!("invalid listing XML: {}", e))),
        }
    }

    Ok(listing)
}

// =============================================================================
// Signing
// =============================================================================

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Other(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn canonical_uri(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &[(&str, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Inputs of one SigV4 signature
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a [(&'a str, String)],
    pub payload_hash: &'a str,
    pub amz_date: &'a str,
    pub region: &'a str,
}

/// Compute the `Authorization` header for a request
pub fn authorization_header(
    credentials: &Credentials,
    req: &SigningRequest<'_>,
) -> Result<String> {
    let date = req
        .amz_date
        .get(..8)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| Error::Other(format!("malformed x-amz-date {:?}", req.amz_date)))?;
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";
    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        req.method,
        canonical_uri(req.path),
        canonical_query(req.query),
        req.host,
        req.payload_hash,
        req.amz_date,
        signed_headers,
        req.payload_hash
    );
    let scope = format!("{}/{}/s3/aws4_request", date, req.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        req.amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac(format!("AWS4{}", credentials.token()).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, req.region.as_bytes())?;
    let k_service = hmac(&k_region, b"s3")?;
    let k_signing = hmac(&k_service, b"aws4_request")?;
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key(),
        scope,
        signed_headers,
        signature
    ))
}

// =============================================================================
// Client
// =============================================================================

/// S3 client bound to one region
#[derive(Clone)]
pub struct S3Client {
    http: ScwHttpClient,
    credentials: Credentials,
    endpoint: String,
    region: Region,
}

impl S3Client {
    pub fn new(
        http: ScwHttpClient,
        credentials: Credentials,
        endpoint_template: Option<&str>,
        region: Region,
    ) -> Self {
        let endpoint = endpoint_template
            .unwrap_or(DEFAULT_ENDPOINT)
            .replace("{region}", region.as_str())
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            credentials,
            endpoint,
            region,
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Signed request against `/{bucket}[/{key}]`
    async fn send(
        &self,
        cancel: &CancellationToken,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Vec<u8>,
        extra_headers: &[(&str, String)],
    ) -> Result<RawResponse> {
        let url = url::Url::parse(&format!("{}{}", self.endpoint, path))
            .map_err(|e| Error::InvalidArgument(format!("invalid object storage URL: {}", e)))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let full_url = if query.is_empty() {
            url.to_string()
        } else {
            format!("{}?{}", url, canonical_query(query))
        };

        let method_str = method.to_string();
        let response = self
            .http
            .execute(cancel, &method, &full_url, |client| {
                // Signed per attempt: the date is part of the signature
                let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
                let payload_hash = sha256_hex(&body);
                let authorization = authorization_header(
                    &self.credentials,
                    &SigningRequest {
                        method: &method_str,
                        host: &host,
                        path,
                        query,
                        payload_hash: &payload_hash,
                        amz_date: &amz_date,
                        region: self.region.as_str(),
                    },
                )?;
                let mut request = client
                    .request(method.clone(), &full_url)
                    .header("x-amz-date", amz_date)
                    .header("x-amz-content-sha256", payload_hash)
                    .header("Authorization", authorization)
                    .body(body.clone());
                for (name, value) in extra_headers {
                    request = request.header(*name, value.as_str());
                }
                Ok(request)
            })
            .await?;

        if !response.status.is_success() {
            let doc: S3ErrorDocument = quick_xml::de::from_str(&response.body).unwrap_or_default();
            return Err(Error::Api(ApiError {
                status: response.status.as_u16(),
                method: method_str,
                url: full_url,
                body: ApiErrorBody {
                    message: doc.message,
                    error_type: doc.code,
                    ..Default::default()
                },
            }));
        }

        Ok(response)
    }

    pub async fn create_bucket(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        acl: Option<&str>,
    ) -> Result<()> {
        tracing::info!("creating bucket {} in {}", bucket, self.region);
        let headers: Vec<(&str, String)> = acl
            .map(|acl| vec![("x-amz-acl", acl.to_string())])
            .unwrap_or_default();
        self.send(cancel, Method::PUT, &format!("/{}", bucket), &[], Vec::new(), &headers)
            .await?;
        Ok(())
    }

    pub async fn head_bucket(&self, cancel: &CancellationToken, bucket: &str) -> Result<()> {
        self.send(cancel, Method::HEAD, &format!("/{}", bucket), &[], Vec::new(), &[])
            .await?;
        Ok(())
    }

    pub async fn delete_bucket(&self, cancel: &CancellationToken, bucket: &str) -> Result<()> {
        tracing::info!("deleting bucket {} in {}", bucket, self.region);
        self.send(cancel, Method::DELETE, &format!("/{}", bucket), &[], Vec::new(), &[])
            .await?;
        Ok(())
    }

    pub async fn put_acl(&self, cancel: &CancellationToken, bucket: &str, acl: &str) -> Result<()> {
        self.send(
            cancel,
            Method::PUT,
            &format!("/{}", bucket),
            &[("acl", String::new())],
            Vec::new(),
            &[("x-amz-acl", acl.to_string())],
        )
        .await?;
        Ok(())
    }

    pub async fn get_versioning(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
    ) -> Result<VersioningConfiguration> {
        let response = self
            .send(
                cancel,
                Method::GET,
                &format!("/{}", bucket),
                &[("versioning", String::new())],
                Vec::new(),
                &[],
            )
            .await?;
        Ok(quick_xml::de::from_str(&response.body).unwrap_or_default())
    }

    pub async fn put_versioning(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        enabled: bool,
    ) -> Result<()> {
        let doc = VersioningConfiguration {
            status: Some(if enabled { "Enabled" } else { "Suspended" }.to_string()),
        };
        let body = quick_xml::se::to_string(&doc)
            .map_err(|e| Error::Other(format!("cannot encode versioning: {}", e)))?;
        self.send(
            cancel,
            Method::PUT,
            &format!("/{}", bucket),
            &[("versioning", String::new())],
            body.into_bytes(),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Bucket tags; a bucket without tags answers `NoSuchTagSet`, mapped to an empty set
    pub async fn get_tagging(&self, cancel: &CancellationToken, bucket: &str) -> Result<Vec<Tag>> {
        let result = self
            .send(
                cancel,
                Method::GET,
                &format!("/{}", bucket),
                &[("tagging", String::new())],
                Vec::new(),
                &[],
            )
            .await;
        match result {
            Ok(response) => {
                let doc: Tagging = quick_xml::de::from_str(&response.body).unwrap_or_default();
                Ok(doc.tag_set.tags)
            }
            Err(Error::Api(err)) if err.body.error_type.as_deref() == Some("NoSuchTagSet") => {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn put_tagging(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        tags: Vec<Tag>,
    ) -> Result<()> {
        if tags.is_empty() {
            self.send(
                cancel,
                Method::DELETE,
                &format!("/{}", bucket),
                &[("tagging", String::new())],
                Vec::new(),
                &[],
            )
            .await?;
            return Ok(());
        }

        let doc = Tagging {
            tag_set: TagSet { tags },
        };
        let body = quick_xml::se::to_string(&doc)
            .map_err(|e| Error::Other(format!("cannot encode tagging: {}", e)))?;
        self.send(
            cancel,
            Method::PUT,
            &format!("/{}", bucket),
            &[("tagging", String::new())],
            body.into_bytes(),
            &[],
        )
        .await?;
        Ok(())
    }

    /// Every object version and delete marker in the bucket
    pub async fn list_all_versions(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
    ) -> Result<Vec<ObjectVersion>> {
        let mut all = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;

        loop {
            let mut query = vec![("versions", String::new())];
            if let Some(marker) = &key_marker {
                query.push(("key-marker", marker.clone()));
            }
            if let Some(marker) = &version_marker {
                query.push(("version-id-marker", marker.clone()));
            }

            let response = self
                .send(cancel, Method::GET, &format!("/{}", bucket), &query, Vec::new(), &[])
                .await?;
            let page = parse_version_listing(&response.body)?;
            all.extend(page.versions);

            if !page.is_truncated {
                break;
            }
            key_marker = page.next_key_marker;
            version_marker = page.next_version_id_marker;
        }

        Ok(all)
    }

    pub async fn delete_object(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        object: &ObjectVersion,
    ) -> Result<()> {
        let query: Vec<(&str, String)> = object
            .version_id
            .as_ref()
            .map(|v| vec![("versionId", v.clone())])
            .unwrap_or_default();
        self.send(
            cancel,
            Method::DELETE,
            &format!("/{}/{}", bucket, object.key),
            &query,
            Vec::new(),
            &[],
        )
        .await?;
        Ok(())
    }
}
