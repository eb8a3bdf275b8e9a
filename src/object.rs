//! Object entity and its HTTP encoding.
//!
//! An [`Object`] travels as a raw body plus headers:
//!
//! | Field         | Header                  |
//! |---------------|-------------------------|
//! | content type  | `Content-Type`          |
//! | vector clock  | `X-Riak-Vclock`         |
//! | etag          | `Etag`                  |
//! | last modified | `Last-Modified`         |
//! | links         | `Link`                  |
//! | user metadata | `X-Riak-Meta-{name}`    |
//! | index tags    | `X-Riak-Index-{name}`   |
//!
//! Header names come back lower-cased from the transport, so metadata and
//! index names are normalized to lower case on both encode and decode.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG, IF_MATCH, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED, LINK, LOCATION,
};
use reqwest::Method;

use crate::bucket::Quorum;
use crate::errors::{Result, RiakError};

pub const VCLOCK_HEADER: &str = "x-riak-vclock";
pub const CLIENT_ID_HEADER: &str = "x-riak-clientid";
const META_PREFIX: &str = "x-riak-meta-";
const INDEX_PREFIX: &str = "x-riak-index-";
const CONTENT_MD5: &str = "content-md5";

/// Characters left unescaped in bucket and key path segments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Bytes inspected when sniffing a content type.
const SNIFF_LEN: usize = 512;

/// A value stored under `bucket/key`, with its causality metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    pub bucket: String,
    /// Empty means "let the server assign one" on store.
    pub key: String,
    pub value: Bytes,
    /// Sniffed from `value` on store when unset.
    pub content_type: Option<String>,
    pub vclock: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub links: Vec<Link>,
    pub metadata: BTreeMap<String, String>,
    /// Index name (with `_bin`/`_int` suffix) to its values.
    pub indexes: BTreeMap<String, BTreeSet<String>>,
}

impl Object {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_vclock(mut self, vclock: impl Into<String>) -> Self {
        self.vclock = Some(vclock.into());
        self
    }

    pub fn with_meta(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name: String = name.into();
        self.metadata.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name: String = name.into();
        self.indexes
            .entry(name.to_ascii_lowercase())
            .or_default()
            .insert(value.into());
        self
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Content type that will be sent: explicit, else sniffed.
    pub fn effective_content_type(&self) -> String {
        match &self.content_type {
            Some(ct) if !ct.trim().is_empty() => ct.clone(),
            _ => detect_content_type(&self.value).to_string(),
        }
    }
}

/// A tagged link from one object to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub bucket: String,
    pub key: String,
    pub tag: String,
}

impl Link {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            tag: tag.into(),
        }
    }

    fn to_header_entry(&self) -> String {
        format!(
            "<{}>; riaktag=\"{}\"",
            object_path(&self.bucket, &self.key),
            self.tag
        )
    }
}

/// Per-request read quorum overrides.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub r: Option<Quorum>,
    pub pr: Option<Quorum>,
}

/// Per-request write quorum overrides and preconditions.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub w: Option<Quorum>,
    pub dw: Option<Quorum>,
    pub pw: Option<Quorum>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
}

/// Per-request delete quorum override.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub rw: Option<Quorum>,
}

impl FetchOptions {
    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        quorum_params([("r", self.r), ("pr", self.pr)])
    }
}

impl DeleteOptions {
    pub(crate) fn query(&self) -> Vec<(&'static str, String)> {
        quorum_params([("rw", self.rw)])
    }
}

fn quorum_params<const N: usize>(
    fields: [(&'static str, Option<Quorum>); N],
) -> Vec<(&'static str, String)> {
    fields
        .into_iter()
        .filter_map(|(name, q)| q.map(|q| (name, q.to_string())))
        .collect()
}

/// A fully built store request, ready for the transport.
#[derive(Debug)]
pub struct StoreRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(&'static str, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

// -- Paths --------------------------------------------------------------------

fn segment(raw: &str) -> String {
    utf8_percent_encode(raw, SEGMENT).to_string()
}

pub fn object_path(bucket: &str, key: &str) -> String {
    format!("/buckets/{}/keys/{}", segment(bucket), segment(key))
}

pub fn keys_path(bucket: &str) -> String {
    format!("/buckets/{}/keys", segment(bucket))
}

pub fn props_path(bucket: &str) -> String {
    format!("/buckets/{}/props", segment(bucket))
}

pub fn counter_path(bucket: &str, key: &str) -> String {
    format!("/buckets/{}/counters/{}", segment(bucket), segment(key))
}

// -- Local validation ---------------------------------------------------------

/// Reject empty bucket or key before touching the network.
pub fn require_location(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() || key.is_empty() {
        return Err(RiakError::validation(format!(
            "both a bucket [{bucket}] and a key [{key}] are required"
        )));
    }
    Ok(())
}

fn validate_index(name: &str, values: &BTreeSet<String>) -> Result<()> {
    if name.ends_with("_bin") {
        return Ok(());
    }
    if name.ends_with("_int") {
        if let Some(bad) = values.iter().find(|v| v.trim().parse::<i64>().is_err()) {
            return Err(RiakError::validation(format!(
                "index {name} requires integer values, got '{bad}'"
            )));
        }
        return Ok(());
    }
    Err(RiakError::validation(format!(
        "index {name} must end with _bin or _int"
    )))
}

// -- Encode -------------------------------------------------------------------

fn header_name(raw: String) -> Result<HeaderName> {
    HeaderName::from_bytes(raw.as_bytes())
        .map_err(|_| RiakError::validation(format!("invalid header name '{raw}'")))
}

fn header_value(raw: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(raw)
        .map_err(|_| RiakError::validation(format!("invalid header value '{raw}'")))
}

/// Base64 MD5 digest of `body`, as sent in `Content-MD5`.
pub fn content_md5(body: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(body);
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the request for storing `object`.
///
/// An empty key becomes a create (`POST` on the key collection); otherwise
/// an upsert (`PUT` at the key). `returnbody=true` is always set so the
/// response carries the stored representation.
pub fn encode_store(object: &Object, opts: &StoreOptions) -> Result<StoreRequest> {
    if object.bucket.is_empty() {
        return Err(RiakError::validation("a bucket is required to store a value"));
    }
    if object.value.is_empty() {
        return Err(RiakError::validation("no value defined for the key"));
    }

    let (method, path) = if object.key.is_empty() {
        (Method::POST, keys_path(&object.bucket))
    } else {
        (Method::PUT, object_path(&object.bucket, &object.key))
    };

    let mut query = vec![("returnbody", "true".to_string())];
    query.extend(quorum_params([
        ("w", opts.w),
        ("dw", opts.dw),
        ("pw", opts.pw),
    ]));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, header_value(&object.effective_content_type())?);
    headers.insert(
        HeaderName::from_static(CONTENT_MD5),
        header_value(&content_md5(&object.value))?,
    );
    if let Some(vclock) = &object.vclock {
        headers.insert(HeaderName::from_static(VCLOCK_HEADER), header_value(vclock)?);
    }
    for (name, value) in &object.metadata {
        headers.insert(header_name(format!("{META_PREFIX}{name}"))?, header_value(value)?);
    }
    for (name, values) in &object.indexes {
        validate_index(name, values)?;
        let joined = values.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
        headers.insert(header_name(format!("{INDEX_PREFIX}{name}"))?, header_value(&joined)?);
    }
    if !object.links.is_empty() {
        let joined = object
            .links
            .iter()
            .map(Link::to_header_entry)
            .collect::<Vec<_>>()
            .join(", ");
        headers.insert(LINK, header_value(&joined)?);
    }
    if let Some(etag) = &opts.if_match {
        headers.insert(IF_MATCH, header_value(etag)?);
    }
    if let Some(etag) = &opts.if_none_match {
        headers.insert(IF_NONE_MATCH, header_value(etag)?);
    }
    if let Some(t) = opts.if_modified_since {
        headers.insert(IF_MODIFIED_SINCE, header_value(&httpdate::fmt_http_date(t))?);
    }
    if let Some(t) = opts.if_unmodified_since {
        headers.insert(IF_UNMODIFIED_SINCE, header_value(&httpdate::fmt_http_date(t))?);
    }

    Ok(StoreRequest {
        method,
        path,
        query,
        headers,
        body: object.value.clone(),
    })
}

// -- Decode -------------------------------------------------------------------

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Decode a response into an [`Object`] at `bucket/key`.
pub fn decode_object(bucket: &str, key: &str, headers: &HeaderMap, body: Bytes) -> Object {
    let mut metadata = BTreeMap::new();
    let mut indexes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let name = name.as_str();
        if let Some(meta) = name.strip_prefix(META_PREFIX) {
            metadata.insert(meta.to_string(), value.trim().to_string());
        } else if let Some(index) = name.strip_prefix(INDEX_PREFIX) {
            let entry = indexes.entry(index.to_string()).or_default();
            entry.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
        }
    }

    Object {
        bucket: bucket.to_string(),
        key: key.to_string(),
        value: body,
        content_type: header_str(headers, CONTENT_TYPE.as_str()).map(str::to_string),
        vclock: header_str(headers, VCLOCK_HEADER).map(str::to_string),
        etag: header_str(headers, ETAG.as_str()).map(str::to_string),
        last_modified: header_str(headers, LAST_MODIFIED.as_str())
            .and_then(|v| httpdate::parse_http_date(v).ok()),
        links: header_str(headers, LINK.as_str())
            .map(parse_links)
            .unwrap_or_default(),
        metadata,
        indexes,
    }
}

/// Key assigned by the server on create, taken from `Location`.
pub fn key_from_location(headers: &HeaderMap) -> Option<String> {
    let location = header_str(headers, LOCATION.as_str())?;
    let path = location.split('?').next()?;
    let last = path.rsplit('/').next()?;
    if last.is_empty() {
        return None;
    }
    Some(percent_decode_str(last).decode_utf8_lossy().into_owned())
}

/// Parse a `Link` header, keeping only tagged links to keys.
///
/// `</buckets/b/keys/k>; riaktag="friend", </buckets/b>; rel="up"` yields a
/// single link to `b/k` tagged `friend`.
pub fn parse_links(raw: &str) -> Vec<Link> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (target, params) = entry.strip_prefix('<')?.split_once('>')?;
            let tag = params.split(';').find_map(|p| {
                let (name, value) = p.trim().split_once('=')?;
                (name.trim() == "riaktag").then(|| value.trim().trim_matches('"').to_string())
            })?;
            let segments: Vec<&str> = target.trim_matches('/').split('/').collect();
            match segments.as_slice() {
                ["buckets", bucket, "keys", key] | ["riak", bucket, key] => Some(Link {
                    bucket: percent_decode_str(bucket).decode_utf8_lossy().into_owned(),
                    key: percent_decode_str(key).decode_utf8_lossy().into_owned(),
                    tag,
                }),
                _ => None,
            }
        })
        .collect()
}

/// Sibling vtags listed in a `300 Multiple Choices` body.
pub fn parse_siblings(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case("siblings:"))
        .map(str::to_string)
        .collect()
}

// -- Content sniffing ---------------------------------------------------------

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const MAGIC: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"BM", "image/bmp"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
];

fn html_tag_at(data: &[u8], tag: &[u8]) -> bool {
    if data.len() < tag.len() + 1 {
        return false;
    }
    let (head, rest) = data.split_at(tag.len());
    if !head.eq_ignore_ascii_case(tag) {
        return false;
    }
    // Comments need no terminator; element tags end in a space or '>'.
    tag == b"<!--" || matches!(rest[0], b' ' | b'>')
}

/// Best-effort content type for raw bytes.
///
/// Recognizes HTML/XML prefixes, common binary magic numbers and byte order
/// marks; otherwise answers plain text unless control bytes are present.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let trimmed = {
        let start = data
            .iter()
            .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0C' | b'\r' | b' '))
            .unwrap_or(data.len());
        &data[start..]
    };
    if HTML_TAGS.iter().any(|tag| html_tag_at(trimmed, tag)) {
        return "text/html; charset=utf-8";
    }
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if let Some((_, ct)) = MAGIC.iter().find(|(magic, _)| data.starts_with(magic)) {
        return *ct;
    }

    let binary = data
        .iter()
        .any(|&b| b <= 0x08 || b == 0x0B || (0x0E..=0x1A).contains(&b) || (0x1C..=0x1F).contains(&b));
    if binary {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}
