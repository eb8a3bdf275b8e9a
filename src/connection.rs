//! A single cluster node: address, transport, liveness flag and counters.
//!
//! Every protocol operation is one explicit method. Each method validates
//! its input locally, issues exactly one HTTP request, and translates the
//! status code into [`RiakError`].
//!
//! Liveness rules:
//! - a failed [`Connection::ping`] marks the node Dead;
//! - a transport failure during any operation marks the node Dead;
//! - a request that merely times out leaves the flag untouched;
//! - only a health-monitor probe brings a Dead node back.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, warn};

use crate::bucket::{BucketProperties, Counter, PropsEnvelope};
use crate::errors::{Result, RiakError};
use crate::metrics;
use crate::object::{
    counter_path, decode_object, encode_store, key_from_location, keys_path, object_path,
    parse_siblings, props_path, require_location, DeleteOptions, FetchOptions, Object,
    StoreOptions, CLIENT_ID_HEADER,
};
use crate::resources::{BucketList, KeyList, NodeStatus, Resources};
use crate::stats::{OpKind, Stats};

const JSON: &str = "application/json";

/// Connection to one node of the cluster.
#[derive(Debug)]
pub struct Connection {
    address: String,
    base: String,
    client: reqwest::Client,
    client_id: String,
    alive: AtomicBool,
    stats: Stats,
}

impl Connection {
    /// Build a connection for `address` (`host:port` or a full URL).
    ///
    /// `request_timeout` bounds every request issued on this connection.
    pub fn new(address: &str, request_timeout: Duration) -> Result<Self> {
        let address = address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(RiakError::Config("node address must not be empty".into()));
        }
        let base = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        reqwest::Url::parse(&base)
            .map_err(|e| RiakError::Config(format!("invalid node address '{address}': {e}")))?;

        let client_id = uuid::Uuid::new_v4().to_string();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(CLIENT_ID_HEADER),
            HeaderValue::from_str(&client_id)
                .map_err(|e| RiakError::Config(format!("invalid client id: {e}")))?,
        );
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RiakError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            address: address.to_string(),
            base,
            client,
            client_id,
            alive: AtomicBool::new(true),
            stats: Stats::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Value sent in `X-Riak-ClientId` on every request.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Flag the node Dead. Returns whether it was Alive before.
    pub(crate) fn mark_dead(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            warn!("Node {} marked dead", self.address);
        }
        was_alive
    }

    /// Flag the node Alive. Returns whether it was Dead before.
    pub(crate) fn mark_alive(&self) -> bool {
        let was_dead = !self.alive.swap(true, Ordering::AcqRel);
        if was_dead {
            info!("Node {} is alive again", self.address);
        }
        was_dead
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    // -- Request plumbing -----------------------------------------------------

    /// Count, time and log one operation.
    async fn observe<T, F>(&self, kind: OpKind, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        self.stats.record(kind);
        let result = fut.await;
        let outcome = metrics::outcome(&result);
        if result.is_err() {
            self.stats.record_error(kind);
        }
        metrics::record_request(operation, outcome, start.elapsed());
        debug!(
            "{} {} on {} -> {} in {:?}",
            kind.as_str(),
            operation,
            self.address,
            outcome,
            start.elapsed()
        );
        result
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))
    }

    async fn read_body(&self, operation: &'static str, response: Response) -> Result<Bytes> {
        response
            .bytes()
            .await
            .map_err(|e| self.transport_error(operation, e))
    }

    fn transport_error(&self, operation: &'static str, err: reqwest::Error) -> RiakError {
        if err.is_timeout() {
            return RiakError::Timeout {
                operation: operation.to_string(),
            };
        }
        self.mark_dead();
        RiakError::Network {
            address: self.address.clone(),
            message: err.to_string(),
        }
    }

    async fn status_error(
        &self,
        operation: &'static str,
        response: Response,
        bucket: &str,
        key: &str,
    ) -> RiakError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        RiakError::from_status(operation, status, bucket, key, &body)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .send(
                operation,
                self.client.get(self.url(path)).query(query).header(ACCEPT, JSON),
            )
            .await?;
        if !response.status().is_success() {
            return Err(self.status_error(operation, response, "", "").await);
        }
        let body = self.read_body(operation, response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    // -- Liveness -------------------------------------------------------------

    /// Issue a health check. Failure of any kind marks the node Dead.
    pub async fn ping(&self) -> Result<()> {
        let result = self
            .observe(OpKind::Ping, "ping", async {
                let response = self.send("ping", self.client.get(self.url("/ping"))).await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(self.status_error("ping", response, "", "").await)
                }
            })
            .await;
        if result.is_err() {
            self.mark_dead();
        }
        result
    }

    /// Ping and update liveness in both directions.
    pub(crate) async fn probe(&self) -> Result<()> {
        self.ping().await?;
        self.mark_alive();
        Ok(())
    }

    // -- Objects --------------------------------------------------------------

    pub async fn fetch(&self, bucket: &str, key: &str) -> Result<Object> {
        self.fetch_with(bucket, key, &FetchOptions::default()).await
    }

    /// Read `bucket/key` with per-request quorum overrides.
    pub async fn fetch_with(&self, bucket: &str, key: &str, opts: &FetchOptions) -> Result<Object> {
        require_location(bucket, key)?;
        self.observe(OpKind::Get, "fetch", async {
            let request = self
                .client
                .get(self.url(&object_path(bucket, key)))
                .query(&opts.query());
            let response = self.send("fetch", request).await?;
            match response.status() {
                status if status.is_success() => {
                    let headers = response.headers().clone();
                    let body = self.read_body("fetch", response).await?;
                    Ok(decode_object(bucket, key, &headers, body))
                }
                StatusCode::MULTIPLE_CHOICES => {
                    let body = response.text().await.unwrap_or_default();
                    Err(RiakError::Siblings {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        vtags: parse_siblings(&body),
                    })
                }
                _ => Err(self.status_error("fetch", response, bucket, key).await),
            }
        })
        .await
    }

    pub async fn store(&self, object: &Object) -> Result<Object> {
        self.store_with(object, &StoreOptions::default()).await
    }

    /// Create (empty key) or upsert `object` and return what was stored.
    pub async fn store_with(&self, object: &Object, opts: &StoreOptions) -> Result<Object> {
        let request = encode_store(object, opts)?;
        let kind = if request.method == Method::POST {
            OpKind::Post
        } else {
            OpKind::Put
        };
        self.observe(kind, "store", async {
            let builder = self
                .client
                .request(request.method, self.url(&request.path))
                .query(&request.query)
                .headers(request.headers)
                .body(request.body);
            let response = self.send("store", builder).await?;
            let status = response.status();
            if status == StatusCode::MULTIPLE_CHOICES {
                let body = response.text().await.unwrap_or_default();
                return Err(RiakError::Siblings {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                    vtags: parse_siblings(&body),
                });
            }
            if !status.is_success() {
                return Err(self
                    .status_error("store", response, &object.bucket, &object.key)
                    .await);
            }

            let key = if object.key.is_empty() {
                key_from_location(response.headers()).ok_or_else(|| {
                    RiakError::Decode("create response carried no Location header".into())
                })?
            } else {
                object.key.clone()
            };
            let headers = response.headers().clone();
            let body = self.read_body("store", response).await?;
            let mut stored = decode_object(&object.bucket, &key, &headers, body);
            if status == StatusCode::NO_CONTENT || stored.value.is_empty() {
                stored.value = object.value.clone();
                stored.links = object.links.clone();
                stored.metadata = object.metadata.clone();
                stored.indexes = object.indexes.clone();
            }
            if stored.content_type.is_none() {
                stored.content_type = Some(object.effective_content_type());
            }
            Ok(stored)
        })
        .await
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.delete_with(bucket, key, &DeleteOptions::default()).await
    }

    /// Delete `bucket/key`. A missing key is not an error.
    pub async fn delete_with(&self, bucket: &str, key: &str, opts: &DeleteOptions) -> Result<()> {
        require_location(bucket, key)?;
        self.observe(OpKind::Delete, "delete", async {
            let request = self
                .client
                .delete(self.url(&object_path(bucket, key)))
                .query(&opts.query());
            let response = self.send("delete", request).await?;
            match response.status() {
                status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
                _ => Err(self.status_error("delete", response, bucket, key).await),
            }
        })
        .await
    }

    // -- Bucket properties ----------------------------------------------------

    pub async fn get_bucket_properties(&self, bucket: &str) -> Result<BucketProperties> {
        require_bucket(bucket)?;
        self.observe(OpKind::Get, "get_bucket_properties", async {
            let envelope: PropsEnvelope = self
                .get_json("get_bucket_properties", &props_path(bucket), &[])
                .await?;
            Ok(envelope.props)
        })
        .await
    }

    /// Replace the bucket's properties after validating every field.
    pub async fn set_bucket_properties(&self, bucket: &str, props: &BucketProperties) -> Result<()> {
        require_bucket(bucket)?;
        props.validate()?;
        let body = serde_json::to_vec(&PropsEnvelope {
            props: props.clone(),
        })?;
        self.observe(OpKind::Put, "set_bucket_properties", async {
            let request = self
                .client
                .put(self.url(&props_path(bucket)))
                .header(CONTENT_TYPE, JSON)
                .body(body);
            let response = self.send("set_bucket_properties", request).await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(self
                    .status_error("set_bucket_properties", response, bucket, "")
                    .await)
            }
        })
        .await
    }

    /// Restore the bucket's properties to the cluster defaults.
    pub async fn reset_bucket_properties(&self, bucket: &str) -> Result<()> {
        require_bucket(bucket)?;
        self.observe(OpKind::Delete, "reset_bucket_properties", async {
            let request = self.client.delete(self.url(&props_path(bucket)));
            let response = self.send("reset_bucket_properties", request).await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(self
                    .status_error("reset_bucket_properties", response, bucket, "")
                    .await)
            }
        })
        .await
    }

    // -- Counters -------------------------------------------------------------

    async fn require_allow_mult(&self, bucket: &str) -> Result<()> {
        if self.get_bucket_properties(bucket).await?.allow_mult {
            Ok(())
        } else {
            Err(RiakError::validation(format!(
                "counters require allow_mult=true on bucket {bucket}"
            )))
        }
    }

    /// Add `delta` (possibly negative) to a counter.
    pub async fn update_counter(&self, bucket: &str, key: &str, delta: i64) -> Result<()> {
        require_location(bucket, key)?;
        self.require_allow_mult(bucket).await?;
        self.observe(OpKind::Post, "update_counter", async {
            let request = self
                .client
                .post(self.url(&counter_path(bucket, key)))
                .header(CONTENT_TYPE, "text/plain")
                .body(delta.to_string());
            let response = self.send("update_counter", request).await?;
            match response.status() {
                status if status.is_success() => Ok(()),
                StatusCode::CONFLICT => Err(RiakError::validation(
                    response.text().await.unwrap_or_default().trim(),
                )),
                _ => Err(self.status_error("update_counter", response, bucket, key).await),
            }
        })
        .await
    }

    pub async fn get_counter(&self, bucket: &str, key: &str) -> Result<Counter> {
        require_location(bucket, key)?;
        self.require_allow_mult(bucket).await?;
        self.observe(OpKind::Get, "get_counter", async {
            let request = self.client.get(self.url(&counter_path(bucket, key)));
            let response = self.send("get_counter", request).await?;
            match response.status() {
                status if status.is_success() => {
                    let body = self.read_body("get_counter", response).await?;
                    let text = String::from_utf8_lossy(&body);
                    let value = text.trim().parse::<i64>().map_err(|_| {
                        RiakError::Decode(format!("counter value '{}' is not an integer", text.trim()))
                    })?;
                    Ok(Counter {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        value,
                    })
                }
                StatusCode::CONFLICT => Err(RiakError::validation(
                    response.text().await.unwrap_or_default().trim(),
                )),
                _ => Err(self.status_error("get_counter", response, bucket, key).await),
            }
        })
        .await
    }

    // -- Node resources -------------------------------------------------------

    /// Node performance and configuration report from `/stats`.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.observe(OpKind::Get, "status", async {
            match self.get_json::<NodeStatus>("status", "/stats", &[]).await {
                Err(RiakError::NotFound { .. }) => {
                    Err(RiakError::validation("stats endpoint not enabled"))
                }
                other => other,
            }
        })
        .await
    }

    /// Resource paths the node advertises.
    pub async fn list_resources(&self) -> Result<Resources> {
        self.observe(OpKind::Get, "list_resources", self.get_json("list_resources", "/", &[]))
            .await
    }

    /// Every bucket in the cluster. Expensive on real clusters.
    pub async fn list_buckets(&self) -> Result<Vec<String>> {
        self.observe(OpKind::Get, "list_buckets", async {
            let list: BucketList = self
                .get_json("list_buckets", "/buckets", &[("buckets", "true")])
                .await?;
            Ok(list.buckets)
        })
        .await
    }

    /// Every key in `bucket`. Walks the whole keyspace; not for production.
    pub async fn list_keys(&self, bucket: &str) -> Result<Vec<String>> {
        require_bucket(bucket)?;
        self.observe(OpKind::Get, "list_keys", async {
            let list: KeyList = self
                .get_json("list_keys", &keys_path(bucket), &[("keys", "true")])
                .await?;
            Ok(list.keys)
        })
        .await
    }
}

fn require_bucket(bucket: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(RiakError::validation("a bucket name is required"));
    }
    Ok(())
}
