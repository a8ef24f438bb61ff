//! # HTTP Batch Sink
//!
//! Delivers each batch as one request whose body is the JSON array of the batch
//! payloads, in sequence order. Only a 2xx response counts as delivered.
//!
//! Classification:
//! - no response (connect error, timeout, reset) is transient;
//! - 408, 425, 429 and 5xx are transient;
//! - every other status is permanent.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::configs::DownstreamConfig;
use crate::core::envelope::Batch;
use crate::core::errors::DeliveryError;
use crate::core::sink::BatchSink;
use crate::retrieve::ky_http::ApiClient;

const SEQUENCE_RANGE_HEADER: &str = "x-batch-sequence-range";
const MAX_ERROR_BODY: usize = 512;

/// `BatchSink` backed by an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpBatchSink {
    client: ApiClient,
    method: Method,
    headers: HeaderMap,
}

impl HttpBatchSink {
    /// Builds a sink for `uri`. The client never retries on its own.
    pub fn new(
        uri: &str,
        method: Method,
        headers: impl IntoIterator<Item = (String, String)>,
        bearer_token: Option<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name '{name}'"))?;
            let value = HeaderValue::from_str(&value)
                .with_context(|| format!("invalid value for header '{name}'"))?;
            map.insert(header, value);
        }

        Ok(Self {
            client: ApiClient::with_options(uri, bearer_token, 0, Some(request_timeout))?,
            method,
            headers: map,
        })
    }

    /// Builds a sink from the validated downstream settings.
    pub fn from_config(config: &DownstreamConfig) -> anyhow::Result<Self> {
        Self::new(
            config.uri.as_str(),
            config.method.clone(),
            config.headers.clone(),
            config.bearer_token.clone(),
            config.request_timeout,
        )
    }

    /// The endpoint batches are sent to.
    pub fn endpoint(&self) -> &str {
        self.client.base_url().as_str()
    }
}

impl BatchSink for HttpBatchSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let mut headers = self.headers.clone();
        let range = format!("{}-{}", batch.first_sequence(), batch.last_sequence());
        if let Ok(value) = HeaderValue::from_str(&range) {
            headers.insert(HeaderName::from_static(SEQUENCE_RANGE_HEADER), value);
        }

        let response = self
            .client
            .send_bytes(self.method.clone(), "", Some(headers), "application/json", batch.to_json_body())
            .await
            .map_err(|e| {
                let unsendable = matches!(&e, reqwest_middleware::Error::Reqwest(inner) if inner.is_builder());
                if unsendable {
                    DeliveryError::permanent(e)
                } else {
                    DeliveryError::transient(e)
                }
            })?;

        if response.status.is_success() {
            log::trace!(
                "Sink accepted batch {} ({} envelopes) with {}",
                range,
                batch.len(),
                response.status
            );
            return Ok(());
        }

        let mut body = response.body;
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        let reason = if body.is_empty() {
            response.status.canonical_reason().unwrap_or("no reason").to_string()
        } else {
            body
        };
        Err(DeliveryError::from_status(response.status.as_u16(), reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::MessageEnvelope;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(AxumHeaders, Bytes)>>>;

    async fn serve(status: StatusCode) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/ingest",
                post(move |State(seen): State<Seen>, headers: AxumHeaders, body: Bytes| async move {
                    seen.lock().unwrap().push((headers, body));
                    (status, "sink says so")
                }),
            )
            .with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/ingest"), seen)
    }

    fn batch() -> Batch {
        Batch::from_envelopes(vec![
            MessageEnvelope::new(7, r#"{"price":1}"#),
            MessageEnvelope::new(8, r#"{"price":2}"#),
        ])
        .unwrap()
    }

    fn sink(uri: &str, token: Option<&str>) -> HttpBatchSink {
        HttpBatchSink::new(
            uri,
            Method::POST,
            vec![("x-source".to_string(), "feed-a".to_string())],
            token.map(str::to_string),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_the_batch_as_a_json_array() {
        let (uri, seen) = serve(StatusCode::OK).await;
        sink(&uri, Some("s3cret")).deliver(&batch()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(&body[..], br#"[{"price":1},{"price":2}]"#);
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(headers["authorization"], "Bearer s3cret");
        assert_eq!(headers["x-source"], "feed-a");
        assert_eq!(headers[SEQUENCE_RANGE_HEADER], "7-8");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let (uri, _) = serve(StatusCode::SERVICE_UNAVAILABLE).await;
        let err = sink(&uri, None).deliver(&batch()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn validation_errors_are_permanent() {
        let (uri, _) = serve(StatusCode::UNPROCESSABLE_ENTITY).await;
        let err = sink(&uri, None).deliver(&batch()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("sink says so"));
    }

    #[tokio::test]
    async fn unreachable_sink_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = sink(&format!("http://{addr}/ingest"), None)
            .deliver(&batch())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn rejects_bad_headers() {
        let result = HttpBatchSink::new(
            "http://127.0.0.1:1/",
            Method::POST,
            vec![("bad header".to_string(), "v".to_string())],
            None,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
