//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with optional exponential
//! backoff retries through `reqwest-retry` and standardized JSON response handling.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// A standardized container for API responses.
///
/// Wraps the deserialized data along with metadata about the HTTP transaction.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// The successfully deserialized response body, if any.
    pub data: Option<T>,
    /// The raw error body returned by the server if the request failed.
    pub error_body: Option<String>,
    /// The numeric HTTP status code.
    pub status: u16,
    /// Indicates if the status code was in the 2xx range.
    pub success: bool,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// Status and body of a request whose payload was sent as raw bytes.
#[derive(Debug)]
pub struct RawResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response body as text, empty if it could not be read.
    pub body: String,
}

/// A flexible asynchronous HTTP client.
///
/// Handles the base URL, bearer authentication, an overall request timeout and,
/// when asked for, automatic retries of transient failures.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a client with the default policy: 3 retries, no timeout.
    pub fn new(base_url: &str, auth_token: Option<String>) -> anyhow::Result<Self> {
        Self::with_options(base_url, auth_token, 3, None)
    }

    /// Creates a client with `max_retries` middleware retries (0 disables the
    /// middleware entirely) and an optional per-request timeout.
    pub fn with_options(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(base_url).with_context(|| format!("invalid base URL '{base_url}'"))?;

        let mut http = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            http = http.timeout(timeout);
        }
        let http = http.build().context("building HTTP client")?;

        let mut builder = ClientBuilder::new(http);
        if max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
            auth_token,
        })
    }

    /// The base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn prepare(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
    ) -> anyhow::Result<reqwest_middleware::RequestBuilder> {
        let full_url = self.base_url.join(path)?;
        let mut req = self.inner.request(method, full_url);
        if let Some(h) = headers {
            req = req.headers(h);
        }
        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        Ok(req)
    }

    /// Performs a JSON request and deserializes a successful response into `T`.
    ///
    /// # Errors
    /// Fails if URL joining, the network exchange or decoding of a 2xx body fails.
    /// Non-2xx responses are returned with `success == false`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        body: Option<B>,
    ) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize,
    {
        let mut req = self.prepare(method, path, headers)?;
        if let Some(b) = body {
            let json_body = serde_json::to_string(&b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let response: reqwest::Response = req.send().await?;
        let status = response.status();
        let resp_headers = response.headers().clone();

        if status.is_success() {
            let data = response.json::<T>().await?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
                headers: resp_headers,
            })
        } else {
            let error_text = response.text().await.ok();
            Ok(ApiResponse {
                data: None,
                error_body: error_text,
                status: status.as_u16(),
                success: false,
                headers: resp_headers,
            })
        }
    }

    /// Sends `body` as-is with the given content type.
    ///
    /// Any failure before a response arrives (bad path, connect error, timeout) is
    /// returned as `reqwest_middleware::Error`, separate from HTTP error statuses.
    pub async fn send_bytes(
        &self,
        method: Method,
        path: &str,
        headers: Option<HeaderMap>,
        content_type: &str,
        body: Vec<u8>,
    ) -> reqwest_middleware::Result<RawResponse> {
        let req = self
            .prepare(method, path, headers)
            .map_err(reqwest_middleware::Error::Middleware)?
            .header(CONTENT_TYPE, content_type)
            .body(body);

        let response = req.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Ok(RawResponse { status, body })
    }
}
