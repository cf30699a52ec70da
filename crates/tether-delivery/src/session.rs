//! Authenticated HTTP session against the management plane.
//!
//! A [`Session`] is built once from the server configuration and then shared
//! read-only by every reporter worker. The [`Transport`] trait is the seam
//! the reporter pool talks to, so the pool can be driven by something other
//! than a live HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use tether_types::ServerConfig;
use tracing::debug;
use url::Url;

use crate::request::{PendingRequest, RequestBody};
use crate::DeliveryError;

/// `User-Agent` sent with every request.
pub const AGENT_USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

/// Something that can deliver a [`PendingRequest`].
///
/// Implementations return the HTTP status on a 2xx response and an error for
/// anything else, including non-2xx statuses.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &PendingRequest, timeout: Duration)
        -> Result<u16, DeliveryError>;
}

/// Render the `Authorization` header value used by the management plane.
pub fn authorization_value(id: &str, key: &str) -> String {
    format!(r#"id="{id}", key="{key}""#)
}

/// HTTP client bound to one management plane and one set of credentials.
pub struct Session {
    client: Client,
    base_url: String,
}

impl Session {
    /// Build a session from the server section of the agent config.
    pub fn new(config: &ServerConfig) -> Result<Self, DeliveryError> {
        let parsed = Url::parse(&config.url).map_err(|e| DeliveryError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        let mut auth = HeaderValue::from_str(&authorization_value(&config.id, &config.key))
            .map_err(|_| DeliveryError::InvalidHeader)?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(USER_AGENT, HeaderValue::from_static(AGENT_USER_AGENT));

        let mut builder = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_certificate);

        if let Some(path) = &config.ca_certificate {
            let pem = std::fs::read(path).map_err(|e| DeliveryError::Certificate {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let cert =
                reqwest::Certificate::from_pem(&pem).map_err(|e| DeliveryError::Certificate {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().map_err(DeliveryError::ClientBuild)?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an API path.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for Session {
    async fn send(
        &self,
        request: &PendingRequest,
        timeout: Duration,
    ) -> Result<u16, DeliveryError> {
        let url = self.url_for(&request.path);
        let mut builder = self
            .client
            .request(request.method.into(), &url)
            .timeout(timeout);

        if request.method.carries_body() {
            builder = match &request.body {
                Some(RequestBody::Json(value)) => builder.json(value),
                Some(RequestBody::Bytes(bytes)) => builder
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(bytes.clone()),
                None => builder,
            };
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(timeout)
            } else {
                DeliveryError::Http(e)
            }
        })?;

        let status = resp.status();
        debug!(method = %request.method, %url, status = status.as_u16(), "request completed");
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}
