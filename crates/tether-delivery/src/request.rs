//! Outbound requests waiting in the delivery queue.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::DeliveryError;

/// Priority given to requests that do not ask for one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// HTTP verbs the management plane accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Whether a JSON body is sent with this verb.
    pub fn carries_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Payload of an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// One queued delivery attempt.
///
/// Lower `priority` values are more urgent. `due` is the earliest instant the
/// request may be sent; `expiry`, when set, is the instant after which it is
/// dropped unsent. `retries_left` is stamped by the queue on first enqueue
/// and only ever decreases.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: Uuid,
    pub priority: i32,
    pub method: Method,
    pub path: String,
    pub body: Option<RequestBody>,
    pub due: Instant,
    pub expiry: Option<Instant>,
    pub retries_left: u32,
    /// Per-call timeout; the pool default applies when `None`.
    pub timeout: Option<Duration>,
}

impl PendingRequest {
    /// A request due now, with default priority and no body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority: DEFAULT_PRIORITY,
            method,
            path: path.into(),
            body: None,
            due: Instant::now(),
            expiry: None,
            retries_left: 0,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, DeliveryError> {
        self.body = Some(RequestBody::Json(serde_json::to_value(body)?));
        Ok(self)
    }

    pub fn with_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(RequestBody::Bytes(body.into()));
        self
    }

    pub fn with_due(mut self, due: Instant) -> Self {
        self.due = due;
        self
    }

    /// Drop the request unsent if it is still queued after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expiry = Some(Instant::now() + ttl);
        self
    }

    pub fn with_expiry(mut self, expiry: Instant) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.due <= now
    }
}
