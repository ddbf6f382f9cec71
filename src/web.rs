//! HTTP carrier abstraction.
//!
//! The protocol machinery never talks to the network directly; everything
//! goes through a [`WebClient`]. This keeps the core testable against an
//! in-process server and lets hosts swap in whatever HTTP stack their
//! platform provides.

use std::time::Duration;

use async_trait::async_trait;
use serde::de;

/// User agent sent on every outbound request.
pub(crate) const USER_AGENT: &str = concat!("acme-keeper/", env!("CARGO_PKG_VERSION"));

/// Request method. Only the verbs the ACME flow needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        HttpRequest {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn post(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        HttpRequest {
            method: Method::Post,
            url: url.into(),
            headers: vec![("content-type".to_owned(), content_type.to_owned())],
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }
}

/// A fully-buffered HTTP response.
///
/// Header lookup is case-insensitive; the two headers the protocol reads are
/// `Replay-Nonce` and `Location`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns the first header with the given name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The media type of the body, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: de::DeserializeOwned>(&self) -> eyre::Result<T> {
        log::debug!("{}", self.body_str());
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport-level failure, before any HTTP status is available.
#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl WebError {
    /// Failures that are expected to clear up on their own (DNS hiccups,
    /// connection resets, timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(self, WebError::Timeout(_) | WebError::Connect(_))
    }
}

/// An interface for carrying HTTP requests to the CA.
#[async_trait]
pub trait WebClient: Send + Sync {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, WebError>;
}

/// [`WebClient`] backed by [`reqwest`].
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(ReqwestClient { client })
    }
}

#[async_trait]
impl WebClient for ReqwestClient {
    async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, WebError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if request.method == Method::Post {
            builder = builder.body(request.body);
        }

        let res = builder.send().await.map_err(classify)?;

        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_owned(), v.to_owned()))
            })
            .collect();

        // Let's Encrypt sometimes closes the TLS session abruptly; treat a
        // truncated body read as transport failure so it is retried.
        let body = res.bytes().await.map_err(classify)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> WebError {
    if err.is_timeout() {
        WebError::Timeout(err.to_string())
    } else if err.is_connect() {
        WebError::Connect(err.to_string())
    } else {
        WebError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let res = HttpResponse {
            status: 200,
            headers: vec![("Replay-Nonce".to_owned(), "abc".to_owned())],
            body: Vec::new(),
        };

        assert_eq!(res.header("replay-nonce"), Some("abc"));
        assert_eq!(res.header("REPLAY-NONCE"), Some("abc"));
        assert_eq!(res.header("location"), None);
    }

    #[test]
    fn test_content_type_strips_parameters() {
        let res = HttpResponse {
            status: 200,
            headers: vec![(
                "content-type".to_owned(),
                "application/problem+json; charset=utf-8".to_owned(),
            )],
            body: Vec::new(),
        };

        assert_eq!(res.content_type(), Some("application/problem+json"));
    }
}
