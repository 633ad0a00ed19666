//! Transport boundary for all REST I/O.
//!
//! The core only needs "send a request, get status, headers and body back".
//! Authentication, user agent and timeouts belong to the transport.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};

use crate::config::GitHubConfig;
use crate::error::{DormantError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
        }
    }
}

/// Header name/value pairs; lookups are case-insensitive.
pub type HttpHeaders = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn header_get<'a>(headers: &'a HttpHeaders, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Pre-authenticated request capability.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Transport backed by a shared `reqwest::Client` carrying the token.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &GitHubConfig, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| DormantError::ConfigError(format!("Invalid token: {}", e)))?,
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| DormantError::ConfigError(format!("Invalid user agent: {}", e)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let mut builder = self.client.request(method, &request.url);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) use mock::MockTransport;

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    type Reply = std::result::Result<HttpResponse, String>;

    /// In-memory transport for unit tests.
    ///
    /// Replies registered for a method + URL are served in FIFO order; the
    /// last one keeps being served once the queue is down to it.
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        inner: Arc<Mutex<MockState>>,
    }

    #[derive(Default)]
    struct MockState {
        routes: HashMap<(HttpMethod, String), VecDeque<Reply>>,
        requests: Vec<HttpRequest>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn push_response(
            &self,
            method: HttpMethod,
            url: impl Into<String>,
            response: HttpResponse,
        ) {
            self.push(method, url.into(), Ok(response));
        }

        pub(crate) fn push_error(&self, method: HttpMethod, url: impl Into<String>, message: &str) {
            self.push(method, url.into(), Err(message.to_string()));
        }

        fn push(&self, method: HttpMethod, url: String, reply: Reply) {
            let mut state = self.inner.lock().expect("mock transport lock poisoned");
            state.routes.entry((method, url)).or_default().push_back(reply);
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.inner
                .lock()
                .expect("mock transport lock poisoned")
                .requests
                .clone()
        }

        pub(crate) fn count(&self, method: HttpMethod, url: &str) -> usize {
            self.requests()
                .iter()
                .filter(|r| r.method == method && r.url == url)
                .count()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
            let mut state = self.inner.lock().expect("mock transport lock poisoned");
            let key = (request.method, request.url.clone());
            state.requests.push(request);

            let reply = match state.routes.get_mut(&key) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };

            match reply {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(DormantError::Transport(message)),
                None => Err(DormantError::Transport(format!(
                    "no mock response registered for {} {}",
                    key.0.as_str(),
                    key.1
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(200, "[]")
            .with_header("Link", "<https://x/?page=2>; rel=\"next\"")
            .with_header("link", "ignored");
        assert_eq!(response.header("LINK"), Some("<https://x/?page=2>; rel=\"next\""));
        assert_eq!(response.header("retry-after"), None);
    }

    #[tokio::test]
    async fn test_mock_transport_serves_fifo_then_sticky() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/x";
        transport.push_response(HttpMethod::Get, url, HttpResponse::new(502, "bad gateway"));
        transport.push_response(HttpMethod::Get, url, HttpResponse::new(200, "ok"));

        let request = HttpRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            body: None,
        };
        let first = transport.request(request.clone()).await.unwrap();
        let second = transport.request(request.clone()).await.unwrap();
        let third = transport.request(request.clone()).await.unwrap();

        assert_eq!(first.status, 502);
        assert_eq!(second.status, 200);
        assert_eq!(third.status, 200);
        assert_eq!(transport.count(HttpMethod::Get, url), 3);
    }

    #[tokio::test]
    async fn test_mock_transport_errors_for_unknown_route() {
        let transport = MockTransport::new();
        let err = transport
            .request(HttpRequest {
                method: HttpMethod::Head,
                url: "https://api.example.com/missing".to_string(),
                body: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DormantError::Transport(_)));
    }
}
