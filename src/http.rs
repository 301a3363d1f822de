use crate::context::FetchContext;
use crate::error::FetchError;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

pub const USER_AGENT: &str = concat!("usage-bar/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `application/x-www-form-urlencoded` POST
    pub fn post_form(url: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )],
            body: Some(body),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::invalid_response(e.to_string()))
    }

    /// Decoded payload for 2xx, `None` otherwise; the body of an error status is ignored.
    pub fn into_payload<T: DeserializeOwned>(self) -> Result<(StatusCode, Option<T>), FetchError> {
        if !self.status.is_success() {
            return Ok((self.status, None));
        }
        let payload = self.json()?;
        Ok((self.status, Some(payload)))
    }
}

/// 401 and 403 mean the credentials were rejected and a refresh is worth trying.
pub fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Sends requests on behalf of the providers. Injected at construction so tests
/// can script responses without touching the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Only connection-level failures are errors; any HTTP status is a response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Send within `ctx`, so cancellation and deadlines interrupt the request.
pub async fn send(
    ctx: &FetchContext,
    transport: &dyn HttpTransport,
    request: HttpRequest,
) -> Result<HttpResponse, FetchError> {
    ctx.run(transport.send(request)).await?
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| FetchError::transport(format!("invalid URL {}: {}", request.url, e)))?;

        let mut builder = self.client.request(request.method.clone(), url);
        if request.header_value("User-Agent").is_none() {
            builder = builder.header("User-Agent", USER_AGENT);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        debug!(method = %request.method, url = %request.url, %status, "response received");
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Reply {
        Response(u16, String),
        Error(FetchError),
        Hang,
    }

    /// Scripted transport: replies are queued per `METHOD url` and consumed in order.
    #[derive(Default)]
    pub struct FakeTransport {
        routes: Mutex<HashMap<String, VecDeque<Reply>>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    fn route_key(method: &Method, url: &str) -> String {
        format!("{} {}", method, url)
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(self, method: Method, url: &str, reply: Reply) -> Self {
            self.routes
                .lock()
                .unwrap()
                .entry(route_key(&method, url))
                .or_default()
                .push_back(reply);
            self
        }

        pub fn reply(self, method: Method, url: &str, status: u16, body: &str) -> Self {
            self.push(method, url, Reply::Response(status, body.to_string()))
        }

        pub fn fail(self, method: Method, url: &str, error: FetchError) -> Self {
            self.push(method, url, Reply::Error(error))
        }

        pub fn hang(self, method: Method, url: &str) -> Self {
            self.push(method, url, Reply::Hang)
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn calls(&self, method: Method, url: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method == method && r.url == url)
                .count()
        }

        pub fn total_calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpTransport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
            let key = route_key(&request.method, &request.url);
            self.requests.lock().unwrap().push(request);
            let reply = self
                .routes
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(VecDeque::pop_front);

            match reply {
                Some(Reply::Response(status, body)) => Ok(HttpResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    body: body.into_bytes(),
                }),
                Some(Reply::Error(err)) => Err(err),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(FetchError::transport("hung request finished"))
                }
                None => panic!("unexpected request: {}", key),
            }
        }
    }
}
