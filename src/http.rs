//! Outbound HTTP: bearer attachment and response classification.
//!
//! Every component talks to the backend through `HttpClient`, which turns
//! raw responses into an `ApiOutcome`. A 401 on an authenticated request
//! clears the session before the outcome is returned.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ClientError, Result};
use crate::session::Session;

pub use reqwest::Method;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        bytes: Vec<u8>,
    },
}

impl FormPart {
    pub fn name(&self) -> &str {
        match self {
            FormPart::Text { name, .. } | FormPart::File { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Never attach the bearer credential.
    pub anonymous: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: vec![],
            body: RequestBody::Empty,
            anonymous: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(RequestBody::Json(body))
    }

    pub fn patch_json(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(RequestBody::Json(body))
    }

    pub fn post_multipart(path: impl Into<String>, parts: Vec<FormPart>) -> Self {
        Self::new(Method::POST, path).with_body(RequestBody::Multipart(parts))
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// What actually goes on the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub request: ApiRequest,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.as_bytes().to_vec(),
        }
    }
}

/// Seam between the client and the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: OutboundRequest) -> Result<RawResponse>;
}

/// Production transport over reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, req: OutboundRequest) -> Result<RawResponse> {
        let OutboundRequest { request, bearer } = req;
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method, url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(v) => builder.json(&v),
            RequestBody::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    form = match part {
                        FormPart::Text { name, value } => form.text(name, value),
                        FormPart::File {
                            name,
                            file_name,
                            bytes,
                        } => form.part(
                            name,
                            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
                        ),
                    };
                }
                builder.multipart(form)
            }
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Uniform result of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Ok(Value),
    /// 204, or a 2xx with an empty body.
    NoContent,
    NeedsReauth,
    Forbidden,
    /// `status` is `None` when the request never got a response.
    Failure {
        status: Option<u16>,
        message: String,
    },
}

impl ApiOutcome {
    pub fn into_result(self) -> Result<Option<Value>> {
        match self {
            ApiOutcome::Ok(v) => Ok(Some(v)),
            ApiOutcome::NoContent => Ok(None),
            ApiOutcome::NeedsReauth => Err(ClientError::AuthExpired),
            ApiOutcome::Forbidden => Err(ClientError::PermissionDenied),
            ApiOutcome::Failure {
                status: Some(status),
                message,
            } => Err(ClientError::Server { status, message }),
            ApiOutcome::Failure {
                status: None,
                message,
            } => Err(ClientError::Transport(message)),
        }
    }
}

/// Classify a raw response. 401 is only `NeedsReauth` for authenticated
/// requests; an anonymous 401 (bad password) is an ordinary failure.
pub fn classify(raw: &RawResponse, authenticated: bool) -> ApiOutcome {
    match raw.status {
        401 if authenticated => ApiOutcome::NeedsReauth,
        403 => ApiOutcome::Forbidden,
        204 => ApiOutcome::NoContent,
        200..=299 if raw.body.iter().all(|b| b.is_ascii_whitespace()) => ApiOutcome::NoContent,
        200..=299 => match serde_json::from_slice(&raw.body) {
            Ok(v) => ApiOutcome::Ok(v),
            Err(e) => ApiOutcome::Failure {
                status: Some(raw.status),
                message: format!("invalid JSON in response: {e}"),
            },
        },
        status => {
            let text = String::from_utf8_lossy(&raw.body).trim().to_string();
            ApiOutcome::Failure {
                status: Some(status),
                message: if text.is_empty() {
                    format!("HTTP {status}")
                } else {
                    text
                },
            }
        }
    }
}

#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
}

impl HttpClient {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<Session>) -> Self {
        Self { transport, session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn request(&self, req: ApiRequest) -> ApiOutcome {
        let bearer = if req.anonymous {
            None
        } else {
            self.session.credential().map(|c| c.token)
        };
        let method = req.method.clone();
        let path = req.path.clone();

        let raw = match self
            .transport
            .send(OutboundRequest {
                request: req,
                bearer: bearer.clone(),
            })
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(%method, %path, error = %e, "request failed before a response");
                // into_result wraps this in Transport again
                let message = match e {
                    ClientError::Transport(m) => m,
                    other => other.to_string(),
                };
                return ApiOutcome::Failure { status: None, message };
            }
        };

        let outcome = classify(&raw, bearer.is_some());
        tracing::debug!(%method, %path, status = raw.status, "response");
        if outcome == ApiOutcome::NeedsReauth {
            if let Some(token) = bearer.as_deref() {
                self.session.expire_if_current(token);
            }
        }
        outcome
    }

    /// `request` folded into the error taxonomy.
    pub async fn call(&self, req: ApiRequest) -> Result<Option<Value>> {
        self.request(req).await.into_result()
    }

    pub async fn call_json<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T> {
        let body = self.call(req).await?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(body)?)
    }
}
