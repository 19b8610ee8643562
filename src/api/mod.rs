//! Client-side gateway to the Odevio REST API.
//!
//! Every call goes through [`ApiClient::send`], which injects the `JWT`
//! authorization header, retries transient failures a bounded number of
//! times and classifies error responses into [`ApiError`].

mod auth;
pub mod builds;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use auth::token_expired;
pub use error::{ApiError, ApiResultExt, ValidationErrors};

use anyhow::Context as _;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::config::ConfigFile;
use crate::prompt::Prompter;

pub const DEFAULT_API_BASE_URL: &str = "https://odevio.com";

const API_PREFIX: &str = "/api/v1";
const EVENTS_PREFIX: &str = "/events";

/// Retry budget for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the budget is spent
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut remaining = policy.attempts.max(1);
    loop {
        remaining -= 1;
        match operation().await {
            Err(e) if e.is_transient() && remaining > 0 => {
                warn!("{} ({} attempts left), retrying", e, remaining);
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) if e.is_transient() => return Err(e.exhausted()),
            other => return other,
        }
    }
}

/// How a request authenticates
#[derive(Debug, Clone, Default)]
pub enum Auth {
    /// Stored token, refreshed or obtained interactively when needed
    #[default]
    Token,
    /// Exchange these credentials for a new token
    Credentials { email: String, password: String },
    /// No authorization header
    Anonymous,
}

/// File upload sent as `multipart/form-data`
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub fields: Vec<(String, String)>,
    pub file_field: String,
    pub file_name: String,
    pub mime: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
enum Payload {
    #[default]
    Empty,
    Json(Value),
    Multipart(MultipartUpload),
}

/// Description of one API call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    route: String,
    query: Vec<(String, String)>,
    payload: Payload,
    auth: Auth,
    event_stream: bool,
}

impl ApiRequest {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            query: Vec::new(),
            payload: Payload::Empty,
            auth: Auth::Token,
            event_stream: false,
        }
    }

    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::GET, route)
    }

    pub fn post(route: impl Into<String>) -> Self {
        Self::new(Method::POST, route)
    }

    pub fn delete(route: impl Into<String>) -> Self {
        Self::new(Method::DELETE, route)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub fn multipart(mut self, upload: MultipartUpload) -> Self {
        self.payload = Payload::Multipart(upload);
        self
    }

    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// Target the server-sent events prefix and keep the body streaming
    pub fn event_stream(mut self) -> Self {
        self.event_stream = true;
        self
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
    config: ConfigFile,
    prompter: Arc<dyn Prompter>,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        config: ConfigFile,
        prompter: Arc<dyn Prompter>,
    ) -> anyhow::Result<Self> {
        // 302 is how the server announces an update in progress, so it must
        // surface instead of being followed
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("odevio-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base_url = base_url.into();
        url::Url::parse(&base_url)
            .map_err(|e| anyhow::anyhow!("Invalid API URL '{}': {}", base_url, e))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            config,
            prompter,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn prompter(&self) -> &dyn Prompter {
        self.prompter.as_ref()
    }

    fn url_for(&self, request: &ApiRequest) -> String {
        let prefix = if request.event_stream {
            EVENTS_PREFIX
        } else {
            API_PREFIX
        };
        format!("{}{}{}", self.base_url, prefix, request.route)
    }

    /// Send a request and return the successful response
    pub async fn send(&self, request: &ApiRequest) -> Result<Response, ApiError> {
        let authorization = match &request.auth {
            Auth::Anonymous => None,
            auth => Some(self.authorization_header(auth).await?),
        };

        with_retry(&self.retry, || self.attempt(request, authorization.as_deref())).await
    }

    async fn attempt(
        &self,
        request: &ApiRequest,
        authorization: Option<&str>,
    ) -> Result<Response, ApiError> {
        let url = self.url_for(request);
        debug!("{} {}", request.method, url);

        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.event_stream {
            builder = builder.header(ACCEPT, "application/json");
        }
        if let Some(value) = authorization {
            builder = builder.header("Authorization", value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        match &request.payload {
            // Reopened on every attempt since a sent body stream is consumed
            Payload::Multipart(upload) => builder = builder.multipart(build_form(upload).await?),
            Payload::Json(body) => builder = builder.json(body),
            Payload::Empty => {}
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ApiError::Connect(e)
            } else {
                ApiError::Transport(e)
            }
        })?;

        classify(request, response).await
    }

    /// Send a request and decode its JSON body
    pub async fn json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        let body = self.bytes(request).await?;
        serde_json::from_slice(&body).map_err(|source| ApiError::Decode {
            route: request.route.clone(),
            source,
        })
    }

    /// Send a request and return the raw body
    pub async fn bytes(&self, request: &ApiRequest) -> Result<Bytes, ApiError> {
        let response = self.send(request).await?;
        response.bytes().await.map_err(ApiError::Transport)
    }

    /// Open a server-sent events stream under the events prefix
    pub async fn events(
        &self,
        route: &str,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>>, ApiError> {
        let response = self.send(&ApiRequest::get(route).event_stream()).await?;
        Ok(response.bytes_stream())
    }
}

/// Multipart form streaming the upload file from disk
async fn build_form(upload: &MultipartUpload) -> Result<Form, ApiError> {
    let file = tokio::fs::File::open(&upload.path)
        .await
        .with_context(|| format!("Failed to open {}", upload.path.display()))?;
    let length = file
        .metadata()
        .await
        .with_context(|| format!("Failed to read metadata of {}", upload.path.display()))?
        .len();

    let mut form = Form::new();
    for (name, value) in &upload.fields {
        form = form.text(name.clone(), value.clone());
    }
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    let part = Part::stream_with_length(body, length)
        .file_name(upload.file_name.clone())
        .mime_str(&upload.mime)
        .map_err(ApiError::Transport)?;
    Ok(form.part(upload.file_field.clone(), part))
}

async fn classify(request: &ApiRequest, response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    debug!("{} {} returned {}", request.method, request.route, status);

    match status.as_u16() {
        400 | 401 => {
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            Err(ApiError::Validation(ValidationErrors::from_value(&body)))
        }
        402 => Err(ApiError::PaymentRequired(detail_of(response).await)),
        403 => Err(ApiError::Forbidden(detail_of(response).await)),
        404 => Err(ApiError::NotFound),
        302 | 503 => Err(ApiError::Unavailable(status)),
        _ => Err(ApiError::Http {
            method: request.method.to_string(),
            route: request.route.clone(),
            reason: status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string(),
        }),
    }
}

async fn detail_of(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|body| body.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(text)
}
