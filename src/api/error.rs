use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;

/// Failure of a call to the Odevio API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 400/401: the server rejected the request with per-field messages
    #[error("{0}")]
    Validation(ValidationErrors),
    /// 402: plan limit reached
    #[error("Error: {0}")]
    PaymentRequired(String),
    /// 403
    #[error("Permission error: {0}")]
    Forbidden(String),
    /// 404
    #[error("Resource not found")]
    NotFound,
    /// Connection retries exhausted
    #[error("Server not available")]
    ServerUnavailable,
    /// 302/503 retries exhausted
    #[error("The server is currently in maintenance. Please try again in a few moments.")]
    Maintenance,
    #[error("{method} {route} failed: {reason}")]
    Http {
        method: String,
        route: String,
        reason: String,
    },
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Unexpected response from {route}: {source}")]
    Decode {
        route: String,
        #[source]
        source: serde_json::Error,
    },
    /// Connection-level failure, retried by the gateway
    #[error("Failed to connect to the server: {0}")]
    Connect(#[source] reqwest::Error),
    /// Update redirect or maintenance response, retried by the gateway
    #[error("Server temporarily unavailable ({0})")]
    Unavailable(StatusCode),
    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),
    /// The source archive is over the upload limit; nothing was sent
    #[error("Zipped directory size ({size} bytes) exceeds 500MB, very large applications are not supported by Odevio. Make sure that all files and directories not needed to build are listed in .odevioignore")]
    ArchiveTooLarge { size: u64 },
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

impl ApiError {
    /// Whether the gateway should retry the same call
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Connect(_) | ApiError::Unavailable(_))
    }

    /// Fatal error raised once the retry budget is spent
    pub fn exhausted(self) -> Self {
        match self {
            ApiError::Connect(_) => ApiError::ServerUnavailable,
            ApiError::Unavailable(_) => ApiError::Maintenance,
            other => other,
        }
    }

    /// Errors that are reported to the user and turned into an empty result
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ApiError::Validation(_)
                | ApiError::PaymentRequired(_)
                | ApiError::Forbidden(_)
                | ApiError::ArchiveTooLarge { .. }
        )
    }

    /// Print a recoverable error the way the CLI presents it
    pub fn report(&self) {
        match self {
            ApiError::PaymentRequired(detail) => {
                println!("Error: {}", detail);
                println!("To upgrade your account, please go to https://odevio.com/plans");
            }
            other => println!("{}", other),
        }
    }
}

pub trait ApiResultExt<T> {
    /// Report recoverable failures and map them to `None`.
    ///
    /// `NotFound` and fatal errors are passed through so call sites can
    /// special-case missing resources.
    fn recover(self) -> Result<Option<T>, ApiError>;
}

impl<T> ApiResultExt<T> for Result<T, ApiError> {
    fn recover(self) -> Result<Option<T>, ApiError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_recoverable() => {
                e.report();
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Validation payload returned with 400/401 responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub general: Vec<String>,
    pub fields: Vec<(String, Vec<String>)>,
}

impl ValidationErrors {
    pub fn from_value(value: &Value) -> Self {
        let mut errors = ValidationErrors::default();
        match value {
            Value::Object(map) => {
                for (field, messages) in map {
                    if field == "non_field_errors" || field == "detail" {
                        errors.general.extend(messages_of(messages));
                    } else {
                        errors.fields.push((field.clone(), messages_of(messages)));
                    }
                }
            }
            Value::Null => errors.general.push("Invalid request".to_string()),
            other => errors.general.extend(messages_of(other)),
        }
        errors
    }
}

fn messages_of(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        other => vec![other.to_string()],
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        for message in &self.general {
            lines.push(format!("Error: {}", message));
        }
        for (field, messages) in &self.fields {
            lines.push(format!("Error: for {} - {}", field, messages.join(", ")));
        }
        write!(f, "{}", lines.join("\n"))
    }
}
