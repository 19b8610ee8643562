//! Typed view of the build log event stream.
//!
//! The server emits `status`, `substatus` and `log` events whose `data` is a
//! JSON-encoded string. Other event names are passed through untouched.

use std::pin::Pin;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};

use super::models::{BuildStatus, SubStatus};
use super::ApiError;

#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Status(BuildStatus),
    SubStatus(SubStatus),
    Log(String),
    Other { event: String, data: String },
}

pub type BuildEventStream = Pin<Box<dyn Stream<Item = Result<BuildEvent, ApiError>> + Send>>;

/// Parse a raw SSE byte stream into [`BuildEvent`]s
pub fn parse_build_events<S>(bytes: S) -> BuildEventStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    bytes
        .eventsource()
        .filter_map(|result| async move {
            match result {
                Ok(event) if event.data.is_empty() && event.event == "message" => None,
                Ok(event) => Some(decode_event(&event.event, &event.data)),
                Err(e) => Some(Err(ApiError::Local(anyhow::anyhow!(
                    "Build event stream interrupted: {}",
                    e
                )))),
            }
        })
        .boxed()
}

fn decode_event(name: &str, data: &str) -> Result<BuildEvent, ApiError> {
    let decode_error = |source| ApiError::Decode {
        route: format!("event '{}'", name),
        source,
    };

    match name {
        "status" => serde_json::from_str(data)
            .map(BuildEvent::Status)
            .map_err(decode_error),
        "substatus" => serde_json::from_str(data)
            .map(BuildEvent::SubStatus)
            .map_err(decode_error),
        "log" => serde_json::from_str(data)
            .map(BuildEvent::Log)
            .map_err(decode_error),
        _ => Ok(BuildEvent::Other {
            event: name.to_string(),
            data: data.to_string(),
        }),
    }
}
