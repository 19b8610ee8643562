use anyhow::Result;
use futures::StreamExt;
use std::io::{self, IsTerminal, Write as _};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::events::{BuildEvent, BuildEventStream};
use crate::api::models::{BuildStatus, SubStatus};
use crate::api::{ApiClient, ApiError};

/// Interval used when falling back to polling after the event stream ended early
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ANSI escape codes for terminal manipulation
mod ansi {
    pub const CLEAR_LINE: &str = "\x1B[2K";
    pub const HIDE_CURSOR: &str = "\x1B[?25l";
    pub const SHOW_CURSOR: &str = "\x1B[?25h";
    pub const RESET: &str = "\x1B[0m";
    pub const CURSOR_TO_START: &str = "\r";
}

// Spinner animation frames
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// How the final state of a build was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// Configuration build ready for remote access
    Configured,
    Succeeded,
    Failed,
    Stopped,
}

impl TerminalOutcome {
    pub fn from_status(status: BuildStatus) -> Option<Self> {
        match status {
            BuildStatus::Config => Some(TerminalOutcome::Configured),
            BuildStatus::Succeeded => Some(TerminalOutcome::Succeeded),
            BuildStatus::Failed => Some(TerminalOutcome::Failed),
            BuildStatus::Stopped => Some(TerminalOutcome::Stopped),
            BuildStatus::Created | BuildStatus::WaitingInstance | BuildStatus::InProgress => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalOutcome::Configured | TerminalOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackResult {
    pub outcome: TerminalOutcome,
    /// Error reported by the server for failed or stopped builds
    pub error_message: Option<String>,
}

/// How progress is followed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressMode {
    /// Live server-sent events
    #[default]
    Events,
    /// Re-fetch the build record on a fixed interval
    Poll(Duration),
}

/// Phase label shown for a status and optional sub-status
pub fn status_label(status: BuildStatus, substatus: Option<&SubStatus>) -> &'static str {
    match status {
        BuildStatus::Created => "Looking for available instance...",
        BuildStatus::WaitingInstance => {
            "No instance available at the moment. Waiting for one to be free..."
        }
        BuildStatus::InProgress => substatus.map(SubStatus::label).unwrap_or("Building..."),
        BuildStatus::Config => "Configured for remote access",
        BuildStatus::Succeeded => "Success!",
        BuildStatus::Failed => "Failed",
        BuildStatus::Stopped => "Stopped",
    }
}

/// Sink for progress updates
pub trait ProgressView {
    /// The build entered a new phase
    fn phase(&mut self, label: &str);
    /// Build log output, written as received
    fn log(&mut self, text: &str);
    /// The build reached a terminal status
    fn finish(&mut self, status: BuildStatus);
}

/// Spinner line on a TTY, plain log lines otherwise
pub struct TerminalView {
    tty: bool,
    current: Option<String>,
    spinner_frame: usize,
    line_shown: bool,
}

impl TerminalView {
    pub fn new() -> Self {
        Self {
            tty: io::stdout().is_terminal(),
            current: None,
            spinner_frame: 0,
            line_shown: false,
        }
    }

    fn clear_line(&mut self) {
        if self.line_shown {
            print!("{}{}", ansi::CURSOR_TO_START, ansi::CLEAR_LINE);
            self.line_shown = false;
        }
    }

    fn redraw(&mut self) {
        let Some(label) = self.current.clone() else {
            return;
        };
        self.clear_line();
        let frame = SPINNER_FRAMES[self.spinner_frame % SPINNER_FRAMES.len()];
        self.spinner_frame += 1;
        print!("{}{} {}", ansi::HIDE_CURSOR, frame, label);
        let _ = io::stdout().flush();
        self.line_shown = true;
    }
}

impl Default for TerminalView {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressView for TerminalView {
    fn phase(&mut self, label: &str) {
        if self.current.as_deref() == Some(label) {
            if self.tty {
                self.redraw();
            }
            return;
        }
        self.current = Some(label.to_string());
        if self.tty {
            self.redraw();
        } else {
            info!("{}", label);
        }
    }

    fn log(&mut self, text: &str) {
        if self.tty {
            self.clear_line();
        }
        print!("{}", text);
        let _ = io::stdout().flush();
        if self.tty && text.ends_with('\n') {
            self.redraw();
        }
    }

    fn finish(&mut self, status: BuildStatus) {
        let label = status_label(status, None);
        if !self.tty {
            info!("{}", label);
            return;
        }
        self.clear_line();
        let (icon, color) = match status {
            BuildStatus::Config | BuildStatus::Succeeded => ("✓", "\x1B[32m"),
            BuildStatus::Failed => ("✗", "\x1B[31m"),
            _ => ("■", "\x1B[90m"),
        };
        println!(
            "{}{}{} {}{}",
            ansi::SHOW_CURSOR,
            color,
            icon,
            label,
            ansi::RESET
        );
    }
}

impl Drop for TerminalView {
    fn drop(&mut self) {
        if self.tty {
            print!("{}", ansi::SHOW_CURSOR);
            let _ = io::stdout().flush();
        }
    }
}

/// Apply events to `view` until a terminal status arrives.
///
/// Returns `None` if the stream ends first. The stream is dropped on return,
/// which closes the connection.
pub async fn consume_events(
    mut events: BuildEventStream,
    view: &mut dyn ProgressView,
) -> Result<Option<BuildStatus>, ApiError> {
    while let Some(event) = events.next().await {
        match event? {
            BuildEvent::Status(status) => {
                debug!("Build status changed to {}", status);
                view.phase(status_label(status, None));
                if status.is_terminal() {
                    return Ok(Some(status));
                }
            }
            BuildEvent::SubStatus(substatus) => view.phase(substatus.label()),
            BuildEvent::Log(text) => view.log(&text),
            BuildEvent::Other { event, .. } => debug!("Ignoring '{}' event", event),
        }
    }
    Ok(None)
}

/// Re-fetch the build until it reaches a terminal status
pub async fn poll_until_terminal(
    api: &ApiClient,
    key: &str,
    interval: Duration,
    view: &mut dyn ProgressView,
) -> Result<BuildStatus, ApiError> {
    loop {
        let record = api.get_build(key).await?;
        view.phase(status_label(
            record.status_code,
            record.substatus_code.as_ref(),
        ));
        if record.status_code.is_terminal() {
            return Ok(record.status_code);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Follow a build until it reaches a terminal status
pub async fn track(
    api: &ApiClient,
    key: &str,
    mode: ProgressMode,
    view: &mut dyn ProgressView,
) -> Result<TrackResult> {
    let status = match mode {
        ProgressMode::Poll(interval) => poll_until_terminal(api, key, interval, view).await?,
        ProgressMode::Events => {
            let record = api.get_build(key).await?;
            view.phase(status_label(
                record.status_code,
                record.substatus_code.as_ref(),
            ));
            if record.status_code.is_terminal() {
                record.status_code
            } else {
                let events = api.build_events(key).await?;
                let streamed = match consume_events(events, view).await {
                    Ok(Some(status)) => Some(status),
                    Ok(None) => {
                        warn!("Event stream of build {} ended early, polling instead", key);
                        None
                    }
                    Err(e) => {
                        warn!("Event stream of build {} failed ({}), polling instead", key, e);
                        None
                    }
                };
                match streamed {
                    Some(status) => status,
                    None => poll_until_terminal(api, key, DEFAULT_POLL_INTERVAL, view).await?,
                }
            }
        }
    };

    view.finish(status);
    info!("Build {} finished with status {}", key, status);

    let outcome = TerminalOutcome::from_status(status)
        .ok_or_else(|| anyhow::anyhow!("Build {} ended in non-terminal status {}", key, status))?;

    let error_message = if outcome.is_success() {
        None
    } else {
        match api.get_build(key).await {
            Ok(record) => record.error_message,
            Err(e) => {
                warn!("Failed to fetch the error message of build {}: {}", key, e);
                None
            }
        }
    };

    Ok(TrackResult {
        outcome,
        error_message,
    })
}

/// Best-effort lookup of the help page of a failed build
pub async fn print_help_link(api: &ApiClient, key: &str) {
    match api.help_link(key).await {
        Ok(help) => {
            println!("Odevio identified an error. You can ask for help regarding this issue here:");
            println!("{}", help.url);
        }
        Err(ApiError::NotFound) => println!("Build couldn't be found."),
        Err(e) => debug!("No help link for build {}: {}", key, e),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records everything shown, in order
    #[derive(Debug, Default)]
    pub struct RecordingView {
        pub phases: Vec<String>,
        pub logs: Vec<String>,
        pub finished: Option<BuildStatus>,
    }

    impl ProgressView for RecordingView {
        fn phase(&mut self, label: &str) {
            if self.phases.last().map(String::as_str) != Some(label) {
                self.phases.push(label.to_string());
            }
        }

        fn log(&mut self, text: &str) {
            self.logs.push(text.to_string());
        }

        fn finish(&mut self, status: BuildStatus) {
            self.finished = Some(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingView;
    use super::*;
    use crate::api::events::parse_build_events;
    use crate::api::testing::client;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(body: &'static str) -> BuildEventStream {
        parse_build_events(stream::iter(vec![Ok(Bytes::from_static(body.as_bytes()))]))
    }

    #[test]
    fn test_terminal_outcome_mapping() {
        assert_eq!(
            TerminalOutcome::from_status(BuildStatus::Config),
            Some(TerminalOutcome::Configured)
        );
        assert_eq!(
            TerminalOutcome::from_status(BuildStatus::Succeeded),
            Some(TerminalOutcome::Succeeded)
        );
        assert_eq!(
            TerminalOutcome::from_status(BuildStatus::Failed),
            Some(TerminalOutcome::Failed)
        );
        assert_eq!(
            TerminalOutcome::from_status(BuildStatus::Stopped),
            Some(TerminalOutcome::Stopped)
        );
        assert_eq!(TerminalOutcome::from_status(BuildStatus::InProgress), None);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(
            status_label(BuildStatus::Created, None),
            "Looking for available instance..."
        );
        assert_eq!(
            status_label(BuildStatus::InProgress, Some(&SubStatus::Publishing)),
            "Publishing..."
        );
        assert_eq!(
            status_label(
                BuildStatus::InProgress,
                Some(&SubStatus::Other("notarizing".to_string()))
            ),
            "Building..."
        );
        assert_eq!(status_label(BuildStatus::InProgress, None), "Building...");
    }

    #[tokio::test]
    async fn test_events_stop_at_terminal_status() {
        let events = sse(concat!(
            "event: status\ndata: \"in_progress\"\n\n",
            "event: substatus\ndata: \"starting_instance\"\n\n",
            "event: log\ndata: \"line one\\n\"\n\n",
            "event: log\ndata: \"line two\\n\"\n\n",
            "event: status\ndata: \"succeeded\"\n\n",
            "event: log\ndata: \"never shown\\n\"\n\n",
        ));

        let mut view = RecordingView::default();
        let status = consume_events(events, &mut view).await.unwrap();

        assert_eq!(status, Some(BuildStatus::Succeeded));
        assert_eq!(view.logs, vec!["line one\n", "line two\n"]);
        assert_eq!(
            view.phases,
            vec!["Building...", "Starting instance...", "Success!"]
        );
    }

    #[tokio::test]
    async fn test_events_without_terminal_status() {
        let events = sse("event: status\ndata: \"waiting_instance\"\n\n");
        let mut view = RecordingView::default();
        assert_eq!(consume_events(events, &mut view).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_build_reports_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/builds/FAIL1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "FAIL1",
                "status_code": "failed",
                "error_message": "Code signing failed"
            })))
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        let mut view = RecordingView::default();
        let result = track(&api, "FAIL1", ProgressMode::Poll(Duration::ZERO), &mut view)
            .await
            .unwrap();

        assert_eq!(result.outcome, TerminalOutcome::Failed);
        assert_eq!(result.error_message.as_deref(), Some("Code signing failed"));
        assert_eq!(view.finished, Some(BuildStatus::Failed));
    }

    #[tokio::test]
    async fn test_stream_ending_early_falls_back_to_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/builds/K1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "K1", "status_code": "waiting_instance"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/builds/K1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "K1", "status_code": "succeeded"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/events/builds/K1/logs"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "event: status\ndata: \"in_progress\"\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        let mut view = RecordingView::default();
        let result = track(&api, "K1", ProgressMode::Events, &mut view)
            .await
            .unwrap();

        assert_eq!(result.outcome, TerminalOutcome::Succeeded);
        assert_eq!(result.error_message, None);
    }

    /// Serves one status line then cuts the chunked event stream, and answers
    /// build lookups with `in_progress` first and `succeeded` afterwards
    async fn serve_interrupted_stream(listener: TcpListener) {
        let lookups = AtomicU32::new(0);
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }

            if head.starts_with(b"GET /events/") {
                let chunk = "event: status\ndata: \"in_progress\"\n\n";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\
                     Transfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                    chunk.len(),
                    chunk
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.flush().await;
                // Dropped without the terminating chunk
                continue;
            }

            let status = if lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                "in_progress"
            } else {
                "succeeded"
            };
            let body = json!({"key": "K2", "status_code": status}).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_interrupted_stream_falls_back_to_polling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_interrupted_stream(listener));

        let (api, _dir) = client(&format!("http://{}", addr));
        let mut view = RecordingView::default();
        let result = track(&api, "K2", ProgressMode::Events, &mut view)
            .await
            .unwrap();
        server.abort();

        assert_eq!(result.outcome, TerminalOutcome::Succeeded);
        assert_eq!(view.finished, Some(BuildStatus::Succeeded));
        assert_eq!(view.phases, vec!["Building...", "Success!"]);
    }

    #[tokio::test]
    async fn test_help_link_failure_does_not_propagate() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/builds/K1/help/"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _dir) = client(&server.uri());
        print_help_link(&api, "K1").await;
    }
}
