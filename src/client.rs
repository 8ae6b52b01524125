//! A consumer of the control API, for scripts and for tests. Besides the
//! plain calls it knows how to keep watching the event feed across dropped
//! connections, either by polling or by following the push stream.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::{header::ACCEPT, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::{
    error::{Result, TelekinesisError},
    events::{Envelope, Event, PollSnapshot},
    http_server::{ApiResponse, RESYNC_EVENT},
    manager::SessionStatus,
    models::ChatMessage,
};

const MIN_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// What a push-feed watcher hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(Envelope),
    /// Events may have been missed; this is everything pending since the
    /// previous poll.
    Snapshot(PollSnapshot),
}

#[derive(Clone)]
pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// `base` is the root of the control API, e.g. `http://127.0.0.1:5000`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base)
    }

    async fn expect_success(response: Response) -> Result<ApiResponse> {
        let status = response.status();
        let body: ApiResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if !status.is_success() => {
                return Err(TelekinesisError::Api {
                    status: status.as_u16(),
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        if !status.is_success() || !body.is_success() {
            return Err(TelekinesisError::Api {
                status: status.as_u16(),
                message: body.message.unwrap_or_default(),
            });
        }
        Ok(body)
    }

    async fn post(&self, path: &str, body: Option<serde_json::Value>) -> Result<ApiResponse> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        Self::expect_success(request.send().await?).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelekinesisError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    pub async fn create_offer(&self) -> Result<ApiResponse> {
        self.post("create_offer", None).await
    }

    pub async fn create_answer(&self, offer: &str) -> Result<ApiResponse> {
        self.post("create_answer", Some(serde_json::json!({ "offer": offer })))
            .await
    }

    pub async fn set_answer(&self, answer: &str) -> Result<ApiResponse> {
        self.post("set_answer", Some(serde_json::json!({ "answer": answer })))
            .await
    }

    pub async fn send_message(&self, message: &str) -> Result<ApiResponse> {
        self.post("send_message", Some(serde_json::json!({ "message": message })))
            .await
    }

    pub async fn send_file(&self, filename: &str, contents: Vec<u8>) -> Result<ApiResponse> {
        let request = self
            .http
            .post(self.url("send_file"))
            .query(&[("filename", filename)])
            .body(contents);
        Self::expect_success(request.send().await?).await
    }

    pub async fn disconnect(&self) -> Result<ApiResponse> {
        self.post("disconnect", None).await
    }

    pub async fn reset(&self) -> Result<ApiResponse> {
        self.post("reset", None).await
    }

    pub async fn poll(&self) -> Result<PollSnapshot> {
        self.get("get_events").await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.get("status").await
    }

    pub async fn messages(&self) -> Result<Vec<ChatMessage>> {
        self.get("messages").await
    }

    /// Polls every `interval` until `tx` is closed. Failed polls are retried
    /// with backoff instead of being reported.
    pub async fn watch_poll(&self, interval: Duration, tx: mpsc::UnboundedSender<PollSnapshot>) {
        let mut backoff = Backoff::default();
        while !tx.is_closed() {
            match self.poll().await {
                Ok(snapshot) => {
                    backoff.reset();
                    if tx.send(snapshot).is_err() {
                        return;
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    let wait = backoff.next_delay();
                    warn!("poll failed, retrying in {wait:?}: {e}");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Follows the push feed until `tx` is closed. Reconnects with backoff
    /// when the stream drops or goes quiet for three heartbeat intervals, and
    /// resumes from the last event seen. When the server reports a gap the
    /// consumer gets a poll snapshot instead of the missing events.
    pub async fn watch_stream(&self, heartbeat: Duration, tx: mpsc::UnboundedSender<FeedItem>) {
        let stall = heartbeat * 3;
        let mut last_id = None;
        let mut backoff = Backoff::default();
        while !tx.is_closed() {
            match self.follow(stall, &mut last_id, &mut backoff, &tx).await {
                Ok(()) => debug!("event stream ended"),
                Err(e) => warn!("event stream dropped: {e}"),
            }
            if tx.is_closed() {
                break;
            }
            let wait = backoff.next_delay();
            info!("reconnecting to event stream in {wait:?}");
            tokio::time::sleep(wait).await;
        }
    }

    async fn follow(
        &self,
        stall: Duration,
        last_id: &mut Option<u64>,
        backoff: &mut Backoff,
        tx: &mpsc::UnboundedSender<FeedItem>,
    ) -> Result<()> {
        let mut request = self
            .http
            .get(self.url("events"))
            .header(ACCEPT, "text/event-stream");
        if let Some(id) = last_id {
            request = request.header(crate::http_server::LAST_EVENT_ID, id.to_string());
        }
        let mut response = request.send().await?.error_for_status()?;

        let mut parser = SseParser::default();
        loop {
            let chunk = tokio::time::timeout(stall, response.chunk())
                .await
                .map_err(|_| TelekinesisError::Transport(format!("no data for {stall:?}")))??;
            let Some(chunk) = chunk else {
                return Ok(());
            };
            backoff.reset();

            for message in parser.feed(&chunk) {
                match message.event.as_deref() {
                    Some(name) if name == Event::Heartbeat.name() => {}
                    Some(RESYNC_EVENT) => {
                        let snapshot = self.poll().await?;
                        *last_id = Some(snapshot.last_event_id);
                        if tx.send(FeedItem::Snapshot(snapshot)).is_err() {
                            return Ok(());
                        }
                    }
                    _ => {
                        let envelope: Envelope = match serde_json::from_str(&message.data) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("skipping unreadable event: {e}");
                                continue;
                            }
                        };
                        *last_id = Some(envelope.id);
                        if tx.send(FeedItem::Event(envelope)).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: MIN_BACKOFF,
        }
    }
}

impl Backoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Feed it bytes as they arrive and
/// it returns every message completed so far.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(end) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            self.line(line.trim_end_matches(['\n', '\r']), &mut out);
        }
        out
    }

    fn line(&mut self, line: &str, out: &mut Vec<SseMessage>) {
        if line.is_empty() {
            let event = self.event.take();
            let id = self.id.take();
            if !self.data.is_empty() {
                out.push(SseMessage {
                    event,
                    id,
                    data: self.data.join("\n"),
                });
                self.data.clear();
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}
