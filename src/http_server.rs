use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, IntervalStream, WatchStream},
    Stream, StreamExt,
};
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use crate::{
    error::{Result, TelekinesisError},
    events::{Envelope, Event, PollSnapshot, Subscription},
    manager::SessionStatus,
    models::ChatMessage,
    transfer::{sanitize_filename, OutgoingFile},
    PeerService,
};

pub const LAST_EVENT_ID: &str = "last-event-id";
pub const RESYNC_EVENT: &str = "resync";

/// Envelope returned by every mutating route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".into(),
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

impl IntoResponse for TelekinesisError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            "decode_error" | "invalid_state" | "protocol_error" | "bad_request" => {
                StatusCode::BAD_REQUEST
            }
            "already_transferring" => StatusCode::CONFLICT,
            "transport_error" => StatusCode::BAD_GATEWAY,
            "service_stopped" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        debug!("request failed with {}: {self}", self.kind());
        (status, Json(ApiResponse::error(self.to_string()))).into_response()
    }
}

type ApiResult = Result<Json<ApiResponse>>;

impl PeerService {
    pub(crate) async fn serve(&self, listener: TcpListener) -> Result<()> {
        let app = self.create_router();
        let mut stopped = self.stopped();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stopped.wait_for(|stop| *stop).await;
                info!("shutting down http server");
            })
            .await?;
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/api/create_offer", post(create_offer))
            .route("/api/create_room", post(create_offer))
            .route("/api/create_answer", post(create_answer))
            .route("/api/join_room", post(create_answer))
            .route("/api/set_answer", post(set_answer))
            .route("/api/send_message", post(send_message))
            .route("/api/send_file", post(send_file))
            .route("/api/disconnect", post(disconnect))
            .route("/api/reset", post(reset))
            .route("/api/get_events", get(get_events))
            .route("/api/events", get(event_stream))
            .route("/api/status", get(status))
            .route("/api/messages", get(messages))
            .fallback(not_found)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.max_upload_bytes))
            .with_state(self.clone())
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TelekinesisError::BadRequest(format!("missing {field}"))),
    }
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(body)| body)
        .map_err(|e| TelekinesisError::BadRequest(e.body_text()))
}

async fn create_offer(State(service): State<PeerService>) -> ApiResult {
    service.session.create_offer().await?;
    Ok(Json(ApiResponse::success("creating offer")))
}

#[derive(Deserialize)]
pub struct OfferBody {
    offer: Option<String>,
}

async fn create_answer(
    State(service): State<PeerService>,
    body: std::result::Result<Json<OfferBody>, JsonRejection>,
) -> ApiResult {
    let offer = required(json_body(body)?.offer, "offer")?;
    service.session.create_answer(offer).await?;
    Ok(Json(ApiResponse::success("creating answer")))
}

#[derive(Deserialize)]
pub struct AnswerBody {
    answer: Option<String>,
}

async fn set_answer(
    State(service): State<PeerService>,
    body: std::result::Result<Json<AnswerBody>, JsonRejection>,
) -> ApiResult {
    let answer = required(json_body(body)?.answer, "answer")?;
    service.session.set_answer(answer).await?;
    Ok(Json(ApiResponse::success("answer applied, connecting")))
}

#[derive(Deserialize)]
pub struct MessageBody {
    message: Option<String>,
}

async fn send_message(
    State(service): State<PeerService>,
    body: std::result::Result<Json<MessageBody>, JsonRejection>,
) -> ApiResult {
    let message = required(json_body(body)?.message, "message")?;
    service.session.send_message(message).await?;
    Ok(Json(ApiResponse::success("message sent")))
}

#[derive(Deserialize)]
pub struct FileParams {
    filename: Option<String>,
}

/// Stages the request body under the data dir and hands it to the session.
/// The staged copy is removed once the transfer ends or is refused.
async fn send_file(
    State(service): State<PeerService>,
    Query(params): Query<FileParams>,
    body: Bytes,
) -> ApiResult {
    let filename = sanitize_filename(&required(params.filename, "filename")?);

    let uploads = service.config.uploads_dir();
    tokio::fs::create_dir_all(&uploads)
        .await
        .map_err(|e| TelekinesisError::storage("could not create upload directory", e))?;
    let staged = uploads.join(Uuid::new_v4().to_string());
    tokio::fs::write(&staged, &body)
        .await
        .map_err(|e| TelekinesisError::storage("could not stage upload", e))?;
    debug!("staged {} bytes of {filename} at {staged:?}", body.len());

    let id = service
        .session
        .send_file(OutgoingFile::staged(staged, filename.clone()))
        .await?;
    Ok(Json(ApiResponse::success(format!(
        "sending {filename} (transfer {id})"
    ))))
}

async fn disconnect(State(service): State<PeerService>) -> ApiResult {
    match service.session.disconnect().await {
        Ok(()) => Ok(Json(ApiResponse::success("disconnected"))),
        Err(TelekinesisError::InvalidState { .. }) => {
            Ok(Json(ApiResponse::success("already disconnected")))
        }
        Err(e) => Err(e),
    }
}

async fn reset(State(service): State<PeerService>) -> ApiResult {
    service.session.reset().await?;
    Ok(Json(ApiResponse::success("session reset")))
}

async fn get_events(State(service): State<PeerService>) -> Json<PollSnapshot> {
    Json(service.events.poll())
}

async fn status(State(service): State<PeerService>) -> Result<Json<SessionStatus>> {
    Ok(Json(service.session.status().await?))
}

async fn messages(State(service): State<PeerService>) -> Result<Json<Vec<ChatMessage>>> {
    Ok(Json(service.session.chat_log().await?))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error("not found")))
}

fn envelope_event(envelope: &Envelope) -> SseEvent {
    let event = SseEvent::default()
        .id(envelope.id.to_string())
        .event(envelope.event.name());
    match serde_json::to_string(envelope) {
        Ok(data) => event.data(data),
        Err(e) => {
            warn!("could not serialize event {}: {e}", envelope.id);
            event.comment("unserializable event")
        }
    }
}

fn heartbeat_event() -> SseEvent {
    let data = serde_json::json!({ "type": Event::Heartbeat.name() });
    SseEvent::default()
        .event(Event::Heartbeat.name())
        .data(data.to_string())
}

/// Tells the consumer that events were missed and it should fetch a poll
/// snapshot.
fn resync_event(last_event_id: u64) -> SseEvent {
    let data = serde_json::json!({ "type": RESYNC_EVENT, "last_event_id": last_event_id });
    SseEvent::default()
        .event(RESYNC_EVENT)
        .data(data.to_string())
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// The push feed: replay from `Last-Event-ID`, then live events merged with
/// heartbeats. Ends when the service stops.
async fn event_stream(
    State(service): State<PeerService>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let requested = last_event_id(&headers);
    let Subscription { replay, live, gap } = service.events.subscribe(requested);
    if gap {
        info!("event stream resumed from {requested:?} after a gap, asking for resync");
    }

    let events = service.events.clone();
    let head = gap
        .then(|| resync_event(events.last_id()))
        .into_iter()
        .chain(replay.iter().map(envelope_event))
        .collect::<Vec<_>>();

    let live = BroadcastStream::new(live).map(move |item| match item {
        Ok(envelope) => Some(envelope_event(&envelope)),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!("event stream lagged by {missed} events");
            Some(resync_event(events.last_id()))
        }
    });

    let period = service.config.events.heartbeat_interval();
    let heartbeats = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + period,
        period,
    ))
    .map(|_| Some(heartbeat_event()));

    let stop = WatchStream::new(service.stopped())
        .filter(|stopped| *stopped)
        .map(|_| None);

    let stream = tokio_stream::iter(head)
        .map(Some)
        .chain(live.merge(heartbeats).merge(stop))
        .take_while(Option::is_some)
        .filter_map(|event| event.map(Ok::<_, Infallible>));

    Sse::new(stream)
}
