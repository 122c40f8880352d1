//! Server-sent event endpoints for execution progress and logs.

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde_json::json;

use super::{external_error_response, AppState};
use crate::progress::{LogEvent, LogObservation, ProgressEvent};

fn progress_frame(event: ProgressEvent) -> Event {
    match event {
        ProgressEvent::Heartbeat => Event::default().comment("heartbeat"),
        other => Event::default()
            .event(other.name())
            .data(other.data().to_string()),
    }
}

fn log_frame(event: LogEvent) -> Event {
    match event {
        LogEvent::Heartbeat => Event::default().comment("heartbeat"),
        other => Event::default()
            .event(other.name())
            .data(other.data().to_string()),
    }
}

fn sse_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Progress channel of one execution.
///
/// Unknown executions still get a stream: a single error event.
pub(super) async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let events = state
        .watcher
        .watch(id)
        .map(|event| Ok::<Event, Infallible>(progress_frame(event)));
    sse_headers(Sse::new(events).into_response())
}

/// Logs of one execution: a JSON list once it has settled, a live tail
/// while it runs.
pub(super) async fn execution_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.watcher.logs(&id).await {
        Ok(LogObservation::Historical(logs)) => {
            let mut response = Json(json!({
                "live": false,
                "total": logs.len(),
                "logs": logs,
            }))
            .into_response();
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            response
        }
        Ok(LogObservation::Live(events)) => {
            let events = events.map(|event| Ok::<Event, Infallible>(log_frame(event)));
            sse_headers(Sse::new(events).into_response())
        }
        Err(e) => external_error_response(e).into_response(),
    }
}
