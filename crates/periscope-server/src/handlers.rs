//! API route handlers.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use tracing::{debug, info};

use periscope_core::session::{StreamItem, DEFAULT_SESSION};

use crate::error::{ApiError, Result};
use crate::models::{CommandRequest, CommandResponse};
use crate::state::AppState;

/// Protocol version the command endpoint accepts.
const PROTOCOL_VERSION: &str = "v1";

/// POST /api/command - dispatch a control command.
pub async fn command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>> {
    if req.version != PROTOCOL_VERSION {
        return Err(ApiError::UnsupportedVersion(req.version));
    }
    debug!(cmd = %req.cmd, uuid = ?req.uuid, "dispatching command");

    match req.cmd.as_str() {
        "hello" => Ok(Json(CommandResponse::new("hello", req.uuid))),

        "start_proxy_pac" => {
            let content = req.content.ok_or_else(|| {
                ApiError::BadRequest("start_proxy_pac requires content".to_string())
            })?;
            state
                .controller
                .start(
                    DEFAULT_SESSION,
                    content.proxy_port,
                    content.pac_port,
                    &content.target,
                )
                .await?;
            Ok(Json(CommandResponse::new(
                format!(
                    "started proxy server on port {} and pac server on port {}",
                    content.proxy_port, content.pac_port
                ),
                req.uuid,
            )))
        }

        // Stop is detached: the caller gets an immediate acknowledgement
        // and the per-channel outcome is logged when the drain finishes.
        "stop_proxy_pac" => {
            let controller = state.controller.clone();
            tokio::spawn(async move {
                let report = controller.stop(DEFAULT_SESSION).await;
                if report.is_clean() {
                    info!("session stop completed");
                } else {
                    tracing::warn!(?report, "session stop completed with unacknowledged signals");
                }
            });
            Ok(Json(CommandResponse::new(
                "stop signal dispatched to proxy and pac servers",
                req.uuid,
            )))
        }

        cmd @ ("start_proxy" | "start_pac" | "stop_proxy" | "stop_pac") => {
            Err(ApiError::NotImplemented(cmd.to_string()))
        }

        _ => Err(ApiError::UnknownCommand(req.cmd)),
    }
}

/// GET /api/stream - stream decoded text segments.
///
/// Server-streaming read of the active session's output channel. Each
/// decoded segment becomes a `data` event; the stream ends with a single
/// `stop` event when the stop sentinel arrives or the channel closes.
pub async fn stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let session = state
        .registry
        .active()
        .map_err(|error| ApiError::NotFound(error.to_string()))?;
    let output = session.take_output().map_err(|_| ApiError::StreamAttached)?;
    info!(key = session.key(), "stream attached");

    let stream = futures::stream::unfold(Some(output), |slot| async move {
        let mut output = slot?;
        match output.recv().await {
            Some(StreamItem::Data(text)) => {
                let event = Event::default().event("data").data(text);
                Some((Ok(event), Some(output)))
            }
            Some(StreamItem::Stop) | None => {
                let event = Event::default().event("stop").data("stop");
                // Yield the sentinel, then end the stream.
                Some((Ok(event), None))
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
