use std::sync::Arc;

use aikore_instance::{Instance, InstanceId};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error_payload::ApiError;
use crate::launcher::StartReport;
use crate::manager::{InstanceManager, InstanceView};
use crate::terminal::TerminalSession;

pub type AppState = Arc<InstanceManager>;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    supervised: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        supervised: state.registry().ids().await.len(),
    })
}

#[derive(Debug, Serialize)]
struct BlueprintsResponse {
    blueprints: Vec<String>,
}

async fn list_blueprints(State(state): State<AppState>) -> Result<Json<BlueprintsResponse>, ApiError> {
    let blueprints = state.catalog().list().await?;
    Ok(Json(BlueprintsResponse { blueprints }))
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, ApiError> {
    Ok(Json(state.get(&InstanceId(id)).await?))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StartReport>, ApiError> {
    Ok(Json(state.start(&InstanceId(id)).await?))
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    Ok(Json(state.stop(&InstanceId(id)).await?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    lines: Vec<String>,
}

async fn instance_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let lines = state.tail_log(&InstanceId(id), q.lines).await?;
    Ok(Json(LogsResponse { lines }))
}

async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let id = InstanceId(id);
    let session = state.open_terminal(&id).await?;
    Ok(ws.on_upgrade(move |socket| bridge_terminal(socket, session, id)))
}

/// Text when the chunk is UTF-8, binary otherwise so no byte is replaced.
fn output_frame(chunk: Vec<u8>) -> Message {
    match String::from_utf8(chunk) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

async fn bridge_terminal(socket: WebSocket, session: TerminalSession, id: InstanceId) {
    let span = tracing::info_span!("terminal_ws", instance = %id, pid = session.pid());
    async move {
        let (mut sender, mut receiver) = socket.split();
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(64);
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);

        let session_task = tokio::spawn(session.run(in_rx, out_tx));

        let mut writer = tokio::spawn(async move {
            while let Some(chunk) = out_rx.recv().await {
                if sender.send(output_frame(chunk)).await.is_err() {
                    break;
                }
            }
            let _ = sender.send(Message::Close(None)).await;
        });

        loop {
            tokio::select! {
                _ = &mut writer => break,
                msg = receiver.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => text.into_bytes(),
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        drop(in_tx);

        match session_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "terminal session ended with error"),
            Err(e) => tracing::error!(error = %e, "terminal session task failed"),
        }
        if !writer.is_finished() {
            let _ = writer.await;
        }
    }
    .instrument(span)
    .await
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/blueprints", get(list_blueprints))
        .route("/api/instances/:id", get(get_instance))
        .route("/api/instances/:id/start", post(start_instance))
        .route("/api/instances/:id/stop", post(stop_instance))
        .route("/api/instances/:id/logs", get(instance_logs))
        .route("/api/instances/:id/terminal", get(terminal_ws))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_output_goes_out_as_text() {
        match output_frame("prompt $ é".as_bytes().to_vec()) {
            Message::Text(text) => assert_eq!(text, "prompt $ é"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn non_utf8_output_keeps_its_bytes() {
        let raw = vec![b'a', 0xff, 0xfe, b'b'];
        match output_frame(raw.clone()) {
            Message::Binary(bytes) => assert_eq!(bytes, raw),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
