// src/handlers/ws.rs
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineId};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension, Path,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use serde::Serialize;
use std::sync::Arc;

/// Frames pushed to a status subscriber
#[derive(Serialize)]
#[serde(tag = "type")]
enum StatusFrame<'a> {
    #[serde(rename = "snapshot")]
    Snapshot { pipeline: &'a Pipeline },
    #[serde(rename = "update")]
    Update { pipeline: &'a Pipeline },
    #[serde(rename = "error")]
    Error { message: String, recoverable: bool },
}

pub fn ws_routes() -> Router {
    Router::new().route("/ws/pipelines/:pipeline_id", get(pipeline_socket_handler))
}

async fn pipeline_socket_handler(
    ws: WebSocketUpgrade,
    Path(pipeline_id): Path<PipelineId>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| pipeline_socket(socket, state, pipeline_id))
}

async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &StatusFrame<'_>) -> bool {
    match serde_json::to_string(frame) {
        Ok(json_str) => sender.send(Message::Text(json_str)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize status frame: {}", e);
            false
        }
    }
}

async fn pipeline_socket(stream: WebSocket, state: Arc<AppState>, pipeline_id: PipelineId) {
    let (mut sender, mut receiver) = stream.split();

    let mut handle = match state.registry.open(&pipeline_id).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("Rejected status subscription for {}: {}", pipeline_id, e);
            let frame = StatusFrame::Error {
                message: e.to_string(),
                recoverable: e.is_recoverable(),
            };
            send_frame(&mut sender, &frame).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::info!("🔌 Status socket opened for pipeline {}", pipeline_id);

    let mut open = send_frame(
        &mut sender,
        &StatusFrame::Snapshot {
            pipeline: handle.snapshot(),
        },
    )
    .await;

    while open && !handle.is_finished() {
        tokio::select! {
            incoming = receiver.next() => {
                // Clients only ever close; anything else is ignored
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                    Some(Ok(_)) => {}
                }
            }
            next = handle.next() => {
                match next {
                    Ok(Some(pipeline)) => {
                        open = send_frame(&mut sender, &StatusFrame::Update { pipeline: &pipeline }).await;
                    }
                    Ok(None) => break,
                    Err(PipelineError::SubscriptionTimeout { .. }) => {
                        // Quiet topic: fall back to a point-read
                        match state.orchestrator.get(&pipeline_id).await {
                            Ok(current) => {
                                handle.reconcile(&current);
                                open = send_frame(&mut sender, &StatusFrame::Snapshot { pipeline: &current }).await;
                            }
                            Err(e) => {
                                send_frame(&mut sender, &StatusFrame::Error {
                                    message: e.to_string(),
                                    recoverable: false,
                                }).await;
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("📡 Status stream for {} interrupted: {}", pipeline_id, e);
                        send_frame(&mut sender, &StatusFrame::Error {
                            message: e.to_string(),
                            recoverable: e.is_recoverable(),
                        }).await;
                        break;
                    }
                }
            }
        }
    }

    state.registry.close(handle).await;
    let _ = sender.send(Message::Close(None)).await;
    tracing::info!("🔌 Status socket closed for pipeline {}", pipeline_id);
}
