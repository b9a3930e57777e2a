//! Reviewer event stream.
//!
//! On connect the client receives a `pending_sync` with every pending
//! proposal, then each `ProposalEvent` as it is broadcast. Clients may also
//! approve or reject over the socket. Decisions run off the socket loop;
//! successes arrive through the broadcast stream and refusals come back to the
//! sender alone as an `error` frame.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::routes::AppState;
use crate::approval::{ApprovalService, ProposalEvent};

/// Actions a reviewer can send over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Approve {
        proposal_id: Uuid,
        decided_by: Option<String>,
    },
    Reject {
        proposal_id: Uuid,
        decided_by: Option<String>,
        reason: Option<String>,
    },
}

/// Frames addressed to a single client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        proposal_id: Option<Uuid>,
        error: String,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, frame: &T) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WS frame");
            true
        }
    }
}

async fn pending_sync(approvals: &ApprovalService) -> Option<ProposalEvent> {
    match approvals.pending().await {
        Ok(proposals) => Some(ProposalEvent::PendingSync { proposals }),
        Err(e) => {
            warn!(error = %e, "Failed to load pending proposals for sync");
            None
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing created in between is missed.
    let mut rx = state.approvals.subscribe();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    if let Some(sync) = pending_sync(&state.approvals).await
        && !send_json(&mut socket, &sync).await
    {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_json(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if let Some(sync) = pending_sync(&state.approvals).await
                            && !send_json(&mut socket, &sync).await
                        {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            Some(reply) = reply_rx.recv() => {
                if !send_json(&mut socket, &reply).await {
                    debug!("Client disconnected during reply");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientAction>(&text) {
                        Ok(action) => {
                            tokio::spawn(decide(action, Arc::clone(&state.approvals), reply_tx.clone()));
                        }
                        Err(e) => {
                            warn!(error = %e, raw = %text.as_str(), "Unrecognized WS message");
                            let _ = reply_tx.send(Reply::Error {
                                proposal_id: None,
                                error: format!("unrecognized message: {e}"),
                            });
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Run one reviewer decision. Refusals go back to the sender only.
async fn decide(action: ClientAction, approvals: Arc<ApprovalService>, reply: mpsc::UnboundedSender<Reply>) {
    let (proposal_id, result) = match action {
        ClientAction::Approve {
            proposal_id,
            decided_by,
        } => (
            proposal_id,
            approvals.approve(proposal_id, decided_by.as_deref()).await,
        ),
        ClientAction::Reject {
            proposal_id,
            decided_by,
            reason,
        } => (
            proposal_id,
            approvals
                .reject(proposal_id, decided_by.as_deref(), reason.as_deref())
                .await,
        ),
    };

    match result {
        Ok(action) => info!(proposal_id = %proposal_id, status = %action.status, "Decision via WS"),
        Err(e) => {
            warn!(proposal_id = %proposal_id, error = %e, "Decision via WS refused");
            // The client may have gone away; nothing else to do then.
            let _ = reply.send(Reply::Error {
                proposal_id: Some(proposal_id),
                error: e.to_string(),
            });
        }
    }
}
