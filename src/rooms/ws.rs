use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{ws::{Message, WebSocket}, Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::{
    db::Store,
    model::{ChatSubmission, GroupId, UserId},
    notify::Notifier,
};

use super::{msg, ConnectionId, RoomRegistry};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChatQuery {
    #[serde(alias = "fitGroupId")]
    group_id: GroupId,
    user_id: UserId,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn chat_ws(
    Query(ChatQuery { group_id, user_id }): Query<ChatQuery>,
    State(rooms): State<RoomRegistry>,
    State(store): State<Store>,
    State(notifier): State<Arc<dyn Notifier>>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_client(socket, group_id, user_id, rooms, store, notifier))
}

async fn serve_client(
    socket: WebSocket,
    group_id: GroupId,
    user_id: UserId,
    rooms: RoomRegistry,
    store: Store,
    notifier: Arc<dyn Notifier>,
) {
    let conn = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut inbox) = rooms.outbox();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(error = %err, "could not encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let clients = rooms.join(group_id, conn, user_id, outbox.clone()).await;
    tracing::info!(group_id, user_id, %conn, clients, "client joined");

    let mut writer_done = false;
    loop {
        let frame = tokio::select! {
            _ = rooms.closed() => break,
            _ = outbox.evicted() => {
                tracing::info!(group_id, user_id, %conn, "evicted from room");
                break;
            }
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                tracing::debug!(%conn, error = %err, "read error");
                break;
            }
        };

        let submission = match serde_json::from_str::<ChatSubmission>(text.as_str()) {
            Ok(submission) => submission,
            Err(err) => {
                tracing::warn!(%conn, error = %err, "skipping undecodable frame");
                continue;
            }
        };

        let message = submission.into_message(group_id, user_id);
        if msg::send_msg(&store, &rooms, &notifier, &outbox, message).await == msg::SendOutcome::SenderGone {
            break;
        }
    }

    let clients = rooms.leave(group_id, conn).await.unwrap_or(0);
    tracing::info!(group_id, user_id, %conn, clients, "client left");

    drop(outbox);
    if !writer_done {
        let _ = writer.await;
    }
}
