use axum::{debug_handler, extract::{Query, State}, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    db::Store,
    model::{parse_wire_time, ChatMessage, GroupId},
    AppError, AppResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUp {
    pub messages: Vec<ChatMessage>,
    pub latest_message_id: String,
}

/// History a reconnecting client is missing.
///
/// If the client already holds the newest message since `since`, only that
/// message comes back as confirmation. Otherwise every message from `since`
/// up to the newest one is returned, oldest first.
pub async fn retrieve_messages(
    store: &Store,
    group_id: GroupId,
    since: OffsetDateTime,
    client_latest_id: &str,
) -> Result<CatchUp, sqlx::Error> {
    let Some(latest) = store.latest_message_since(group_id, since).await? else {
        return Ok(CatchUp {
            messages: Vec::new(),
            latest_message_id: String::new(),
        });
    };

    let latest_message_id = latest.id.clone();
    let messages = if latest.id == client_latest_id {
        vec![latest]
    } else {
        store.messages_between(group_id, since, latest.sent_at).await?
    };

    Ok(CatchUp { messages, latest_message_id })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RetrieveQuery {
    #[serde(alias = "fitGroupId")]
    group_id: GroupId,
    message_time: String,
    #[serde(default)]
    message_id: String,
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn retrieve(
    State(store): State<Store>,
    Query(RetrieveQuery { group_id, message_time, message_id }): Query<RetrieveQuery>,
) -> AppResult<Json<CatchUp>> {
    let since = parse_wire_time(&message_time)
        .map_err(|err| AppError::bad_request(format!("invalid messageTime {message_time:?}: {err}")))?;

    let catch_up = retrieve_messages(&store, group_id, since, &message_id).await?;
    tracing::info!(
        group_id,
        %since,
        client_latest = %message_id,
        server_latest = %catch_up.latest_message_id,
        returned = catch_up.messages.len(),
        "catch-up served"
    );

    Ok(Json(catch_up))
}
