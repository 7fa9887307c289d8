use axum::{debug_handler, extract::{Query, State}, Json};
use serde::Deserialize;

use crate::{
    db::{GroupRecord, Store},
    model::UserId,
    AppResult,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupsQuery {
    user_id: UserId,
}

/// Groups the user is a member of, from the local replica.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn groups_for_user(
    State(store): State<Store>,
    Query(GroupsQuery { user_id }): Query<GroupsQuery>,
) -> AppResult<Json<Vec<GroupRecord>>> {
    Ok(Json(store.groups_for_user(user_id).await?))
}
