use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    db::{Store, UserRecord},
    model::UserId,
    upstream::Upstream,
};

use super::{decode_id, ReconcileError, Reconciler, Topic};

/// Payload of `user-create-event`: the full user record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreateEvent {
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub state: bool,
    #[serde(default)]
    pub image_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<UserCreateEvent> for UserRecord {
    fn from(event: UserCreateEvent) -> Self {
        UserRecord {
            id: event.user_id,
            nickname: event.nickname,
            state: event.state,
            image_url: event.image_url,
            created_at: event.created_at,
            updated_at: event.updated_at,
        }
    }
}

pub struct UserCreateReconciler {
    store: Store,
}

impl UserCreateReconciler {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Reconciler for UserCreateReconciler {
    fn topic(&self) -> Topic {
        Topic::UserCreate
    }

    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError> {
        let event: UserCreateEvent =
            serde_json::from_slice(payload).map_err(|err| ReconcileError::Decode(err.to_string()))?;
        let user_id = event.user_id;
        self.store.upsert_user(&event.into()).await?;
        tracing::info!(user_id, "user stored");
        Ok(())
    }
}

/// Re-fetches a user whose profile changed upstream.
pub struct UserInfoReconciler {
    store: Store,
    upstream: Arc<dyn Upstream>,
}

impl UserInfoReconciler {
    pub(crate) fn new(store: Store, upstream: Arc<dyn Upstream>) -> Self {
        Self { store, upstream }
    }
}

#[async_trait]
impl Reconciler for UserInfoReconciler {
    fn topic(&self) -> Topic {
        Topic::UserInfo
    }

    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError> {
        let id = decode_id(payload)?;
        let snapshot = self.upstream.fetch_user_info(id).await?;

        let now = OffsetDateTime::now_utc();
        let created_at = self
            .store
            .find_user(snapshot.user_id)
            .await?
            .map_or(now, |known| known.created_at);

        self.store
            .upsert_user(&UserRecord {
                id: snapshot.user_id,
                nickname: snapshot.nickname,
                state: snapshot.state,
                image_url: snapshot.image_url,
                created_at,
                updated_at: now,
            })
            .await?;
        tracing::info!(user_id = id, "user refreshed");
        Ok(())
    }
}
