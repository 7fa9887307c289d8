use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    debug_handler,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::{db::Store, reconcile::Pipeline, AppResult, AppState};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("event log: {0}")]
    Store(#[from] sqlx::Error),
}

/// One raw event handed out by an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub offset: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    /// Times this event has been handed out, this delivery included.
    pub attempts: u32,
}

/// An at-least-once stream with manual acknowledgement.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch(&self) -> Result<Option<Delivery>, IngressError>;
    async fn ack(&self, offset: i64) -> Result<(), IngressError>;
    /// Hands a fetched event back undelivered: the attempt is not counted and
    /// the event becomes visible again after `delay`.
    async fn release(&self, offset: i64, delay: Duration) -> Result<(), IngressError>;
}

/// Durable event log kept next to the replica. A fetched event is leased;
/// if it is not acked before the lease runs out it is delivered again.
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    pool: SqlitePool,
    lease: Duration,
}

impl SqliteEventLog {
    pub fn new(store: &Store, lease: Duration) -> Self {
        Self {
            pool: store.pool().clone(),
            lease,
        }
    }

    pub async fn append(&self, topic: &str, payload: &[u8]) -> Result<i64, sqlx::Error> {
        let (offset,): (i64,) = sqlx::query_as("INSERT INTO events (topic,payload) VALUES (?,?) RETURNING seq")
            .bind(topic)
            .bind(payload)
            .fetch_one(&self.pool)
            .await?;
        Ok(offset)
    }

    /// Events not yet acknowledged, leased or not.
    pub async fn pending(&self) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[async_trait]
impl EventSource for SqliteEventLog {
    async fn fetch(&self) -> Result<Option<Delivery>, IngressError> {
        let now = now_millis();
        let lease_ms = i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX);
        let row: Option<(i64, String, Vec<u8>, i64)> = sqlx::query_as(
            "UPDATE events SET attempts = attempts + 1, leased_until = ?
             WHERE seq = (SELECT seq FROM events WHERE leased_until <= ? ORDER BY seq LIMIT 1)
             RETURNING seq, topic, payload, attempts",
        )
        .bind(now.saturating_add(lease_ms))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(offset, topic, payload, attempts)| Delivery {
            offset,
            topic,
            payload,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    async fn ack(&self, offset: i64) -> Result<(), IngressError> {
        sqlx::query("DELETE FROM events WHERE seq=?")
            .bind(offset)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, offset: i64, delay: Duration) -> Result<(), IngressError> {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        sqlx::query("UPDATE events SET attempts = MAX(attempts - 1, 0), leased_until = ? WHERE seq=?")
            .bind(now_millis().saturating_add(delay_ms))
            .bind(offset)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Feeds the pipeline until `shutdown` fires. Idle polls back off by `poll_interval`.
pub async fn consume(
    source: Arc<dyn EventSource>,
    pipeline: Pipeline,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("event consumer started");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.fetch() => next,
        };

        match next {
            Ok(Some(delivery)) => {
                tracing::debug!(offset = delivery.offset, topic = %delivery.topic, attempts = delivery.attempts, "event received");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = pipeline.dispatch(delivery) => {}
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "fetching events failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    tracing::info!("event consumer stopped");
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn publish(
    State(events): State<SqliteEventLog>,
    Path(topic): Path<String>,
    payload: Bytes,
) -> AppResult<(StatusCode, Json<Value>)> {
    let offset = events.append(&topic, &payload).await?;
    tracing::debug!(%topic, offset, "event appended");
    Ok((StatusCode::ACCEPTED, Json(json!({ "offset": offset }))))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events/{topic}", post(publish))
}
