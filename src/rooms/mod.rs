mod msg;
mod registry;
mod room;
mod ws;

use std::fmt;

use axum::{routing::get, Router};
use tokio::sync::mpsc::{
    self,
    error::{SendError, TrySendError},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::{model::ServerFrame, AppState};

pub use registry::RoomRegistry;

/// Outbound queue feeding one connection's socket writer, plus the switch a
/// room flips when it gives up on the connection.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerFrame>,
    evicted: CancellationToken,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, evicted: CancellationToken::new() }, rx)
    }

    pub fn try_send(&self, frame: ServerFrame) -> Result<(), TrySendError<ServerFrame>> {
        self.tx.try_send(frame)
    }

    pub async fn send(&self, frame: ServerFrame) -> Result<(), SendError<ServerFrame>> {
        self.tx.send(frame).await
    }

    /// Tells the connection it no longer belongs to its room.
    pub fn evict(&self) {
        self.evicted.cancel();
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.evicted.cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", get(ws::chat_ws))
}
