use std::collections::{HashMap, HashSet};

use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::{ChatMessage, GroupId, ServerFrame, UserId};

use super::{registry::RoomMap, ConnectionId, Outbox};

pub(crate) enum RoomCommand {
    Register {
        conn: ConnectionId,
        user_id: UserId,
        outbox: Outbox,
        done: oneshot::Sender<usize>,
    },
    Unregister {
        conn: ConnectionId,
        done: oneshot::Sender<usize>,
    },
    /// Replies with the presence set as it stands after delivery.
    Broadcast {
        message: ChatMessage,
        done: oneshot::Sender<HashSet<UserId>>,
    },
}

struct Client {
    user_id: UserId,
    outbox: Outbox,
}

/// State of one live group. Only ever touched by its own control loop.
pub(crate) struct Room {
    group_id: GroupId,
    instance: Uuid,
    clients: HashMap<ConnectionId, Client>,
    presence: HashSet<UserId>,
    acks: Vec<oneshot::Sender<usize>>,
}

impl Room {
    pub(crate) fn new(group_id: GroupId, instance: Uuid) -> Self {
        Self {
            group_id,
            instance,
            clients: HashMap::new(),
            presence: HashSet::new(),
            acks: Vec::new(),
        }
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Register { conn, user_id, outbox, done } => {
                self.clients.insert(conn, Client { user_id, outbox });
                self.presence.insert(user_id);
                self.acks.push(done);
            }
            RoomCommand::Unregister { conn, done } => {
                self.remove(conn);
                self.acks.push(done);
            }
            RoomCommand::Broadcast { message, done } => {
                self.broadcast(&message);
                let _ = done.send(self.presence.clone());
            }
        }
    }

    fn broadcast(&mut self, message: &ChatMessage) {
        let mut dead = Vec::new();
        for (conn, client) in &self.clients {
            if client.user_id == message.author_user_id {
                continue;
            }

            let frame = ServerFrame::Message(message.clone());
            if let Err(err) = client.outbox.try_send(frame) {
                let reason = match err {
                    TrySendError::Full(_) => "outbound queue full",
                    TrySendError::Closed(_) => "connection closed",
                };
                tracing::warn!(group_id = self.group_id, %conn, user_id = client.user_id, reason, "dropping client");
                dead.push(*conn);
            }
        }

        for conn in dead {
            self.remove(conn);
        }
    }

    fn remove(&mut self, conn: ConnectionId) {
        let Some(client) = self.clients.remove(&conn) else {
            return;
        };
        client.outbox.evict();

        if !self.clients.values().any(|c| c.user_id == client.user_id) {
            self.presence.remove(&client.user_id);
        }
    }

    /// Drops the registry entry if the room is still empty once every queued
    /// command has been applied. Runs under the registry lock so no join can
    /// slip in between the check and the removal.
    fn retire(&mut self, rooms: &RoomMap, rx: &mut mpsc::UnboundedReceiver<RoomCommand>) -> bool {
        let mut rooms = rooms.lock();
        while self.clients.is_empty() {
            match rx.try_recv() {
                Ok(command) => self.handle(command),
                Err(_) => {
                    if rooms.get(&self.group_id).is_some_and(|h| h.instance == self.instance) {
                        rooms.remove(&self.group_id);
                    }
                    return true;
                }
            }
        }
        false
    }

    fn flush_acks(&mut self) {
        let remaining = self.clients.len();
        for done in self.acks.drain(..) {
            let _ = done.send(remaining);
        }
    }
}

pub(crate) async fn run(
    mut room: Room,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    rooms: RoomMap,
    shutdown: CancellationToken,
) {
    tracing::info!(group_id = room.group_id, "room opened");

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        room.handle(command);
        let retired = room.clients.is_empty() && room.retire(&rooms, &mut rx);
        room.flush_acks();

        if retired {
            tracing::info!(group_id = room.group_id, "room closed");
            return;
        }
    }

    // dropping every outbox ends the writers, which close their sockets
    let released = room.clients.len();
    for (_, client) in room.clients.drain() {
        client.outbox.evict();
    }
    room.presence.clear();
    room.flush_acks();
    tracing::info!(group_id = room.group_id, released, "room shut down");
}

#[cfg(test)]
impl Room {
    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn present(&self) -> &HashSet<UserId> {
        &self.presence
    }
}
