use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{
    mpsc::{self, error::SendError},
    oneshot,
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::model::{ChatMessage, GroupId, ServerFrame, UserId};

use super::{
    room::{self, Room, RoomCommand},
    ConnectionId, Outbox,
};

#[derive(Clone)]
pub(crate) struct RoomHandle {
    pub(crate) instance: Uuid,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

pub(crate) type RoomMap = Arc<Mutex<HashMap<GroupId, RoomHandle>>>;

/// Maps group ids to live room actors. Rooms open on first join and close
/// themselves when their last client leaves.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomMap,
    outbound_buffer: usize,
    shutdown: CancellationToken,
}

impl RoomRegistry {
    pub fn new(outbound_buffer: usize, shutdown: CancellationToken) -> Self {
        Self {
            rooms: Arc::default(),
            outbound_buffer: outbound_buffer.max(1),
            shutdown,
        }
    }

    /// A fresh per-connection outbound queue.
    pub fn outbox(&self) -> (Outbox, mpsc::Receiver<ServerFrame>) {
        Outbox::channel(self.outbound_buffer)
    }

    /// Registers the connection, opening the room if needed.
    /// Returns the room's client count once registered.
    pub async fn join(&self, group_id: GroupId, conn: ConnectionId, user_id: UserId, outbox: Outbox) -> usize {
        let (done, registered) = oneshot::channel();
        let command = RoomCommand::Register { conn, user_id, outbox, done };

        {
            let mut rooms = self.rooms.lock();
            let unsent = match rooms.get(&group_id) {
                Some(handle) => handle.tx.send(command).err().map(|SendError(command)| command),
                None => Some(command),
            };

            if let Some(command) = unsent {
                let handle = self.open(group_id);
                let _ = handle.tx.send(command);
                rooms.insert(group_id, handle);
            }
        }

        registered.await.unwrap_or(0)
    }

    /// Returns the remaining client count, or `None` if the room was not open.
    pub async fn leave(&self, group_id: GroupId, conn: ConnectionId) -> Option<usize> {
        let (done, unregistered) = oneshot::channel();
        self.send(group_id, RoomCommand::Unregister { conn, done })?;
        unregistered.await.ok()
    }

    /// Fans the message out and returns the users present in the room.
    pub async fn publish(&self, message: ChatMessage) -> HashSet<UserId> {
        let group_id = message.group_id;
        let (done, delivered) = oneshot::channel();
        if self.send(group_id, RoomCommand::Broadcast { message, done }).is_none() {
            return HashSet::new();
        }
        delivered.await.unwrap_or_default()
    }

    pub fn contains(&self, group_id: GroupId) -> bool {
        self.rooms.lock().contains_key(&group_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every room, releasing all client connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.rooms.lock().clear();
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    fn send(&self, group_id: GroupId, command: RoomCommand) -> Option<()> {
        let tx = self.rooms.lock().get(&group_id)?.tx.clone();
        tx.send(command).ok()
    }

    fn open(&self, group_id: GroupId) -> RoomHandle {
        let instance = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(room::run(
            Room::new(group_id, instance),
            rx,
            self.rooms.clone(),
            self.shutdown.clone(),
        ));
        RoomHandle { instance, tx }
    }
}
