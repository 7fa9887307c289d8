use std::{collections::HashSet, sync::Arc};

use crate::{
    db::Store,
    model::{ChatMessage, FailureNotice, ServerFrame, UserId},
    notify::{notify_all, Notifier},
};

use super::{Outbox, RoomRegistry};

pub(crate) const SAVE_FAILED: &str = "failed to save message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendOutcome {
    Saved,
    SaveFailed,
    /// The sender could not even be told about a failed save.
    SenderGone,
}

/// Broadcasts first, then persists. A failed save is reported to the sender
/// only; peers keep the copy they already received.
pub(crate) async fn send_msg(
    store: &Store,
    rooms: &RoomRegistry,
    notifier: &Arc<dyn Notifier>,
    sender: &Outbox,
    message: ChatMessage,
) -> SendOutcome {
    let present = rooms.publish(message.clone()).await;

    if let Err(err) = store.save_message(&message).await {
        tracing::error!(group_id = message.group_id, message_id = %message.id, error = %err, "failed to save message");
        let notice = ServerFrame::Failure(FailureNotice {
            message_id: message.id.clone(),
            reason: SAVE_FAILED.to_owned(),
        });
        return match sender.send(notice).await {
            Ok(()) => SendOutcome::SaveFailed,
            Err(_) => SendOutcome::SenderGone,
        };
    }

    match offline_members(store, &message, &present).await {
        Ok(targets) => notify_all(notifier, &message, targets),
        Err(err) => tracing::warn!(group_id = message.group_id, error = %err, "could not resolve offline members"),
    }

    SendOutcome::Saved
}

/// Known members of the group who are neither the author nor in the room.
async fn offline_members(
    store: &Store,
    message: &ChatMessage,
    present: &HashSet<UserId>,
) -> Result<Vec<UserId>, sqlx::Error> {
    Ok(store
        .mate_user_ids(message.group_id)
        .await?
        .into_iter()
        .filter(|user_id| *user_id != message.author_user_id && !present.contains(user_id))
        .collect())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use tokio_util::sync::CancellationToken;

    use crate::{
        db::{memory_store, sample_group, MateRecord},
        model::MessageKind,
        notify::testing::RecordingNotifier,
        rooms::ConnectionId,
    };

    use super::*;

    fn message(id: &str, author: UserId) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            group_id: 42,
            author_user_id: author,
            body: "hi".into(),
            sent_at: datetime!(2024-05-01 00:00:00 UTC),
            kind: MessageKind::Chatting,
        }
    }

    #[tokio::test]
    async fn offline_members_get_notified() {
        let store = memory_store().await;
        store.insert_group(&sample_group(42)).await.unwrap();
        for (id, user) in [(1, 10), (2, 20), (3, 30)] {
            store.insert_mate(&MateRecord::placeholder(id, user, 42)).await.unwrap();
        }

        let rooms = RoomRegistry::new(8, CancellationToken::new());
        let (author_out, _author_in) = rooms.outbox();
        let (peer_out, mut peer_in) = rooms.outbox();
        rooms.join(42, ConnectionId::new(), 10, author_out.clone()).await;
        rooms.join(42, ConnectionId::new(), 20, peer_out).await;

        let (recorder, mut notified) = RecordingNotifier::new(false);
        let notifier: Arc<dyn Notifier> = recorder.clone();

        let outcome = send_msg(&store, &rooms, &notifier, &author_out, message("m1", 10)).await;
        assert_eq!(outcome, SendOutcome::Saved);
        assert!(matches!(peer_in.recv().await, Some(ServerFrame::Message(m)) if m.id == "m1"));
        assert_eq!(notified.recv().await, Some(30));
        assert_eq!(recorder.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_save_is_reported_to_sender_after_broadcast() {
        let store = memory_store().await;
        let rooms = RoomRegistry::new(8, CancellationToken::new());
        let (author_out, mut author_in) = rooms.outbox();
        let (peer_out, mut peer_in) = rooms.outbox();
        rooms.join(42, ConnectionId::new(), 10, author_out.clone()).await;
        rooms.join(42, ConnectionId::new(), 20, peer_out).await;
        let (recorder, _) = RecordingNotifier::new(false);
        let notifier: Arc<dyn Notifier> = recorder;

        assert_eq!(send_msg(&store, &rooms, &notifier, &author_out, message("dup", 10)).await, SendOutcome::Saved);
        let _ = peer_in.recv().await;

        // same id again: the insert fails but peers still get the copy
        let outcome = send_msg(&store, &rooms, &notifier, &author_out, message("dup", 10)).await;
        assert_eq!(outcome, SendOutcome::SaveFailed);
        assert!(matches!(peer_in.recv().await, Some(ServerFrame::Message(_))));
        assert_eq!(
            author_in.recv().await,
            Some(ServerFrame::Failure(FailureNotice {
                message_id: "dup".into(),
                reason: SAVE_FAILED.into(),
            }))
        );
    }

    #[tokio::test]
    async fn unreachable_sender_ends_the_connection() {
        let store = memory_store().await;
        let rooms = RoomRegistry::new(8, CancellationToken::new());
        let (recorder, _) = RecordingNotifier::new(false);
        let notifier: Arc<dyn Notifier> = recorder;
        store.save_message(&message("taken", 10)).await.unwrap();

        let (sender, inbox) = rooms.outbox();
        drop(inbox);
        let outcome = send_msg(&store, &rooms, &notifier, &sender, message("taken", 10)).await;
        assert_eq!(outcome, SendOutcome::SenderGone);
    }
}
