use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{ChatMessage, GroupId, UserId};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook answered {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub group_id: GroupId,
    pub target_user_id: UserId,
    pub message: ChatMessage,
}

/// Outbound push for members who are not in the room.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::ClientBuilder::new().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let status = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await?
            .status();

        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

/// Fire-and-forget: one task per target, failures are logged and never retried.
pub fn notify_all(
    notifier: &Arc<dyn Notifier>,
    message: &ChatMessage,
    targets: impl IntoIterator<Item = UserId>,
) {
    for target_user_id in targets {
        let notifier = notifier.clone();
        let notification = Notification {
            group_id: message.group_id,
            target_user_id,
            message: message.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&notification).await {
                tracing::warn!(
                    group_id = notification.group_id,
                    target_user_id,
                    message_id = %notification.message.id,
                    error = %err,
                    "offline notification failed"
                );
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::model::MessageKind;

    use super::{testing::RecordingNotifier, *};

    #[tokio::test]
    async fn failures_are_swallowed() {
        let (recorder, mut rx) = RecordingNotifier::new(true);
        let notifier: Arc<dyn Notifier> = recorder.clone();
        let message = ChatMessage {
            id: "m".into(),
            group_id: 4,
            author_user_id: 1,
            body: "hey".into(),
            sent_at: datetime!(2024-05-01 00:00:00 UTC),
            kind: MessageKind::Chatting,
        };

        notify_all(&notifier, &message, [2, 3]);

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![2, 3]);
        assert!(recorder.sent.lock().iter().all(|n| n.group_id == 4 && n.message == message));
    }
}
