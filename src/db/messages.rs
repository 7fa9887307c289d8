use time::OffsetDateTime;

use crate::model::{ChatMessage, GroupId, MessageKind};

use super::{from_db_time, to_db_time, Store};

type MessageRow = (String, i64, i64, String, i64, String);

fn from_row((id, group_id, user_id, body, sent_at, kind): MessageRow) -> Result<ChatMessage, sqlx::Error> {
    Ok(ChatMessage {
        id,
        group_id,
        author_user_id: user_id,
        body,
        sent_at: from_db_time(sent_at)?,
        kind: kind
            .parse::<MessageKind>()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
    })
}

impl Store {
    pub async fn save_message(&self, msg: &ChatMessage) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO messages (id,group_id,user_id,body,sent_at,kind) VALUES (?,?,?,?,?,?)")
            .bind(&msg.id)
            .bind(msg.group_id)
            .bind(msg.author_user_id)
            .bind(&msg.body)
            .bind(to_db_time(msg.sent_at))
            .bind(msg.kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent message of the group sent at or after `since`.
    pub async fn latest_message_since(
        &self,
        group_id: GroupId,
        since: OffsetDateTime,
    ) -> Result<Option<ChatMessage>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT id,group_id,user_id,body,sent_at,kind FROM messages
             WHERE group_id=? AND sent_at>=?
             ORDER BY sent_at DESC, id DESC
             LIMIT 1",
        )
        .bind(group_id)
        .bind(to_db_time(since))
        .fetch_optional(&self.pool)
        .await?
        .map(from_row)
        .transpose()
    }

    /// Messages with `from <= sent_at <= to`, oldest first.
    pub async fn messages_between(
        &self,
        group_id: GroupId,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<ChatMessage>, sqlx::Error> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT id,group_id,user_id,body,sent_at,kind FROM messages
             WHERE group_id=? AND sent_at>=? AND sent_at<=?
             ORDER BY sent_at ASC, id ASC",
        )
        .bind(group_id)
        .bind(to_db_time(from))
        .bind(to_db_time(to))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use crate::db::memory_store;

    use super::*;

    fn msg(id: &str, group_id: GroupId, sent_at: OffsetDateTime) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            group_id,
            author_user_id: 1,
            body: format!("body of {id}"),
            sent_at,
            kind: MessageKind::Chatting,
        }
    }

    #[tokio::test]
    async fn latest_breaks_time_ties_by_id() {
        let store = memory_store().await;
        let at = datetime!(2024-05-01 10:00:00 UTC);
        store.save_message(&msg("a", 1, at)).await.unwrap();
        store.save_message(&msg("b", 1, at)).await.unwrap();
        store.save_message(&msg("z", 2, at)).await.unwrap();

        let latest = store.latest_message_since(1, at).await.unwrap().unwrap();
        assert_eq!(latest.id, "b");
        assert_eq!(latest.sent_at, at);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = memory_store().await;
        let at = datetime!(2024-05-01 10:00:00 UTC);
        store.save_message(&msg("a", 1, at)).await.unwrap();
        assert!(store.save_message(&msg("a", 1, at)).await.is_err());
    }

    #[tokio::test]
    async fn range_is_inclusive_and_ascending() {
        let store = memory_store().await;
        let t0 = datetime!(2024-05-01 10:00:00 +09:00);
        for (id, minutes) in [("m3", 3), ("m1", 1), ("m2", 2), ("m4", 4), ("m0", 0)] {
            store
                .save_message(&msg(id, 1, t0 + time::Duration::minutes(minutes)))
                .await
                .unwrap();
        }

        let got = store
            .messages_between(1, t0 + time::Duration::minutes(1), t0 + time::Duration::minutes(3))
            .await
            .unwrap();
        let ids: Vec<_> = got.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }
}
