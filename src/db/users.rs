use time::OffsetDateTime;

use crate::model::UserId;

use super::{from_db_time, to_db_time, Store};

/// Local projection of an upstream user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub nickname: String,
    pub state: bool,
    pub image_url: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Store {
    /// Insert-or-overwrite keyed by user id; the last write wins.
    pub async fn upsert_user(&self, user: &UserRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (id,nickname,state,image_url,created_at,updated_at) VALUES (?,?,?,?,?,?)
             ON CONFLICT(id) DO UPDATE SET
                nickname=excluded.nickname,
                state=excluded.state,
                image_url=excluded.image_url,
                created_at=excluded.created_at,
                updated_at=excluded.updated_at",
        )
        .bind(user.id)
        .bind(&user.nickname)
        .bind(user.state)
        .bind(&user.image_url)
        .bind(to_db_time(user.created_at))
        .bind(to_db_time(user.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_user(&self, id: UserId) -> Result<Option<UserRecord>, sqlx::Error> {
        let row: Option<(i64, String, bool, String, i64, i64)> =
            sqlx::query_as("SELECT id,nickname,state,image_url,created_at,updated_at FROM users WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id, nickname, state, image_url, created_at, updated_at)| {
            Ok(UserRecord {
                id,
                nickname,
                state,
                image_url,
                created_at: from_db_time(created_at)?,
                updated_at: from_db_time(updated_at)?,
            })
        })
        .transpose()
    }
}
