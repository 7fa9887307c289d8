use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::model::{GroupId, UserId};

use super::{to_db_time, Store};

/// One membership row: user `user_id` is a mate of group `group_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MateRecord {
    pub id: i64,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl MateRecord {
    /// A freshly reconciled membership; profile fields arrive via the user topics.
    pub fn placeholder(id: i64, user_id: UserId, group_id: GroupId) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            user_id,
            group_id,
            active: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Store {
    pub async fn mate_ids(&self, group_id: GroupId) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM mates WHERE group_id=? ORDER BY id")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Distinct users holding a membership in the group.
    pub async fn mate_user_ids(&self, group_id: GroupId) -> Result<BTreeSet<UserId>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT DISTINCT user_id FROM mates WHERE group_id=?")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn insert_mate(&self, mate: &MateRecord) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO mates (id,user_id,group_id,active,created_at,updated_at) VALUES (?,?,?,?,?,?)")
            .bind(mate.id)
            .bind(mate.user_id)
            .bind(mate.group_id)
            .bind(mate.active)
            .bind(to_db_time(mate.created_at))
            .bind(to_db_time(mate.updated_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes then inserts as one transaction; on error nothing is applied.
    pub async fn replace_mates(&self, delete: &[i64], insert: &[MateRecord]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for id in delete {
            sqlx::query("DELETE FROM mates WHERE id=?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for mate in insert {
            sqlx::query("INSERT INTO mates (id,user_id,group_id,active,created_at,updated_at) VALUES (?,?,?,?,?,?)")
                .bind(mate.id)
                .bind(mate.user_id)
                .bind(mate.group_id)
                .bind(mate.active)
                .bind(to_db_time(mate.created_at))
                .bind(to_db_time(mate.updated_at))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }

    pub async fn delete_mate(&self, id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM mates WHERE id=?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
