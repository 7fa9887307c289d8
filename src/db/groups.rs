use serde::Serialize;
use time::OffsetDateTime;

use crate::model::{GroupId, UserId};

use super::{from_db_time, to_db_time, Store};

/// Local replica of an upstream group. Upstream is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: GroupId,
    pub leader_user_id: UserId,
    pub name: String,
    pub category: i64,
    pub cycle: i64,
    pub frequency: i64,
    pub member_count_hint: i64,
    pub max_members: i64,
    pub retired: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

type GroupRow = (i64, i64, String, i64, i64, i64, i64, i64, bool, i64, i64);

const GROUP_COLUMNS: &str =
    "g.id,g.leader_user_id,g.name,g.category,g.cycle,g.frequency,g.member_count_hint,g.max_members,g.retired,g.created_at,g.updated_at";

fn from_row(row: GroupRow) -> Result<GroupRecord, sqlx::Error> {
    let (id, leader_user_id, name, category, cycle, frequency, member_count_hint, max_members, retired, created_at, updated_at) = row;
    Ok(GroupRecord {
        id,
        leader_user_id,
        name,
        category,
        cycle,
        frequency,
        member_count_hint,
        max_members,
        retired,
        created_at: from_db_time(created_at)?,
        updated_at: from_db_time(updated_at)?,
    })
}

impl Store {
    pub async fn find_group(&self, id: GroupId) -> Result<Option<GroupRecord>, sqlx::Error> {
        sqlx::query_as::<_, GroupRow>(&format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.id=?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(from_row)
            .transpose()
    }

    pub async fn group_exists(&self, id: GroupId) -> Result<bool, sqlx::Error> {
        Ok(sqlx::query_as::<_, (i64,)>("SELECT 1 FROM groups WHERE id=?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    pub async fn insert_group(&self, group: &GroupRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO groups (id,leader_user_id,name,category,cycle,frequency,member_count_hint,max_members,retired,created_at,updated_at)
             VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(group.id)
        .bind(group.leader_user_id)
        .bind(&group.name)
        .bind(group.category)
        .bind(group.cycle)
        .bind(group.frequency)
        .bind(group.member_count_hint)
        .bind(group.max_members)
        .bind(group.retired)
        .bind(to_db_time(group.created_at))
        .bind(to_db_time(group.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_group(&self, group: &GroupRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE groups SET leader_user_id=?,name=?,category=?,cycle=?,frequency=?,member_count_hint=?,max_members=?,retired=?,updated_at=?
             WHERE id=?",
        )
        .bind(group.leader_user_id)
        .bind(&group.name)
        .bind(group.category)
        .bind(group.cycle)
        .bind(group.frequency)
        .bind(group.member_count_hint)
        .bind(group.max_members)
        .bind(group.retired)
        .bind(to_db_time(group.updated_at))
        .bind(group.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes the group together with its mates.
    pub async fn delete_group(&self, id: GroupId) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mates WHERE group_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM groups WHERE id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Groups the user belongs to as a mate.
    pub async fn groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupRecord>, sqlx::Error> {
        sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM groups g
             JOIN mates m ON m.group_id = g.id
             WHERE m.user_id=?
             ORDER BY g.id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(from_row)
        .collect()
    }
}

#[cfg(test)]
pub(crate) fn sample_group(id: GroupId) -> GroupRecord {
    let at = time::macros::datetime!(2024-05-01 00:00:00 UTC);
    GroupRecord {
        id,
        leader_user_id: 1,
        name: format!("group {id}"),
        category: 1,
        cycle: 1,
        frequency: 3,
        member_count_hint: 1,
        max_members: 10,
        retired: false,
        created_at: at,
        updated_at: at,
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{memory_store, MateRecord};

    use super::*;

    #[tokio::test]
    async fn insert_update_find() {
        let store = memory_store().await;
        let mut group = sample_group(5);
        store.insert_group(&group).await.unwrap();
        assert!(store.group_exists(5).await.unwrap());
        assert!(!store.group_exists(6).await.unwrap());

        group.name = "renamed".into();
        group.leader_user_id = 9;
        store.update_group(&group).await.unwrap();
        assert_eq!(store.find_group(5).await.unwrap(), Some(group));
    }

    #[tokio::test]
    async fn deleting_a_group_takes_its_mates() {
        let store = memory_store().await;
        store.insert_group(&sample_group(1)).await.unwrap();
        store.insert_group(&sample_group(2)).await.unwrap();
        store.insert_mate(&MateRecord::placeholder(10, 100, 1)).await.unwrap();
        store.insert_mate(&MateRecord::placeholder(20, 100, 2)).await.unwrap();

        assert_eq!(store.groups_for_user(100).await.unwrap().len(), 2);

        store.delete_group(1).await.unwrap();
        assert!(store.find_group(1).await.unwrap().is_none());
        assert!(store.mate_ids(1).await.unwrap().is_empty());
        assert_eq!(store.mate_ids(2).await.unwrap(), vec![20]);
        let groups = store.groups_for_user(100).await.unwrap();
        assert_eq!(groups.iter().map(|g| g.id).collect::<Vec<_>>(), vec![2]);
    }
}
