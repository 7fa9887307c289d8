use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::{
    db::{GroupRecord, Store},
    upstream::{upstream_time_or_now, GroupSnapshot, Upstream},
};

use super::{decode_id, signal::DependencySignal, ReconcileError, Reconciler, Topic};

pub struct GroupReconciler {
    store: Store,
    upstream: Arc<dyn Upstream>,
    signal: DependencySignal,
}

impl GroupReconciler {
    pub(crate) fn new(store: Store, upstream: Arc<dyn Upstream>, signal: DependencySignal) -> Self {
        Self { store, upstream, signal }
    }
}

fn record_from(snapshot: GroupSnapshot) -> GroupRecord {
    let created_at = upstream_time_or_now(snapshot.created_at.as_deref());
    GroupRecord {
        id: snapshot.id,
        leader_user_id: snapshot.leader_user_id,
        name: snapshot.name,
        category: snapshot.category,
        cycle: snapshot.cycle,
        frequency: snapshot.frequency,
        member_count_hint: snapshot.member_count_hint,
        max_members: snapshot.max_members,
        retired: snapshot.retired,
        created_at,
        updated_at: OffsetDateTime::now_utc(),
    }
}

#[async_trait]
impl Reconciler for GroupReconciler {
    fn topic(&self) -> Topic {
        Topic::GroupDetail
    }

    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError> {
        let id = decode_id(payload)?;
        let snapshot = self.upstream.fetch_group_detail(id).await?;

        let Some(local) = self.store.find_group(id).await? else {
            self.store.insert_group(&record_from(snapshot)).await?;
            tracing::info!(group_id = id, "group created");
            self.signal.notify(id);
            return Ok(());
        };

        if snapshot.retired {
            self.store.delete_group(id).await?;
            tracing::info!(group_id = id, "group retired");
            return Ok(());
        }

        if local.leader_user_id == snapshot.leader_user_id
            && local.name == snapshot.name
            && local.retired == snapshot.retired
        {
            tracing::debug!(group_id = id, "group unchanged");
            return Ok(());
        }

        let updated = GroupRecord {
            created_at: local.created_at,
            ..record_from(snapshot)
        };
        self.store.update_group(&updated).await?;
        tracing::info!(group_id = id, "group updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        db::{memory_store, MateRecord},
        reconcile::{signal::dependency_channel, testing::FakeUpstream},
    };

    use super::*;

    #[tokio::test]
    async fn creates_then_updates_only_on_change() {
        let store = memory_store().await;
        let upstream = Arc::new(FakeUpstream::default());
        let (signal, mut waiter) = dependency_channel();
        let mut worker = GroupReconciler::new(store.clone(), upstream.clone(), signal);

        upstream.put_group(5, "morning run", 7, false);
        worker.reconcile(b"5").await.unwrap();
        assert!(waiter.wait_for(5, Duration::from_millis(10)).await);
        let created = store.find_group(5).await.unwrap().unwrap();
        assert_eq!((created.name.as_str(), created.leader_user_id), ("morning run", 7));
        assert_eq!(created.created_at, time::macros::datetime!(2024-05-01 00:00:00 UTC));

        // Same snapshot again: nothing is rewritten and nobody is signalled.
        worker.reconcile(b"5").await.unwrap();
        assert_eq!(store.find_group(5).await.unwrap(), Some(created.clone()));
        assert!(!waiter.wait_for(5, Duration::from_millis(10)).await);

        upstream.put_group(5, "evening run", 8, false);
        worker.reconcile(b"5").await.unwrap();
        let updated = store.find_group(5).await.unwrap().unwrap();
        assert_eq!((updated.name.as_str(), updated.leader_user_id), ("evening run", 8));
        assert_eq!(updated.created_at, created.created_at);

        // Replaying the update changes nothing, not even `updated_at`.
        worker.reconcile(b"5").await.unwrap();
        assert_eq!(store.find_group(5).await.unwrap(), Some(updated));
        assert!(!waiter.wait_for(5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn retired_groups_are_removed_with_their_mates() {
        let store = memory_store().await;
        let upstream = Arc::new(FakeUpstream::default());
        let mut worker = GroupReconciler::new(store.clone(), upstream.clone(), dependency_channel().0);

        upstream.put_group(5, "morning run", 7, false);
        worker.reconcile(b"5").await.unwrap();
        store.insert_mate(&MateRecord::placeholder(1, 100, 5)).await.unwrap();

        upstream.put_group(5, "morning run", 7, true);
        worker.reconcile(b"5").await.unwrap();
        assert!(store.find_group(5).await.unwrap().is_none());
        assert!(store.mate_ids(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failures_are_transient() {
        let store = memory_store().await;
        let mut worker = GroupReconciler::new(store, Arc::new(FakeUpstream::default()), dependency_channel().0);
        let err = worker.reconcile(b"404").await.unwrap_err();
        assert!(err.is_transient());
    }
}
