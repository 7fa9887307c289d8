use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    db::{MateRecord, Store},
    model::GroupId,
    upstream::{MateSnapshot, Upstream},
};

use super::{decode_id, signal::DependencyWaiter, ReconcileError, Reconciler, Topic};

/// Membership changes needed to make the local set match upstream.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MateDiff {
    pub delete: Vec<i64>,
    pub insert: Vec<MateSnapshot>,
}

pub fn diff_mates(local: &[i64], upstream: &[MateSnapshot]) -> MateDiff {
    let local: BTreeSet<i64> = local.iter().copied().collect();
    let remote: BTreeSet<i64> = upstream.iter().map(|mate| mate.id).collect();

    MateDiff {
        delete: local.difference(&remote).copied().collect(),
        insert: upstream
            .iter()
            .filter(|mate| !local.contains(&mate.id))
            .cloned()
            .collect(),
    }
}

pub struct MateReconciler {
    store: Store,
    upstream: Arc<dyn Upstream>,
    waiter: DependencyWaiter,
    wait: Duration,
}

impl MateReconciler {
    pub(crate) fn new(store: Store, upstream: Arc<dyn Upstream>, waiter: DependencyWaiter, wait: Duration) -> Self {
        Self { store, upstream, waiter, wait }
    }

    /// Waits once for the group to show up locally, then checks the store one last time.
    async fn ensure_group(&mut self, group_id: GroupId) -> Result<(), ReconcileError> {
        if self.store.group_exists(group_id).await? {
            return Ok(());
        }

        tracing::debug!(group_id, wait_ms = self.wait.as_millis() as u64, "group not replicated yet, waiting");
        if self.waiter.wait_for(group_id, self.wait).await {
            return Ok(());
        }

        if self.store.group_exists(group_id).await? {
            tracing::debug!(group_id, "group appeared without a signal");
            return Ok(());
        }

        Err(ReconcileError::Unresolved(group_id))
    }
}

#[async_trait]
impl Reconciler for MateReconciler {
    fn topic(&self) -> Topic {
        Topic::MateList
    }

    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError> {
        let group_id = decode_id(payload)?;
        self.ensure_group(group_id).await?;

        let list = self.upstream.fetch_mate_list(group_id).await?;
        let local = self.store.mate_ids(group_id).await?;
        let diff = diff_mates(&local, &list.mates);

        let inserts: Vec<MateRecord> = diff
            .insert
            .iter()
            .map(|mate| MateRecord::placeholder(mate.id, mate.user_id, group_id))
            .collect();
        self.store.replace_mates(&diff.delete, &inserts).await?;

        tracing::info!(group_id, deleted = diff.delete.len(), inserted = diff.insert.len(), "mates reconciled");
        Ok(())
    }
}
