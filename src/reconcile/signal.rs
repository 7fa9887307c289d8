use std::time::Duration;

use tokio::{sync::mpsc, time::Instant};

use crate::model::GroupId;

/// Best-effort "group created" notification. Capacity one, never blocks:
/// a signal nobody has room for is dropped, and waiters fall back to
/// re-checking the store.
pub(crate) fn dependency_channel() -> (DependencySignal, DependencyWaiter) {
    let (tx, rx) = mpsc::channel(1);
    (DependencySignal { tx }, DependencyWaiter { rx })
}

#[derive(Debug, Clone)]
pub(crate) struct DependencySignal {
    tx: mpsc::Sender<GroupId>,
}

impl DependencySignal {
    pub(crate) fn notify(&self, group_id: GroupId) -> bool {
        match self.tx.try_send(group_id) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(group_id, "dependency signal dropped");
                false
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct DependencyWaiter {
    rx: mpsc::Receiver<GroupId>,
}

impl DependencyWaiter {
    /// Waits until a signal for `group_id` arrives or `timeout` elapses.
    /// Signals for other groups are discarded.
    pub(crate) async fn wait_for(&mut self, group_id: GroupId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(signalled)) if signalled == group_id => return true,
                Ok(Some(signalled)) => {
                    tracing::debug!(waiting_for = group_id, signalled, "ignoring signal for another group");
                }
                Ok(None) | Err(_) => return false,
            }
        }
    }
}
