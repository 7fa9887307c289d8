//! Keeps the local group/mate/user replica converging on upstream truth.
//!
//! One long-lived worker per topic, each strictly sequential. The only
//! cross-topic coordination is the best-effort dependency signal from the
//! group worker to the mate worker. Dispatch never waits on a worker: an
//! event whose queue is full goes back to the log for later.

mod group;
mod mate;
mod signal;
mod user;

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::PipelineConfig,
    db::Store,
    ingress::{Delivery, EventSource},
    upstream::{Upstream, UpstreamError},
};

pub use group::GroupReconciler;
pub use mate::{diff_mates, MateDiff, MateReconciler};
pub use user::{UserCreateEvent, UserCreateReconciler, UserInfoReconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    GroupDetail,
    MateList,
    UserCreate,
    UserInfo,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::GroupDetail, Topic::MateList, Topic::UserCreate, Topic::UserInfo];

    pub fn as_str(&self) -> &'static str {
        use Topic::*;
        match self {
            GroupDetail => "fit-group",
            MateList => "fit-mate",
            UserCreate => "user-create-event",
            UserInfo => "user-info-event",
        }
    }

    pub fn parse(topic: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.as_str() == topic)
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("group {0} did not appear within the dependency window")]
    Unresolved(i64),
    #[error("store: {0}")]
    Store(#[from] sqlx::Error),
}

impl ReconcileError {
    /// Worth another delivery.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Upstream(_) | ReconcileError::Store(_))
    }
}

/// Payloads of the id-only topics: a bare decimal id.
pub(crate) fn decode_id(payload: &[u8]) -> Result<i64, ReconcileError> {
    let raw = std::str::from_utf8(payload).map_err(|err| ReconcileError::Decode(err.to_string()))?;
    raw.trim()
        .trim_matches('"')
        .parse()
        .map_err(|_| ReconcileError::Decode(format!("expected an id, got {raw:?}")))
}

#[async_trait]
pub trait Reconciler: Send + 'static {
    fn topic(&self) -> Topic;
    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError>;
}

#[async_trait]
impl<R: Reconciler + ?Sized> Reconciler for Box<R> {
    fn topic(&self) -> Topic {
        (**self).topic()
    }

    async fn reconcile(&mut self, payload: &[u8]) -> Result<(), ReconcileError> {
        (**self).reconcile(payload).await
    }
}

/// Offsets handed to a worker and not yet settled.
type InFlight = Arc<Mutex<HashSet<i64>>>;

#[derive(Debug)]
pub(crate) struct Job {
    offset: i64,
    attempts: u32,
    payload: Vec<u8>,
}

async fn run_worker<R: Reconciler>(
    mut reconciler: R,
    mut jobs: mpsc::Receiver<Job>,
    source: Arc<dyn EventSource>,
    in_flight: InFlight,
    max_attempts: u32,
    shutdown: CancellationToken,
) {
    let topic = reconciler.topic().as_str();
    tracing::info!(topic, "worker started");

    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let acknowledge = match reconciler.reconcile(&job.payload).await {
            Ok(()) => true,
            Err(err) if err.is_transient() && job.attempts < max_attempts => {
                tracing::warn!(topic, offset = job.offset, attempts = job.attempts, error = %err, "event failed, leaving it for redelivery");
                false
            }
            Err(err) => {
                tracing::error!(topic, offset = job.offset, attempts = job.attempts, error = %err, "event failed, dropping it");
                true
            }
        };

        if acknowledge {
            if let Err(err) = source.ack(job.offset).await {
                tracing::error!(topic, offset = job.offset, error = %err, "ack failed");
            }
        }
        in_flight.lock().remove(&job.offset);
    }

    tracing::info!(topic, "worker stopped");
}

/// Routes raw deliveries to the per-topic workers.
#[derive(Clone)]
pub struct Pipeline {
    group: mpsc::Sender<Job>,
    mate: mpsc::Sender<Job>,
    user_create: mpsc::Sender<Job>,
    user_info: mpsc::Sender<Job>,
    source: Arc<dyn EventSource>,
    in_flight: InFlight,
    requeue_delay: Duration,
}

impl Pipeline {
    pub fn spawn(
        store: Store,
        upstream: Arc<dyn Upstream>,
        source: Arc<dyn EventSource>,
        config: &PipelineConfig,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (signal, waiter) = signal::dependency_channel();
        let in_flight = InFlight::default();
        let mut workers = Vec::new();
        let mut start = |reconciler: Box<dyn Reconciler>| {
            let (tx, rx) = mpsc::channel(config.worker_queue.max(1));
            workers.push(tokio::spawn(run_worker(
                reconciler,
                rx,
                source.clone(),
                in_flight.clone(),
                config.max_attempts,
                shutdown.clone(),
            )));
            tx
        };

        let group = start(Box::new(GroupReconciler::new(store.clone(), upstream.clone(), signal)));
        let mate = start(Box::new(MateReconciler::new(
            store.clone(),
            upstream.clone(),
            waiter,
            config.dependency_wait,
        )));
        let user_create = start(Box::new(UserCreateReconciler::new(store.clone())));
        let user_info = start(Box::new(UserInfoReconciler::new(store, upstream)));

        (
            Self {
                group,
                mate,
                user_create,
                user_info,
                source,
                in_flight,
                requeue_delay: config.requeue_delay,
            },
            workers,
        )
    }

    pub async fn dispatch(&self, delivery: Delivery) {
        let Some(topic) = Topic::parse(&delivery.topic) else {
            tracing::warn!(topic = %delivery.topic, offset = delivery.offset, "no handler for topic, dropping event");
            if let Err(err) = self.source.ack(delivery.offset).await {
                tracing::error!(offset = delivery.offset, error = %err, "ack failed");
            }
            return;
        };

        let queue = match topic {
            Topic::GroupDetail => &self.group,
            Topic::MateList => &self.mate,
            Topic::UserCreate => &self.user_create,
            Topic::UserInfo => &self.user_info,
        };

        let offset = delivery.offset;
        // A lease can run out while the job still waits in its queue.
        if !self.in_flight.lock().insert(offset) {
            tracing::debug!(topic = topic.as_str(), offset, "event already queued, handing it back");
            self.release(offset).await;
            return;
        }

        let job = Job {
            offset,
            attempts: delivery.attempts,
            payload: delivery.payload,
        };
        match queue.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.in_flight.lock().remove(&offset);
                tracing::debug!(topic = topic.as_str(), offset, "worker busy, handing event back");
                self.release(offset).await;
            }
            Err(TrySendError::Closed(_)) => {
                self.in_flight.lock().remove(&offset);
                tracing::warn!(topic = topic.as_str(), offset, "worker is gone, event left for redelivery");
            }
        }
    }

    async fn release(&self, offset: i64) {
        if let Err(err) = self.source.release(offset, self.requeue_delay).await {
            tracing::error!(offset, error = %err, "release failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use crate::{
        db::memory_store,
        ingress::{consume, SqliteEventLog},
    };

    use super::{testing::FakeUpstream, *};

    #[test]
    fn topics_round_trip_their_wire_names() {
        for topic in Topic::ALL {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
        assert_eq!(Topic::parse("fit-group-v2"), None);
    }

    #[test]
    fn ids_decode_leniently() {
        assert_eq!(decode_id(b"42").unwrap(), 42);
        assert_eq!(decode_id(b" \"42\"\n").unwrap(), 42);
        assert!(matches!(decode_id(b"forty-two"), Err(ReconcileError::Decode(_))));
    }

    async fn lone_job(log: &SqliteEventLog, topic: Topic, payload: &[u8]) -> Job {
        log.append(topic.as_str(), payload).await.unwrap();
        let delivery = log.fetch().await.unwrap().unwrap();
        Job { offset: delivery.offset, attempts: delivery.attempts, payload: delivery.payload }
    }

    async fn run_once(store: Store, log: &SqliteEventLog, job: Job, max_attempts: u32) {
        let upstream: Arc<dyn Upstream> = Arc::new(FakeUpstream::default());
        let (tx, rx) = mpsc::channel(1);
        tx.send(job).await.unwrap();
        drop(tx);
        run_worker(
            GroupReconciler::new(store, upstream, signal::dependency_channel().0),
            rx,
            Arc::new(log.clone()),
            InFlight::default(),
            max_attempts,
            CancellationToken::new(),
        )
        .await;
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered_until_the_attempt_limit() {
        let store = memory_store().await;
        let log = SqliteEventLog::new(&store, Duration::from_secs(3600));

        let job = lone_job(&log, Topic::GroupDetail, b"5").await;
        run_once(store.clone(), &log, job, 3).await;
        assert_eq!(log.pending().await.unwrap(), 1);

        let mut exhausted = lone_job(&log, Topic::GroupDetail, b"6").await;
        exhausted.attempts = 3;
        run_once(store, &log, exhausted, 3).await;
        assert_eq!(log.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn malformed_payloads_are_skipped() {
        let store = memory_store().await;
        let log = SqliteEventLog::new(&store, Duration::from_secs(3600));
        let job = lone_job(&log, Topic::GroupDetail, b"not-an-id").await;
        run_once(store, &log, job, 5).await;
        assert_eq!(log.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_topics_are_dropped() {
        let store = memory_store().await;
        let log = SqliteEventLog::new(&store, Duration::from_secs(3600));
        let source: Arc<dyn EventSource> = Arc::new(log.clone());
        let upstream: Arc<dyn Upstream> = Arc::new(FakeUpstream::default());
        let (pipeline, _workers) = Pipeline::spawn(
            store,
            upstream,
            source.clone(),
            &PipelineConfig::default(),
            CancellationToken::new(),
        );

        log.append("fit-badge", b"1").await.unwrap();
        let delivery = source.fetch().await.unwrap().unwrap();
        pipeline.dispatch(delivery).await;
        assert_eq!(log.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn busy_mate_worker_does_not_hold_back_group_events() {
        let store = memory_store().await;
        let upstream = Arc::new(FakeUpstream::default());
        for id in [1, 2, 3] {
            upstream.put_group(id, "crew", 1, false);
            upstream.put_mates(id, &[id * 10]);
        }

        let log = SqliteEventLog::new(&store, Duration::from_secs(60));
        for topic in ["fit-mate", "fit-group"] {
            for id in ["1", "2", "3"] {
                log.append(topic, id.as_bytes()).await.unwrap();
            }
        }

        let config = PipelineConfig {
            dependency_wait: Duration::from_millis(300),
            worker_queue: 1,
            max_attempts: 5,
            requeue_delay: Duration::from_millis(20),
        };
        let shutdown = CancellationToken::new();
        let source: Arc<dyn EventSource> = Arc::new(log.clone());
        let (pipeline, _workers) = Pipeline::spawn(store.clone(), upstream, source.clone(), &config, shutdown.clone());
        let consumer = tokio::spawn(consume(source, pipeline, Duration::from_millis(5), shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while log.pending().await.unwrap() > 0 {
            assert!(tokio::time::Instant::now() < deadline, "events were not drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for id in [1, 2, 3] {
            assert_eq!(store.mate_ids(id).await.unwrap(), vec![id * 10], "mates of group {id}");
        }

        shutdown.cancel();
        consumer.await.unwrap();
    }
}
