use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::Error as _;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

use crate::config::DispatchConfig;
use crate::dispatch::{DispatchJob, ScheduleOptions};
use crate::error::{SignalError, SignalResult};

/// Executes a job to completion. Implemented by the engine core; backends
/// that run work in-process call back through this instead of owning the
/// engine directly.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: DispatchJob);
}

/// Where background jobs go. One backend per process; the engine routes every
/// `to_server` dispatch through it.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `eta`/`countdown`/`expires` are honored. Dispatches carrying
    /// any of them fail fast against a backend that returns false here.
    fn supports_scheduling(&self) -> bool {
        false
    }

    async fn submit(&self, job: DispatchJob, schedule: &ScheduleOptions) -> SignalResult<()>;
}

/// Runs each job on the caller's task before `submit` returns. Debugging and
/// tests; a slow handler blocks the dispatcher.
pub struct InlineBackend {
    runner: Arc<dyn JobRunner>,
}

impl InlineBackend {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl WorkerBackend for InlineBackend {
    fn name(&self) -> &'static str {
        "inline"
    }

    async fn submit(&self, job: DispatchJob, _schedule: &ScheduleOptions) -> SignalResult<()> {
        self.runner.run(job).await;
        Ok(())
    }
}

const POOL_QUEUE_CAPACITY: usize = 1024;

/// In-process pools, one per queue name, created on first use and kept for
/// the life of the process. Pool sizes come from configuration; every worker
/// task in a pool pulls from the same bounded channel.
pub struct PoolBackend {
    runner: Arc<dyn JobRunner>,
    config: DispatchConfig,
    pools: Mutex<HashMap<String, mpsc::Sender<DispatchJob>>>,
}

impl PoolBackend {
    pub fn new(runner: Arc<dyn JobRunner>, config: DispatchConfig) -> Self {
        Self {
            runner,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn spawn_pool(&self, queue: &str) -> mpsc::Sender<DispatchJob> {
        let size = self.config.pool_size(queue);
        debug!("starting pool of {size} workers for queue {queue:?}");
        let (tx, rx) = mpsc::channel::<DispatchJob>(POOL_QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..size {
            let rx = rx.clone();
            let runner = self.runner.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => runner.run(job).await,
                        None => break,
                    }
                }
            });
        }
        tx
    }
}

#[async_trait]
impl WorkerBackend for PoolBackend {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn submit(&self, job: DispatchJob, _schedule: &ScheduleOptions) -> SignalResult<()> {
        let tx = {
            let mut pools = self.pools.lock().await;
            pools
                .entry(job.queue.clone())
                .or_insert_with_key(|queue| self.spawn_pool(queue))
                .clone()
        };
        if tx.send(job).await.is_err() {
            // worker tasks only stop when the runtime shuts down
            error!("pool workers are gone, dropping job");
        }
        Ok(())
    }
}

/// Pushes jobs onto per-queue redis lists consumed by sibling worker
/// processes (`worker --queue <name>`). No scheduling.
pub struct ChannelBackend {
    conn: ConnectionManager,
    config: DispatchConfig,
}

impl ChannelBackend {
    pub async fn connect(url: &str, config: DispatchConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed connecting redis channel backend")?;
        Ok(Self { conn, config })
    }
}

#[async_trait]
impl WorkerBackend for ChannelBackend {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn submit(&self, job: DispatchJob, _schedule: &ScheduleOptions) -> SignalResult<()> {
        let mut conn = self.conn.clone();
        let key = self.config.queue_key(&job.queue);
        let payload = JobEnvelope::immediate(&job).encode();
        let _: i64 = conn.rpush(key, payload).await?;
        Ok(())
    }
}

/// The only scheduling-capable backend: a redis ready list per queue plus a
/// sorted set of scheduled envelopes scored by their due time. Workers
/// promote due entries before each blocking pop.
pub struct TaskQueueBackend {
    conn: ConnectionManager,
    config: DispatchConfig,
}

impl TaskQueueBackend {
    pub async fn connect(url: &str, config: DispatchConfig) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed connecting redis task queue backend")?;
        Ok(Self { conn, config })
    }
}

#[async_trait]
impl WorkerBackend for TaskQueueBackend {
    fn name(&self) -> &'static str {
        "task_queue"
    }

    fn supports_scheduling(&self) -> bool {
        true
    }

    async fn submit(&self, job: DispatchJob, schedule: &ScheduleOptions) -> SignalResult<()> {
        let mut conn = self.conn.clone();
        let now = epoch_secs();
        let envelope = JobEnvelope {
            job: job.encode(),
            expires_at: schedule.expires.map(|delay| now + delay),
        };
        let due = schedule
            .eta
            .or_else(|| schedule.countdown.map(|delay| now + delay));
        match due {
            Some(due) if due > now => {
                let key = self.config.scheduled_key(&job.queue);
                let _: i64 = conn.zadd(key, envelope.encode(), due).await?;
            }
            _ => {
                let key = self.config.queue_key(&job.queue);
                let _: i64 = conn.rpush(key, envelope.encode()).await?;
            }
        }
        Ok(())
    }
}

/// Wire wrapper around a job on a redis queue. Jobs without expiry travel as
/// the bare positional array; expiring jobs are wrapped so the worker can
/// drop them unexecuted past their deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    pub job: Value,
    /// Unix seconds; the job is dropped when popped after this instant.
    pub expires_at: Option<u64>,
}

impl JobEnvelope {
    pub fn immediate(job: &DispatchJob) -> Self {
        Self {
            job: job.encode(),
            expires_at: None,
        }
    }

    pub fn encode(&self) -> String {
        match self.expires_at {
            None => self.job.to_string(),
            Some(expires_at) => json!({"job": self.job, "expires_at": expires_at}).to_string(),
        }
    }

    pub fn parse(payload: &str) -> SignalResult<Self> {
        let value: Value = serde_json::from_str(payload)?;
        match value {
            Value::Array(_) => Ok(Self {
                job: value,
                expires_at: None,
            }),
            Value::Object(mut map) => {
                let job = map
                    .remove("job")
                    .ok_or_else(|| serde_json::Error::custom("envelope without job field"))?;
                let expires_at = map.get("expires_at").and_then(Value::as_u64);
                Ok(Self { job, expires_at })
            }
            _ => Err(SignalError::Serialization(serde_json::Error::custom(
                "queue payload is neither a job array nor an envelope",
            ))),
        }
    }

    pub fn expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Test double capturing every submitted job with its schedule.
#[cfg(test)]
pub struct RecordingBackend {
    scheduling: bool,
    jobs: Mutex<Vec<(DispatchJob, ScheduleOptions)>>,
}

#[cfg(test)]
impl RecordingBackend {
    pub fn new(scheduling: bool) -> Self {
        Self {
            scheduling,
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub async fn submitted(&self) -> Vec<(DispatchJob, ScheduleOptions)> {
        self.jobs.lock().await.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl WorkerBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn supports_scheduling(&self) -> bool {
        self.scheduling
    }

    async fn submit(&self, job: DispatchJob, schedule: &ScheduleOptions) -> SignalResult<()> {
        self.jobs.lock().await.push((job, *schedule));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::{epoch_secs, InlineBackend, JobEnvelope, JobRunner, PoolBackend, WorkerBackend};
    use crate::config::DispatchConfig;
    use crate::dispatch::{DispatchJob, ScheduleOptions};
    use crate::registry::JsonMap;

    struct CountingRunner {
        count: AtomicUsize,
        done: Notify,
    }

    impl CountingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                count: AtomicUsize::new(0),
                done: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: DispatchJob) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.done.notify_waiters();
        }
    }

    fn job(queue: &str) -> DispatchJob {
        DispatchJob {
            signal_name: "demo.signal".to_owned(),
            context: None,
            kwargs: JsonMap::new(),
            from_client: false,
            client_topics: Vec::new(),
            to_server: true,
            queue: queue.to_owned(),
        }
    }

    #[tokio::test]
    async fn inline_runs_before_submit_returns() {
        let runner = CountingRunner::new();
        let backend = InlineBackend::new(runner.clone());
        backend
            .submit(job("default"), &ScheduleOptions::none())
            .await
            .expect("submit");
        assert_eq!(runner.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pool_executes_jobs_across_queues() {
        let runner = CountingRunner::new();
        let backend = PoolBackend::new(runner.clone(), DispatchConfig::default());
        for queue in ["default", "default", "slow"] {
            backend
                .submit(job(queue), &ScheduleOptions::none())
                .await
                .expect("submit");
        }
        timeout(Duration::from_secs(2), async {
            while runner.count.load(Ordering::SeqCst) < 3 {
                runner.done.notified().await;
            }
        })
        .await
        .expect("all jobs executed");
    }

    #[test]
    fn immediate_envelope_travels_as_bare_array() {
        let envelope = JobEnvelope::immediate(&job("default"));
        let encoded = envelope.encode();
        assert!(encoded.starts_with('['));
        let parsed = JobEnvelope::parse(&encoded).expect("parse");
        assert_eq!(parsed, envelope);
        assert!(!parsed.expired(epoch_secs()));
        DispatchJob::decode(&parsed.job).expect("job decodes");
    }

    #[test]
    fn expiring_envelope_round_trips_and_expires() {
        let envelope = JobEnvelope {
            job: job("default").encode(),
            expires_at: Some(100),
        };
        let parsed = JobEnvelope::parse(&envelope.encode()).expect("parse");
        assert_eq!(parsed, envelope);
        assert!(!parsed.expired(99));
        assert!(parsed.expired(100));
        assert!(parsed.expired(101));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(JobEnvelope::parse("not json").is_err());
        assert!(JobEnvelope::parse("42").is_err());
        assert!(JobEnvelope::parse(&json!({"no_job": true}).to_string()).is_err());
    }
}
