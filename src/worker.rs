use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use crate::backend::{epoch_secs, JobEnvelope, JobRunner};
use crate::config::DispatchConfig;
use crate::dispatch::DispatchJob;

const PROMOTE_BATCH: isize = 64;

/// Consumes one redis-backed queue: promotes due scheduled envelopes into the
/// ready list, then blocks on the list and runs whatever it pops. Handler
/// failures are contained by the runner; only redis trouble is visible here,
/// and it backs off instead of crashing the loop.
pub struct QueueWorker {
    conn: ConnectionManager,
    config: DispatchConfig,
    runner: Arc<dyn JobRunner>,
    queue: String,
}

impl QueueWorker {
    pub async fn connect(
        url: &str,
        config: DispatchConfig,
        runner: Arc<dyn JobRunner>,
        queue: &str,
    ) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed connecting queue worker")?;
        Ok(Self {
            conn,
            config,
            runner,
            queue: queue.to_owned(),
        })
    }

    pub async fn run(mut self) -> Result<()> {
        info!("worker consuming queue {:?}", self.queue);
        let backoff = Duration::from_millis(self.config.scheduler_poll_ms);
        loop {
            if let Err(err) = self.promote_due().await {
                error!("failed promoting scheduled jobs on {:?}: {err}", self.queue);
                tokio::time::sleep(backoff).await;
                continue;
            }
            match self.pop_ready().await {
                Ok(Some(payload)) => execute_payload(self.runner.as_ref(), &payload).await,
                Ok(None) => {}
                Err(err) => {
                    error!("failed popping from queue {:?}: {err}", self.queue);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Move every scheduled envelope whose due time has passed onto the ready
    /// list. ZREM is the claim: with several workers on one queue, exactly
    /// one sees the removal succeed and pushes.
    async fn promote_due(&mut self) -> Result<()> {
        let scheduled_key = self.config.scheduled_key(&self.queue);
        let ready_key = self.config.queue_key(&self.queue);
        let now = epoch_secs();
        let due: Vec<String> = self
            .conn
            .zrangebyscore_limit(&scheduled_key, 0, now as isize, 0, PROMOTE_BATCH)
            .await?;
        for payload in due {
            let removed: i64 = self.conn.zrem(&scheduled_key, &payload).await?;
            if removed == 1 {
                debug!("promoting scheduled job on queue {:?}", self.queue);
                let _: i64 = self.conn.rpush(&ready_key, payload).await?;
            }
        }
        Ok(())
    }

    /// Blocking pop bounded by the scheduler poll interval, so promotion runs
    /// even when the ready list stays empty.
    async fn pop_ready(&mut self) -> Result<Option<String>> {
        let timeout_secs = (self.config.scheduler_poll_ms as f64 / 1000.0).max(0.1);
        let popped: Option<(String, String)> = self
            .conn
            .blpop(self.config.queue_key(&self.queue), timeout_secs)
            .await?;
        Ok(popped.map(|(_, payload)| payload))
    }
}

/// Decode one queue payload and run it. Malformed payloads and expired
/// envelopes are logged and dropped; a queue must survive anything a past or
/// foreign producer may have pushed.
pub(crate) async fn execute_payload(runner: &dyn JobRunner, payload: &str) {
    let envelope = match JobEnvelope::parse(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!("discarding malformed queue payload: {err}");
            return;
        }
    };
    if envelope.expired(epoch_secs()) {
        debug!("dropping expired job without executing it");
        return;
    }
    match DispatchJob::decode(&envelope.job) {
        Ok(job) => runner.run(job).await,
        Err(err) => warn!("discarding undecodable job payload: {err}"),
    }
}
