use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{JobRunner, WorkerBackend};
use crate::config::DispatchConfig;
use crate::context::{ContextMap, ContextPipeline, WindowContext};
use crate::error::{SignalError, SignalResult};
use crate::pubsub::PubSubLayer;
use crate::registry::{JsonMap, SignalRegistry};
use crate::topics::{self, Destination};

/// Delay semantics for a triggered signal. Only honored by a
/// scheduling-capable backend; `eta` is an absolute unix timestamp in
/// seconds, `countdown` a relative delay, `expires` a
/// drop-if-not-started-by deadline relative to the trigger call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    pub countdown: Option<u64>,
    pub eta: Option<u64>,
    pub expires: Option<u64>,
}

impl ScheduleOptions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.countdown.is_none() && self.eta.is_none() && self.expires.is_none()
    }
}

/// A fully resolved dispatch, ready for a worker backend. Fields are plain
/// JSON values so the job can cross process boundaries opaquely; building a
/// job from `JsonMap`/`ContextMap` inputs makes serializability structural,
/// so a bad payload fails at the trigger call site, never inside a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    pub signal_name: String,
    pub context: Option<ContextMap>,
    pub kwargs: JsonMap,
    pub from_client: bool,
    /// Topics to publish when the job runs, for delayed dispatches whose
    /// client notification must not leak early.
    pub client_topics: Vec<String>,
    pub to_server: bool,
    pub queue: String,
}

impl DispatchJob {
    /// The positional wire form handed to worker backends:
    /// `[signal_name, context|null, kwargs, from_client, client_topics,
    /// to_server, queue]`.
    pub fn encode(&self) -> Value {
        json!([
            self.signal_name,
            self.context
                .clone()
                .map(Value::Object)
                .unwrap_or(Value::Null),
            Value::Object(self.kwargs.clone()),
            self.from_client,
            self.client_topics,
            self.to_server,
            self.queue,
        ])
    }

    pub fn decode(value: &Value) -> SignalResult<Self> {
        let (signal_name, context, kwargs, from_client, client_topics, to_server, queue): (
            String,
            Option<ContextMap>,
            JsonMap,
            bool,
            Vec<String>,
            bool,
            String,
        ) = serde_json::from_value(value.clone())?;
        Ok(Self {
            signal_name,
            context,
            kwargs,
            from_client,
            client_topics,
            to_server,
            queue,
        })
    }
}

type SignalLoader = Box<dyn Fn(&SignalRegistry) -> SignalResult<()> + Send + Sync>;

/// Execution half of the engine: everything needed to run a job, shared with
/// the worker backends so in-process variants can call straight back in.
pub struct EngineCore {
    registry: Arc<SignalRegistry>,
    pipeline: Arc<ContextPipeline>,
    pubsub: Arc<dyn PubSubLayer>,
    config: DispatchConfig,
    loader: SignalLoader,
}

impl EngineCore {
    pub fn new(
        registry: Arc<SignalRegistry>,
        pipeline: Arc<ContextPipeline>,
        pubsub: Arc<dyn PubSubLayer>,
        config: DispatchConfig,
        loader: SignalLoader,
    ) -> Self {
        Self {
            registry,
            pipeline,
            pubsub,
            config,
            loader,
        }
    }

    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<ContextPipeline> {
        &self.pipeline
    }

    /// Run the registration pass now instead of on the first dispatch. The
    /// binary calls this at startup so a broken registration aborts the
    /// process rather than leaving it running with an empty registry.
    pub async fn ensure_populated(&self) -> SignalResult<()> {
        self.registry
            .ensure_populated(|registry| (self.loader)(registry))
            .await
    }

    /// Execute one job: publish carried topics, rebuild the context, then
    /// run every matching handler. Handler and validation failures are
    /// contained here so a durable queue never sees a handler bug as a
    /// transport failure.
    pub async fn process_task(&self, job: DispatchJob) {
        info!(
            "signal {:?} called on queue {:?} to {} topics (from_client={}, to_server={})",
            job.signal_name,
            job.queue,
            job.client_topics.len(),
            job.from_client,
            job.to_server,
        );
        if !job.client_topics.is_empty() {
            let signal_id = Uuid::new_v4().to_string();
            if let Err(err) = self
                .publish_to_topics(&job.signal_name, &signal_id, &job.client_topics, &job.kwargs)
                .await
            {
                error!("failed publishing {:?} to client topics: {err:#}", job.signal_name);
            }
        }
        let mut ctx = match &job.context {
            Some(values) => self.pipeline.from_map(values),
            None => self.pipeline.blank(),
        };
        if let Err(err) = self.ensure_populated().await {
            error!("signal registration failed while processing a job: {err}");
            return;
        }
        self.pipeline.before_process(&mut ctx);
        if !job.to_server || !self.registry.has_signal(&job.signal_name) {
            return;
        }
        for conn in self.registry.connections_for(&job.signal_name) {
            // affinity is re-checked with the current strategy evaluation; a
            // non-deterministic strategy may skip the job here, matching the
            // dispatch-time behavior
            if conn.get_queue(&ctx, &job.kwargs, &self.config.default_queue) != job.queue {
                continue;
            }
            if job.from_client && !conn.allowed(&ctx, &job.kwargs) {
                warn!(
                    "unauthorized client invocation of {:?} rejected (window {:?})",
                    conn.path(),
                    ctx.window_key
                );
                continue;
            }
            let Some(validated) = conn.validate(&job.kwargs) else {
                continue;
            };
            if let Err(err) = conn.invoke(&ctx, &validated) {
                error!("handler {:?} failed: {err:#}", conn.path());
            }
        }
    }

    pub async fn publish_to_topics(
        &self,
        signal_name: &str,
        signal_id: &str,
        topic_keys: &[String],
        kwargs: &JsonMap,
    ) -> anyhow::Result<()> {
        let frame = json!({
            "signal": signal_name,
            "opts": kwargs,
            "signal_id": signal_id,
        })
        .to_string();
        for topic_key in topic_keys {
            debug!("send {signal_name:?} to topic {topic_key}");
            self.pubsub.publish(topic_key, &frame).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for EngineCore {
    async fn run(&self, job: DispatchJob) {
        self.process_task(job).await;
    }
}

/// The routing core: resolves destinations, partitions work between the
/// worker backend and the pub/sub layer, and enforces queue affinity.
pub struct DispatchEngine {
    core: Arc<EngineCore>,
    backend: Arc<dyn WorkerBackend>,
}

impl DispatchEngine {
    pub fn new(core: Arc<EngineCore>, backend: Arc<dyn WorkerBackend>) -> Self {
        Self { core, backend }
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Shortcut for the common case: no delay, not from a client.
    pub async fn trigger(
        &self,
        ctx: Option<&WindowContext>,
        signal_name: &str,
        to: &[Destination],
        kwargs: JsonMap,
    ) -> SignalResult<()> {
        self.trigger_inner(ctx, signal_name, to, kwargs, ScheduleOptions::none(), false)
            .await
    }

    pub async fn trigger_signal(
        &self,
        ctx: Option<&WindowContext>,
        signal_name: &str,
        to: &[Destination],
        kwargs: JsonMap,
        schedule: ScheduleOptions,
    ) -> SignalResult<()> {
        self.trigger_inner(ctx, signal_name, to, kwargs, schedule, false)
            .await
    }

    /// Entry point for the gateway: destinations restricted to the server,
    /// authorization enforced per handler at execution time.
    pub async fn trigger_from_client(
        &self,
        ctx: Option<&WindowContext>,
        signal_name: &str,
        kwargs: JsonMap,
        schedule: ScheduleOptions,
    ) -> SignalResult<()> {
        self.trigger_inner(
            ctx,
            signal_name,
            &[Destination::Server],
            kwargs,
            schedule,
            true,
        )
        .await
    }

    /// Re-trigger a connection's own path server-side, for handlers that
    /// chain into themselves or siblings.
    pub async fn call_soon(
        &self,
        ctx: Option<&WindowContext>,
        path: &str,
        kwargs: JsonMap,
    ) -> SignalResult<()> {
        self.trigger_inner(
            ctx,
            path,
            &[Destination::Server],
            kwargs,
            ScheduleOptions::none(),
            false,
        )
        .await
    }

    /// Invoke a registered remote function directly: validation and (for
    /// client calls) authorization apply, the worker backend does not.
    pub async fn call_function(
        &self,
        ctx: &WindowContext,
        path: &str,
        kwargs: &JsonMap,
        from_client: bool,
    ) -> SignalResult<bool> {
        self.core.ensure_populated().await?;
        let Some(conn) = self.core.registry.function(path) else {
            debug!("function {path:?} is unknown by the server");
            return Ok(false);
        };
        if from_client && !conn.allowed(ctx, kwargs) {
            warn!("unauthorized client invocation of function {path:?} rejected");
            return Ok(false);
        }
        let Some(validated) = conn.validate(kwargs) else {
            return Ok(false);
        };
        if let Err(err) = conn.invoke(ctx, &validated) {
            error!("function {path:?} failed: {err:#}");
            return Ok(false);
        }
        Ok(true)
    }

    async fn trigger_inner(
        &self,
        ctx: Option<&WindowContext>,
        signal_name: &str,
        to: &[Destination],
        kwargs: JsonMap,
        schedule: ScheduleOptions,
        from_client: bool,
    ) -> SignalResult<()> {
        self.core.ensure_populated().await?;
        let default_to = [Destination::User];
        let to = if to.is_empty() { &default_to[..] } else { to };
        debug!("received signal {signal_name:?} to {to:?}");

        let mut to_server = false;
        let mut to_sync = false;
        let mut client_topics = Vec::new();
        for dest in to {
            match dest {
                Destination::Server | Destination::Sync => {
                    if !self.core.registry.has_signal(signal_name) {
                        debug!("signal {signal_name:?} is unknown by the server");
                    }
                    if matches!(dest, Destination::Sync) {
                        to_sync = true;
                    } else {
                        to_server = true;
                    }
                }
                dest => {
                    // unresolved destinations (no window key, anonymous user)
                    // are dropped, not errors
                    if let Some(topic_key) = topics::resolve_key(ctx, dest) {
                        client_topics.push(topic_key);
                    }
                }
            }
        }

        if !schedule.is_empty() && !self.backend.supports_scheduling() {
            return Err(SignalError::SchedulingUnsupported {
                backend: self.backend.name(),
            });
        }

        let context_map = ctx.map(|ctx| self.core.pipeline.to_map(ctx));
        let queue_ctx = ctx.cloned().unwrap_or_default();
        let mut queues: BTreeSet<String> = self
            .core
            .registry
            .connections_for(signal_name)
            .iter()
            .map(|conn| conn.get_queue(&queue_ctx, &kwargs, &self.core.config.default_queue))
            .collect();

        let background_topics = if !schedule.is_empty() && !client_topics.is_empty() {
            // delayed signals must not notify clients before they run; the
            // default-queue job republishes at execution time
            queues.insert(self.core.config.default_queue.clone());
            to_server = true;
            std::mem::take(&mut client_topics)
        } else {
            Vec::new()
        };

        if to_sync {
            for queue in &queues {
                self.core
                    .process_task(DispatchJob {
                        signal_name: signal_name.to_owned(),
                        context: context_map.clone(),
                        kwargs: kwargs.clone(),
                        from_client,
                        client_topics: Vec::new(),
                        to_server: true,
                        queue: queue.clone(),
                    })
                    .await;
            }
        }

        if to_server {
            for queue in &queues {
                let topics_for_queue = if *queue == self.core.config.default_queue {
                    background_topics.clone()
                } else {
                    Vec::new()
                };
                let job = DispatchJob {
                    signal_name: signal_name.to_owned(),
                    context: context_map.clone(),
                    kwargs: kwargs.clone(),
                    from_client,
                    client_topics: topics_for_queue,
                    to_server,
                    queue: queue.clone(),
                };
                self.backend.submit(job, &schedule).await?;
            }
        }

        if !client_topics.is_empty() {
            let signal_id = Uuid::new_v4().to_string();
            if let Err(err) = self
                .core
                .publish_to_topics(signal_name, &signal_id, &client_topics, &kwargs)
                .await
            {
                error!("failed publishing {signal_name:?} to client topics: {err:#}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tokio::time::timeout;

    use super::{DispatchEngine, DispatchJob, EngineCore, ScheduleOptions};
    use crate::backend::{InlineBackend, RecordingBackend};
    use crate::config::DispatchConfig;
    use crate::context::{ContextPipeline, WindowContext};
    use crate::error::SignalError;
    use crate::pubsub::{LocalPubSub, PubSubLayer};
    use crate::registry::{
        AccessPolicy, JsonMap, Param, QueueSelector, SignalConnection, SignalRegistry,
    };
    use crate::topics::{self, Destination};

    struct Harness {
        engine: DispatchEngine,
        pubsub: Arc<LocalPubSub>,
        backend: Arc<RecordingBackend>,
        calls: Arc<AtomicUsize>,
    }

    fn kwargs(value: Value) -> JsonMap {
        value.as_object().expect("object").clone()
    }

    fn ctx() -> WindowContext {
        WindowContext {
            window_key: Some("w-1".to_owned()),
            user_id: Some("42".to_owned()),
            ..WindowContext::default()
        }
    }

    fn harness(scheduling: bool, build: impl Fn(&SignalRegistry, Arc<AtomicUsize>)) -> Harness {
        let registry = Arc::new(SignalRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        build(&registry, calls.clone());
        let pubsub = Arc::new(LocalPubSub::new());
        let core = Arc::new(EngineCore::new(
            registry,
            Arc::new(ContextPipeline::default()),
            pubsub.clone(),
            DispatchConfig::default(),
            Box::new(|_| Ok(())),
        ));
        let backend = Arc::new(RecordingBackend::new(scheduling));
        let engine = DispatchEngine::new(core, backend.clone());
        Harness {
            engine,
            pubsub,
            backend,
            calls,
        }
    }

    fn counting_connection(path: &str, calls: Arc<AtomicUsize>) -> SignalConnection {
        SignalConnection::new(
            path,
            &[Param::Context, Param::ExtraKwargs],
            move |_: &WindowContext, _: &JsonMap| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("connection")
    }

    #[test]
    fn job_round_trips_through_wire_form() {
        let job = DispatchJob {
            signal_name: "demo.signal".to_owned(),
            context: Some(kwargs(json!({"window_key": "w-1"}))),
            kwargs: kwargs(json!({"a": 1})),
            from_client: true,
            client_topics: vec!["abc".to_owned()],
            to_server: true,
            queue: "default".to_owned(),
        };
        let decoded = DispatchJob::decode(&job.encode()).expect("decode");
        assert_eq!(decoded, job);

        let null_ctx = DispatchJob {
            context: None,
            ..job
        };
        let decoded = DispatchJob::decode(&null_ctx.encode()).expect("decode");
        assert_eq!(decoded.context, None);
    }

    #[tokio::test]
    async fn fan_out_splits_server_job_and_immediate_publish() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.signal", calls))
                .expect("register");
        });
        let entity = Destination::entity("article", "7");
        let topic_key = topics::resolve_key(None, &entity).expect("topic");
        let mut rx = h
            .pubsub
            .subscribe(vec![topic_key])
            .await
            .expect("subscribe");

        h.engine
            .trigger(
                Some(&ctx()),
                "demo.signal",
                &[Destination::Server, entity],
                kwargs(json!({"a": 1})),
            )
            .await
            .expect("trigger");

        let jobs = h.backend.submitted().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.queue, "default");
        assert!(jobs[0].0.client_topics.is_empty());
        assert!(jobs[0].0.to_server);

        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("frame");
        let parsed: Value = serde_json::from_str(&frame.payload).expect("json");
        assert_eq!(parsed["signal"], "demo.signal");
        assert_eq!(parsed["opts"]["a"], 1);
        assert!(parsed["signal_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn delayed_fan_out_defers_client_topics_into_the_job() {
        let h = harness(true, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.signal", calls))
                .expect("register");
        });
        let entity = Destination::entity("article", "7");
        let topic_key = topics::resolve_key(None, &entity).expect("topic");
        let mut rx = h
            .pubsub
            .subscribe(vec![topic_key.clone()])
            .await
            .expect("subscribe");

        h.engine
            .trigger_signal(
                Some(&ctx()),
                "demo.signal",
                &[Destination::Server, entity],
                kwargs(json!({})),
                ScheduleOptions {
                    eta: Some(4_102_444_800),
                    ..ScheduleOptions::default()
                },
            )
            .await
            .expect("trigger");

        let jobs = h.backend.submitted().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.client_topics, vec![topic_key]);
        assert!(jobs[0].0.to_server);
        assert_eq!(jobs[0].1.eta, Some(4_102_444_800));
        // nothing published until the job runs
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "no immediate publish expected"
        );
    }

    #[tokio::test]
    async fn scheduling_on_incapable_backend_fails_before_any_job() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.signal", calls))
                .expect("register");
        });
        let err = h
            .engine
            .trigger_signal(
                Some(&ctx()),
                "demo.signal",
                &[Destination::Server],
                kwargs(json!({})),
                ScheduleOptions {
                    countdown: Some(30),
                    ..ScheduleOptions::default()
                },
            )
            .await
            .expect_err("should fail");
        assert!(matches!(err, SignalError::SchedulingUnsupported { .. }));
        assert!(h.backend.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn omitted_destinations_default_to_user() {
        let h = harness(false, |_, _| {});
        let user_key = topics::resolve_key(Some(&ctx()), &Destination::User).expect("topic");
        let mut rx = h.pubsub.subscribe(vec![user_key]).await.expect("subscribe");
        h.engine
            .trigger(Some(&ctx()), "demo.signal", &[], kwargs(json!({"n": 1})))
            .await
            .expect("trigger");
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert!(frame.payload.contains("demo.signal"));
    }

    #[tokio::test]
    async fn unknown_server_signal_completes_without_jobs() {
        let h = harness(false, |_, _| {});
        h.engine
            .trigger(
                Some(&ctx()),
                "nobody.home",
                &[Destination::Server],
                kwargs(json!({})),
            )
            .await
            .expect("tolerated");
        assert!(h.backend.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn unresolved_destinations_are_dropped_silently() {
        let h = harness(false, |_, _| {});
        // no context: window and user cannot resolve
        h.engine
            .trigger(
                None,
                "demo.signal",
                &[Destination::Window, Destination::User],
                kwargs(json!({})),
            )
            .await
            .expect("trigger");
        assert!(h.backend.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn sync_destination_runs_handlers_before_returning() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.sync", calls))
                .expect("register");
        });
        h.engine
            .trigger(Some(&ctx()), "demo.sync", &[Destination::Sync], kwargs(json!({})))
            .await
            .expect("trigger");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert!(h.backend.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn inline_backend_executes_submitted_jobs() {
        let registry = Arc::new(SignalRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register_signal(counting_connection("demo.inline", calls.clone()))
            .expect("register");
        let core = Arc::new(EngineCore::new(
            registry,
            Arc::new(ContextPipeline::default()),
            Arc::new(LocalPubSub::new()),
            DispatchConfig::default(),
            Box::new(|_| Ok(())),
        ));
        let engine = DispatchEngine::new(core.clone(), Arc::new(InlineBackend::new(core)));
        engine
            .trigger(Some(&ctx()), "demo.inline", &[Destination::Server], kwargs(json!({})))
            .await
            .expect("trigger");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_registration_surfaces_at_eager_population() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader_attempts = attempts.clone();
        let core = Arc::new(EngineCore::new(
            Arc::new(SignalRegistry::new()),
            Arc::new(ContextPipeline::default()),
            Arc::new(LocalPubSub::new()),
            DispatchConfig::default(),
            Box::new(move |_| {
                loader_attempts.fetch_add(1, Ordering::SeqCst);
                Err(SignalError::InvalidPath("demo..broken".to_owned()))
            }),
        ));
        let err = core.ensure_populated().await.expect_err("population fails");
        assert!(matches!(err, SignalError::InvalidPath(_)));

        // dispatch after a failed pass reports the same error instead of
        // quietly running against an empty registry
        let engine = DispatchEngine::new(core.clone(), Arc::new(InlineBackend::new(core)));
        let err = engine
            .trigger(Some(&ctx()), "demo.signal", &[Destination::Server], kwargs(json!({})))
            .await
            .expect_err("trigger fails");
        assert!(matches!(err, SignalError::InvalidPath(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn queue_affinity_is_rechecked_at_execution() {
        let h = harness(false, |registry, calls| {
            let calls = calls.clone();
            registry
                .register_signal(
                    counting_connection("demo.queued", calls)
                        .with_queue(QueueSelector::Static("other".to_owned())),
                )
                .expect("register");
        });
        // job addressed to a queue the handler does not resolve to
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.queued".to_owned(),
                context: None,
                kwargs: JsonMap::new(),
                from_client: false,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.queued".to_owned(),
                context: None,
                kwargs: JsonMap::new(),
                from_client: false,
                client_topics: Vec::new(),
                to_server: true,
                queue: "other".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unauthorized_client_jobs_are_skipped_quietly() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.protected", calls))
                .expect("register");
        });
        // default policy is server-only: client jobs never invoke
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.protected".to_owned(),
                context: None,
                kwargs: JsonMap::new(),
                from_client: true,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        // the same job from server-side code runs fine
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.protected".to_owned(),
                context: None,
                kwargs: JsonMap::new(),
                from_client: false,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_handler_does_not_stop_siblings() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(
                    SignalConnection::new(
                        "demo.multi",
                        &[Param::Context, Param::ExtraKwargs],
                        |_: &WindowContext, _: &JsonMap| -> anyhow::Result<()> {
                            anyhow::bail!("handler bug")
                        },
                    )
                    .expect("connection"),
                )
                .expect("register");
            registry
                .register_signal(counting_connection("demo.multi", calls))
                .expect("register");
        });
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.multi".to_owned(),
                context: None,
                kwargs: JsonMap::new(),
                from_client: false,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validation_rejection_skips_only_that_handler() {
        let h = harness(false, |registry, calls| {
            // strict contract: requires "title"
            let strict_calls = calls.clone();
            registry
                .register_signal(
                    SignalConnection::new(
                        "demo.mixed",
                        &[Param::Context, Param::required("title")],
                        move |_: &WindowContext, _: &JsonMap| {
                            strict_calls.fetch_add(10, Ordering::SeqCst);
                            Ok(())
                        },
                    )
                    .expect("connection"),
                )
                .expect("register");
            registry
                .register_signal(counting_connection("demo.mixed", calls))
                .expect("register");
        });
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.mixed".to_owned(),
                context: None,
                kwargs: kwargs(json!({"other": true})),
                from_client: false,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        // lenient handler ran, strict one was rejected
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn carried_topics_publish_when_the_job_runs() {
        let h = harness(false, |_, _| {});
        let topic_key = topics::topic_key("-article.7");
        let mut rx = h
            .pubsub
            .subscribe(vec![topic_key.clone()])
            .await
            .expect("subscribe");
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.deferred".to_owned(),
                context: None,
                kwargs: kwargs(json!({"late": true})),
                from_client: false,
                client_topics: vec![topic_key],
                to_server: false,
                queue: "default".to_owned(),
            })
            .await;
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("frame");
        assert!(frame.payload.contains("demo.deferred"));
    }

    #[tokio::test]
    async fn serialized_context_keeps_authorization_outcomes() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(
                    counting_connection("demo.auth", calls)
                        .with_policy(AccessPolicy::Authenticated),
                )
                .expect("register");
        });
        let pipeline = ContextPipeline::default();
        let context_map = pipeline.to_map(&ctx());
        h.engine
            .core()
            .process_task(DispatchJob {
                signal_name: "demo.auth".to_owned(),
                context: Some(context_map),
                kwargs: JsonMap::new(),
                from_client: true,
                client_topics: Vec::new(),
                to_server: true,
                queue: "default".to_owned(),
            })
            .await;
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn call_soon_reaches_the_backend() {
        let h = harness(false, |registry, calls| {
            registry
                .register_signal(counting_connection("demo.chain", calls))
                .expect("register");
        });
        h.engine
            .call_soon(Some(&ctx()), "demo.chain", kwargs(json!({"hop": 1})))
            .await
            .expect("call_soon");
        let jobs = h.backend.submitted().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.signal_name, "demo.chain");
        assert!(!jobs[0].0.from_client);
    }

    #[tokio::test]
    async fn functions_invoke_directly_with_policy_checks() {
        let h = harness(false, |registry, calls| {
            let calls = calls.clone();
            registry
                .register_function(
                    SignalConnection::new(
                        "demo.func",
                        &[Param::Context],
                        move |_: &WindowContext, _: &JsonMap| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                    )
                    .expect("connection")
                    .with_policy(AccessPolicy::Authenticated),
                )
                .expect("register");
        });
        let invoked = h
            .engine
            .call_function(&ctx(), "demo.func", &JsonMap::new(), true)
            .await
            .expect("call");
        assert!(invoked);
        let rejected = h
            .engine
            .call_function(&WindowContext::default(), "demo.func", &JsonMap::new(), true)
            .await
            .expect("call");
        assert!(!rejected);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }
}
