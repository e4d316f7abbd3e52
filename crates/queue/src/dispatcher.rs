//! Background task dispatcher.
//!
//! Claims runnable tasks into a bounded pool of execution slots and runs
//! the [`TaskHandler`] on each. Every task runs in its own Tokio task, so
//! a failing or panicking handler only affects its own delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handler::{TaskContext, TaskFailure, TaskHandler};
use crate::lane::{LaneScheduler, LaneWeights};
use crate::retry::RetryPolicy;
use crate::store::{ClaimedTask, TaskStore, TaskStoreError};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of execution slots.
    pub concurrency: usize,
    /// Sleep between claim attempts when every lane is empty.
    pub poll_interval: Duration,
    /// Claim lease, renewed every third of its length while a handler runs.
    pub lease: Duration,
    pub weights: LaneWeights,
    pub retry: RetryPolicy,
    /// How long in-flight handlers may keep running after shutdown
    /// before they are cancelled.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(60),
            weights: LaneWeights::default(),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Pool of execution slots consuming a [`TaskStore`].
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        handler: Arc<dyn TaskHandler>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            handler,
            config,
        }
    }

    /// Run until `shutdown` is triggered, then drain in-flight tasks.
    ///
    /// After shutdown no new task is claimed. Handlers still running once
    /// the grace period elapses have their context cancelled; the call
    /// returns when every handler has returned.
    pub async fn run(&self, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let tracker = TaskTracker::new();
        let hard_stop = CancellationToken::new();
        let mut scheduler = LaneScheduler::new(self.config.weights);

        tracing::info!(
            concurrency = self.config.concurrency.max(1),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            lease_secs = self.config.lease.as_secs(),
            "Task dispatcher started",
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next(&mut scheduler).await {
                Ok(Some(task)) => {
                    tracker.spawn(run_task(
                        Arc::clone(&self.store),
                        Arc::clone(&self.handler),
                        task,
                        hard_stop.child_token(),
                        self.config.clone(),
                        permit,
                    ));
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "Task claim failed"),
            }

            drop(permit);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Task dispatcher draining");

        if tokio::time::timeout(self.config.shutdown_grace, tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = tracker.len(),
                "Shutdown grace elapsed, cancelling in-flight tasks",
            );
            hard_stop.cancel();
            tracker.wait().await;
        }

        tracing::info!("Task dispatcher stopped");
    }

    /// Try the scheduler's preferred lane first, then the other one.
    async fn claim_next(
        &self,
        scheduler: &mut LaneScheduler,
    ) -> Result<Option<ClaimedTask>, TaskStoreError> {
        for lane in scheduler.next_order() {
            if let Some(task) = self.store.claim(lane, self.config.lease).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }
}

/// One delivery: run the handler, keep the lease alive, settle the outcome.
async fn run_task(
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
    task: ClaimedTask,
    cancel: CancellationToken,
    config: DispatcherConfig,
    _permit: OwnedSemaphorePermit,
) {
    let task_id = task.id;
    let ctx = TaskContext {
        task_id,
        lane: task.lane,
        attempt: task.attempt,
        max_attempts: task.max_attempts,
        payload: task.payload.clone(),
        cancel,
    };

    // A lease that expired after the final attempt brings the task back
    // once more; the budget is already spent.
    if task.attempt > task.max_attempts {
        tracing::warn!(
            task_id = %task_id,
            attempt = task.attempt,
            max_attempts = task.max_attempts,
            "Retry budget exhausted on redelivery, burying task",
        );
        let reason = "Retry budget exhausted";
        notify_abandoned(&handler, &ctx, reason).await;
        if let Err(e) = store.bury(task_id, task.attempt, reason).await {
            tracing::error!(task_id = %task_id, error = %e, "Failed to bury task");
        }
        return;
    }

    tracing::info!(
        task_id = %task_id,
        lane = %task.lane,
        attempt = task.attempt,
        max_attempts = task.max_attempts,
        "Task started",
    );

    let heartbeat_stop = CancellationToken::new();
    let heartbeat = start_heartbeat(
        Arc::clone(&store),
        task_id,
        task.attempt,
        config.lease,
        heartbeat_stop.clone(),
    );

    let runner = Arc::clone(&handler);
    let delivery = ctx.clone();
    let outcome = tokio::spawn(async move { runner.handle(delivery).await }).await;

    heartbeat_stop.cancel();
    let _ = heartbeat.await;

    let settled = match outcome {
        Ok(Ok(())) => {
            tracing::info!(task_id = %task_id, "Task completed");
            store.ack(task_id, task.attempt).await
        }
        Ok(Err(failure)) => settle_failure(store.as_ref(), &task, &failure, &config.retry).await,
        Err(join_error) => {
            let failure = if join_error.is_panic() {
                TaskFailure::retryable("Task handler panicked")
            } else {
                TaskFailure::retryable("Task handler aborted")
            };
            tracing::error!(task_id = %task_id, error = %join_error, "Task handler crashed");
            if ctx.is_final_attempt() {
                notify_abandoned(&handler, &ctx, failure.message()).await;
            }
            settle_failure(store.as_ref(), &task, &failure, &config.retry).await
        }
    };

    if let Err(e) = settled {
        tracing::error!(
            task_id = %task_id,
            error = %e,
            "Failed to settle task, it will be redelivered after its lease expires",
        );
    }
}

/// Run the handler's abandon hook in its own task so a panic there cannot
/// keep the task from being buried.
async fn notify_abandoned(handler: &Arc<dyn TaskHandler>, ctx: &TaskContext, reason: &str) {
    let handler = Arc::clone(handler);
    let ctx = ctx.clone();
    let reason = reason.to_string();
    let task_id = ctx.task_id;
    if let Err(e) = tokio::spawn(async move { handler.abandoned(&ctx, &reason).await }).await {
        tracing::error!(task_id = %task_id, error = %e, "Task abandon hook crashed");
    }
}

async fn settle_failure(
    store: &dyn TaskStore,
    task: &ClaimedTask,
    failure: &TaskFailure,
    retry: &RetryPolicy,
) -> Result<(), TaskStoreError> {
    if failure.is_retryable() && task.attempt < task.max_attempts {
        let delay = retry.delay_for(task.attempt);
        tracing::warn!(
            task_id = %task.id,
            attempt = task.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "Task failed, retrying",
        );
        store.retry(task.id, task.attempt, delay, failure.message()).await
    } else {
        tracing::error!(
            task_id = %task.id,
            attempt = task.attempt,
            retryable = failure.is_retryable(),
            error = %failure,
            "Task failed permanently",
        );
        store.bury(task.id, task.attempt, failure.message()).await
    }
}

/// Renew a task's lease until `stop` is triggered or the lease is lost.
fn start_heartbeat(
    store: Arc<dyn TaskStore>,
    task_id: uuid::Uuid,
    attempt: u32,
    lease: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = (lease / 3).max(Duration::from_millis(100));
        let mut interval = tokio::time::interval(period);
        // The claim itself just set a fresh lease.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => match store.extend_lease(task_id, attempt, lease).await {
                    Ok(true) => tracing::trace!(task_id = %task_id, "Task lease renewed"),
                    Ok(false) => {
                        tracing::warn!(task_id = %task_id, "Task lease lost");
                        break;
                    }
                    Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Task lease renewal failed"),
                },
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::lane::Lane;
    use crate::memory::{MemoryTaskState, MemoryTaskStore};

    fn fast_config(concurrency: usize) -> DispatcherConfig {
        DispatcherConfig {
            concurrency,
            poll_interval: Duration::from_millis(5),
            lease: Duration::from_secs(30),
            weights: LaneWeights::default(),
            retry: RetryPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: 0.0,
            },
            shutdown_grace: Duration::from_secs(5),
        }
    }

    /// Handler driven by the payload: `{"n": 1, "fail": "retry"|"terminal"|"panic", "times": k}`.
    #[derive(Default)]
    struct ScriptedHandler {
        seen: Mutex<Vec<(i64, u32)>>,
        abandoned: Mutex<Vec<(i64, u32, String)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        hold: Option<Duration>,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn handle(&self, task: TaskContext) -> Result<(), TaskFailure> {
            let n = task.payload["n"].as_i64().unwrap_or(0);
            self.seen.lock().unwrap().push((n, task.attempt));

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            if let Some(hold) = self.hold {
                tokio::time::sleep(hold).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            let times = task.payload["times"].as_u64().unwrap_or(u64::MAX) as u32;
            if task.attempt > times {
                return Ok(());
            }
            match task.payload["fail"].as_str() {
                Some("retry") => Err(TaskFailure::retryable("worker exited with status 1")),
                Some("terminal") => Err(TaskFailure::terminal("worker not found")),
                Some("panic") => panic!("handler blew up"),
                _ => Ok(()),
            }
        }

        async fn abandoned(&self, task: &TaskContext, reason: &str) {
            let n = task.payload["n"].as_i64().unwrap_or(0);
            self.abandoned
                .lock()
                .unwrap()
                .push((n, task.attempt, reason.to_string()));
        }
    }

    async fn run_until_settled(
        store: Arc<MemoryTaskStore>,
        handler: Arc<dyn TaskHandler>,
        config: DispatcherConfig,
    ) {
        let dispatcher = Dispatcher::new(store.clone(), handler, config);
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let watcher = store.clone();

        let waiter = tokio::spawn(async move {
            loop {
                let settled = watcher.snapshot().iter().all(|t| {
                    matches!(t.state, MemoryTaskState::Done | MemoryTaskState::Dead)
                });
                if settled {
                    stopper.cancel();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(10), dispatcher.run(shutdown))
            .await
            .expect("dispatcher should drain");
        waiter.await.unwrap();
    }

    async fn enqueue(store: &MemoryTaskStore, lane: Lane, payload: serde_json::Value) -> uuid::Uuid {
        store.enqueue(lane, payload, 3).await.unwrap()
    }

    // -----------------------------------------------------------------------
    // Delivery outcomes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn successful_tasks_are_acked() {
        let store = Arc::new(MemoryTaskStore::new());
        for n in 0..3 {
            enqueue(&store, Lane::Default, serde_json::json!({ "n": n })).await;
        }
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(1)).await;

        assert!(store.snapshot().iter().all(|t| t.state == MemoryTaskState::Done));
        let seen: Vec<i64> = handler.seen.lock().unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn retryable_failure_is_redelivered() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = enqueue(&store, Lane::Default, serde_json::json!({ "n": 1, "fail": "retry", "times": 1 })).await;
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(1)).await;

        let task = store.find(id).unwrap();
        assert_eq!(task.state, MemoryTaskState::Done);
        assert_eq!(task.attempts, 2);
        assert_eq!(*handler.seen.lock().unwrap(), vec![(1, 1), (1, 2)]);
    }

    #[tokio::test]
    async fn terminal_failure_is_not_retried() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = enqueue(&store, Lane::Default, serde_json::json!({ "fail": "terminal" })).await;
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(1)).await;

        let task = store.find(id).unwrap();
        assert_eq!(task.state, MemoryTaskState::Dead);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("worker not found"));
        // The handler settled this failure itself.
        assert!(handler.abandoned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = enqueue(&store, Lane::Default, serde_json::json!({ "fail": "retry" })).await;

        run_until_settled(store.clone(), Arc::new(ScriptedHandler::default()), fast_config(1)).await;

        let task = store.find(id).unwrap();
        assert_eq!(task.state, MemoryTaskState::Dead);
        assert_eq!(task.attempts, 3);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_other_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        let bad = enqueue(&store, Lane::Default, serde_json::json!({ "n": 1, "fail": "panic" })).await;
        let good = enqueue(&store, Lane::Default, serde_json::json!({ "n": 2 })).await;
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(2)).await;

        let bad = store.find(bad).unwrap();
        assert_eq!(bad.state, MemoryTaskState::Dead);
        assert_eq!(bad.attempts, 3);
        assert_eq!(bad.last_error.as_deref(), Some("Task handler panicked"));
        assert_eq!(store.find(good).unwrap().state, MemoryTaskState::Done);
        // Only the final crash abandons; earlier ones are retried.
        assert_eq!(
            *handler.abandoned.lock().unwrap(),
            vec![(1, 3, "Task handler panicked".to_string())]
        );
    }

    #[tokio::test]
    async fn exhausted_redelivery_is_buried_without_running() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = store.enqueue(Lane::Default, serde_json::json!({ "n": 4 }), 1).await.unwrap();
        store.claim(Lane::Default, Duration::from_secs(30)).await.unwrap();
        store.expire_lease(id);
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(1)).await;

        let task = store.find(id).unwrap();
        assert_eq!(task.state, MemoryTaskState::Dead);
        assert_eq!(task.last_error.as_deref(), Some("Retry budget exhausted"));
        assert!(handler.seen.lock().unwrap().is_empty());
        assert_eq!(
            *handler.abandoned.lock().unwrap(),
            vec![(4, 2, "Retry budget exhausted".to_string())]
        );
    }

    struct PanickingAbandon;

    #[async_trait]
    impl TaskHandler for PanickingAbandon {
        async fn handle(&self, _task: TaskContext) -> Result<(), TaskFailure> {
            Ok(())
        }

        async fn abandoned(&self, _task: &TaskContext, _reason: &str) {
            panic!("abandon hook blew up");
        }
    }

    #[tokio::test]
    async fn crashing_abandon_hook_still_buries() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = store.enqueue(Lane::Default, serde_json::json!({}), 1).await.unwrap();
        store.claim(Lane::Default, Duration::from_secs(30)).await.unwrap();
        store.expire_lease(id);

        run_until_settled(store.clone(), Arc::new(PanickingAbandon), fast_config(1)).await;

        assert_eq!(store.find(id).unwrap().state, MemoryTaskState::Dead);
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrency_is_bounded_by_slots() {
        let store = Arc::new(MemoryTaskStore::new());
        for n in 0..6 {
            enqueue(&store, Lane::Default, serde_json::json!({ "n": n })).await;
        }
        let handler = Arc::new(ScriptedHandler {
            hold: Some(Duration::from_millis(30)),
            ..Default::default()
        });

        run_until_settled(store.clone(), handler.clone(), fast_config(2)).await;

        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(handler.seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn critical_lane_is_favoured_without_starving_default() {
        let store = Arc::new(MemoryTaskStore::new());
        for n in 0..3 {
            enqueue(&store, Lane::Default, serde_json::json!({ "n": 100 + n })).await;
        }
        for n in 0..3 {
            enqueue(&store, Lane::Critical, serde_json::json!({ "n": n })).await;
        }
        let handler = Arc::new(ScriptedHandler::default());

        run_until_settled(store.clone(), handler.clone(), fast_config(1)).await;

        let order: Vec<i64> = handler.seen.lock().unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(order, vec![0, 100, 1, 2, 101, 102]);
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    struct WaitForCancel;

    #[async_trait]
    impl TaskHandler for WaitForCancel {
        async fn handle(&self, task: TaskContext) -> Result<(), TaskFailure> {
            task.cancel.cancelled().await;
            Err(TaskFailure::terminal("Cancelled"))
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_after_grace() {
        let store = Arc::new(MemoryTaskStore::new());
        let id = enqueue(&store, Lane::Default, serde_json::json!({})).await;
        let config = DispatcherConfig {
            shutdown_grace: Duration::from_millis(50),
            ..fast_config(1)
        };
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(WaitForCancel), config);
        let shutdown = CancellationToken::new();

        let stopper = shutdown.clone();
        let watcher = store.clone();
        tokio::spawn(async move {
            while watcher.find(id).map(|t| t.state) != Some(MemoryTaskState::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), dispatcher.run(shutdown))
            .await
            .expect("dispatcher should stop after grace");

        let task = store.find(id).unwrap();
        assert_eq!(task.state, MemoryTaskState::Dead);
        assert_eq!(task.last_error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn shutdown_with_idle_pool_returns_promptly() {
        let store = Arc::new(MemoryTaskStore::new());
        let dispatcher = Dispatcher::new(store, Arc::new(ScriptedHandler::default()), fast_config(3));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), dispatcher.run(shutdown))
            .await
            .expect("idle dispatcher should stop immediately");
    }
}
