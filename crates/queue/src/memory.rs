//! In-process [`TaskStore`] with the same claim/lease semantics as the
//! Postgres store. Nothing survives a restart.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::lane::Lane;
use crate::store::{ClaimedTask, TaskStore, TaskStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTaskState {
    Pending,
    Running,
    Done,
    Dead,
}

#[derive(Debug, Clone)]
struct MemoryTask {
    id: Uuid,
    lane: Lane,
    payload: serde_json::Value,
    state: MemoryTaskState,
    attempts: u32,
    max_attempts: u32,
    run_at: Instant,
    locked_until: Option<Instant>,
    last_error: Option<String>,
}

impl MemoryTask {
    fn is_runnable(&self, lane: Lane, now: Instant) -> bool {
        if self.lane != lane {
            return false;
        }
        match self.state {
            MemoryTaskState::Pending => self.run_at <= now,
            MemoryTaskState::Running => self.locked_until.is_some_and(|t| t < now),
            MemoryTaskState::Done | MemoryTaskState::Dead => false,
        }
    }

    /// Whether the delivery numbered `attempt` still holds this task.
    fn holds(&self, id: Uuid, attempt: u32) -> bool {
        self.id == id && self.state == MemoryTaskState::Running && self.attempts == attempt
    }
}

/// Snapshot of one stored task, for assertions.
#[derive(Debug, Clone)]
pub struct MemoryTaskSnapshot {
    pub id: Uuid,
    pub lane: Lane,
    pub state: MemoryTaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<MemoryTask>>,
    /// When set, every call fails with `Unavailable`.
    unavailable: Mutex<Option<String>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail, or recover with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.lock_unavailable() = reason.map(str::to_string);
    }

    pub fn snapshot(&self) -> Vec<MemoryTaskSnapshot> {
        self.lock_tasks()
            .iter()
            .map(|t| MemoryTaskSnapshot {
                id: t.id,
                lane: t.lane,
                state: t.state,
                attempts: t.attempts,
                last_error: t.last_error.clone(),
            })
            .collect()
    }

    pub fn find(&self, id: Uuid) -> Option<MemoryTaskSnapshot> {
        self.snapshot().into_iter().find(|t| t.id == id)
    }

    /// Make a pending task runnable now, skipping its backoff.
    pub fn release_delay(&self, id: Uuid) {
        if let Some(task) = self.lock_tasks().iter_mut().find(|t| t.id == id) {
            task.run_at = Instant::now();
        }
    }

    /// Expire a running task's lease, as if its holder crashed.
    pub fn expire_lease(&self, id: Uuid) {
        if let Some(task) = self.lock_tasks().iter_mut().find(|t| t.id == id) {
            if task.state == MemoryTaskState::Running {
                task.locked_until = Some(Instant::now() - Duration::from_millis(1));
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<MemoryTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_unavailable(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.unavailable
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), TaskStoreError> {
        match self.lock_unavailable().as_ref() {
            Some(reason) => Err(TaskStoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn settle(
        &self,
        id: Uuid,
        attempt: u32,
        state: MemoryTaskState,
        error: Option<&str>,
    ) -> Result<(), TaskStoreError> {
        self.check_available()?;
        let mut tasks = self.lock_tasks();
        if let Some(task) = tasks.iter_mut().find(|t| t.holds(id, attempt)) {
            task.state = state;
            task.locked_until = None;
            if let Some(error) = error {
                task.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn enqueue(
        &self,
        lane: Lane,
        payload: serde_json::Value,
        max_attempts: u32,
    ) -> Result<Uuid, TaskStoreError> {
        self.check_available()?;
        let id = Uuid::now_v7();
        self.lock_tasks().push(MemoryTask {
            id,
            lane,
            payload,
            state: MemoryTaskState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            run_at: Instant::now(),
            locked_until: None,
            last_error: None,
        });
        Ok(id)
    }

    async fn claim(&self, lane: Lane, lease: Duration) -> Result<Option<ClaimedTask>, TaskStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut tasks = self.lock_tasks();
        let next = tasks
            .iter_mut()
            .filter(|t| t.is_runnable(lane, now))
            .min_by_key(|t| t.run_at);
        Ok(next.map(|task| {
            task.state = MemoryTaskState::Running;
            task.attempts += 1;
            task.locked_until = Some(now + lease);
            ClaimedTask {
                id: task.id,
                lane: task.lane,
                payload: task.payload.clone(),
                attempt: task.attempts,
                max_attempts: task.max_attempts,
            }
        }))
    }

    async fn extend_lease(&self, id: Uuid, attempt: u32, lease: Duration) -> Result<bool, TaskStoreError> {
        self.check_available()?;
        let mut tasks = self.lock_tasks();
        match tasks.iter_mut().find(|t| t.holds(id, attempt)) {
            Some(task) => {
                task.locked_until = Some(Instant::now() + lease);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, id: Uuid, attempt: u32) -> Result<(), TaskStoreError> {
        self.settle(id, attempt, MemoryTaskState::Done, None)
    }

    async fn retry(
        &self,
        id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), TaskStoreError> {
        self.check_available()?;
        let mut tasks = self.lock_tasks();
        if let Some(task) = tasks.iter_mut().find(|t| t.holds(id, attempt)) {
            task.state = MemoryTaskState::Pending;
            task.run_at = Instant::now() + delay;
            task.locked_until = None;
            task.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn bury(&self, id: Uuid, attempt: u32, error: &str) -> Result<(), TaskStoreError> {
        self.settle(id, attempt, MemoryTaskState::Dead, Some(error))
    }
}
