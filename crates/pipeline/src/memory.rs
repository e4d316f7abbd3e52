//! In-process [`JobStore`] mirroring the Postgres transition rules.
//!
//! Used by the pipeline tests and for running the pipeline without a
//! database. Individual operations can be made to fail to exercise the
//! best-effort and fatal write paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use manga_core::types::RequestId;
use manga_db::models::request::{CreateRequest, Request, RequestListQuery};
use manga_db::models::result::{NewPageResult, PageResult};
use manga_db::models::status::RequestStatus;

use crate::error::StoreError;
use crate::store::JobStore;

/// Operations that can be switched to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    MarkProcessing,
    AdvanceProgress,
    Complete,
    Fail,
    SaveResults,
    SetPageCount,
}

#[derive(Default)]
struct State {
    requests: HashMap<RequestId, Request>,
    results: HashMap<RequestId, Vec<PageResult>>,
    failing: HashSet<StoreOp>,
    /// Every progress value accepted by `advance_progress`, in order.
    progress_log: HashMap<RequestId, Vec<u8>>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail with `Unavailable` (or succeed again).
    pub fn set_failing(&self, op: StoreOp, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(op);
        } else {
            state.failing.remove(&op);
        }
    }

    /// Progress values that were actually stored, oldest first.
    pub fn progress_log(&self, id: RequestId) -> Vec<u8> {
        self.lock().progress_log.get(&id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(state: &State, op: StoreOp) -> Result<(), StoreError> {
        if state.failing.contains(&op) {
            return Err(StoreError::Unavailable(format!("{op:?} disabled")));
        }
        Ok(())
    }

    fn status_of(request: &Request) -> Option<RequestStatus> {
        RequestStatus::from_id(request.status_id)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError> {
        let now = Utc::now();
        let request = Request {
            id: uuid::Uuid::now_v7(),
            filename: input.filename.clone(),
            file_kind: input.file_kind.as_str().to_string(),
            status_id: RequestStatus::Queued.id(),
            progress: 0,
            page_count: 0,
            thumbnail_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.lock().requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(self.lock().requests.get(&id).cloned())
    }

    async fn list_requests(&self, query: &RequestListQuery) -> Result<Vec<Request>, StoreError> {
        let state = self.lock();
        let mut rows: Vec<Request> = state
            .requests
            .values()
            .filter(|r| query.status_id.is_none_or(|s| r.status_id == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        let limit = query.limit.unwrap_or(50).clamp(1, 100) as usize;
        let offset = query.offset.unwrap_or(0).max(0) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_processing(&self, id: RequestId) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::MarkProcessing)?;
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(false);
        };
        match Self::status_of(request) {
            Some(RequestStatus::Queued) => {
                request.status_id = RequestStatus::Processing.id();
                request.progress = 0;
            }
            Some(RequestStatus::Processing) => {}
            _ => return Ok(false),
        }
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn advance_progress(&self, id: RequestId, percent: u8) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::AdvanceProgress)?;
        let percent = percent.min(100);
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(false);
        };
        if Self::status_of(request) != Some(RequestStatus::Processing)
            || request.progress >= i16::from(percent)
        {
            return Ok(false);
        }
        request.progress = i16::from(percent);
        request.updated_at = Utc::now();
        state.progress_log.entry(id).or_default().push(percent);
        Ok(true)
    }

    async fn complete(&self, id: RequestId) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::Complete)?;
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(false);
        };
        if Self::status_of(request) != Some(RequestStatus::Processing) {
            return Ok(false);
        }
        let now = Utc::now();
        request.status_id = RequestStatus::Completed.id();
        request.progress = 100;
        request.completed_at = Some(now);
        request.updated_at = now;
        Ok(true)
    }

    async fn fail(&self, id: RequestId, message: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::Fail)?;
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(false);
        };
        if Self::status_of(request).is_none_or(RequestStatus::is_terminal) {
            return Ok(false);
        }
        let now = Utc::now();
        request.status_id = RequestStatus::Failed.id();
        request.error_message = Some(message.to_string());
        request.completed_at = Some(now);
        request.updated_at = now;
        Ok(true)
    }

    async fn save_results(
        &self,
        id: RequestId,
        pages: &[NewPageResult],
    ) -> Result<Vec<PageResult>, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::SaveResults)?;
        if !state.requests.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut seen = HashSet::new();
        if !pages.iter().all(|p| seen.insert(p.page_number)) {
            return Err(StoreError::Unavailable("duplicate page number".into()));
        }

        let now = Utc::now();
        let mut rows: Vec<PageResult> = pages
            .iter()
            .map(|p| PageResult {
                id: uuid::Uuid::now_v7(),
                request_id: id,
                page_number: p.page_number,
                original_path: p.original_path.clone(),
                translated_path: p.translated_path.clone(),
                created_at: now,
            })
            .collect();
        rows.sort_by_key(|r| r.page_number);
        state.results.insert(id, rows.clone());
        Ok(rows)
    }

    async fn set_page_count(&self, id: RequestId, page_count: u32) -> Result<bool, StoreError> {
        let mut state = self.lock();
        Self::check(&state, StoreOp::SetPageCount)?;
        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(false);
        };
        if Self::status_of(request) != Some(RequestStatus::Processing) {
            return Ok(false);
        }
        request.page_count = i32::try_from(page_count).unwrap_or(i32::MAX);
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_results(&self, id: RequestId) -> Result<Vec<PageResult>, StoreError> {
        Ok(self.lock().results.get(&id).cloned().unwrap_or_default())
    }
}
