//! The job state store seam and its Postgres implementation.
//!
//! Every transition is a conditional write: callers learn from the
//! returned `bool` whether it applied, and no transition ever leaves a
//! terminal state or moves progress backward.

use async_trait::async_trait;
use manga_core::types::RequestId;
use manga_db::models::request::{CreateRequest, Request, RequestListQuery};
use manga_db::models::result::{NewPageResult, PageResult};
use manga_db::repositories::{RequestRepo, ResultRepo};
use manga_db::DbPool;

use crate::error::StoreError;

/// Persistence for requests and their page results.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError>;

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError>;

    async fn list_requests(&self, query: &RequestListQuery) -> Result<Vec<Request>, StoreError>;

    /// `queued -> processing` with progress reset; a no-op returning
    /// `true` when already processing, `false` when terminal or absent.
    async fn mark_processing(&self, id: RequestId) -> Result<bool, StoreError>;

    /// Raise stored progress; `false` when nothing changed.
    async fn advance_progress(&self, id: RequestId, percent: u8) -> Result<bool, StoreError>;

    /// `processing -> completed`, progress forced to 100.
    async fn complete(&self, id: RequestId) -> Result<bool, StoreError>;

    /// Any non-terminal state `-> failed`.
    async fn fail(&self, id: RequestId, message: &str) -> Result<bool, StoreError>;

    /// Replace the request's result set atomically.
    async fn save_results(
        &self,
        id: RequestId,
        pages: &[NewPageResult],
    ) -> Result<Vec<PageResult>, StoreError>;

    async fn set_page_count(&self, id: RequestId, page_count: u32) -> Result<bool, StoreError>;

    /// Results ordered by page number.
    async fn list_results(&self, id: RequestId) -> Result<Vec<PageResult>, StoreError>;
}

/// [`JobStore`] over the `requests` and `results` tables.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError> {
        Ok(RequestRepo::create(&self.pool, input).await?)
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, StoreError> {
        Ok(RequestRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_requests(&self, query: &RequestListQuery) -> Result<Vec<Request>, StoreError> {
        Ok(RequestRepo::list(&self.pool, query).await?)
    }

    async fn mark_processing(&self, id: RequestId) -> Result<bool, StoreError> {
        Ok(RequestRepo::mark_processing(&self.pool, id).await?)
    }

    async fn advance_progress(&self, id: RequestId, percent: u8) -> Result<bool, StoreError> {
        Ok(RequestRepo::advance_progress(&self.pool, id, i16::from(percent)).await?)
    }

    async fn complete(&self, id: RequestId) -> Result<bool, StoreError> {
        Ok(RequestRepo::complete(&self.pool, id).await?)
    }

    async fn fail(&self, id: RequestId, message: &str) -> Result<bool, StoreError> {
        Ok(RequestRepo::fail(&self.pool, id, message).await?)
    }

    async fn save_results(
        &self,
        id: RequestId,
        pages: &[NewPageResult],
    ) -> Result<Vec<PageResult>, StoreError> {
        Ok(ResultRepo::create_batch(&self.pool, id, pages).await?)
    }

    async fn set_page_count(&self, id: RequestId, page_count: u32) -> Result<bool, StoreError> {
        let page_count = i32::try_from(page_count).unwrap_or(i32::MAX);
        Ok(RequestRepo::set_page_count(&self.pool, id, page_count).await?)
    }

    async fn list_results(&self, id: RequestId) -> Result<Vec<PageResult>, StoreError> {
        Ok(ResultRepo::list_by_request(&self.pool, id).await?)
    }
}
