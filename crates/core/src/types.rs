/// Requests, results and queue tasks are keyed by UUIDs.
pub type RequestId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
