pub mod memory;
pub mod mysql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::grader::Verdict;
use crate::model::{AnswerPayload, QuestionState, SessionSnapshot, SessionStatus};

/// Storage failures split by retry policy. Transient errors are retried in
/// place by the room actor; permanent errors terminate the session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,
    #[error("nickname already taken")]
    NicknameTaken,
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// One appended answer attempt, persisted verbatim alongside the verdict.
#[derive(Debug, Clone)]
pub struct NewAnswerRecord {
    pub session_id: i64,
    pub participant_id: i64,
    pub question_id: String,
    pub attempt_no: u32,
    pub payload: AnswerPayload,
    pub verdict: Verdict,
    pub answered_at: DateTime<Utc>,
}

/// Narrow persistence interface the orchestrator depends on. All writes for
/// one room are issued from that room's actor, so implementations only need
/// to tolerate concurrency across rooms.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Loads session metadata, quiz content (with answer keys), and any
    /// already-persisted participants, question states, and aggregates.
    /// Called once per room materialisation.
    async fn load_session(&self, room_code: &str) -> Result<SessionSnapshot, StoreError>;

    async fn create_participant(
        &self,
        session_id: i64,
        nickname: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Idempotent on `(session, participant, question, attempt_no)`.
    async fn record_answer(&self, record: &NewAnswerRecord) -> Result<(), StoreError>;

    async fn upsert_question_state(
        &self,
        session_id: i64,
        participant_id: i64,
        question_id: &str,
        state: &QuestionState,
    ) -> Result<(), StoreError>;

    /// `participant_id = None` is the class-wide row.
    async fn upsert_aggregate(
        &self,
        session_id: i64,
        participant_id: Option<i64>,
        correct: u32,
        wrong: u32,
        pct: f64,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn mark_participant_left(
        &self,
        participant_id: i64,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
