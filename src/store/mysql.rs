//! MySQL implementation of the session store gateway, over the platform's
//! `sessions` / `session_participants` / `session_answers` /
//! `session_question_states` / `session_stats_aggregate` tables.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tokio::time::timeout;

use crate::model::{
    AnswerKey, GameMode, JoinState, Participant, PersistedAggregate, PersistedQuestionState,
    Question, QuestionKind, QuestionOption, QuestionState, SessionMeta, SessionSnapshot,
    SessionStatus,
};

use super::{NewAnswerRecord, SessionStore, StoreError};

pub struct MySqlSessionStore {
    pool: MySqlPool,
    op_deadline: Duration,
}

impl MySqlSessionStore {
    pub fn new(pool: MySqlPool, op_deadline: Duration) -> Self {
        Self { pool, op_deadline }
    }

    pub async fn connect(database_url: &str, op_deadline: Duration) -> Result<Self, sqlx::Error> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, op_deadline))
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match timeout(self.op_deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(map_sqlx_error(err)),
            Err(_) => Err(StoreError::Transient("store deadline elapsed".to_string())),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
        other => StoreError::Permanent(other.to_string()),
    }
}

fn get_utc(row: &MySqlRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let naive: NaiveDateTime = row.try_get(column)?;
    Ok(naive.and_utc())
}

fn get_utc_opt(row: &MySqlRow, column: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let naive: Option<NaiveDateTime> = row.try_get(column)?;
    Ok(naive.map(|n| n.and_utc()))
}

fn map_session_row(row: &MySqlRow) -> Result<SessionMeta, StoreError> {
    let game_mode_raw: String = row.try_get("game_mode").map_err(map_sqlx_error)?;
    let status_raw: String = row.try_get("status").map_err(map_sqlx_error)?;
    Ok(SessionMeta {
        session_id: row.try_get("id").map_err(map_sqlx_error)?,
        room_code: row.try_get("room_code").map_err(map_sqlx_error)?,
        join_token: row.try_get("join_token").map_err(map_sqlx_error)?,
        teacher_csrf: row.try_get("teacher_csrf").map_err(map_sqlx_error)?,
        quiz_id: row.try_get("quiz_id").map_err(map_sqlx_error)?,
        teacher_id: row.try_get("teacher_id").map_err(map_sqlx_error)?,
        game_mode: GameMode::from_str(&game_mode_raw)
            .ok_or_else(|| StoreError::Permanent(format!("unknown game mode {game_mode_raw}")))?,
        status: SessionStatus::from_str(&status_raw)
            .ok_or_else(|| StoreError::Permanent(format!("unknown session status {status_raw}")))?,
        started_at: get_utc_opt(row, "started_at").map_err(map_sqlx_error)?,
        ended_at: get_utc_opt(row, "ended_at").map_err(map_sqlx_error)?,
    })
}

fn build_answer_key(
    external_id: &str,
    kind: QuestionKind,
    answer_text: Option<String>,
    options: &[(QuestionOption, bool)],
) -> Result<AnswerKey, StoreError> {
    match kind {
        QuestionKind::Open => answer_text.map(AnswerKey::Open).ok_or_else(|| {
            StoreError::Permanent(format!("open question {external_id} has no answer text"))
        }),
        QuestionKind::Single => options
            .iter()
            .find(|(_, correct)| *correct)
            .map(|(opt, _)| AnswerKey::Single(opt.external_id.clone()))
            .ok_or_else(|| {
                StoreError::Permanent(format!(
                    "single question {external_id} has no correct option"
                ))
            }),
        QuestionKind::Multi => {
            let key: BTreeSet<String> = options
                .iter()
                .filter(|(_, correct)| *correct)
                .map(|(opt, _)| opt.external_id.clone())
                .collect();
            if key.is_empty() {
                return Err(StoreError::Permanent(format!(
                    "multi question {external_id} has no correct options"
                )));
            }
            Ok(AnswerKey::Multi(key))
        }
    }
}

#[async_trait]
impl SessionStore for MySqlSessionStore {
    async fn load_session(&self, room_code: &str) -> Result<SessionSnapshot, StoreError> {
        let row = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT id, room_code, join_token, teacher_csrf, quiz_id, teacher_id,
                           game_mode, status, started_at, ended_at
                    FROM sessions
                    WHERE room_code = ?
                    LIMIT 1
                    "#,
                )
                .bind(room_code)
                .fetch_optional(&self.pool),
            )
            .await?;

        let session = match row {
            Some(row) => map_session_row(&row)?,
            None => return Err(StoreError::RoomNotFound),
        };

        let question_rows = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT id, external_id, position, kind, prompt, answer_text
                    FROM quiz_questions
                    WHERE quiz_id = ?
                    ORDER BY position ASC
                    "#,
                )
                .bind(session.quiz_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let option_rows = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT o.question_id, o.external_id, o.text, o.is_correct
                    FROM quiz_question_options o
                    JOIN quiz_questions q ON q.id = o.question_id
                    WHERE q.quiz_id = ?
                    ORDER BY o.question_id ASC, o.position ASC
                    "#,
                )
                .bind(session.quiz_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut options_by_question: std::collections::HashMap<i64, Vec<(QuestionOption, bool)>> =
            std::collections::HashMap::new();
        for row in &option_rows {
            let question_db_id: i64 = row.try_get("question_id").map_err(map_sqlx_error)?;
            let option = QuestionOption {
                external_id: row.try_get("external_id").map_err(map_sqlx_error)?,
                text: row.try_get("text").map_err(map_sqlx_error)?,
            };
            let is_correct: bool = row.try_get("is_correct").map_err(map_sqlx_error)?;
            options_by_question
                .entry(question_db_id)
                .or_default()
                .push((option, is_correct));
        }

        let mut questions = Vec::with_capacity(question_rows.len());
        for row in &question_rows {
            let question_db_id: i64 = row.try_get("id").map_err(map_sqlx_error)?;
            let external_id: String = row.try_get("external_id").map_err(map_sqlx_error)?;
            let kind_raw: String = row.try_get("kind").map_err(map_sqlx_error)?;
            let kind = QuestionKind::from_str(&kind_raw).ok_or_else(|| {
                StoreError::Permanent(format!("unknown question kind {kind_raw}"))
            })?;
            let answer_text: Option<String> = row.try_get("answer_text").map_err(map_sqlx_error)?;
            let options = options_by_question.remove(&question_db_id).unwrap_or_default();
            let answer_key = build_answer_key(&external_id, kind, answer_text, &options)?;
            let position: u32 = row.try_get::<i64, _>("position").map_err(map_sqlx_error)? as u32;
            questions.push(Question {
                external_id,
                position,
                kind,
                prompt: row.try_get("prompt").map_err(map_sqlx_error)?,
                options: options.into_iter().map(|(opt, _)| opt).collect(),
                answer_key,
            });
        }

        let participant_rows = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT id, nickname, join_state, connected_at, left_at
                    FROM session_participants
                    WHERE session_id = ?
                    ORDER BY id ASC
                    "#,
                )
                .bind(session.session_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut participants = Vec::with_capacity(participant_rows.len());
        for row in &participant_rows {
            let join_state_raw: String = row.try_get("join_state").map_err(map_sqlx_error)?;
            participants.push(Participant {
                participant_id: row.try_get("id").map_err(map_sqlx_error)?,
                nickname: row.try_get("nickname").map_err(map_sqlx_error)?,
                join_state: JoinState::from_str(&join_state_raw).ok_or_else(|| {
                    StoreError::Permanent(format!("unknown join state {join_state_raw}"))
                })?,
                connected_at: get_utc(row, "connected_at").map_err(map_sqlx_error)?,
                left_at: get_utc_opt(row, "left_at").map_err(map_sqlx_error)?,
            });
        }

        let state_rows = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT participant_id, question_id, attempts, is_correct,
                           first_attempt_at, last_attempt_at
                    FROM session_question_states
                    WHERE session_id = ?
                    "#,
                )
                .bind(session.session_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut question_states = Vec::with_capacity(state_rows.len());
        for row in &state_rows {
            question_states.push(PersistedQuestionState {
                participant_id: row.try_get("participant_id").map_err(map_sqlx_error)?,
                question_id: row.try_get("question_id").map_err(map_sqlx_error)?,
                state: QuestionState {
                    attempts: row.try_get::<i64, _>("attempts").map_err(map_sqlx_error)? as u32,
                    is_correct: row.try_get("is_correct").map_err(map_sqlx_error)?,
                    first_attempt_at: get_utc(row, "first_attempt_at").map_err(map_sqlx_error)?,
                    last_attempt_at: get_utc(row, "last_attempt_at").map_err(map_sqlx_error)?,
                },
            });
        }

        let aggregate_rows = self
            .with_deadline(
                sqlx::query(
                    r#"
                    SELECT participant_id, correct_count, wrong_count
                    FROM session_stats_aggregate
                    WHERE session_id = ?
                    "#,
                )
                .bind(session.session_id)
                .fetch_all(&self.pool),
            )
            .await?;

        let mut aggregates = Vec::with_capacity(aggregate_rows.len());
        for row in &aggregate_rows {
            aggregates.push(PersistedAggregate {
                participant_id: row.try_get("participant_id").map_err(map_sqlx_error)?,
                correct: row.try_get::<i64, _>("correct_count").map_err(map_sqlx_error)? as u32,
                wrong: row.try_get::<i64, _>("wrong_count").map_err(map_sqlx_error)? as u32,
            });
        }

        Ok(SessionSnapshot {
            session,
            questions,
            participants,
            question_states,
            aggregates,
        })
    }

    async fn create_participant(
        &self,
        session_id: i64,
        nickname: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = timeout(
            self.op_deadline,
            sqlx::query(
                r#"
                INSERT INTO session_participants (session_id, nickname, join_state, connected_at)
                VALUES (?, ?, 'waiting', ?)
                "#,
            )
            .bind(session_id)
            .bind(nickname)
            .bind(connected_at.naive_utc())
            .execute(&self.pool),
        )
        .await;

        match result {
            Ok(Ok(done)) => Ok(done.last_insert_id() as i64),
            Ok(Err(err)) if is_unique_violation(&err) => Err(StoreError::NicknameTaken),
            Ok(Err(err)) => Err(map_sqlx_error(err)),
            Err(_) => Err(StoreError::Transient("store deadline elapsed".to_string())),
        }
    }

    async fn record_answer(&self, record: &NewAnswerRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|err| StoreError::Permanent(err.to_string()))?;
        // INSERT IGNORE keeps replays of the same attempt_no idempotent.
        self.with_deadline(
            sqlx::query(
                r#"
                INSERT IGNORE INTO session_answers
                    (session_id, participant_id, question_id, attempt_no, payload, verdict, answered_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(record.session_id)
            .bind(record.participant_id)
            .bind(&record.question_id)
            .bind(record.attempt_no)
            .bind(payload)
            .bind(record.verdict.as_str())
            .bind(record.answered_at.naive_utc())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn upsert_question_state(
        &self,
        session_id: i64,
        participant_id: i64,
        question_id: &str,
        state: &QuestionState,
    ) -> Result<(), StoreError> {
        self.with_deadline(
            sqlx::query(
                r#"
                INSERT INTO session_question_states
                    (session_id, participant_id, question_id, attempts, is_correct,
                     first_attempt_at, last_attempt_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    attempts = VALUES(attempts),
                    is_correct = VALUES(is_correct),
                    last_attempt_at = VALUES(last_attempt_at)
                "#,
            )
            .bind(session_id)
            .bind(participant_id)
            .bind(question_id)
            .bind(state.attempts)
            .bind(state.is_correct)
            .bind(state.first_attempt_at.naive_utc())
            .bind(state.last_attempt_at.naive_utc())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn upsert_aggregate(
        &self,
        session_id: i64,
        participant_id: Option<i64>,
        correct: u32,
        wrong: u32,
        pct: f64,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // The class row is keyed by NULL participant_id; the per-room
        // single-writer keeps it unique without a NULL-safe index.
        self.with_deadline(
            sqlx::query(
                r#"
                INSERT INTO session_stats_aggregate
                    (session_id, participant_id, correct_count, wrong_count, correct_pct, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON DUPLICATE KEY UPDATE
                    correct_count = VALUES(correct_count),
                    wrong_count = VALUES(wrong_count),
                    correct_pct = VALUES(correct_pct),
                    updated_at = VALUES(updated_at)
                "#,
            )
            .bind(session_id)
            .bind(participant_id)
            .bind(correct)
            .bind(wrong)
            .bind(pct)
            .bind(ts.naive_utc())
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.with_deadline(
            sqlx::query(
                r#"
                UPDATE sessions
                SET status = ?,
                    started_at = COALESCE(?, started_at),
                    ended_at = COALESCE(?, ended_at)
                WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(started_at.map(|ts| ts.naive_utc()))
            .bind(ended_at.map(|ts| ts.naive_utc()))
            .bind(session_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn mark_participant_left(
        &self,
        participant_id: i64,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_deadline(
            sqlx::query(
                r#"
                UPDATE session_participants
                SET join_state = 'left', left_at = ?
                WHERE id = ?
                "#,
            )
            .bind(left_at.naive_utc())
            .bind(participant_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
