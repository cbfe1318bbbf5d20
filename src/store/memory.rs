//! In-memory store used by tests and local fixtures. Mirrors the gateway
//! contract closely enough to exercise the actor's persistence paths,
//! including injected failures for the retry policy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::{
    Participant, PersistedAggregate, PersistedQuestionState, JoinState, QuestionState,
    SessionSnapshot, SessionStatus,
};

use super::{NewAnswerRecord, SessionStore, StoreError};

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, SessionSnapshot>,
    answers: Vec<NewAnswerRecord>,
    next_participant_id: i64,
    injected_failures: VecDeque<StoreError>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_participant_id: 1,
                ..MemoryState::default()
            })),
        }
    }

    pub fn seed_session(&self, snapshot: SessionSnapshot) {
        let mut state = self.state.lock();
        state
            .sessions
            .insert(snapshot.session.room_code.clone(), snapshot);
    }

    /// Queues an error returned by the next write call, ahead of its normal
    /// behaviour. Tests use this to drive the actor's retry path.
    pub fn inject_failure(&self, error: StoreError) {
        self.state.lock().injected_failures.push_back(error);
    }

    pub fn answer_records(&self) -> Vec<NewAnswerRecord> {
        self.state.lock().answers.clone()
    }

    pub fn session_status(&self, room_code: &str) -> Option<SessionStatus> {
        self.state
            .lock()
            .sessions
            .get(room_code)
            .map(|snapshot| snapshot.session.status)
    }

    pub fn participants(&self, room_code: &str) -> Vec<Participant> {
        self.state
            .lock()
            .sessions
            .get(room_code)
            .map(|snapshot| snapshot.participants.clone())
            .unwrap_or_default()
    }

    pub fn aggregates(&self, room_code: &str) -> Vec<PersistedAggregate> {
        self.state
            .lock()
            .sessions
            .get(room_code)
            .map(|snapshot| snapshot.aggregates.clone())
            .unwrap_or_default()
    }

    pub fn question_states(&self, room_code: &str) -> Vec<PersistedQuestionState> {
        self.state
            .lock()
            .sessions
            .get(room_code)
            .map(|snapshot| snapshot.question_states.clone())
            .unwrap_or_default()
    }

    fn take_injected(&self) -> Option<StoreError> {
        self.state.lock().injected_failures.pop_front()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn load_session(&self, room_code: &str) -> Result<SessionSnapshot, StoreError> {
        let state = self.state.lock();
        state
            .sessions
            .get(room_code)
            .cloned()
            .ok_or(StoreError::RoomNotFound)
    }

    async fn create_participant(
        &self,
        session_id: i64,
        nickname: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        let id = state.next_participant_id;
        let snapshot = state
            .sessions
            .values_mut()
            .find(|snapshot| snapshot.session.session_id == session_id)
            .ok_or_else(|| StoreError::Permanent("unknown session".to_string()))?;
        if snapshot
            .participants
            .iter()
            .any(|p| p.nickname == nickname)
        {
            return Err(StoreError::NicknameTaken);
        }
        snapshot.participants.push(Participant {
            participant_id: id,
            nickname: nickname.to_string(),
            join_state: JoinState::Waiting,
            connected_at,
            left_at: None,
        });
        state.next_participant_id += 1;
        Ok(id)
    }

    async fn record_answer(&self, record: &NewAnswerRecord) -> Result<(), StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        let duplicate = state.answers.iter().any(|existing| {
            existing.session_id == record.session_id
                && existing.participant_id == record.participant_id
                && existing.question_id == record.question_id
                && existing.attempt_no == record.attempt_no
        });
        if !duplicate {
            state.answers.push(record.clone());
        }
        Ok(())
    }

    async fn upsert_question_state(
        &self,
        session_id: i64,
        participant_id: i64,
        question_id: &str,
        question_state: &QuestionState,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        let snapshot = state
            .sessions
            .values_mut()
            .find(|snapshot| snapshot.session.session_id == session_id)
            .ok_or_else(|| StoreError::Permanent("unknown session".to_string()))?;
        let existing = snapshot.question_states.iter_mut().find(|qs| {
            qs.participant_id == participant_id && qs.question_id == question_id
        });
        match existing {
            Some(qs) => qs.state = *question_state,
            None => snapshot.question_states.push(PersistedQuestionState {
                participant_id,
                question_id: question_id.to_string(),
                state: *question_state,
            }),
        }
        Ok(())
    }

    async fn upsert_aggregate(
        &self,
        session_id: i64,
        participant_id: Option<i64>,
        correct: u32,
        wrong: u32,
        _pct: f64,
        _ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        let snapshot = state
            .sessions
            .values_mut()
            .find(|snapshot| snapshot.session.session_id == session_id)
            .ok_or_else(|| StoreError::Permanent("unknown session".to_string()))?;
        let existing = snapshot
            .aggregates
            .iter_mut()
            .find(|agg| agg.participant_id == participant_id);
        match existing {
            Some(agg) => {
                agg.correct = correct;
                agg.wrong = wrong;
            }
            None => snapshot.aggregates.push(PersistedAggregate {
                participant_id,
                correct,
                wrong,
            }),
        }
        Ok(())
    }

    async fn set_session_status(
        &self,
        session_id: i64,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        let snapshot = state
            .sessions
            .values_mut()
            .find(|snapshot| snapshot.session.session_id == session_id)
            .ok_or_else(|| StoreError::Permanent("unknown session".to_string()))?;
        snapshot.session.status = status;
        if started_at.is_some() {
            snapshot.session.started_at = started_at;
        }
        if ended_at.is_some() {
            snapshot.session.ended_at = ended_at;
        }
        Ok(())
    }

    async fn mark_participant_left(
        &self,
        participant_id: i64,
        left_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(err) = self.take_injected() {
            return Err(err);
        }
        let mut state = self.state.lock();
        for snapshot in state.sessions.values_mut() {
            if let Some(participant) = snapshot
                .participants
                .iter_mut()
                .find(|p| p.participant_id == participant_id)
            {
                participant.join_state = JoinState::Left;
                participant.left_at = Some(left_at);
                return Ok(());
            }
        }
        Err(StoreError::Permanent("unknown participant".to_string()))
    }
}
