//! Per-room single-writer state machine. The actor owns all mutable room
//! state and drains one mailbox; the WS adapter and timers are the only
//! producers. It never awaits a socket read, so a slow client cannot stall
//! the room.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::grader::{grade, Verdict};
use crate::model::{
    validate_nickname, AnswerPayload, JoinState, Participant, Question, QuestionState,
    SessionMeta, SessionSnapshot, SessionStatus,
};
use crate::protocol::{
    now_rfc3339_millis, ClassStats, ClientEvent, ClientFrame, CloseReason, JoinRequest,
    NextAction, ParticipantView, QuestionPublic, ServerEvent, ServerFrame, StudentStats,
    TriggerReason,
};
use crate::room::outbound::{OutboundSender, PushOutcome};
use crate::room::stats::{round2, ScoreBoard};
use crate::store::{NewAnswerRecord, SessionStore, StoreError};

use super::registry::RegistryRef;

pub type ConnId = Uuid;

#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        conn_id: ConnId,
        queue: OutboundSender,
    },
    Inbound {
        conn_id: ConnId,
        frame: ClientFrame,
    },
    ConnectionClosed {
        conn_id: ConnId,
    },
    FlushStats,
    FlushWaitingRoom,
    StudentLeftTimeout {
        participant_id: i64,
        generation: u64,
    },
    TeacherAwayTimeout {
        generation: u64,
    },
    ReservationTimeout {
        participant_id: i64,
        seq: u64,
    },
    /// Fires after the EndQuiz drain window; hard-closes remaining sockets.
    FinishDrainExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnRole {
    Teacher,
    Student(i64),
}

struct ConnEntry {
    queue: OutboundSender,
    role: Option<ConnRole>,
}

struct Reservation {
    question_id: String,
    seq: u64,
}

pub struct RoomActor {
    session: SessionMeta,
    questions: Vec<Question>,
    participants: HashMap<i64, Participant>,
    by_nickname: HashMap<String, i64>,
    question_states: HashMap<i64, HashMap<String, QuestionState>>,
    scoreboard: ScoreBoard,
    reservations: HashMap<i64, Reservation>,
    conns: HashMap<ConnId, ConnEntry>,
    teacher_conn: Option<ConnId>,
    student_conns: HashMap<i64, ConnId>,
    left_generation: HashMap<i64, u64>,
    teacher_away_generation: u64,
    seq_counter: u64,
    stats_window_open: bool,
    stats_dirty: bool,
    waiting_window_open: bool,
    waiting_dirty: bool,
    crashed: bool,
    store: Arc<dyn SessionStore>,
    config: RoomConfig,
    self_tx: mpsc::Sender<RoomCommand>,
    registry: RegistryRef,
    epoch: u64,
}

impl RoomActor {
    pub fn new(
        snapshot: SessionSnapshot,
        store: Arc<dyn SessionStore>,
        config: RoomConfig,
        self_tx: mpsc::Sender<RoomCommand>,
        registry: RegistryRef,
        epoch: u64,
    ) -> Self {
        let mut questions = snapshot.questions;
        questions.sort_by_key(|q| q.position);

        let mut participants = HashMap::new();
        let mut by_nickname = HashMap::new();
        for participant in snapshot.participants {
            by_nickname.insert(participant.nickname.clone(), participant.participant_id);
            participants.insert(participant.participant_id, participant);
        }

        let mut question_states: HashMap<i64, HashMap<String, QuestionState>> = HashMap::new();
        for persisted in snapshot.question_states {
            question_states
                .entry(persisted.participant_id)
                .or_default()
                .insert(persisted.question_id, persisted.state);
        }

        let scoreboard = ScoreBoard::from_persisted(&snapshot.aggregates);

        let mut actor = Self {
            session: snapshot.session,
            questions,
            participants,
            by_nickname,
            question_states,
            scoreboard,
            reservations: HashMap::new(),
            conns: HashMap::new(),
            teacher_conn: None,
            student_conns: HashMap::new(),
            left_generation: HashMap::new(),
            teacher_away_generation: 0,
            seq_counter: 0,
            stats_window_open: false,
            stats_dirty: false,
            waiting_window_open: false,
            waiting_dirty: false,
            crashed: false,
            store,
            config,
            self_tx,
            registry,
            epoch,
        };

        // Participants loaded from storage have no socket yet; give each the
        // usual grace to reconnect before being marked as left.
        let pending: Vec<i64> = actor
            .participants
            .values()
            .filter(|p| p.join_state != JoinState::Left)
            .map(|p| p.participant_id)
            .collect();
        for participant_id in pending {
            let generation = actor.bump_left_generation(participant_id);
            actor.schedule(
                actor.config.student_grace,
                RoomCommand::StudentLeftTimeout {
                    participant_id,
                    generation,
                },
            );
        }

        actor
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
            if self.should_retire() {
                if let Some(registry) = self.registry.upgrade() {
                    registry.retire(&self.session.room_code, self.epoch);
                }
                tracing::info!(
                    room = %self.session.room_code,
                    crashed = self.crashed,
                    "room actor stopped"
                );
                break;
            }
        }

        // Turn away anything that raced into the mailbox after retirement.
        rx.close();
        while let Ok(command) = rx.try_recv() {
            if let RoomCommand::Connect { queue, .. } = command {
                queue.close(Some(CloseReason::RoomClosed));
            }
        }
    }

    fn should_retire(&self) -> bool {
        self.session.status == SessionStatus::Finished && self.conns.is_empty()
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect { conn_id, queue } => self.handle_connect(conn_id, queue),
            RoomCommand::Inbound { conn_id, frame } => self.handle_inbound(conn_id, frame).await,
            RoomCommand::ConnectionClosed { conn_id } => self.handle_connection_closed(conn_id),
            RoomCommand::FlushStats => self.handle_flush_stats(),
            RoomCommand::FlushWaitingRoom => self.handle_flush_waiting_room(),
            RoomCommand::StudentLeftTimeout {
                participant_id,
                generation,
            } => self.handle_student_left_timeout(participant_id, generation).await,
            RoomCommand::TeacherAwayTimeout { generation } => {
                self.handle_teacher_away_timeout(generation)
            }
            RoomCommand::ReservationTimeout {
                participant_id,
                seq,
            } => self.handle_reservation_timeout(participant_id, seq),
            RoomCommand::FinishDrainExpired => {
                if self.session.status == SessionStatus::Finished {
                    self.close_all_conns(None);
                }
            }
        }
    }

    fn handle_connect(&mut self, conn_id: ConnId, queue: OutboundSender) {
        if self.session.status == SessionStatus::Finished {
            queue.push(ServerFrame::new(ServerEvent::BadRequest {
                message: "room_closed".to_string(),
            }));
            queue.close(Some(CloseReason::RoomClosed));
            return;
        }
        self.conns.insert(conn_id, ConnEntry { queue, role: None });
    }

    async fn handle_inbound(&mut self, conn_id: ConnId, frame: ClientFrame) {
        if !self.conns.contains_key(&conn_id) {
            return;
        }
        let request_id = frame.request_id;
        match frame.event {
            ClientEvent::JoinRoom(request) => self.handle_join(conn_id, request, request_id).await,
            ClientEvent::AnswerSubmit {
                question_id,
                answer,
            } => {
                self.handle_answer_submit(conn_id, question_id, answer, request_id)
                    .await
            }
            ClientEvent::RequestQuestion { reason } => {
                self.handle_request_question(conn_id, reason, request_id)
            }
            ClientEvent::RequestStats {} => self.handle_request_stats(conn_id, request_id),
            ClientEvent::StartQuiz {} => self.handle_start_quiz(conn_id, request_id).await,
            ClientEvent::EndQuiz {} => self.handle_end_quiz(conn_id, request_id).await,
        }
    }

    async fn handle_join(
        &mut self,
        conn_id: ConnId,
        request: JoinRequest,
        request_id: Option<String>,
    ) {
        if self.session.status == SessionStatus::Finished {
            self.bad_request(conn_id, "room_closed", request_id);
            return;
        }
        if self.role_of(conn_id).is_some() {
            self.bad_request(conn_id, "already joined", request_id);
            return;
        }

        match request {
            JoinRequest::Teacher { csrf } => {
                if !secure_eq(csrf.as_bytes(), self.session.teacher_csrf.as_bytes()) {
                    tracing::warn!(room = %self.session.room_code, "teacher join with bad csrf");
                    self.bad_request(conn_id, "unauthorized", request_id);
                    if let Some(entry) = self.conns.get(&conn_id) {
                        entry.queue.close(None);
                    }
                    return;
                }

                if let Some(previous) = self.teacher_conn.take() {
                    if previous != conn_id {
                        if let Some(entry) = self.conns.get(&previous) {
                            entry.queue.close(Some(CloseReason::SupersededByNewer));
                        }
                        tracing::info!(
                            room = %self.session.room_code,
                            "teacher connection superseded by newer"
                        );
                    }
                }
                self.teacher_conn = Some(conn_id);
                self.teacher_away_generation += 1;
                if let Some(entry) = self.conns.get_mut(&conn_id) {
                    entry.role = Some(ConnRole::Teacher);
                }

                let ack = self.waiting_room_event();
                self.send_to(conn_id, ServerFrame::with_request_id(ack, request_id));
                if self.session.status == SessionStatus::Active {
                    let resume = self.start_quiz_event();
                    self.send_to(conn_id, ServerFrame::new(resume));
                }
                tracing::info!(room = %self.session.room_code, conn = %conn_id, "teacher joined");
            }
            JoinRequest::Student { nickname } => {
                let nickname = match validate_nickname(&nickname) {
                    Ok(valid) => valid.to_string(),
                    Err(err) => {
                        self.bad_request(conn_id, &err.to_string(), request_id);
                        return;
                    }
                };

                if let Some(&participant_id) = self.by_nickname.get(&nickname) {
                    self.rebind_student(conn_id, participant_id, request_id);
                    return;
                }

                let now = Utc::now();
                let store = Arc::clone(&self.store);
                let session_id = self.session.session_id;
                let created = with_retry(&self.config.store_retry_backoff, || {
                    store.create_participant(session_id, &nickname, now)
                })
                .await;

                match created {
                    Ok(participant_id) => {
                        let join_state = if self.session.status == SessionStatus::Active {
                            JoinState::Playing
                        } else {
                            JoinState::Waiting
                        };
                        self.participants.insert(
                            participant_id,
                            Participant {
                                participant_id,
                                nickname: nickname.clone(),
                                join_state,
                                connected_at: now,
                                left_at: None,
                            },
                        );
                        self.by_nickname.insert(nickname.clone(), participant_id);
                        self.student_conns.insert(participant_id, conn_id);
                        if let Some(entry) = self.conns.get_mut(&conn_id) {
                            entry.role = Some(ConnRole::Student(participant_id));
                        }

                        let ack = self.waiting_room_event();
                        self.send_to(conn_id, ServerFrame::with_request_id(ack, request_id));
                        if self.session.status == SessionStatus::Active {
                            let resume = self.start_quiz_event();
                            self.send_to(conn_id, ServerFrame::new(resume));
                        }
                        self.mark_waiting_dirty();
                        tracing::info!(
                            room = %self.session.room_code,
                            participant = participant_id,
                            nickname = %nickname,
                            "student joined"
                        );
                    }
                    Err(StoreError::NicknameTaken) => {
                        self.bad_request(conn_id, "nickname_taken", request_id);
                    }
                    Err(err) if err.is_transient() => {
                        tracing::warn!(
                            room = %self.session.room_code,
                            error = %err,
                            "participant create failed after retries"
                        );
                        self.internal_error(conn_id, request_id);
                    }
                    Err(err) => {
                        tracing::error!(
                            room = %self.session.room_code,
                            error = %err,
                            "permanent store failure creating participant"
                        );
                        self.fail_session(Some((conn_id, request_id))).await;
                    }
                }
            }
        }
    }

    fn rebind_student(
        &mut self,
        conn_id: ConnId,
        participant_id: i64,
        request_id: Option<String>,
    ) {
        let socket_live = self
            .student_conns
            .get(&participant_id)
            .map(|bound| self.conns.contains_key(bound))
            .unwrap_or(false);
        if socket_live {
            self.bad_request(conn_id, "nickname_in_use", request_id);
            return;
        }

        self.bump_left_generation(participant_id);
        let active = self.session.status == SessionStatus::Active;
        if let Some(participant) = self.participants.get_mut(&participant_id) {
            participant.join_state = if active {
                JoinState::Playing
            } else {
                JoinState::Waiting
            };
            participant.left_at = None;
        }
        self.student_conns.insert(participant_id, conn_id);
        if let Some(entry) = self.conns.get_mut(&conn_id) {
            entry.role = Some(ConnRole::Student(participant_id));
        }

        let ack = self.waiting_room_event();
        self.send_to(conn_id, ServerFrame::with_request_id(ack, request_id));
        if active {
            let resume = self.start_quiz_event();
            self.send_to(conn_id, ServerFrame::new(resume));
        }
        self.mark_waiting_dirty();
        tracing::info!(
            room = %self.session.room_code,
            participant = participant_id,
            "student rebound to existing participant"
        );
    }

    async fn handle_start_quiz(&mut self, conn_id: ConnId, request_id: Option<String>) {
        if self.role_of(conn_id) != Some(ConnRole::Teacher) {
            self.bad_request(conn_id, "teacher only", request_id);
            return;
        }
        match self.session.status {
            SessionStatus::Active => {
                self.bad_request(conn_id, "quiz already started", request_id);
                return;
            }
            SessionStatus::Finished => {
                self.bad_request(conn_id, "room_closed", request_id);
                return;
            }
            SessionStatus::Waiting => {}
        }

        let now = Utc::now();
        let store = Arc::clone(&self.store);
        let session_id = self.session.session_id;
        let persisted = with_retry(&self.config.store_retry_backoff, || {
            store.set_session_status(session_id, SessionStatus::Active, Some(now), None)
        })
        .await;

        match persisted {
            Ok(()) => {
                self.session.status = SessionStatus::Active;
                self.session.started_at = Some(now);
                for participant in self.participants.values_mut() {
                    if participant.join_state == JoinState::Waiting {
                        participant.join_state = JoinState::Playing;
                    }
                }
                let event = self.start_quiz_event();
                self.broadcast_all(event);
                self.mark_waiting_dirty();
                tracing::info!(room = %self.session.room_code, "quiz started");
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(room = %self.session.room_code, error = %err, "start persist failed");
                self.internal_error(conn_id, request_id);
            }
            Err(err) => {
                tracing::error!(room = %self.session.room_code, error = %err, "permanent store failure on start");
                self.fail_session(Some((conn_id, request_id))).await;
            }
        }
    }

    fn handle_request_question(
        &mut self,
        conn_id: ConnId,
        reason: TriggerReason,
        request_id: Option<String>,
    ) {
        let participant_id = match self.role_of(conn_id) {
            Some(ConnRole::Student(id)) => id,
            _ => {
                self.bad_request(conn_id, "student only", request_id);
                return;
            }
        };
        match self.session.status {
            SessionStatus::Waiting => {
                self.bad_request(conn_id, "quiz not started", request_id);
                return;
            }
            SessionStatus::Finished => {
                self.bad_request(conn_id, "room_closed", request_id);
                return;
            }
            SessionStatus::Active => {}
        }
        if self.reservations.contains_key(&participant_id) {
            self.bad_request(conn_id, "question already pending", request_id);
            return;
        }

        let next = self
            .next_question_for(participant_id)
            .map(|question| (QuestionPublic::from_question(question), question.external_id.clone()));

        match next {
            None => {
                self.send_to(
                    conn_id,
                    ServerFrame::with_request_id(ServerEvent::NoMoreQuestions {}, request_id),
                );
            }
            Some((public, question_id)) => {
                self.seq_counter += 1;
                let seq = self.seq_counter;
                self.reservations.insert(
                    participant_id,
                    Reservation {
                        question_id,
                        seq,
                    },
                );
                self.schedule(
                    self.config.reservation_ttl,
                    RoomCommand::ReservationTimeout {
                        participant_id,
                        seq,
                    },
                );
                self.send_to(
                    conn_id,
                    ServerFrame::with_request_id(
                        ServerEvent::QuestionPush {
                            question: public,
                            reason,
                        },
                        request_id,
                    ),
                );
            }
        }
    }

    async fn handle_answer_submit(
        &mut self,
        conn_id: ConnId,
        question_id: String,
        answer: AnswerPayload,
        request_id: Option<String>,
    ) {
        let participant_id = match self.role_of(conn_id) {
            Some(ConnRole::Student(id)) => id,
            _ => {
                self.bad_request(conn_id, "student only", request_id);
                return;
            }
        };
        match self.session.status {
            SessionStatus::Finished => {
                self.bad_request(conn_id, "room_closed", request_id);
                return;
            }
            SessionStatus::Waiting => {
                self.bad_request(conn_id, "quiz not started", request_id);
                return;
            }
            SessionStatus::Active => {}
        }

        let reserved = self
            .reservations
            .get(&participant_id)
            .map(|r| r.question_id.clone());
        match reserved {
            Some(ref reserved_id) if *reserved_id == question_id => {}
            Some(_) | None => {
                self.bad_request(conn_id, "no matching question pending", request_id);
                return;
            }
        }

        let verdict = match self.question_by_id(&question_id) {
            Some(question) => grade(question, &answer),
            None => {
                self.bad_request(conn_id, "unknown question", request_id);
                return;
            }
        };
        if verdict == Verdict::Malformed {
            // Reservation stays open so a well-formed resubmission can land.
            self.bad_request(conn_id, "answer shape does not match question type", request_id);
            return;
        }

        let now = Utc::now();
        let previous = self
            .question_states
            .get(&participant_id)
            .and_then(|states| states.get(&question_id))
            .copied();
        let new_state = QuestionState {
            attempts: previous.map(|s| s.attempts).unwrap_or(0) + 1,
            is_correct: previous.map(|s| s.is_correct).unwrap_or(false) || verdict.is_correct(),
            first_attempt_at: previous.map(|s| s.first_attempt_at).unwrap_or(now),
            last_attempt_at: now,
        };
        let newly_correct =
            verdict.is_correct() && !previous.map(|s| s.is_correct).unwrap_or(false);

        let mut participant_tally = self.scoreboard.participant(participant_id);
        let mut class_tally = self.scoreboard.class();
        if newly_correct {
            participant_tally.correct += 1;
            class_tally.correct += 1;
        } else {
            participant_tally.wrong += 1;
            class_tally.wrong += 1;
        }

        let record = NewAnswerRecord {
            session_id: self.session.session_id,
            participant_id,
            question_id: question_id.clone(),
            attempt_no: new_state.attempts,
            payload: answer,
            verdict,
            answered_at: now,
        };

        let store = Arc::clone(&self.store);
        let backoff = self.config.store_retry_backoff;
        let session_id = self.session.session_id;
        let persisted: Result<(), StoreError> = async {
            with_retry(&backoff, || store.record_answer(&record)).await?;
            with_retry(&backoff, || {
                store.upsert_question_state(session_id, participant_id, &question_id, &new_state)
            })
            .await?;
            with_retry(&backoff, || {
                store.upsert_aggregate(
                    session_id,
                    Some(participant_id),
                    participant_tally.correct,
                    participant_tally.wrong,
                    round2(participant_tally.correct_pct()),
                    now,
                )
            })
            .await?;
            with_retry(&backoff, || {
                store.upsert_aggregate(
                    session_id,
                    None,
                    class_tally.correct,
                    class_tally.wrong,
                    round2(class_tally.correct_pct()),
                    now,
                )
            })
            .await?;
            Ok(())
        }
        .await;

        match persisted {
            Ok(()) => {
                self.question_states
                    .entry(participant_id)
                    .or_default()
                    .insert(question_id.clone(), new_state);
                self.scoreboard.record_answer(participant_id, newly_correct);
                self.reservations.remove(&participant_id);

                let next_action = if verdict.is_correct() {
                    NextAction::Continue
                } else {
                    NextAction::Retry
                };
                self.send_to(
                    conn_id,
                    ServerFrame::with_request_id(
                        ServerEvent::AnswerResult {
                            question_id,
                            correct: verdict.is_correct(),
                            next_action,
                        },
                        request_id,
                    ),
                );
                // answer_result is enqueued before any stats broadcast this
                // answer causes.
                self.mark_stats_dirty();
            }
            Err(err) if err.is_transient() => {
                // In-memory state untouched and the reservation kept, so the
                // client can retry the same submission coherently.
                tracing::warn!(
                    room = %self.session.room_code,
                    participant = participant_id,
                    error = %err,
                    "answer persist failed after retries"
                );
                self.internal_error(conn_id, request_id);
            }
            Err(err) => {
                tracing::error!(
                    room = %self.session.room_code,
                    error = %err,
                    "permanent store failure persisting answer"
                );
                self.fail_session(Some((conn_id, request_id))).await;
            }
        }
    }

    fn handle_request_stats(&mut self, conn_id: ConnId, request_id: Option<String>) {
        if self.role_of(conn_id) != Some(ConnRole::Teacher) {
            self.bad_request(conn_id, "teacher only", request_id);
            return;
        }
        let event = self.stats_event();
        self.send_to(conn_id, ServerFrame::with_request_id(event, request_id));
    }

    async fn handle_end_quiz(&mut self, conn_id: ConnId, request_id: Option<String>) {
        if self.role_of(conn_id) != Some(ConnRole::Teacher) {
            self.bad_request(conn_id, "teacher only", request_id);
            return;
        }
        match self.session.status {
            SessionStatus::Waiting => {
                self.bad_request(conn_id, "quiz not started", request_id);
                return;
            }
            SessionStatus::Finished => {
                self.bad_request(conn_id, "room_closed", request_id);
                return;
            }
            SessionStatus::Active => {}
        }

        let now = Utc::now();
        let store = Arc::clone(&self.store);
        let session_id = self.session.session_id;
        let persisted = with_retry(&self.config.store_retry_backoff, || {
            store.set_session_status(session_id, SessionStatus::Finished, None, Some(now))
        })
        .await;

        match persisted {
            Ok(()) => {
                self.session.status = SessionStatus::Finished;
                self.session.ended_at = Some(now);
                self.reservations.clear();
                let event = self.end_quiz_event();
                self.broadcast_all(event);
                // Sockets stay up for the drain window so in-flight frames
                // (and late submissions, answered with bad_request) flush.
                self.schedule(self.config.drain_timeout, RoomCommand::FinishDrainExpired);
                tracing::info!(room = %self.session.room_code, "quiz ended");
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(room = %self.session.room_code, error = %err, "end persist failed");
                self.internal_error(conn_id, request_id);
            }
            Err(err) => {
                tracing::error!(room = %self.session.room_code, error = %err, "permanent store failure on end");
                self.fail_session(Some((conn_id, request_id))).await;
            }
        }
    }

    fn handle_connection_closed(&mut self, conn_id: ConnId) {
        let Some(entry) = self.conns.remove(&conn_id) else {
            return;
        };
        entry.queue.close(None);

        match entry.role {
            Some(ConnRole::Teacher) if self.teacher_conn == Some(conn_id) => {
                self.teacher_conn = None;
                self.teacher_away_generation += 1;
                if self.session.status == SessionStatus::Active {
                    let generation = self.teacher_away_generation;
                    self.schedule(
                        self.config.teacher_grace,
                        RoomCommand::TeacherAwayTimeout { generation },
                    );
                }
                tracing::info!(room = %self.session.room_code, "teacher disconnected");
            }
            Some(ConnRole::Student(participant_id))
                if self.student_conns.get(&participant_id) == Some(&conn_id) =>
            {
                self.student_conns.remove(&participant_id);
                // A dropped connection abandons its reservation; the student
                // re-requests after reconnecting.
                self.reservations.remove(&participant_id);
                if self.session.status != SessionStatus::Finished {
                    let generation = self.bump_left_generation(participant_id);
                    self.schedule(
                        self.config.student_grace,
                        RoomCommand::StudentLeftTimeout {
                            participant_id,
                            generation,
                        },
                    );
                }
                tracing::debug!(
                    room = %self.session.room_code,
                    participant = participant_id,
                    "student disconnected, grace timer started"
                );
            }
            _ => {}
        }
    }

    async fn handle_student_left_timeout(&mut self, participant_id: i64, generation: u64) {
        if self.left_generation.get(&participant_id) != Some(&generation) {
            return;
        }
        if self.student_conns.contains_key(&participant_id) {
            return;
        }
        if self.session.status == SessionStatus::Finished {
            return;
        }
        let already_left = self
            .participants
            .get(&participant_id)
            .map(|p| p.join_state == JoinState::Left)
            .unwrap_or(true);
        if already_left {
            return;
        }

        let now = Utc::now();
        let store = Arc::clone(&self.store);
        let persisted = with_retry(&self.config.store_retry_backoff, || {
            store.mark_participant_left(participant_id, now)
        })
        .await;

        match persisted {
            Ok(()) => {
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    participant.join_state = JoinState::Left;
                    participant.left_at = Some(now);
                }
                self.mark_waiting_dirty();
                tracing::info!(
                    room = %self.session.room_code,
                    participant = participant_id,
                    "participant marked left after grace"
                );
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    room = %self.session.room_code,
                    participant = participant_id,
                    error = %err,
                    "left-mark persist failed"
                );
            }
            Err(err) => {
                tracing::error!(room = %self.session.room_code, error = %err, "permanent store failure marking left");
                self.fail_session(None).await;
            }
        }
    }

    fn handle_teacher_away_timeout(&mut self, generation: u64) {
        if generation != self.teacher_away_generation
            || self.teacher_conn.is_some()
            || self.session.status != SessionStatus::Active
        {
            return;
        }
        // The session never auto-finishes; it waits for an explicit end.
        tracing::warn!(
            room = %self.session.room_code,
            "teacher absent past reconnect window, session stalled"
        );
    }

    fn handle_reservation_timeout(&mut self, participant_id: i64, seq: u64) {
        let expired = self
            .reservations
            .get(&participant_id)
            .map(|reservation| reservation.seq == seq)
            .unwrap_or(false);
        if !expired {
            return;
        }
        let Some(reservation) = self.reservations.remove(&participant_id) else {
            return;
        };
        tracing::debug!(
            room = %self.session.room_code,
            participant = participant_id,
            question = %reservation.question_id,
            "reservation expired"
        );
        if let Some(&conn_id) = self.student_conns.get(&participant_id) {
            self.send_to(
                conn_id,
                ServerFrame::new(ServerEvent::QuestionExpired {
                    question_id: reservation.question_id,
                }),
            );
        }
    }

    // --- coalesced broadcasts ------------------------------------------------

    fn mark_stats_dirty(&mut self) {
        if self.session.status == SessionStatus::Finished {
            return;
        }
        if self.stats_window_open {
            self.stats_dirty = true;
        } else {
            self.broadcast_stats();
            self.stats_window_open = true;
            self.schedule(self.config.stats_window, RoomCommand::FlushStats);
        }
    }

    fn handle_flush_stats(&mut self) {
        self.stats_window_open = false;
        if self.stats_dirty && self.session.status != SessionStatus::Finished {
            self.stats_dirty = false;
            self.broadcast_stats();
            self.stats_window_open = true;
            self.schedule(self.config.stats_window, RoomCommand::FlushStats);
        }
    }

    fn mark_waiting_dirty(&mut self) {
        if self.session.status == SessionStatus::Finished {
            return;
        }
        if self.waiting_window_open {
            self.waiting_dirty = true;
        } else {
            self.broadcast_waiting_room();
            self.waiting_window_open = true;
            self.schedule(self.config.waiting_room_window, RoomCommand::FlushWaitingRoom);
        }
    }

    fn handle_flush_waiting_room(&mut self) {
        self.waiting_window_open = false;
        if self.waiting_dirty && self.session.status != SessionStatus::Finished {
            self.waiting_dirty = false;
            self.broadcast_waiting_room();
            self.waiting_window_open = true;
            self.schedule(self.config.waiting_room_window, RoomCommand::FlushWaitingRoom);
        }
    }

    fn broadcast_stats(&mut self) {
        if let Some(conn_id) = self.teacher_conn {
            let event = self.stats_event();
            self.send_to(conn_id, ServerFrame::new(event));
        }
    }

    fn broadcast_waiting_room(&mut self) {
        if let Some(conn_id) = self.teacher_conn {
            let event = self.waiting_room_event();
            self.send_to(conn_id, ServerFrame::new(event));
        }
    }

    // --- failure handling ----------------------------------------------------

    /// Permanent store failure: notify the originator, force the session to
    /// finished, broadcast end_quiz, and tear the room down.
    async fn fail_session(&mut self, originator: Option<(ConnId, Option<String>)>) {
        if let Some((conn_id, request_id)) = originator {
            self.internal_error(conn_id, request_id);
        }
        if self.session.status == SessionStatus::Finished {
            return;
        }
        self.crashed = true;
        let now = Utc::now();
        self.session.status = SessionStatus::Finished;
        self.session.ended_at = Some(now);
        self.reservations.clear();

        // Best effort; the store is already known to be unhealthy.
        if let Err(err) = self
            .store
            .set_session_status(self.session.session_id, SessionStatus::Finished, None, Some(now))
            .await
        {
            tracing::warn!(
                room = %self.session.room_code,
                error = %err,
                "could not persist crashed-finish status"
            );
        }

        let event = self.end_quiz_event();
        self.broadcast_all(event);
        self.close_all_conns(None);
        tracing::error!(room = %self.session.room_code, "session torn down after permanent store failure");
    }

    // --- helpers -------------------------------------------------------------

    fn role_of(&self, conn_id: ConnId) -> Option<ConnRole> {
        self.conns.get(&conn_id).and_then(|entry| entry.role)
    }

    fn question_by_id(&self, question_id: &str) -> Option<&Question> {
        self.questions
            .iter()
            .find(|question| question.external_id == question_id)
    }

    /// First question in position order the participant has not yet answered
    /// correctly.
    fn next_question_for(&self, participant_id: i64) -> Option<&Question> {
        let states = self.question_states.get(&participant_id);
        self.questions.iter().find(|question| {
            !states
                .and_then(|map| map.get(&question.external_id))
                .map(|state| state.is_correct)
                .unwrap_or(false)
        })
    }

    fn bump_left_generation(&mut self, participant_id: i64) -> u64 {
        let generation = self.left_generation.entry(participant_id).or_insert(0);
        *generation += 1;
        *generation
    }

    fn waiting_room_event(&self) -> ServerEvent {
        let mut participants: Vec<ParticipantView> = self
            .participants
            .values()
            .map(|participant| ParticipantView {
                nickname: participant.nickname.clone(),
                state: participant.join_state,
            })
            .collect();
        participants.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        ServerEvent::WaitingRoomUpdate {
            session_id: self.session.session_id,
            participants,
        }
    }

    fn start_quiz_event(&self) -> ServerEvent {
        ServerEvent::StartQuiz {
            session_id: self.session.session_id,
            game_mode: self.session.game_mode,
            started_at: self
                .session
                .started_at
                .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                .unwrap_or_else(now_rfc3339_millis),
        }
    }

    fn end_quiz_event(&self) -> ServerEvent {
        ServerEvent::EndQuiz {
            session_id: self.session.session_id,
            ended_at: self
                .session
                .ended_at
                .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
                .unwrap_or_else(now_rfc3339_millis),
            results_ready: true,
        }
    }

    fn stats_event(&self) -> ServerEvent {
        let mut students: Vec<StudentStats> = self
            .participants
            .values()
            .map(|participant| {
                let tally = self.scoreboard.participant(participant.participant_id);
                StudentStats {
                    nickname: participant.nickname.clone(),
                    correct: tally.correct,
                    wrong: tally.wrong,
                    correct_pct: round2(tally.correct_pct()),
                }
            })
            .collect();
        students.sort_by(|a, b| a.nickname.cmp(&b.nickname));

        let class = self.scoreboard.class();
        ServerEvent::StatsUpdate {
            class: ClassStats {
                correct_pct: round2(class.correct_pct()),
                wrong_pct: round2(class.wrong_pct()),
            },
            students,
        }
    }

    fn bad_request(&mut self, conn_id: ConnId, message: &str, request_id: Option<String>) {
        self.send_to(
            conn_id,
            ServerFrame::with_request_id(
                ServerEvent::BadRequest {
                    message: message.to_string(),
                },
                request_id,
            ),
        );
    }

    fn internal_error(&mut self, conn_id: ConnId, request_id: Option<String>) {
        self.send_to(
            conn_id,
            ServerFrame::with_request_id(
                ServerEvent::InternalError {
                    message: "internal error".to_string(),
                },
                request_id,
            ),
        );
    }

    fn send_to(&mut self, conn_id: ConnId, frame: ServerFrame) {
        if let Some(entry) = self.conns.get(&conn_id) {
            if entry.queue.push(frame) == PushOutcome::Overflow {
                tracing::warn!(
                    room = %self.session.room_code,
                    conn = %conn_id,
                    "outbound queue overflow, connection closing"
                );
            }
        }
    }

    fn broadcast_all(&mut self, event: ServerEvent) {
        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for conn_id in conn_ids {
            self.send_to(conn_id, ServerFrame::new(event.clone()));
        }
    }

    fn close_all_conns(&mut self, reason: Option<CloseReason>) {
        for entry in self.conns.values() {
            entry.queue.close(reason);
        }
    }

    fn schedule(&self, delay: Duration, command: RoomCommand) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command).await;
        });
    }
}

/// Constant-time comparison for the teacher csrf token.
fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

/// Retries a transient-failing store call up to `backoff.len()` times on the
/// actor's own task; the actor is intentionally blocked while a write is in
/// flight.
async fn with_retry<T, F, Fut>(backoff: &[Duration; 3], mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < backoff.len() => {
                tracing::warn!(error = %err, attempt, "transient store failure, retrying");
                tokio::time::sleep(backoff[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
