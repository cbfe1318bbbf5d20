//! End-to-end scenarios driven through the room registry, actor, and the
//! in-memory store. Connections are simulated at the mailbox/queue boundary,
//! exactly where the WS adapter sits.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use horoquiz_live::config::RoomConfig;
use horoquiz_live::model::{
    AnswerKey, AnswerPayload, GameMode, JoinState, Question, QuestionKind, QuestionOption,
    SessionMeta, SessionSnapshot, SessionStatus,
};
use horoquiz_live::protocol::{
    ClientEvent, ClientFrame, CloseReason, JoinRequest, NextAction, ServerEvent, ServerFrame,
    TriggerReason,
};
use horoquiz_live::room::outbound::{self, DrainItem, OutboundReceiver};
use horoquiz_live::room::{ConnId, Registry, RoomCommand, RoomHandle};
use horoquiz_live::store::memory::InMemoryStore;
use horoquiz_live::store::StoreError;

const ROOM: &str = "ABCDEF";
const CSRF: &str = "teacher-csrf-token";

fn single_question(id: &str, position: u32, correct: &str, options: &[&str]) -> Question {
    Question {
        external_id: id.to_string(),
        position,
        kind: QuestionKind::Single,
        prompt: format!("prompt {id}"),
        options: options
            .iter()
            .map(|opt| QuestionOption {
                external_id: opt.to_string(),
                text: format!("option {opt}"),
            })
            .collect(),
        answer_key: AnswerKey::Single(correct.to_string()),
    }
}

fn multi_question(id: &str, position: u32, correct: &[&str], options: &[&str]) -> Question {
    Question {
        external_id: id.to_string(),
        position,
        kind: QuestionKind::Multi,
        prompt: format!("prompt {id}"),
        options: options
            .iter()
            .map(|opt| QuestionOption {
                external_id: opt.to_string(),
                text: format!("option {opt}"),
            })
            .collect(),
        answer_key: AnswerKey::Multi(correct.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()),
    }
}

fn snapshot(questions: Vec<Question>, status: SessionStatus) -> SessionSnapshot {
    SessionSnapshot {
        session: SessionMeta {
            session_id: 1,
            room_code: ROOM.to_string(),
            join_token: "join-token".to_string(),
            teacher_csrf: CSRF.to_string(),
            quiz_id: 11,
            teacher_id: 7,
            game_mode: GameMode::Classic,
            status,
            started_at: if status == SessionStatus::Active {
                Some(Utc::now())
            } else {
                None
            },
            ended_at: None,
        },
        questions,
        participants: Vec::new(),
        question_states: Vec::new(),
        aggregates: Vec::new(),
    }
}

struct Fixture {
    store: InMemoryStore,
    handle: RoomHandle,
}

async fn fixture(questions: Vec<Question>, status: SessionStatus, config: RoomConfig) -> Fixture {
    let store = InMemoryStore::new();
    store.seed_session(snapshot(questions, status));
    let registry = Registry::new(Arc::new(store.clone()), config);
    let handle = registry.acquire(ROOM).await.expect("room should materialise");
    Fixture { store, handle }
}

fn fast_config() -> RoomConfig {
    RoomConfig {
        stats_window: Duration::from_millis(200),
        waiting_room_window: Duration::from_millis(50),
        student_grace: Duration::from_millis(200),
        teacher_grace: Duration::from_millis(200),
        drain_timeout: Duration::from_millis(200),
        store_retry_backoff: [
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(5),
        ],
        ..RoomConfig::default()
    }
}

struct TestConn {
    conn_id: ConnId,
    handle: RoomHandle,
    rx: OutboundReceiver,
}

impl TestConn {
    async fn open(handle: &RoomHandle) -> Self {
        let (tx, rx) = outbound::channel(64);
        let conn_id: ConnId = Uuid::new_v4();
        assert!(
            handle
                .send(RoomCommand::Connect {
                    conn_id,
                    queue: tx
                })
                .await
        );
        Self {
            conn_id,
            handle: handle.clone(),
            rx,
        }
    }

    async fn send(&self, event: ClientEvent) {
        assert!(
            self.handle
                .send(RoomCommand::Inbound {
                    conn_id: self.conn_id,
                    frame: ClientFrame {
                        event,
                        request_id: None,
                    },
                })
                .await
        );
    }

    async fn disconnect(&self) {
        let _ = self
            .handle
            .send(RoomCommand::ConnectionClosed {
                conn_id: self.conn_id,
            })
            .await;
    }

    async fn next_frame(&mut self) -> ServerFrame {
        match tokio::time::timeout(Duration::from_secs(2), self.rx.next()).await {
            Ok(DrainItem::Frame(frame)) => frame,
            Ok(DrainItem::Closed(reason)) => panic!("connection closed: {reason:?}"),
            Err(_) => panic!("timed out waiting for frame"),
        }
    }

    /// Skips frames until one with the given event name arrives.
    async fn next_named(&mut self, name: &str) -> ServerEvent {
        for _ in 0..16 {
            let frame = self.next_frame().await;
            if frame.event.event_name() == name {
                return frame.event;
            }
        }
        panic!("no {name} frame within 16 frames");
    }

    async fn expect_closed(&mut self, expected: Option<CloseReason>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), self.rx.next()).await {
                Ok(DrainItem::Frame(_)) => continue,
                Ok(DrainItem::Closed(reason)) => {
                    assert_eq!(reason, expected);
                    return;
                }
                Err(_) => panic!("timed out waiting for close"),
            }
        }
    }

    /// Drains whatever is immediately available.
    async fn drain_frames(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(50), self.rx.next()).await {
                Ok(DrainItem::Frame(frame)) => frames.push(frame),
                _ => break,
            }
        }
        frames
    }
}

async fn join_teacher(handle: &RoomHandle) -> TestConn {
    let mut conn = TestConn::open(handle).await;
    conn.send(ClientEvent::JoinRoom(JoinRequest::Teacher {
        csrf: CSRF.to_string(),
    }))
    .await;
    conn.next_named("waiting_room_update").await;
    conn
}

async fn join_student(handle: &RoomHandle, nickname: &str) -> TestConn {
    let mut conn = TestConn::open(handle).await;
    conn.send(ClientEvent::JoinRoom(JoinRequest::Student {
        nickname: nickname.to_string(),
    }))
    .await;
    conn.next_named("waiting_room_update").await;
    conn
}

fn submit(question_id: &str, answer: AnswerPayload) -> ClientEvent {
    ClientEvent::AnswerSubmit {
        question_id: question_id.to_string(),
        answer,
    }
}

fn option_answer(option_id: &str) -> AnswerPayload {
    AnswerPayload::Single {
        option_id: option_id.to_string(),
    }
}

fn options_answer(ids: &[&str]) -> AnswerPayload {
    AnswerPayload::Multi {
        option_ids: ids.iter().map(|s| s.to_string()).collect(),
    }
}

async fn expect_answer_result(
    conn: &mut TestConn,
    question_id: &str,
    correct: bool,
    next_action: NextAction,
) {
    match conn.next_named("answer_result").await {
        ServerEvent::AnswerResult {
            question_id: got_id,
            correct: got_correct,
            next_action: got_next,
        } => {
            assert_eq!(got_id, question_id);
            assert_eq!(got_correct, correct);
            assert_eq!(got_next, next_action);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

async fn expect_question_push(conn: &mut TestConn, question_id: &str) {
    match conn.next_named("question_push").await {
        ServerEvent::QuestionPush { question, .. } => {
            assert_eq!(question.id, question_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

// --- classical flow ----------------------------------------------------------

#[tokio::test]
async fn classical_flow_grades_answers_and_aggregates() {
    let quiz = vec![
        single_question("q1", 1, "o1", &["o1", "o2"]),
        single_question("q2", 2, "o2", &["o1", "o2"]),
    ];
    let fixture = fixture(quiz, SessionStatus::Waiting, fast_config()).await;
    let mut teacher = join_teacher(&fixture.handle).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    teacher.send(ClientEvent::StartQuiz {}).await;
    teacher.next_named("start_quiz").await;
    alice.next_named("start_quiz").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    alice.send(submit("q1", option_answer("o1"))).await;
    expect_answer_result(&mut alice, "q1", true, NextAction::Continue).await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::LevelUp,
        })
        .await;
    expect_question_push(&mut alice, "q2").await;

    alice.send(submit("q2", option_answer("o99"))).await;
    expect_answer_result(&mut alice, "q2", false, NextAction::Retry).await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Retry,
        })
        .await;
    expect_question_push(&mut alice, "q2").await;

    alice.send(submit("q2", option_answer("o2"))).await;
    expect_answer_result(&mut alice, "q2", true, NextAction::Continue).await;

    // Let the coalesced broadcasts settle, then ask for a fresh snapshot so
    // the next stats_update is the final one.
    tokio::time::sleep(Duration::from_millis(300)).await;
    teacher.drain_frames().await;
    teacher.send(ClientEvent::RequestStats {}).await;
    match teacher.next_named("stats_update").await {
        ServerEvent::StatsUpdate { class, students } => {
            assert_eq!(students.len(), 1);
            let alice_stats = &students[0];
            assert_eq!(alice_stats.nickname, "alice");
            assert_eq!(alice_stats.correct, 2);
            assert_eq!(alice_stats.wrong, 1);
            assert_eq!(alice_stats.correct_pct, 66.67);
            // Class row is the sum of per-participant tallies.
            assert_eq!(class.correct_pct, 66.67);
            assert_eq!(class.wrong_pct, 33.33);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Three attempts persisted, contiguous per question.
    let records = fixture.store.answer_records();
    assert_eq!(records.len(), 3);
    let q2_attempts: Vec<u32> = records
        .iter()
        .filter(|r| r.question_id == "q2")
        .map(|r| r.attempt_no)
        .collect();
    assert_eq!(q2_attempts, vec![1, 2]);

    let aggregates = fixture.store.aggregates(ROOM);
    let class_row = aggregates
        .iter()
        .find(|a| a.participant_id.is_none())
        .expect("class aggregate persisted");
    assert_eq!((class_row.correct, class_row.wrong), (2, 1));
}

// --- multi-choice grading ----------------------------------------------------

#[tokio::test]
async fn multi_answers_are_graded_as_sets() {
    let quiz = vec![multi_question("q1", 1, &["o2", "o4"], &["o1", "o2", "o3", "o4"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;

    // carol answers in reverse key order, correct on the first try
    let mut carol = join_student(&fixture.handle, "carol").await;
    carol
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut carol, "q1").await;
    carol.send(submit("q1", options_answer(&["o4", "o2"]))).await;
    expect_answer_result(&mut carol, "q1", true, NextAction::Continue).await;

    // bob under-selects first, then submits with duplicates
    let mut bob = join_student(&fixture.handle, "bob").await;
    bob.send(ClientEvent::RequestQuestion {
        reason: TriggerReason::Death,
    })
    .await;
    expect_question_push(&mut bob, "q1").await;
    bob.send(submit("q1", options_answer(&["o2"]))).await;
    expect_answer_result(&mut bob, "q1", false, NextAction::Retry).await;

    bob.send(ClientEvent::RequestQuestion {
        reason: TriggerReason::Retry,
    })
    .await;
    expect_question_push(&mut bob, "q1").await;
    bob.send(submit("q1", options_answer(&["o2", "o4", "o2"]))).await;
    expect_answer_result(&mut bob, "q1", true, NextAction::Continue).await;
}

// --- reconnection ------------------------------------------------------------

#[tokio::test]
async fn reconnect_within_grace_keeps_participant() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;

    let bob = join_student(&fixture.handle, "bob").await;
    bob.disconnect().await;

    // Reconnect well inside the grace window.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _bob2 = join_student(&fixture.handle, "bob").await;

    let participants = fixture.store.participants(ROOM);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].join_state, JoinState::Waiting);
    assert!(participants[0].left_at.is_none(), "no left mark persisted");
}

#[tokio::test]
async fn reconnect_after_grace_rebinds_same_participant() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut teacher = join_teacher(&fixture.handle).await;

    let bob = join_student(&fixture.handle, "bob").await;
    bob.disconnect().await;

    // Let the 200 ms grace expire; the left mark is persisted.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let participants = fixture.store.participants(ROOM);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].join_state, JoinState::Left);
    assert!(participants[0].left_at.is_some());
    let original_id = participants[0].participant_id;

    // Nickname uniqueness holds regardless of join state: rejoining as bob
    // re-binds the same participant and flips it back to playing.
    let _bob2 = join_student(&fixture.handle, "bob").await;
    assert_eq!(fixture.store.participants(ROOM).len(), 1);
    assert_eq!(
        fixture.store.participants(ROOM)[0].participant_id,
        original_id
    );

    // The teacher's latest roster shows bob playing again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let last_roster = teacher
        .drain_frames()
        .await
        .into_iter()
        .filter_map(|frame| match frame.event {
            ServerEvent::WaitingRoomUpdate { participants, .. } => Some(participants),
            _ => None,
        })
        .last()
        .expect("roster update after rejoin");
    assert_eq!(last_roster.len(), 1);
    assert_eq!(last_roster[0].state, JoinState::Playing);
}

#[tokio::test]
async fn nickname_in_use_while_socket_live() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;

    let _bob = join_student(&fixture.handle, "bob").await;

    let mut imposter = TestConn::open(&fixture.handle).await;
    imposter
        .send(ClientEvent::JoinRoom(JoinRequest::Student {
            nickname: "bob".to_string(),
        }))
        .await;
    match imposter.next_named("bad_request").await {
        ServerEvent::BadRequest { message } => assert_eq!(message, "nickname_in_use"),
        other => panic!("unexpected event: {other:?}"),
    }
}

// --- teacher supersession ----------------------------------------------------

#[tokio::test]
async fn second_teacher_supersedes_first() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Waiting, fast_config()).await;

    let mut first = join_teacher(&fixture.handle).await;
    let _second = join_teacher(&fixture.handle).await;

    first.expect_closed(Some(CloseReason::SupersededByNewer)).await;
}

#[tokio::test]
async fn teacher_join_with_bad_csrf_rejected() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Waiting, fast_config()).await;

    let mut conn = TestConn::open(&fixture.handle).await;
    conn.send(ClientEvent::JoinRoom(JoinRequest::Teacher {
        csrf: "wrong".to_string(),
    }))
    .await;
    match conn.next_named("bad_request").await {
        ServerEvent::BadRequest { message } => assert_eq!(message, "unauthorized"),
        other => panic!("unexpected event: {other:?}"),
    }
    conn.expect_closed(None).await;
}

// --- stats coalescing --------------------------------------------------------

#[tokio::test]
async fn stats_updates_are_coalesced() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1", "o2"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut teacher = join_teacher(&fixture.handle).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    // Settle the join-time waiting_room traffic before counting.
    tokio::time::sleep(Duration::from_millis(150)).await;
    teacher.drain_frames().await;

    // Ten answers in quick succession, all wrong so the question re-serves.
    for _ in 0..10 {
        alice
            .send(ClientEvent::RequestQuestion {
                reason: TriggerReason::Retry,
            })
            .await;
        expect_question_push(&mut alice, "q1").await;
        alice.send(submit("q1", option_answer("o2"))).await;
        expect_answer_result(&mut alice, "q1", false, NextAction::Retry).await;
    }

    // One immediate dispatch, then exactly one more after the 200 ms window.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats_frames = teacher
        .drain_frames()
        .await
        .into_iter()
        .filter(|frame| frame.event.event_name() == "stats_update")
        .count();
    assert_eq!(stats_frames, 2);
}

// --- question exhaustion -----------------------------------------------------

#[tokio::test]
async fn no_more_questions_after_all_correct() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;
    alice.send(submit("q1", option_answer("o1"))).await;
    expect_answer_result(&mut alice, "q1", true, NextAction::Continue).await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::LevelUp,
        })
        .await;
    alice.next_named("no_more_questions").await;

    // No reservation was created, so a submission has nothing to match.
    alice.send(submit("q1", option_answer("o1"))).await;
    match alice.next_named("bad_request").await {
        ServerEvent::BadRequest { message } => {
            assert_eq!(message, "no matching question pending")
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

// --- finished session rejects late writes ------------------------------------

#[tokio::test]
async fn finished_session_rejects_answer_submit() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1", "o2"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut teacher = join_teacher(&fixture.handle).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    teacher.send(ClientEvent::EndQuiz {}).await;
    teacher.next_named("end_quiz").await;
    alice.next_named("end_quiz").await;

    // The socket is still open inside the drain window; a late submission is
    // answered and nothing is persisted.
    alice.send(submit("q1", option_answer("o1"))).await;
    match alice.next_named("bad_request").await {
        ServerEvent::BadRequest { message } => assert_eq!(message, "room_closed"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(fixture.store.answer_records().is_empty());
    assert_eq!(
        fixture.store.session_status(ROOM),
        Some(SessionStatus::Finished)
    );

    // After the drain window the adapter queues close normally.
    alice.expect_closed(None).await;
    teacher.expect_closed(None).await;
}

// --- reservation / pending-question discipline -------------------------------

#[tokio::test]
async fn request_question_with_pending_reservation_is_rejected() {
    let quiz = vec![
        single_question("q1", 1, "o1", &["o1"]),
        single_question("q2", 2, "o2", &["o2"]),
    ];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    // Property: no second question_push before the answer_result.
    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    match alice.next_named("bad_request").await {
        ServerEvent::BadRequest { message } => {
            assert_eq!(message, "question already pending")
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_answer_shape_keeps_reservation() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    // Wrong payload shape for a single-choice question.
    alice
        .send(submit(
            "q1",
            AnswerPayload::Text {
                text: "o1".to_string(),
            },
        ))
        .await;
    alice.next_named("bad_request").await;
    assert!(fixture.store.answer_records().is_empty());

    // The reservation survived, so a well-formed resubmission lands.
    alice.send(submit("q1", option_answer("o1"))).await;
    expect_answer_result(&mut alice, "q1", true, NextAction::Continue).await;
}

// --- store failure semantics -------------------------------------------------

#[tokio::test]
async fn transient_store_failure_surfaces_internal_error_and_keeps_state() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    // Four transient failures exhaust the initial attempt plus 3 retries.
    for _ in 0..4 {
        fixture
            .store
            .inject_failure(StoreError::Transient("db hiccup".to_string()));
    }
    alice.send(submit("q1", option_answer("o1"))).await;
    alice.next_named("internal_error").await;
    assert!(fixture.store.answer_records().is_empty());

    // In-memory state was left untouched; the same submission now succeeds
    // with attempt_no 1.
    alice.send(submit("q1", option_answer("o1"))).await;
    expect_answer_result(&mut alice, "q1", true, NextAction::Continue).await;
    let records = fixture.store.answer_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt_no, 1);
}

#[tokio::test]
async fn permanent_store_failure_finishes_session() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let fixture = fixture(quiz, SessionStatus::Active, fast_config()).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    fixture
        .store
        .inject_failure(StoreError::Permanent("schema mismatch".to_string()));
    alice.send(submit("q1", option_answer("o1"))).await;

    alice.next_named("internal_error").await;
    alice.next_named("end_quiz").await;
    assert_eq!(
        fixture.store.session_status(ROOM),
        Some(SessionStatus::Finished)
    );
}

// --- registry ----------------------------------------------------------------

#[tokio::test]
async fn registry_rejects_unknown_and_finished_rooms() {
    let store = InMemoryStore::new();
    store.seed_session(snapshot(
        vec![single_question("q1", 1, "o1", &["o1"])],
        SessionStatus::Finished,
    ));
    let registry = Registry::new(Arc::new(store), RoomConfig::default());

    assert!(matches!(
        registry.acquire("ZZZZZZ").await,
        Err(horoquiz_live::room::AcquireError::RoomNotFound)
    ));
    assert!(matches!(
        registry.acquire(ROOM).await,
        Err(horoquiz_live::room::AcquireError::RoomClosed)
    ));
}

#[tokio::test]
async fn registry_returns_same_room_for_same_code() {
    let store = InMemoryStore::new();
    store.seed_session(snapshot(
        vec![single_question("q1", 1, "o1", &["o1"])],
        SessionStatus::Waiting,
    ));
    let registry = Registry::new(Arc::new(store), RoomConfig::default());

    let first = registry.acquire(ROOM).await.expect("first acquire");
    let second = registry.acquire(ROOM).await.expect("second acquire");
    assert_eq!(registry.room_count(), 1);

    // Both handles feed the same mailbox.
    let conn_a = TestConn::open(&first).await;
    let conn_b = TestConn::open(&second).await;
    drop(conn_a);
    drop(conn_b);
}

// --- question expiry ----------------------------------------------------------

#[tokio::test]
async fn reservation_expires_and_notifies_student() {
    let quiz = vec![single_question("q1", 1, "o1", &["o1"])];
    let config = RoomConfig {
        reservation_ttl: Duration::from_millis(100),
        ..fast_config()
    };
    let fixture = fixture(quiz, SessionStatus::Active, config).await;
    let mut alice = join_student(&fixture.handle, "alice").await;

    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Death,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;

    match alice.next_named("question_expired").await {
        ServerEvent::QuestionExpired { question_id } => assert_eq!(question_id, "q1"),
        other => panic!("unexpected event: {other:?}"),
    }

    // The reservation is gone; a fresh request re-serves the same question.
    alice
        .send(ClientEvent::RequestQuestion {
            reason: TriggerReason::Retry,
        })
        .await;
    expect_question_push(&mut alice, "q1").await;
}
