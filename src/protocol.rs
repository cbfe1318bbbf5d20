//! Wire protocol for `/ws/sessions/{roomCode}`. Text JSON frames both ways:
//! inbound `{event, payload, requestId?}`, outbound `{event, payload,
//! requestId?, ts}` with RFC 3339 millisecond timestamps.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AnswerPayload, GameMode, JoinState, Question, QuestionKind,
};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Death,
    LevelUp,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum JoinRequest {
    Student { nickname: String },
    Teacher { csrf: String },
}

/// Client -> server events. Adjacently tagged so the `event` discriminant and
/// the `payload` body land in separate envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom(JoinRequest),
    #[serde(rename_all = "camelCase")]
    AnswerSubmit {
        question_id: String,
        answer: AnswerPayload,
    },
    RequestQuestion {
        reason: TriggerReason,
    },
    RequestStats {},
    StartQuiz {},
    EndQuiz {},
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrame {
    #[serde(flatten)]
    pub event: ClientEvent,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

pub fn parse_client_frame(text: &str) -> Result<ClientFrame, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionPublic {
    pub id: String,
    pub text: String,
}

/// Client-visible projection of a question: no answer key, no correctness
/// fields, options in stored order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPublic {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<OptionPublic>,
}

impl QuestionPublic {
    pub fn from_question(question: &Question) -> Self {
        Self {
            id: question.external_id.clone(),
            kind: question.kind,
            prompt: question.prompt.clone(),
            options: question
                .options
                .iter()
                .map(|opt| OptionPublic {
                    id: opt.external_id.clone(),
                    text: opt.text.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub nickname: String,
    pub state: JoinState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub correct_pct: f64,
    pub wrong_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStats {
    pub nickname: String,
    pub correct: u32,
    pub wrong: u32,
    pub correct_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Retry,
    Continue,
}

/// Server -> client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    WaitingRoomUpdate {
        session_id: i64,
        participants: Vec<ParticipantView>,
    },
    #[serde(rename_all = "camelCase")]
    StartQuiz {
        session_id: i64,
        game_mode: GameMode,
        started_at: String,
    },
    QuestionPush {
        question: QuestionPublic,
        reason: TriggerReason,
    },
    #[serde(rename_all = "camelCase")]
    AnswerResult {
        question_id: String,
        correct: bool,
        next_action: NextAction,
    },
    StatsUpdate {
        class: ClassStats,
        students: Vec<StudentStats>,
    },
    #[serde(rename_all = "camelCase")]
    EndQuiz {
        session_id: i64,
        ended_at: String,
        results_ready: bool,
    },
    NoMoreQuestions {},
    #[serde(rename_all = "camelCase")]
    QuestionExpired {
        question_id: String,
    },
    BadRequest {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::WaitingRoomUpdate { .. } => "waiting_room_update",
            ServerEvent::StartQuiz { .. } => "start_quiz",
            ServerEvent::QuestionPush { .. } => "question_push",
            ServerEvent::AnswerResult { .. } => "answer_result",
            ServerEvent::StatsUpdate { .. } => "stats_update",
            ServerEvent::EndQuiz { .. } => "end_quiz",
            ServerEvent::NoMoreQuestions {} => "no_more_questions",
            ServerEvent::QuestionExpired { .. } => "question_expired",
            ServerEvent::BadRequest { .. } => "bad_request",
            ServerEvent::InternalError { .. } => "internal_error",
        }
    }

    /// Critical frames carry causal meaning to one client and are never
    /// coalesced or dropped under backpressure.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerEvent::QuestionPush { .. }
                | ServerEvent::AnswerResult { .. }
                | ServerEvent::StartQuiz { .. }
                | ServerEvent::EndQuiz { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
    pub ts: String,
}

impl ServerFrame {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            event,
            request_id: None,
            ts: now_rfc3339_millis(),
        }
    }

    pub fn with_request_id(event: ServerEvent, request_id: Option<String>) -> Self {
        Self {
            event,
            request_id,
            ts: now_rfc3339_millis(),
        }
    }

    pub fn to_json(&self) -> String {
        // All payload types serialize infallibly.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

pub fn now_rfc3339_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Close reasons surfaced in the WS close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    SupersededByNewer,
    Timeout,
    BackpressureFatal,
    RoomClosed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::SupersededByNewer => "superseded_by_newer",
            CloseReason::Timeout => "timeout",
            CloseReason::BackpressureFatal => "backpressure_fatal",
            CloseReason::RoomClosed => "room_closed",
        }
    }
}
