use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const NICKNAME_MIN_CHARS: usize = 2;
pub const NICKNAME_MAX_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Open,
    Single,
    Multi,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionKind::Open => "open",
            QuestionKind::Single => "single",
            QuestionKind::Multi => "multi",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(QuestionKind::Open),
            "single" => Some(QuestionKind::Single),
            "multi" => Some(QuestionKind::Multi),
            _ => None,
        }
    }
}

/// Canonical correct answer for a question. Never serialized to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerKey {
    /// Normalised text (see `grader::normalize_open`).
    Open(String),
    /// Option external id.
    Single(String),
    /// Non-empty set of option external ids.
    Multi(BTreeSet<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOption {
    pub external_id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub external_id: String,
    pub position: u32,
    pub kind: QuestionKind,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
    pub answer_key: AnswerKey,
}

/// Submitted answer, one of three disjoint shapes keyed by the question type.
/// Validated at the parse boundary; the grader only sees well-formed variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerPayload {
    Text {
        text: String,
    },
    Single {
        #[serde(rename = "optionId")]
        option_id: String,
    },
    Multi {
        #[serde(rename = "optionIds")]
        option_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Platformer,
    Shooter,
    /// Accepted but not wired to any client gate; behaves like the others.
    Tycoon,
    Classic,
}

impl GameMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Platformer => "platformer",
            GameMode::Shooter => "shooter",
            GameMode::Tycoon => "tycoon",
            GameMode::Classic => "classic",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "platformer" => Some(GameMode::Platformer),
            "shooter" => Some(GameMode::Shooter),
            "tycoon" => Some(GameMode::Tycoon),
            "classic" => Some(GameMode::Classic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Finished,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::Finished => "finished",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(SessionStatus::Waiting),
            "active" => Some(SessionStatus::Active),
            "finished" => Some(SessionStatus::Finished),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub session_id: i64,
    pub room_code: String,
    pub join_token: String,
    pub teacher_csrf: String,
    pub quiz_id: i64,
    pub teacher_id: i64,
    pub game_mode: GameMode,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Waiting,
    Playing,
    Left,
}

impl JoinState {
    pub fn as_str(self) -> &'static str {
        match self {
            JoinState::Waiting => "waiting",
            JoinState::Playing => "playing",
            JoinState::Left => "left",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JoinState::Waiting),
            "playing" => Some(JoinState::Playing),
            "left" => Some(JoinState::Left),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub participant_id: i64,
    pub nickname: String,
    pub join_state: JoinState,
    pub connected_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Per (participant, question) progress. `is_correct` only ever flips
/// false -> true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionState {
    pub attempts: u32,
    pub is_correct: bool,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersistedQuestionState {
    pub participant_id: i64,
    pub question_id: String,
    pub state: QuestionState,
}

#[derive(Debug, Clone)]
pub struct PersistedAggregate {
    /// `None` is the class-wide row.
    pub participant_id: Option<i64>,
    pub correct: u32,
    pub wrong: u32,
}

/// Everything the registry needs to materialise a live room.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: SessionMeta,
    pub questions: Vec<Question>,
    pub participants: Vec<Participant>,
    pub question_states: Vec<PersistedQuestionState>,
    pub aggregates: Vec<PersistedAggregate>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NicknameError {
    #[error("nickname must be at least {NICKNAME_MIN_CHARS} characters")]
    TooShort,
    #[error("nickname must be at most {NICKNAME_MAX_CHARS} characters")]
    TooLong,
    #[error("nickname contains control characters")]
    ControlChars,
}

pub fn validate_nickname(raw: &str) -> Result<&str, NicknameError> {
    let nickname = raw.trim();
    let chars = nickname.chars().count();
    if chars < NICKNAME_MIN_CHARS {
        return Err(NicknameError::TooShort);
    }
    if chars > NICKNAME_MAX_CHARS {
        return Err(NicknameError::TooLong);
    }
    if nickname.chars().any(char::is_control) {
        return Err(NicknameError::ControlChars);
    }
    Ok(nickname)
}
