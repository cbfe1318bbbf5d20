//! Answer grading. Pure and deterministic; the room actor calls this and
//! persists the verdict, nothing here touches I/O.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{AnswerKey, AnswerPayload, Question};

const STRIPPED_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '"', '\''];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
    /// Payload shape does not match the question type. Not persisted.
    Malformed,
}

impl Verdict {
    pub fn is_correct(self) -> bool {
        matches!(self, Verdict::Correct)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Correct => "correct",
            Verdict::Incorrect => "incorrect",
            Verdict::Malformed => "malformed",
        }
    }
}

/// Normalisation applied to both sides of an `open` comparison: strip the
/// fixed punctuation set, Unicode-lowercase, collapse whitespace runs to a
/// single space, trim.
pub fn normalize_open(text: &str) -> String {
    let lowered: String = text
        .chars()
        .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
        .flat_map(char::to_lowercase)
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn grade(question: &Question, payload: &AnswerPayload) -> Verdict {
    match (&question.answer_key, payload) {
        (AnswerKey::Open(key), AnswerPayload::Text { text }) => {
            if normalize_open(text) == normalize_open(key) {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            }
        }
        (AnswerKey::Single(key), AnswerPayload::Single { option_id }) => {
            // Unknown option ids are a wrong answer, not a protocol error.
            if option_id == key {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            }
        }
        (AnswerKey::Multi(key), AnswerPayload::Multi { option_ids }) => {
            let submitted: BTreeSet<&str> = option_ids.iter().map(String::as_str).collect();
            if submitted.is_empty() {
                return Verdict::Incorrect;
            }
            let expected: BTreeSet<&str> = key.iter().map(String::as_str).collect();
            if submitted == expected {
                Verdict::Correct
            } else {
                Verdict::Incorrect
            }
        }
        _ => Verdict::Malformed,
    }
}
