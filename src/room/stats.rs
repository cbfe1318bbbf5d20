//! Incremental per-participant and class-wide tallies. `correct` counts
//! questions whose state is correct; `wrong` is total attempts minus that,
//! so a first-time correct answer bumps `correct` and anything else bumps
//! `wrong`.

use std::collections::HashMap;

use crate::model::PersistedAggregate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub correct: u32,
    pub wrong: u32,
}

impl Tally {
    pub fn correct_pct(&self) -> f64 {
        self.correct as f64 / (self.correct + self.wrong).max(1) as f64 * 100.0
    }

    pub fn wrong_pct(&self) -> f64 {
        self.wrong as f64 / (self.correct + self.wrong).max(1) as f64 * 100.0
    }
}

/// Two-decimal rounding applied at the wire and in persisted pct columns.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
pub struct ScoreBoard {
    per_participant: HashMap<i64, Tally>,
}

impl ScoreBoard {
    pub fn from_persisted(aggregates: &[PersistedAggregate]) -> Self {
        let mut board = ScoreBoard::default();
        for aggregate in aggregates {
            if let Some(participant_id) = aggregate.participant_id {
                board.per_participant.insert(
                    participant_id,
                    Tally {
                        correct: aggregate.correct,
                        wrong: aggregate.wrong,
                    },
                );
            }
        }
        board
    }

    /// `newly_correct` is true when this answer flipped the question state
    /// from incorrect to correct.
    pub fn record_answer(&mut self, participant_id: i64, newly_correct: bool) {
        let tally = self.per_participant.entry(participant_id).or_default();
        if newly_correct {
            tally.correct += 1;
        } else {
            tally.wrong += 1;
        }
    }

    pub fn participant(&self, participant_id: i64) -> Tally {
        self.per_participant
            .get(&participant_id)
            .copied()
            .unwrap_or_default()
    }

    /// Class tally is always the sum of the per-participant tallies,
    /// recomputed on demand.
    pub fn class(&self) -> Tally {
        let mut class = Tally::default();
        for tally in self.per_participant.values() {
            class.correct += tally.correct;
            class.wrong += tally.wrong;
        }
        class
    }
}
