//! The five linear session stages (spec §4.10) and helpers shared across the
//! Constraint Retriever, the Session Controller, and the durable constraint
//! `applies_stages` routing tags.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CollectConstraints,
    CaptureInputs,
    Skeleton,
    Refine,
    ReviewCommit,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::CollectConstraints,
        Stage::CaptureInputs,
        Stage::Skeleton,
        Stage::Refine,
        Stage::ReviewCommit,
    ];

    /// The wire/tag form used in `ConstraintRecord::applies_stages` and in
    /// `ConstraintFilters::stage`.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::CollectConstraints => "collect_constraints",
            Stage::CaptureInputs => "capture_inputs",
            Stage::Skeleton => "skeleton",
            Stage::Refine => "refine",
            Stage::ReviewCommit => "review_commit",
        }
    }

    pub fn index(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap()
    }

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    /// Stages that always route `DW, SW` event-type constraints (spec §4.7).
    pub fn is_startup(self) -> bool {
        matches!(
            self,
            Stage::CaptureInputs | Stage::Skeleton | Stage::Refine | Stage::ReviewCommit
        )
    }

    /// Scheduling stages (those that place events on the calendar, as
    /// opposed to `CollectConstraints`, which only establishes the frame).
    pub fn is_scheduling(self) -> bool {
        matches!(self, Stage::Skeleton | Stage::Refine | Stage::ReviewCommit)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
