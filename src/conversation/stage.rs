//! Funnel stages and the transition table that names the special ones.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A qualification stage in the sales funnel.
///
/// Ordered: a higher stage is further down the funnel. `Greeting` is the
/// implicit entry state for a contact with no prior record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Stage {
    Greeting = 0,
    Discovery = 1,
    Qualification = 2,
    Education = 3,
    DataCollection = 4,
    BillCollection = 5,
    BillAnalysis = 6,
    Proposal = 7,
    FollowUp = 8,
    Negotiation = 9,
    Closed = 10,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Greeting,
        Stage::Discovery,
        Stage::Qualification,
        Stage::Education,
        Stage::DataCollection,
        Stage::BillCollection,
        Stage::BillAnalysis,
        Stage::Proposal,
        Stage::FollowUp,
        Stage::Negotiation,
        Stage::Closed,
    ];

    /// Numeric index of this stage.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Short machine name, used in prompts and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Discovery => "discovery",
            Self::Qualification => "qualification",
            Self::Education => "education",
            Self::DataCollection => "data_collection",
            Self::BillCollection => "bill_collection",
            Self::BillAnalysis => "bill_analysis",
            Self::Proposal => "proposal",
            Self::FollowUp => "follow_up",
            Self::Negotiation => "negotiation",
            Self::Closed => "closed",
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::Greeting
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.index()
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Stage::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| format!("stage {value} is outside 0..={}", Stage::Closed.index()))
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.index(), self.name())
    }
}

/// Named stage constants checked once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTable {
    ceiling: Stage,
    close_threshold: Stage,
    fast_track: Stage,
    deliverable: Stage,
    allow_regression: bool,
}

impl StageTable {
    /// Build a table, rejecting inconsistent stage constants.
    ///
    /// - `ceiling`: conversations at or beyond it are closed.
    /// - `close_threshold`: crossing it fires `QualifiedLead`.
    /// - `fast_track`: jump target for explicit price inquiries.
    /// - `deliverable`: entering it triggers proposal generation.
    pub fn new(
        ceiling: Stage,
        close_threshold: Stage,
        fast_track: Stage,
        deliverable: Stage,
    ) -> Result<Self, ConfigError> {
        if ceiling == Stage::Greeting {
            return Err(invalid("ceiling", "must be above the entry stage"));
        }
        if close_threshold > ceiling {
            return Err(invalid(
                "close_threshold",
                &format!("{close_threshold} is above the ceiling {ceiling}"),
            ));
        }
        if fast_track >= ceiling {
            return Err(invalid(
                "fast_track",
                &format!("{fast_track} must be below the ceiling {ceiling}"),
            ));
        }
        if deliverable >= ceiling {
            return Err(invalid(
                "deliverable",
                &format!("{deliverable} must be below the ceiling {ceiling}"),
            ));
        }

        Ok(Self {
            ceiling,
            close_threshold,
            fast_track,
            deliverable,
            allow_regression: false,
        })
    }

    /// Whether the adapter may move a conversation to a lower stage.
    pub fn with_regression(mut self, allow: bool) -> Self {
        self.allow_regression = allow;
        self
    }

    pub fn ceiling(&self) -> Stage {
        self.ceiling
    }

    pub fn close_threshold(&self) -> Stage {
        self.close_threshold
    }

    pub fn fast_track(&self) -> Stage {
        self.fast_track
    }

    pub fn deliverable(&self) -> Stage {
        self.deliverable
    }

    pub fn allows_regression(&self) -> bool {
        self.allow_regression
    }

    /// Whether a conversation at `stage` is closed to further processing.
    pub fn is_closed(&self, stage: Stage) -> bool {
        stage >= self.ceiling
    }

    /// Clamp a raw adapter stage number into `[0, ceiling]`.
    pub fn clamp(&self, raw: i64) -> Stage {
        let bounded = raw.clamp(0, self.ceiling.index() as i64) as u8;
        // Every index up to the ceiling is a valid stage.
        Stage::try_from(bounded).unwrap_or(self.ceiling)
    }

    /// Resolve the stage a conversation moves to given the adapter's proposal.
    ///
    /// Moving back to the deliverable stage is always allowed: it is how the
    /// adapter asks for a new proposal.
    pub fn resolve(&self, current: Stage, proposed: i64) -> Stage {
        let next = self.clamp(proposed);
        if next < current && next != self.deliverable && !self.allow_regression {
            tracing::warn!(
                current = %current,
                proposed,
                "Adapter proposed a stage regression; holding current stage"
            );
            return current;
        }
        next
    }
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            ceiling: Stage::Closed,
            close_threshold: Stage::Proposal,
            fast_track: Stage::DataCollection,
            deliverable: Stage::Proposal,
            allow_regression: false,
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("stage_table.{key}"),
        message: message.to_string(),
    }
}
