//! Common types used throughout the match-state engine

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Opaque, externally supplied match identifier
pub type MatchId = String;

/// Hash field names of a persisted match record
pub const FIELD_PUZZLE: &str = "puzzle";
pub const FIELD_ORIGINAL: &str = "original";
pub const FIELD_STATE: &str = "state";

/// Lifecycle state of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MatchState {
    #[default]
    InProgress,
    Ended,
}

impl MatchState {
    /// Value stored in the `state` field
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchState::InProgress => "",
            MatchState::Ended => "ENDED",
        }
    }

    /// Parse a stored `state` field. Older records used a bare "E".
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        match raw {
            "" => Ok(MatchState::InProgress),
            "ENDED" | "E" => Ok(MatchState::Ended),
            other => Err(EngineError::Decode {
                what: "match state".to_string(),
                message: format!("unknown state '{}'", other),
            }),
        }
    }
}

impl std::fmt::Display for MatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchState::InProgress => write!(f, "IN_PROGRESS"),
            MatchState::Ended => write!(f, "ENDED"),
        }
    }
}

/// Persisted match hash `{puzzle, original, state}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Serialized current grid
    pub puzzle: String,
    /// Serialized starting grid, written once at creation
    pub original: String,
    pub state: MatchState,
}

impl MatchRecord {
    /// Fresh record for a newly generated puzzle
    pub fn new(serialized_grid: String) -> Self {
        Self {
            original: serialized_grid.clone(),
            puzzle: serialized_grid,
            state: MatchState::InProgress,
        }
    }

    /// Decode a record from its hash fields. An empty hash means "no record".
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Option<Self>, EngineError> {
        if fields.is_empty() {
            return Ok(None);
        }

        let field = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| EngineError::Decode {
                what: "match record".to_string(),
                message: format!("missing field '{}'", name),
            })
        };

        Ok(Some(Self {
            puzzle: field(FIELD_PUZZLE)?,
            original: field(FIELD_ORIGINAL)?,
            state: MatchState::parse(fields.get(FIELD_STATE).map(String::as_str).unwrap_or(""))?,
        }))
    }

    /// All fields, as written on creation
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (FIELD_PUZZLE.to_string(), self.puzzle.clone()),
            (FIELD_ORIGINAL.to_string(), self.original.clone()),
            (FIELD_STATE.to_string(), self.state.as_str().to_string()),
        ]
    }

    /// The mutable subset written by a move (`original` is never rewritten)
    pub fn mutable_fields(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (FIELD_PUZZLE.to_string(), self.puzzle.clone()),
            (FIELD_STATE.to_string(), self.state.as_str().to_string()),
        ])
    }

    pub fn is_ended(&self) -> bool {
        self.state == MatchState::Ended
    }
}

/// What a move did to its match. Every variant is a success for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveOutcome {
    /// Cell written, match still in progress
    Applied,
    /// Cell written and the grid is now solved
    Completed,
    /// Clue cell or ended match; nothing written
    Ignored,
}

impl MoveOutcome {
    /// Metric label
    pub fn as_label(&self) -> &'static str {
        match self {
            MoveOutcome::Applied => "applied",
            MoveOutcome::Completed => "completed",
            MoveOutcome::Ignored => "ignored",
        }
    }
}

/// "State changed" event carried on the update channel and pushed to observers.
///
/// Wire shape is `{"Mid": "...", "Game": {"puzzle": "...", "state": "..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    #[serde(rename = "Mid")]
    pub mid: MatchId,
    #[serde(rename = "Game")]
    pub game: BTreeMap<String, String>,
}

impl UpdateEvent {
    pub fn new(mid: impl Into<MatchId>, game: BTreeMap<String, String>) -> Self {
        Self {
            mid: mid.into(),
            game,
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|e| EngineError::InternalError {
            message: format!("Failed to serialize update: {}", e),
        })
    }

    pub fn from_json(payload: &str) -> Result<Self, EngineError> {
        serde_json::from_str(payload).map_err(|e| EngineError::Decode {
            what: "update event".to_string(),
            message: e.to_string(),
        })
    }
}

/// Full match view returned by GetMatch, same envelope as `UpdateEvent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchView {
    #[serde(rename = "Mid")]
    pub mid: MatchId,
    #[serde(rename = "Game")]
    pub game: BTreeMap<String, String>,
}

impl MatchView {
    pub fn from_record(mid: &str, record: &MatchRecord) -> Self {
        Self {
            mid: mid.to_string(),
            game: record.to_fields().into_iter().collect(),
        }
    }
}

/// Lifecycle announcement written to the `games` stream family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnouncementState {
    Ready,
    Ended,
}

impl AnnouncementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnouncementState::Ready => "READY",
            AnnouncementState::Ended => "ENDED",
        }
    }
}

/// Payload `{mid, state}` appended to `<namespace>games-{partition}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub mid: MatchId,
    pub state: AnnouncementState,
}

impl Announcement {
    pub fn ready(mid: &str) -> Self {
        Self {
            mid: mid.to_string(),
            state: AnnouncementState::Ready,
        }
    }

    pub fn ended(mid: &str) -> Self {
        Self {
            mid: mid.to_string(),
            state: AnnouncementState::Ended,
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("mid".to_string(), self.mid.clone()),
            ("state".to_string(), self.state.as_str().to_string()),
        ]
    }
}

/// Match-creation payload `{game, match_id}` produced by matchmaking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchmakingAnnouncement {
    pub game: String,
    pub match_id: MatchId,
}

impl MatchmakingAnnouncement {
    /// Decode from stream entry fields
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EngineError> {
        let field = |name: &str| {
            fields.get(name).cloned().ok_or_else(|| EngineError::Decode {
                what: "matchmaking announcement".to_string(),
                message: format!("missing field '{}'", name),
            })
        };

        Ok(Self {
            game: field("game")?,
            match_id: field("match_id")?,
        })
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("game".to_string(), self.game.clone()),
            ("match_id".to_string(), self.match_id.clone()),
        ]
    }
}
