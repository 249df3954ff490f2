//! Common types used throughout the state-storage layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller-supplied, globally unique player (or group) identifier
pub type PlayerId = String;

/// Opaque attribute bag attached to a request
pub type Properties = serde_json::Value;

/// A player's matchmaking request as held by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRequest {
    pub id: PlayerId,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    /// Connection string, present once an assignment was published
    pub assignment: Option<String>,
}

/// Connection info delivered to a waiting client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: PlayerId,
    pub connection_string: String,
}

/// A named group of players inside an accepted match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub name: String,
    pub player_ids: Vec<PlayerId>,
}

impl Roster {
    pub fn new(name: impl Into<String>, player_ids: Vec<PlayerId>) -> Self {
        Self {
            name: name.into(),
            player_ids,
        }
    }
}

/// Connection info for every player of every roster in an accepted match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignments {
    pub connection_info: String,
    pub rosters: Vec<Roster>,
}

impl Assignments {
    /// All player ids across rosters, in roster order
    pub fn player_ids(&self) -> impl Iterator<Item = &PlayerId> {
        self.rosters.iter().flat_map(|roster| roster.player_ids.iter())
    }
}

/// A single exclusion mark on an ignore list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreListEntry {
    pub list: String,
    pub id: PlayerId,
    pub inserted_at: DateTime<Utc>,
}
