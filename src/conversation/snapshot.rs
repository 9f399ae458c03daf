use serde::{Deserialize, Serialize};

use super::{Conversation, Turn, TurnStatus};
use crate::error::SessionError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Serializable copy of a conversation, for hosts that persist sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub version: u32,
    pub turns: Vec<Turn>,
}

impl ConversationSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Conversation {
    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            version: SNAPSHOT_VERSION,
            turns: self.turns.clone(),
        }
    }

    /// Rebuilds a conversation from `snapshot`.
    ///
    /// Turns that were still in flight when the snapshot was taken come back
    /// as cancelled, since nothing is streaming into them anymore.
    pub fn restore(snapshot: ConversationSnapshot) -> Result<Self, SessionError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SessionError::UnsupportedSnapshot {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let turns = snapshot
            .turns
            .into_iter()
            .map(|mut turn| {
                if !turn.is_terminal() {
                    turn.status = TurnStatus::Cancelled;
                }
                turn
            })
            .collect();
        Ok(Self { turns })
    }
}
