//! The presence signal consumed by the reconciliation loop.

pub mod snapshot;

use crate::core::{GroupId, MemberId, Result, RoleId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub use snapshot::SnapshotSignalSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    DoNotDisturb,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub status: PresenceStatus,
    #[serde(default)]
    pub application: Option<String>,
}

impl Presence {
    pub fn new(status: PresenceStatus) -> Self {
        Self {
            status,
            application: None,
        }
    }

    pub fn playing(status: PresenceStatus, application: impl Into<String>) -> Self {
        Self {
            status,
            application: Some(application.into()),
        }
    }

    /// The reported application name; an empty name counts as none
    pub fn current_application(&self) -> Option<&str> {
        self.application.as_deref().filter(|name| !name.is_empty())
    }
}

/// A roster entry resolved to its details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterMember {
    pub id: MemberId,
    pub display_name: String,
    #[serde(default)]
    pub roles: HashSet<RoleId>,
}

/// Live roster and presence, polled once per tick.
///
/// A `Validation` error from `member` or `presence` marks that one entry as
/// malformed and the member is skipped for the tick. Any other error is
/// treated as the source being unavailable for the whole tick.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Called once at the start of every tick before any other read
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    /// Member ids currently in `group`
    async fn roster(&self, group: GroupId) -> Result<Vec<MemberId>>;

    /// Details for one roster entry; `None` if it can no longer be resolved
    async fn member(&self, group: GroupId, member: MemberId) -> Result<Option<RosterMember>>;

    /// Cached presence; `None` means the member is unobservable right now,
    /// which is distinct from `PresenceStatus::Offline`
    async fn presence(&self, member: MemberId) -> Result<Option<Presence>>;

    /// Role name to id mapping of `group`, read once at startup
    async fn group_roles(&self, _group: GroupId) -> Result<HashMap<String, RoleId>> {
        Ok(HashMap::new())
    }
}
