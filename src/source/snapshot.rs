use super::{Presence, RosterMember, SignalSource};
use crate::core::{GroupId, MemberId, Result, RoleId, TrackerError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::warn;

/// One roster or presence entry as reported. An entry that does not decode
/// is kept verbatim, so it fails on its own lookup instead of failing the
/// whole snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalEntry<T> {
    Valid(T),
    Malformed(Value),
}

impl<T: DeserializeOwned + Clone> SignalEntry<T> {
    fn decode(&self, what: &str) -> Result<T> {
        match self {
            Self::Valid(value) => Ok(value.clone()),
            Self::Malformed(raw) => match serde_json::from_value::<T>(raw.clone()) {
                Ok(value) => Ok(value),
                Err(e) => Err(TrackerError::Validation(format!(
                    "Malformed {} entry: {}",
                    what, e
                ))),
            },
        }
    }
}

impl SignalEntry<RosterMember> {
    /// Id of the entry, if it carries a usable one
    fn member_id(&self) -> Option<MemberId> {
        match self {
            Self::Valid(member) => Some(member.id),
            Self::Malformed(raw) => raw.get("id").and_then(Value::as_u64).map(MemberId),
        }
    }
}

/// Everything a source reports at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    #[serde(default)]
    pub groups: BTreeMap<GroupId, GroupSnapshot>,
    #[serde(default)]
    pub presence: HashMap<MemberId, SignalEntry<Presence>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    #[serde(default)]
    pub roles: HashMap<String, RoleId>,
    #[serde(default)]
    pub members: Vec<SignalEntry<RosterMember>>,
}

/// Source backed by an in-memory snapshot.
///
/// Either fed through the mutators, or bound to a JSON file with
/// `from_file`, in which case every `refresh` re-reads the file and an
/// unreadable file, or one that is not a snapshot at all, makes the source
/// unavailable for that tick. A single entry that fails to decode only
/// surfaces as a `Validation` error when that member is looked up.
pub struct SnapshotSignalSource {
    state: RwLock<SignalSnapshot>,
    path: Option<PathBuf>,
    unavailable: AtomicBool,
}

impl SnapshotSignalSource {
    pub fn new() -> Self {
        Self::with_snapshot(SignalSnapshot::default())
    }

    pub fn with_snapshot(snapshot: SignalSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            path: None,
            unavailable: AtomicBool::new(false),
        }
    }

    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = read_snapshot(&path).await?;
        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
            unavailable: AtomicBool::new(false),
        })
    }

    pub async fn replace(&self, snapshot: SignalSnapshot) {
        *self.state.write().await = snapshot;
    }

    pub async fn add_member(&self, group: GroupId, member: RosterMember) {
        let mut state = self.state.write().await;
        let members = &mut state.groups.entry(group).or_default().members;
        members.retain(|m| m.member_id() != Some(member.id));
        members.push(SignalEntry::Valid(member));
    }

    pub async fn remove_member(&self, group: GroupId, member: MemberId) {
        let mut state = self.state.write().await;
        if let Some(snapshot) = state.groups.get_mut(&group) {
            snapshot.members.retain(|m| m.member_id() != Some(member));
        }
    }

    pub async fn set_group_roles(&self, group: GroupId, roles: HashMap<String, RoleId>) {
        let mut state = self.state.write().await;
        state.groups.entry(group).or_default().roles = roles;
    }

    pub async fn set_presence(&self, member: MemberId, presence: Presence) {
        self.state
            .write()
            .await
            .presence
            .insert(member, SignalEntry::Valid(presence));
    }

    /// Drop the cached presence so the member becomes unobservable
    pub async fn clear_presence(&self, member: MemberId) {
        self.state.write().await.presence.remove(&member);
    }

    /// Make every `refresh` fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for SnapshotSignalSource {
    fn default() -> Self {
        Self::new()
    }
}

async fn read_snapshot(path: &Path) -> Result<SignalSnapshot> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        TrackerError::SourceUnavailable(format!(
            "Failed to read signal file {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        TrackerError::SourceUnavailable(format!(
            "Failed to parse signal file {}: {}",
            path.display(),
            e
        ))
    })
}

#[async_trait]
impl SignalSource for SnapshotSignalSource {
    async fn refresh(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TrackerError::SourceUnavailable(
                "signal source is unavailable".to_string(),
            ));
        }
        if let Some(ref path) = self.path {
            let snapshot = read_snapshot(path).await?;
            self.replace(snapshot).await;
        }
        Ok(())
    }

    async fn roster(&self, group: GroupId) -> Result<Vec<MemberId>> {
        let state = self.state.read().await;
        let snapshot = state.groups.get(&group).ok_or_else(|| {
            TrackerError::SourceUnavailable(format!("Group {} is not visible to the source", group))
        })?;
        let mut ids = Vec::with_capacity(snapshot.members.len());
        for entry in &snapshot.members {
            match entry.member_id() {
                Some(id) => ids.push(id),
                None => warn!(group = %group, "roster entry without a member id"),
            }
        }
        Ok(ids)
    }

    async fn member(&self, group: GroupId, member: MemberId) -> Result<Option<RosterMember>> {
        let state = self.state.read().await;
        let entry = state
            .groups
            .get(&group)
            .and_then(|g| g.members.iter().find(|m| m.member_id() == Some(member)));
        entry.map(|e| e.decode("roster")).transpose()
    }

    async fn presence(&self, member: MemberId) -> Result<Option<Presence>> {
        let state = self.state.read().await;
        state
            .presence
            .get(&member)
            .map(|e| e.decode("presence"))
            .transpose()
    }

    async fn group_roles(&self, group: GroupId) -> Result<HashMap<String, RoleId>> {
        let state = self.state.read().await;
        Ok(state
            .groups
            .get(&group)
            .map(|g| g.roles.clone())
            .unwrap_or_default())
    }
}
