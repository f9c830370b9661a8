use crate::core::{GroupId, Result, RoleId, TrackerError};
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One community group the tracker polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: GroupId,

    /// Role name to id mapping of this group. When empty, the mapping is
    /// requested from the signal source at startup.
    #[serde(default)]
    pub roles: HashMap<String, RoleId>,
}

impl GroupConfig {
    pub fn new(id: impl Into<GroupId>) -> Self {
        Self {
            id: id.into(),
            roles: HashMap::new(),
        }
    }

    pub fn role(mut self, name: &str, id: impl Into<RoleId>) -> Self {
        self.roles.insert(name.to_string(), id.into());
        self
    }
}

/// Tracker configuration
///
/// Loaded from a JSON file or built in code; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Directory for WAL and snapshot files; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// WAL entries between automatic checkpoints
    pub checkpoint_threshold: usize,

    /// Seconds between ticks
    pub tick_interval_secs: u64,

    /// Members reconciled concurrently within one tick
    pub member_concurrency: usize,

    pub tracked_roles: Vec<String>,

    pub excluded_roles: Vec<String>,

    pub groups: Vec<GroupConfig>,

    /// JSON presence snapshot read by the binary's signal source
    pub signal_file: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::Async,
            checkpoint_threshold: 1000,
            tick_interval_secs: 60,
            member_concurrency: 8,
            tracked_roles: vec!["admin".to_string()],
            excluded_roles: Vec::new(),
            groups: Vec::new(),
            signal_file: None,
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| TrackerError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Add a polled group
    pub fn group(mut self, group: GroupConfig) -> Self {
        self.groups.push(group);
        self
    }

    /// Set tracked role names
    pub fn tracked_roles<I, T>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tracked_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Set excluded role names
    pub fn excluded_roles<I, T>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.excluded_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set durability mode
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    /// Set tick interval
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_secs = interval.as_secs();
        self
    }

    /// Set per-tick member concurrency
    pub fn member_concurrency(mut self, concurrency: usize) -> Self {
        self.member_concurrency = concurrency;
        self
    }

    /// Set the signal snapshot file
    pub fn signal_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.signal_file = Some(path.into());
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(TrackerError::Config(
                "tick_interval_secs must be positive".to_string(),
            ));
        }
        if self.member_concurrency == 0 {
            return Err(TrackerError::Config(
                "member_concurrency must be positive".to_string(),
            ));
        }
        if self.checkpoint_threshold == 0 {
            return Err(TrackerError::Config(
                "checkpoint_threshold must be positive".to_string(),
            ));
        }
        if self.groups.is_empty() {
            return Err(TrackerError::Config(
                "at least one group must be configured".to_string(),
            ));
        }
        if self.tracked_roles.is_empty() {
            return Err(TrackerError::Config(
                "at least one tracked role must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for group in &self.groups {
            if !seen.insert(group.id) {
                return Err(TrackerError::Config(format!(
                    "group {} is configured twice",
                    group.id
                )));
            }
        }
        Ok(())
    }
}
