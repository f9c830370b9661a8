use super::engine::StorageEngine;
use super::persistence::{DurabilityMode, PersistenceManager, WalEntry};
use super::table::Table;
use crate::core::{
    Game, GameId, Member, MemberId, NewGame, NewSession, Result, Session, SessionId, Timestamp,
    TrackerError,
};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// The three logical tables plus their secondary indexes.
///
/// Indexes are derived data: they are skipped on serialization and rebuilt
/// with `rebuild_indexes` after a snapshot is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub members: Table<Member>,
    pub games: Table<Game>,
    pub sessions: Table<Session>,
    /// UNIQUE(games.name)
    #[serde(skip)]
    game_names: HashMap<String, GameId>,
    /// INDEX(sessions.member_id, sessions.ended_at) restricted to open rows
    #[serde(skip)]
    open_by_member: HashMap<MemberId, BTreeSet<SessionId>>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            members: Table::new("members"),
            games: Table::new("games"),
            sessions: Table::new("sessions"),
            game_names: HashMap::new(),
            open_by_member: HashMap::new(),
        }
    }
}

impl Tables {
    pub fn rebuild_indexes(&mut self) {
        self.game_names = self
            .games
            .values()
            .map(|game| (game.name.clone(), game.id))
            .collect();

        self.open_by_member.clear();
        for session in self.sessions.values().filter(|s| s.is_open()) {
            self.open_by_member
                .entry(session.member_id)
                .or_default()
                .insert(session.id);
        }
    }

    pub fn game_id_by_name(&self, name: &str) -> Option<GameId> {
        self.game_names.get(name).copied()
    }

    pub fn open_session_ids(&self, member: MemberId) -> Vec<SessionId> {
        self.open_by_member
            .get(&member)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Key and foreign-key checks for an entry, without mutating anything
    pub fn check(&self, entry: &WalEntry) -> Result<()> {
        match entry {
            WalEntry::InsertMember(member) => {
                if self.members.contains(member.id.0) {
                    return Err(TrackerError::ConstraintViolation(format!(
                        "Member {} already exists",
                        member.id
                    )));
                }
            }
            WalEntry::InsertGame(game) => {
                if self.game_names.contains_key(&game.name) {
                    return Err(TrackerError::ConstraintViolation(format!(
                        "Unique constraint violation: game name '{}' already exists",
                        game.name
                    )));
                }
                if self.games.contains(game.id.0) {
                    return Err(TrackerError::ConstraintViolation(format!(
                        "Game {} already exists",
                        game.id
                    )));
                }
                self.check_member_exists(game.first_member_id)?;
            }
            WalEntry::InsertSession(session) => {
                if self.sessions.contains(session.id.0) {
                    return Err(TrackerError::ConstraintViolation(format!(
                        "Session {} already exists",
                        session.id
                    )));
                }
                self.check_member_exists(session.member_id)?;
                if !self.games.contains(session.game_id.0) {
                    return Err(TrackerError::ConstraintViolation(format!(
                        "Foreign key violation: game {} does not exist",
                        session.game_id
                    )));
                }
            }
            WalEntry::EndSessions { .. } | WalEntry::DeleteSessions { .. } => {}
        }
        Ok(())
    }

    fn check_member_exists(&self, member: MemberId) -> Result<()> {
        if self.members.contains(member.0) {
            Ok(())
        } else {
            Err(TrackerError::ConstraintViolation(format!(
                "Foreign key violation: member {} does not exist",
                member
            )))
        }
    }

    /// Apply one entry, returning the number of rows affected.
    ///
    /// Used both for live writes and for WAL replay, so the result depends
    /// only on the entry and the current tables.
    pub fn apply(&mut self, entry: &WalEntry) -> Result<usize> {
        self.check(entry)?;
        match entry {
            WalEntry::InsertMember(member) => {
                self.members.insert_keyed(member.id.0, member.clone())?;
                Ok(1)
            }
            WalEntry::InsertGame(game) => {
                self.games.insert_keyed(game.id.0, game.clone())?;
                self.game_names.insert(game.name.clone(), game.id);
                Ok(1)
            }
            WalEntry::InsertSession(session) => {
                self.sessions.insert_keyed(session.id.0, session.clone())?;
                if session.is_open() {
                    self.open_by_member
                        .entry(session.member_id)
                        .or_default()
                        .insert(session.id);
                }
                Ok(1)
            }
            WalEntry::EndSessions { ids, at } => {
                let mut ended = 0;
                for id in ids {
                    let Some(session) = self.sessions.get_mut(id.0) else {
                        continue;
                    };
                    if !session.is_open() {
                        continue;
                    }
                    // ended_at never precedes started_at
                    session.ended_at = Some((*at).max(session.started_at));
                    let member = session.member_id;
                    self.unindex_open(member, *id);
                    ended += 1;
                }
                Ok(ended)
            }
            WalEntry::DeleteSessions { ids } => {
                let mut deleted = 0;
                for id in ids {
                    if let Some(session) = self.sessions.remove(id.0) {
                        self.unindex_open(session.member_id, *id);
                        deleted += 1;
                    }
                }
                Ok(deleted)
            }
        }
    }

    fn unindex_open(&mut self, member: MemberId, id: SessionId) {
        if let Some(ids) = self.open_by_member.get_mut(&member) {
            ids.remove(&id);
            if ids.is_empty() {
                self.open_by_member.remove(&member);
            }
        }
    }
}

/// Table store guarded by an async lock, optionally backed by WAL + snapshot
/// files. Every mutation is checked, logged, then applied under one write
/// lock, so memory and log never disagree about a committed row.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    persistence: Option<Arc<Mutex<PersistenceManager>>>,
}

impl InMemoryStorage {
    /// Volatile storage; nothing survives the process
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            persistence: None,
        }
    }

    /// Open (or create) durable storage under `data_dir`, recovering any
    /// snapshot and WAL found there.
    pub async fn open<P: AsRef<Path>>(data_dir: P, durability_mode: DurabilityMode) -> Result<Self> {
        let mut persistence = PersistenceManager::new(data_dir, durability_mode)?;
        let tables = match persistence.recover()? {
            Some(tables) => {
                info!(
                    "Store recovered from persistence: {} members, {} games, {} sessions",
                    tables.members.row_count(),
                    tables.games.row_count(),
                    tables.sessions.row_count()
                );
                // Fold the replayed log into a snapshot; appends must not
                // follow a torn tail record.
                persistence.checkpoint(&tables)?;
                tables
            }
            None => Tables::default(),
        };

        Ok(Self {
            tables: RwLock::new(tables),
            persistence: Some(Arc::new(Mutex::new(persistence))),
        })
    }

    pub async fn set_checkpoint_threshold(&self, threshold: usize) {
        if let Some(ref persistence) = self.persistence {
            persistence.lock().await.set_checkpoint_threshold(threshold);
        }
    }

    pub fn is_persistence_enabled(&self) -> bool {
        self.persistence.is_some()
    }

    /// Write a snapshot and truncate the WAL
    pub async fn checkpoint(&self) -> Result<()> {
        if let Some(ref persistence) = self.persistence {
            let tables = self.tables.read().await;
            persistence.lock().await.checkpoint(&tables)?;
        }
        Ok(())
    }

    async fn write(&self, tables: &mut Tables, entry: WalEntry) -> Result<usize> {
        tables.check(&entry)?;

        // 1. Log to WAL BEFORE making changes
        if let Some(ref persistence) = self.persistence {
            let mut persistence_guard = persistence.lock().await;
            persistence_guard.log(&entry)?;
        }

        // 2. Apply in memory
        let affected = tables.apply(&entry)?;

        // 3. Check if checkpoint is needed. The entry is committed at this
        // point; a failed checkpoint is retried on the next write.
        if let Some(ref persistence) = self.persistence {
            let mut persistence_guard = persistence.lock().await;
            if persistence_guard.needs_checkpoint() {
                if let Err(e) = persistence_guard.checkpoint(tables) {
                    warn!("Checkpoint failed, WAL kept: {}", e);
                }
            }
        }

        Ok(affected)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    async fn member_ids(&self) -> Result<Vec<MemberId>> {
        let tables = self.tables.read().await;
        Ok(tables.members.keys().map(MemberId).collect())
    }

    async fn get_member(&self, id: MemberId) -> Result<Option<Member>> {
        let tables = self.tables.read().await;
        Ok(tables.members.get(id.0).cloned())
    }

    async fn insert_member(&self, member: Member) -> Result<()> {
        let mut tables = self.tables.write().await;
        self.write(&mut tables, WalEntry::InsertMember(member)).await?;
        Ok(())
    }

    async fn find_game_by_name(&self, name: &str) -> Result<Option<Game>> {
        let tables = self.tables.read().await;
        Ok(tables
            .game_id_by_name(name)
            .and_then(|id| tables.games.get(id.0))
            .cloned())
    }

    async fn insert_game(&self, game: NewGame) -> Result<Game> {
        let mut tables = self.tables.write().await;
        let game = Game {
            id: GameId(tables.games.peek_next_id()),
            name: game.name,
            first_seen_at: game.first_seen_at,
            first_member_id: game.first_member_id,
        };
        self.write(&mut tables, WalEntry::InsertGame(game.clone())).await?;
        Ok(game)
    }

    async fn list_games(&self) -> Result<Vec<Game>> {
        let tables = self.tables.read().await;
        Ok(tables.games.values().cloned().collect())
    }

    async fn insert_session(&self, session: NewSession) -> Result<Session> {
        let mut tables = self.tables.write().await;
        let session = Session {
            id: SessionId(tables.sessions.peek_next_id()),
            member_id: session.member_id,
            game_id: session.game_id,
            started_at: session.started_at,
            ended_at: None,
        };
        self.write(&mut tables, WalEntry::InsertSession(session.clone()))
            .await?;
        Ok(session)
    }

    async fn open_sessions(&self, member: MemberId) -> Result<Vec<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .open_session_ids(member)
            .into_iter()
            .filter_map(|id| tables.sessions.get(id.0).cloned())
            .collect())
    }

    async fn all_open_sessions(&self) -> Result<Vec<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| s.is_open())
            .cloned()
            .collect())
    }

    async fn end_sessions(&self, ids: &[SessionId], at: Timestamp) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let open: Vec<SessionId> = ids
            .iter()
            .copied()
            .filter(|id| tables.sessions.get(id.0).is_some_and(Session::is_open))
            .collect();
        if open.is_empty() {
            return Ok(0);
        }
        self.write(&mut tables, WalEntry::EndSessions { ids: open, at })
            .await
    }

    async fn delete_sessions(&self, ids: &[SessionId]) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let present: Vec<SessionId> = ids
            .iter()
            .copied()
            .filter(|id| tables.sessions.contains(id.0))
            .collect();
        if present.is_empty() {
            return Ok(0);
        }
        self.write(&mut tables, WalEntry::DeleteSessions { ids: present })
            .await
    }

    async fn list_sessions(&self, member: Option<MemberId>) -> Result<Vec<Session>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sessions
            .values()
            .filter(|s| member.is_none_or(|m| s.member_id == m))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn seeded() -> (InMemoryStorage, Game) {
        let storage = InMemoryStorage::new();
        storage
            .insert_member(Member {
                id: MemberId(1),
                display_name: "U".to_string(),
                first_seen_at: at(0),
            })
            .await
            .unwrap();
        let game = storage
            .insert_game(NewGame {
                name: "Skyrim".to_string(),
                first_seen_at: at(0),
                first_member_id: MemberId(1),
            })
            .await
            .unwrap();
        (storage, game)
    }

    #[tokio::test]
    async fn test_failed_checkpoint_keeps_the_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = InMemoryStorage::open(dir.path(), DurabilityMode::Sync)
            .await
            .unwrap();
        storage.set_checkpoint_threshold(1).await;
        // A directory in the way makes the snapshot rename fail
        let blocker = dir.path().join(crate::storage::persistence::SNAPSHOT_FILE_NAME);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        storage
            .insert_member(Member {
                id: MemberId(1),
                display_name: "U".to_string(),
                first_seen_at: at(0),
            })
            .await
            .unwrap();
        assert_eq!(storage.member_ids().await.unwrap(), vec![MemberId(1)]);
        drop(storage);

        // The WAL still holds the row
        std::fs::remove_dir_all(&blocker).unwrap();
        let reopened = InMemoryStorage::open(dir.path(), DurabilityMode::Sync)
            .await
            .unwrap();
        assert_eq!(reopened.member_ids().await.unwrap(), vec![MemberId(1)]);
    }

    #[tokio::test]
    async fn test_game_name_is_unique() {
        let (storage, _) = seeded().await;
        let err = storage
            .insert_game(NewGame {
                name: "Skyrim".to_string(),
                first_seen_at: at(5),
                first_member_id: MemberId(1),
            })
            .await
            .unwrap_err();

        assert!(err.is_constraint_violation());
        assert_eq!(storage.list_games().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_game_lookup_is_exact() {
        let (storage, game) = seeded().await;
        assert_eq!(
            storage.find_game_by_name("Skyrim").await.unwrap(),
            Some(game)
        );
        assert_eq!(storage.find_game_by_name("skyrim").await.unwrap(), None);
        assert_eq!(storage.find_game_by_name("Skyrim ").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_checked() {
        let storage = InMemoryStorage::new();
        let err = storage
            .insert_game(NewGame {
                name: "Skyrim".to_string(),
                first_seen_at: at(0),
                first_member_id: MemberId(99),
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());

        let (storage, _) = seeded().await;
        let err = storage
            .insert_session(NewSession {
                member_id: MemberId(1),
                game_id: GameId(42),
                started_at: at(0),
            })
            .await
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[tokio::test]
    async fn test_open_index_tracks_end_and_delete() {
        let (storage, game) = seeded().await;
        let first = storage
            .insert_session(NewSession {
                member_id: MemberId(1),
                game_id: game.id,
                started_at: at(0),
            })
            .await
            .unwrap();
        let second = storage
            .insert_session(NewSession {
                member_id: MemberId(1),
                game_id: game.id,
                started_at: at(60),
            })
            .await
            .unwrap();
        assert_eq!(storage.open_sessions(MemberId(1)).await.unwrap().len(), 2);

        assert_eq!(storage.end_sessions(&[first.id], at(60)).await.unwrap(), 1);
        assert_eq!(storage.end_sessions(&[first.id], at(90)).await.unwrap(), 0);
        assert_eq!(storage.delete_sessions(&[second.id]).await.unwrap(), 1);

        assert!(storage.open_sessions(MemberId(1)).await.unwrap().is_empty());
        let all = storage.list_sessions(Some(MemberId(1))).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ended_at, Some(at(60)));
    }

    #[tokio::test]
    async fn test_end_never_precedes_start() {
        let (storage, game) = seeded().await;
        let session = storage
            .insert_session(NewSession {
                member_id: MemberId(1),
                game_id: game.id,
                started_at: at(120),
            })
            .await
            .unwrap();

        storage.end_sessions(&[session.id], at(60)).await.unwrap();
        let stored = storage.list_sessions(None).await.unwrap();
        assert_eq!(stored[0].ended_at, Some(at(120)));
    }
}
