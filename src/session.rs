//! Session interval bookkeeping.
//!
//! Every operation takes the observation time explicitly; nothing here reads
//! a clock. After any call returns, a member has at most one open session.

use crate::core::{GameId, MemberId, NewSession, Result, Session, SessionId, Timestamp};
use crate::storage::StorageEngine;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of `SessionStore::open_session`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A session for the game was already open; nothing new was written
    Unchanged,
    /// A new session was inserted after closing `closed` other sessions
    Opened { session: Session, closed: usize },
}

pub struct SessionStore<S: ?Sized> {
    storage: Arc<S>,
}

impl<S: StorageEngine + ?Sized> SessionStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Converge `member` onto playing `game` as of `at`.
    ///
    /// Re-applying the same observation is a no-op. Otherwise every other
    /// open session is closed at `at` and a new one starts at `at`.
    pub async fn open_session(
        &self,
        member: MemberId,
        game: GameId,
        at: Timestamp,
    ) -> Result<OpenOutcome> {
        let open = self.storage.open_sessions(member).await?;

        let keep = open
            .iter()
            .filter(|s| s.game_id == game)
            .min_by_key(|s| (s.started_at, s.id))
            .map(|s| s.id);

        if let Some(keep) = keep {
            let extra: Vec<&Session> = open.iter().filter(|s| s.id != keep).collect();
            if !extra.is_empty() {
                warn!(
                    member = %member,
                    count = extra.len(),
                    "closing extra open sessions beside the one being kept"
                );
                self.end(member, &extra, at).await?;
            }
            return Ok(OpenOutcome::Unchanged);
        }

        // No session of `game` is open, so this closes every other one
        let closed = self.close_all_open_except_game(member, game, at).await?;
        let session = self
            .storage
            .insert_session(NewSession {
                member_id: member,
                game_id: game,
                started_at: at,
            })
            .await?;
        info!(member = %member, game = %game, session = %session.id, closed, "session opened");
        Ok(OpenOutcome::Opened { session, closed })
    }

    /// Close every open session of `member` at `at`
    pub async fn close_all_open(&self, member: MemberId, at: Timestamp) -> Result<usize> {
        let open = self.storage.open_sessions(member).await?;
        let all: Vec<&Session> = open.iter().collect();
        self.end(member, &all, at).await
    }

    /// Close every open session of `member` except those for `game`
    pub async fn close_all_open_except_game(
        &self,
        member: MemberId,
        game: GameId,
        at: Timestamp,
    ) -> Result<usize> {
        let open = self.storage.open_sessions(member).await?;
        let others: Vec<&Session> = open.iter().filter(|s| s.game_id != game).collect();
        self.end(member, &others, at).await
    }

    /// `(game, session)` pairs currently open for `member`; order is unspecified
    pub async fn list_open_sessions(&self, member: MemberId) -> Result<Vec<(GameId, SessionId)>> {
        Ok(self
            .storage
            .open_sessions(member)
            .await?
            .into_iter()
            .map(|s| (s.game_id, s.id))
            .collect())
    }

    /// Discard every session still open from a previous process.
    ///
    /// Their real end time is unknown, so the rows are removed instead of
    /// being closed at some guessed time. Returns the number removed.
    pub async fn cleanup_on_startup(&self) -> Result<usize> {
        let ids: Vec<SessionId> = self
            .storage
            .all_open_sessions()
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let removed = self.storage.delete_sessions(&ids).await?;
        info!(removed, "discarded sessions left open by the previous run");
        Ok(removed)
    }

    async fn end(&self, member: MemberId, sessions: &[&Session], at: Timestamp) -> Result<usize> {
        if sessions.is_empty() {
            return Ok(0);
        }
        for session in sessions.iter().filter(|s| at < s.started_at) {
            warn!(
                member = %member,
                session = %session.id,
                started_at = %session.started_at,
                at = %at,
                "end time precedes start, ending at start"
            );
        }
        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();
        let closed = self.storage.end_sessions(&ids, at).await?;
        debug!(member = %member, closed, "sessions closed");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Member, NewGame};
    use crate::storage::InMemoryStorage;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    const U: MemberId = MemberId(100);

    async fn setup() -> (Arc<InMemoryStorage>, SessionStore<InMemoryStorage>, GameId, GameId) {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .insert_member(Member {
                id: U,
                display_name: "U".to_string(),
                first_seen_at: at(0),
            })
            .await
            .unwrap();
        let mut games = Vec::new();
        for name in ["A", "B"] {
            let game = storage
                .insert_game(NewGame {
                    name: name.to_string(),
                    first_seen_at: at(0),
                    first_member_id: U,
                })
                .await
                .unwrap();
            games.push(game.id);
        }
        let store = SessionStore::new(storage.clone());
        (storage, store, games[0], games[1])
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let (storage, store, a, _) = setup().await;

        let first = store.open_session(U, a, at(0)).await.unwrap();
        assert!(matches!(first, OpenOutcome::Opened { closed: 0, .. }));
        let second = store.open_session(U, a, at(60)).await.unwrap();
        assert_eq!(second, OpenOutcome::Unchanged);

        let sessions = storage.list_sessions(Some(U)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].started_at, at(0));
        assert!(sessions[0].is_open());
    }

    #[tokio::test]
    async fn test_switching_game_closes_previous() {
        let (storage, store, a, b) = setup().await;
        store.open_session(U, a, at(0)).await.unwrap();

        let outcome = store.open_session(U, b, at(60)).await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened { closed: 1, .. }));

        let sessions = storage.list_sessions(Some(U)).await.unwrap();
        assert_eq!(sessions[0].game_id, a);
        assert_eq!(sessions[0].ended_at, Some(at(60)));
        assert_eq!(sessions[1].game_id, b);
        assert_eq!(sessions[1].started_at, at(60));
        assert_eq!(sessions[1].ended_at, None);
    }

    #[tokio::test]
    async fn test_open_repairs_multiple_open_sessions() {
        let (storage, store, a, b) = setup().await;
        for (game, t) in [(b, 0), (a, 10), (a, 20)] {
            storage
                .insert_session(NewSession {
                    member_id: U,
                    game_id: game,
                    started_at: at(t),
                })
                .await
                .unwrap();
        }

        let outcome = store.open_session(U, a, at(60)).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Unchanged);

        let open = storage.open_sessions(U).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].game_id, a);
        assert_eq!(open[0].started_at, at(10));
    }

    #[tokio::test]
    async fn test_switch_closes_every_other_open_session() {
        let (storage, store, a, b) = setup().await;
        for t in [0, 10] {
            storage
                .insert_session(NewSession {
                    member_id: U,
                    game_id: a,
                    started_at: at(t),
                })
                .await
                .unwrap();
        }

        let outcome = store.open_session(U, b, at(60)).await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened { closed: 2, .. }));

        let open = store.list_open_sessions(U).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, b);
        let sessions = storage.list_sessions(Some(U)).await.unwrap();
        assert_eq!(sessions[0].ended_at, Some(at(60)));
        assert_eq!(sessions[1].ended_at, Some(at(60)));
    }

    #[tokio::test]
    async fn test_close_all_open() {
        let (_, store, a, _) = setup().await;
        assert_eq!(store.close_all_open(U, at(0)).await.unwrap(), 0);

        store.open_session(U, a, at(0)).await.unwrap();
        assert_eq!(store.close_all_open(U, at(120)).await.unwrap(), 1);
        assert!(store.list_open_sessions(U).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_open_except_game() {
        let (storage, store, a, b) = setup().await;
        for game in [a, b] {
            storage
                .insert_session(NewSession {
                    member_id: U,
                    game_id: game,
                    started_at: at(0),
                })
                .await
                .unwrap();
        }

        let closed = store.close_all_open_except_game(U, a, at(30)).await.unwrap();
        assert_eq!(closed, 1);
        let open = store.list_open_sessions(U).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, a);
    }

    #[tokio::test]
    async fn test_cleanup_discards_open_sessions() {
        let (storage, store, a, b) = setup().await;
        store.open_session(U, a, at(0)).await.unwrap();
        store.open_session(U, b, at(60)).await.unwrap();

        assert_eq!(store.cleanup_on_startup().await.unwrap(), 1);

        let sessions = storage.list_sessions(None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].game_id, a);
        assert_eq!(sessions[0].ended_at, Some(at(60)));
        assert_eq!(store.cleanup_on_startup().await.unwrap(), 0);
    }
}
