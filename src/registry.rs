//! Member and game registries: lookup-or-create of identity records.

use crate::core::{GameId, Member, MemberId, NewGame, Result, Timestamp, TrackerError};
use crate::storage::StorageEngine;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct Registry<S: ?Sized> {
    storage: Arc<S>,
    /// Serializes game creation inside this process. The storage UNIQUE(name)
    /// constraint covers everything else; a losing insert re-reads the winner.
    game_creation: Mutex<()>,
}

impl<S: StorageEngine + ?Sized> Registry<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            game_creation: Mutex::new(()),
        }
    }

    pub async fn known_members(&self) -> Result<HashSet<MemberId>> {
        Ok(self.storage.member_ids().await?.into_iter().collect())
    }

    /// Return `id` once a member record exists for it. The display name of
    /// an existing member is left as first recorded.
    pub async fn ensure_member(
        &self,
        id: MemberId,
        display_name: &str,
        at: Timestamp,
    ) -> Result<MemberId> {
        if self.storage.get_member(id).await?.is_some() {
            return Ok(id);
        }

        let member = Member {
            id,
            display_name: display_name.to_string(),
            first_seen_at: at,
        };
        match self.storage.insert_member(member).await {
            Ok(()) => {
                info!(member = %id, display_name, "registered member");
                Ok(id)
            }
            Err(err) if err.is_constraint_violation() => {
                debug!(member = %id, "member registered concurrently, re-reading");
                match self.storage.get_member(id).await? {
                    Some(_) => Ok(id),
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub async fn find_game(&self, name: &str) -> Result<Option<GameId>> {
        Ok(self.storage.find_game_by_name(name).await?.map(|game| game.id))
    }

    /// Return the id of the game named exactly `name`, creating it with
    /// `first_member` as its discoverer if no such game exists.
    pub async fn ensure_game(
        &self,
        name: &str,
        first_member: MemberId,
        at: Timestamp,
    ) -> Result<GameId> {
        if name.is_empty() {
            return Err(TrackerError::Validation(
                "game name must not be empty".to_string(),
            ));
        }
        if let Some(id) = self.find_game(name).await? {
            return Ok(id);
        }

        let _creating = self.game_creation.lock().await;
        if let Some(id) = self.find_game(name).await? {
            return Ok(id);
        }

        let new_game = NewGame {
            name: name.to_string(),
            first_seen_at: at,
            first_member_id: first_member,
        };
        match self.storage.insert_game(new_game).await {
            Ok(game) => {
                info!(game = %game.id, name, first_member = %first_member, "registered game");
                Ok(game.id)
            }
            Err(err) if err.is_constraint_violation() => {
                debug!(name, "game created by another writer, re-reading");
                self.find_game(name).await?.ok_or(err)
            }
            Err(err) => Err(err),
        }
    }
}
