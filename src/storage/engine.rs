use crate::core::{
    Game, Member, MemberId, NewGame, NewSession, Result, Session, SessionId, Timestamp,
};
use async_trait::async_trait;

/// Storage engine trait - allows pluggable storage backends
///
/// Row-level operations over the `members`, `games` and `sessions` tables.
/// Implementations execute what they are asked to and enforce key
/// constraints; they never decide business transitions. Each mutating call
/// is atomic on its own.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// All registered member ids
    async fn member_ids(&self) -> Result<Vec<MemberId>>;

    async fn get_member(&self, id: MemberId) -> Result<Option<Member>>;

    /// Insert a member; an existing id is a `ConstraintViolation`
    async fn insert_member(&self, member: Member) -> Result<()>;

    /// Exact-name lookup; absence is `Ok(None)`
    async fn find_game_by_name(&self, name: &str) -> Result<Option<Game>>;

    /// Insert a game; a duplicate name is a `ConstraintViolation`
    async fn insert_game(&self, game: NewGame) -> Result<Game>;

    async fn list_games(&self) -> Result<Vec<Game>>;

    async fn insert_session(&self, session: NewSession) -> Result<Session>;

    /// Open sessions (`ended_at IS NULL`) of one member
    async fn open_sessions(&self, member: MemberId) -> Result<Vec<Session>>;

    /// Open sessions of every member
    async fn all_open_sessions(&self) -> Result<Vec<Session>>;

    /// Set `ended_at` on the given sessions that are still open.
    /// Returns how many rows changed.
    async fn end_sessions(&self, ids: &[SessionId], at: Timestamp) -> Result<usize>;

    /// Remove the given sessions. Returns how many rows were removed.
    async fn delete_sessions(&self, ids: &[SessionId]) -> Result<usize>;

    /// Sessions ordered by id, optionally restricted to one member
    async fn list_sessions(&self, member: Option<MemberId>) -> Result<Vec<Session>>;
}
