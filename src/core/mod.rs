pub mod error;
pub mod types;

pub use error::{Result, TrackerError};
pub use types::{
    Game, GameId, GroupId, Member, MemberId, NewGame, NewSession, RoleId, Session, SessionId,
    Timestamp,
};
