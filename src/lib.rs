// ============================================================================
// playtrack Library
// ============================================================================

//! Turns a polled, noisy presence signal into durable play sessions.
//!
//! A [`Tracker`] is started once per process over a [`StorageEngine`] and a
//! [`SignalSource`]; starting it discards sessions left open by a previous
//! process. Each [`Tracker::tick`] then reads the source and converges the
//! stored sessions so that every member has at most one open session.
//!
//! ```
//! use playtrack::{
//!     GroupConfig, GroupId, InMemoryStorage, MemberId, Presence, PresenceStatus, RoleId,
//!     RosterMember, SnapshotSignalSource, Tracker, TrackerConfig,
//! };
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let source = SnapshotSignalSource::new();
//! source
//!     .add_member(GroupId(1), RosterMember {
//!         id: MemberId(7),
//!         display_name: "U".to_string(),
//!         roles: [RoleId(10)].into_iter().collect(),
//!     })
//!     .await;
//! source
//!     .set_presence(MemberId(7), Presence::playing(PresenceStatus::Online, "Skyrim"))
//!     .await;
//!
//! let config = TrackerConfig::new()
//!     .group(GroupConfig::new(GroupId(1)).role("admin", RoleId(10)));
//! let storage = Arc::new(InMemoryStorage::new());
//! let tracker = Tracker::start(storage, source, &config).await?;
//!
//! let report = tracker.tick(chrono::Utc::now()).await?;
//! assert_eq!(report.sessions_opened, 1);
//! # Ok::<(), playtrack::TrackerError>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod core;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod storage;

pub use config::{GroupConfig, TrackerConfig};
pub use core::{
    Game, GameId, GroupId, Member, MemberId, Result, RoleId, Session, SessionId, Timestamp,
    TrackerError,
};
pub use policy::{Eligibility, RolePolicy};
pub use reconcile::{MemberFailure, MemberOutcome, TickReport, Tracker, Transition};
pub use registry::Registry;
pub use session::{OpenOutcome, SessionStore};
pub use source::{Presence, PresenceStatus, RosterMember, SignalSource, SnapshotSignalSource};
pub use storage::{DurabilityMode, InMemoryStorage, StorageEngine};
