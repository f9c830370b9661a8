//! The periodic reconciliation loop.
//!
//! A tick reads the whole signal first (rosters, member details, presence)
//! without writing anything, then converges stored state member by member:
//!
//! ```text
//! NoSession --playing g--> Open(g)
//! Open(g)   --playing g--> Open(g)                      no write
//! Open(g)   --playing g2--> Open(g2)                    close g, open g2
//! Open(g)   --idle / no game / unobservable--> NoSession
//! ```
//!
//! A source failure aborts the tick before any write. A malformed roster or
//! presence entry only skips that member. A storage failure for one member is
//! reported and that member is retried on the next tick.

use crate::config::TrackerConfig;
use crate::core::{GameId, GroupId, MemberId, Result, Timestamp, TrackerError};
use crate::policy::{Eligibility, RolePolicy};
use crate::registry::Registry;
use crate::session::{OpenOutcome, SessionStore};
use crate::source::{Presence, PresenceStatus, RosterMember, SignalSource};
use crate::storage::StorageEngine;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, debug, event, info, info_span, warn};

/// How one member's stored state moved during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Presence could not be resolved; open sessions were closed
    Unobservable { closed: usize },
    /// Idle or not playing anything; open sessions were closed
    Stopped { closed: usize },
    /// Still playing the game of the open session
    Continued { game: GameId },
    /// A new session was opened, after closing `closed` others
    Started { game: GameId, closed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberOutcome {
    pub member: MemberId,
    /// A member record was created this tick
    pub registered: bool,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub member: MemberId,
    pub error: String,
}

/// Summary of one completed tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub at: Timestamp,
    /// Distinct members across all rosters
    pub roster_size: usize,
    pub ineligible: usize,
    /// Roster or presence entries that could not be resolved or were
    /// malformed; those members were left untouched
    pub invalid: usize,
    pub signal_misses: usize,
    pub registered: usize,
    pub sessions_opened: usize,
    pub sessions_closed: usize,
    /// Members reconciled successfully, ordered by id
    pub members: Vec<MemberOutcome>,
    /// Members skipped because a write failed, ordered by id
    pub failures: Vec<MemberFailure>,
}

impl TickReport {
    fn new(at: Timestamp) -> Self {
        Self {
            at,
            roster_size: 0,
            ineligible: 0,
            invalid: 0,
            signal_misses: 0,
            registered: 0,
            sessions_opened: 0,
            sessions_closed: 0,
            members: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn processed(&self) -> usize {
        self.members.len()
    }

    fn record(&mut self, outcome: MemberOutcome) {
        if outcome.registered {
            self.registered += 1;
        }
        match outcome.transition {
            Transition::Unobservable { closed } => {
                self.signal_misses += 1;
                self.sessions_closed += closed;
            }
            Transition::Stopped { closed } => self.sessions_closed += closed,
            Transition::Continued { .. } => {}
            Transition::Started { closed, .. } => {
                self.sessions_opened += 1;
                self.sessions_closed += closed;
            }
        }
        self.members.push(outcome);
    }
}

#[derive(Debug, Clone)]
struct Observation {
    group: GroupId,
    member: RosterMember,
    presence: Option<Presence>,
}

/// Owns the registries and the session store and drives them from the
/// signal source. Constructed only through `start`, which discards sessions
/// left open by a previous process before the first tick can run.
pub struct Tracker<S: ?Sized, P> {
    storage: Arc<S>,
    registry: Registry<S>,
    sessions: SessionStore<S>,
    source: P,
    policy: RolePolicy,
    groups: Vec<GroupId>,
    member_concurrency: usize,
    tick_lock: Mutex<()>,
}

impl<S, P> Tracker<S, P>
where
    S: StorageEngine + ?Sized,
    P: SignalSource,
{
    pub async fn start(storage: Arc<S>, source: P, config: &TrackerConfig) -> Result<Self> {
        config.validate()?;

        let mut policy = RolePolicy::new();
        for group in &config.groups {
            let role_ids = if group.roles.is_empty() {
                source
                    .group_roles(group.id)
                    .await
                    .map_err(source_unavailable)?
            } else {
                group.roles.clone()
            };
            if role_ids.is_empty() {
                warn!(group = %group.id, "no role mapping, no member of this group is eligible");
            }
            policy.add_group(
                group.id,
                &role_ids,
                &config.tracked_roles,
                &config.excluded_roles,
            );
        }

        let sessions = SessionStore::new(Arc::clone(&storage));
        let discarded = sessions.cleanup_on_startup().await?;
        info!(
            discarded,
            groups = config.groups.len(),
            "tracker started"
        );

        Ok(Self {
            registry: Registry::new(Arc::clone(&storage)),
            sessions,
            storage,
            source,
            policy,
            groups: config.groups.iter().map(|g| g.id).collect(),
            member_concurrency: config.member_concurrency.max(1),
            tick_lock: Mutex::new(()),
        })
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn registry(&self) -> &Registry<S> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore<S> {
        &self.sessions
    }

    pub fn source(&self) -> &P {
        &self.source
    }

    /// Run one reconciliation pass as of `now`.
    ///
    /// Concurrent calls are serialized. An `Err` means the tick was aborted
    /// before it wrote anything (source unavailable, or the known-member
    /// read failed); per-member write failures are in the report instead.
    pub async fn tick(&self, now: Timestamp) -> Result<TickReport> {
        let _running = self.tick_lock.lock().await;
        let span = info_span!("tick", at = %now);
        self.run_tick(now).instrument(span).await
    }

    async fn run_tick(&self, now: Timestamp) -> Result<TickReport> {
        let known = self.registry.known_members().await?;
        let (observations, mut report) = self.observe(now).await?;

        let known = &known;
        let mut outcomes: Vec<(MemberId, Result<MemberOutcome>)> = stream::iter(observations)
            .map(|obs| async move {
                let member = obs.member.id;
                (member, self.reconcile_member(obs, known, now).await)
            })
            .buffer_unordered(self.member_concurrency)
            .collect()
            .await;
        outcomes.sort_by_key(|(member, _)| *member);

        for (member, outcome) in outcomes {
            match outcome {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    event!(Level::WARN, member = %member, error = %err, "member skipped this tick");
                    report.failures.push(MemberFailure {
                        member,
                        error: err.to_string(),
                    });
                }
            }
        }

        event!(
            Level::INFO,
            roster = report.roster_size,
            processed = report.processed(),
            ineligible = report.ineligible,
            invalid = report.invalid,
            signal_misses = report.signal_misses,
            opened = report.sessions_opened,
            closed = report.sessions_closed,
            failed = report.failures.len(),
            "tick complete"
        );
        Ok(report)
    }

    /// Read-only phase: everything the tick needs from the source
    async fn observe(&self, now: Timestamp) -> Result<(Vec<Observation>, TickReport)> {
        self.source.refresh().await.map_err(source_unavailable)?;

        let mut report = TickReport::new(now);
        let mut roster_ids = HashSet::new();
        let mut ineligible = HashSet::new();
        let mut observed_ids = HashSet::new();
        let mut observations = Vec::new();

        for &group in &self.groups {
            let roster = self
                .source
                .roster(group)
                .await
                .map_err(source_unavailable)?;

            for member_id in roster {
                roster_ids.insert(member_id);
                if observed_ids.contains(&member_id) {
                    continue;
                }

                let member = match self.source.member(group, member_id).await {
                    Ok(Some(member)) => member,
                    Ok(None) => {
                        debug!(group = %group, member = %member_id, "roster entry no longer resolvable");
                        report.invalid += 1;
                        continue;
                    }
                    Err(TrackerError::Validation(reason)) => {
                        warn!(group = %group, member = %member_id, %reason, "skipping malformed roster entry");
                        report.invalid += 1;
                        continue;
                    }
                    Err(err) => return Err(source_unavailable(err)),
                };
                if member.id != member_id {
                    warn!(
                        group = %group,
                        member = %member_id,
                        resolved = %member.id,
                        "roster entry resolved to a different member"
                    );
                    report.invalid += 1;
                    continue;
                }

                match self.policy.eligibility(group, &member.roles) {
                    Eligibility::Tracked => {}
                    _ => {
                        ineligible.insert(member_id);
                        continue;
                    }
                }

                // Settled for this tick, whatever its presence turns out to be
                observed_ids.insert(member_id);
                let presence = match self.source.presence(member_id).await {
                    Ok(presence) => presence,
                    Err(TrackerError::Validation(reason)) => {
                        warn!(member = %member_id, %reason, "skipping malformed presence entry");
                        report.invalid += 1;
                        continue;
                    }
                    Err(err) => return Err(source_unavailable(err)),
                };
                observations.push(Observation {
                    group,
                    member,
                    presence,
                });
            }
        }

        report.roster_size = roster_ids.len();
        report.ineligible = ineligible.difference(&observed_ids).count();
        Ok((observations, report))
    }

    /// Converge one member onto its observed play-state
    async fn reconcile_member(
        &self,
        obs: Observation,
        known: &HashSet<MemberId>,
        now: Timestamp,
    ) -> Result<MemberOutcome> {
        let member = obs.member.id;

        let Some(presence) = obs.presence else {
            let closed = self.sessions.close_all_open(member, now).await?;
            debug!(group = %obs.group, member = %member, closed, "presence unresolved, member unobservable");
            return Ok(MemberOutcome {
                member,
                registered: false,
                transition: Transition::Unobservable { closed },
            });
        };

        let registered = !known.contains(&member);
        if registered {
            self.registry
                .ensure_member(member, &obs.member.display_name, now)
                .await?;
        }

        let playing = match presence.status {
            PresenceStatus::Idle => None,
            _ => presence.current_application(),
        };

        let transition = match playing {
            None => Transition::Stopped {
                closed: self.sessions.close_all_open(member, now).await?,
            },
            Some(application) => {
                let game = self.registry.ensure_game(application, member, now).await?;
                match self.sessions.open_session(member, game, now).await? {
                    OpenOutcome::Unchanged => Transition::Continued { game },
                    OpenOutcome::Opened { closed, .. } => Transition::Started { game, closed },
                }
            }
        };

        Ok(MemberOutcome {
            member,
            registered,
            transition,
        })
    }
}

fn source_unavailable(err: TrackerError) -> TrackerError {
    match err {
        TrackerError::SourceUnavailable(_) => err,
        other => TrackerError::SourceUnavailable(other.to_string()),
    }
}
