//! Role-based eligibility.
//!
//! A member is tracked when it holds at least one tracked role and no
//! excluded role. Exclusion always wins, whatever order the roles are
//! configured or reported in. Role names are resolved to ids per group, so a
//! role that exists under the same name in two groups may carry different ids.

use crate::core::{GroupId, RoleId};
use std::collections::{HashMap, HashSet};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Tracked,
    /// Holds no tracked role
    NotTracked,
    /// Holds an excluded role
    Excluded,
    /// The group has no role mapping
    UnknownGroup,
}

impl Eligibility {
    pub fn is_tracked(self) -> bool {
        self == Self::Tracked
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct GroupRoles {
    tracked: HashSet<RoleId>,
    excluded: HashSet<RoleId>,
}

#[derive(Debug, Clone, Default)]
pub struct RolePolicy {
    groups: HashMap<GroupId, GroupRoles>,
}

impl RolePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the tracked and excluded role names against one group's
    /// name-to-id mapping. Names missing from the mapping are logged and
    /// ignored for that group.
    pub fn add_group(
        &mut self,
        group: GroupId,
        role_ids: &HashMap<String, RoleId>,
        tracked: &[String],
        excluded: &[String],
    ) {
        let resolve = |names: &[String]| -> HashSet<RoleId> {
            names
                .iter()
                .filter_map(|name| {
                    let id = role_ids.get(name).copied();
                    if id.is_none() {
                        warn!(group = %group, role = %name, "role name not present in group");
                    }
                    id
                })
                .collect()
        };

        let roles = GroupRoles {
            tracked: resolve(tracked),
            excluded: resolve(excluded),
        };
        self.groups.insert(group, roles);
    }

    pub fn eligibility(&self, group: GroupId, roles: &HashSet<RoleId>) -> Eligibility {
        let Some(group_roles) = self.groups.get(&group) else {
            return Eligibility::UnknownGroup;
        };
        if !group_roles.excluded.is_disjoint(roles) {
            Eligibility::Excluded
        } else if !group_roles.tracked.is_disjoint(roles) {
            Eligibility::Tracked
        } else {
            Eligibility::NotTracked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RolePolicy {
        let mut policy = RolePolicy::new();
        let roles = HashMap::from([
            ("admin".to_string(), RoleId(1)),
            ("gamer".to_string(), RoleId(2)),
            ("bot".to_string(), RoleId(3)),
        ]);
        policy.add_group(
            GroupId(10),
            &roles,
            &["admin".to_string(), "gamer".to_string()],
            &["bot".to_string()],
        );
        policy
    }

    #[test]
    fn test_tracked_role_is_eligible() {
        let roles = HashSet::from([RoleId(2), RoleId(99)]);
        assert_eq!(policy().eligibility(GroupId(10), &roles), Eligibility::Tracked);
    }

    #[test]
    fn test_exclusion_wins_over_tracking() {
        let roles = HashSet::from([RoleId(1), RoleId(3)]);
        assert_eq!(policy().eligibility(GroupId(10), &roles), Eligibility::Excluded);
    }

    #[test]
    fn test_no_tracked_role() {
        let roles = HashSet::from([RoleId(99)]);
        assert_eq!(policy().eligibility(GroupId(10), &roles), Eligibility::NotTracked);
        assert_eq!(
            policy().eligibility(GroupId(10), &HashSet::new()),
            Eligibility::NotTracked
        );
    }

    #[test]
    fn test_mapping_is_per_group() {
        let mut policy = policy();
        let other = HashMap::from([("admin".to_string(), RoleId(50))]);
        policy.add_group(GroupId(20), &other, &["admin".to_string()], &["bot".to_string()]);

        let roles = HashSet::from([RoleId(1)]);
        assert!(policy.eligibility(GroupId(10), &roles).is_tracked());
        assert_eq!(policy.eligibility(GroupId(20), &roles), Eligibility::NotTracked);
        assert!(policy
            .eligibility(GroupId(20), &HashSet::from([RoleId(50)]))
            .is_tracked());
        assert_eq!(
            policy.eligibility(GroupId(30), &roles),
            Eligibility::UnknownGroup
        );
    }
}
