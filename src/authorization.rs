//! Ownership predicates and listing filters.
//!
//! Everything here is pure: callers load entities from the store and pass
//! them in. Administrator bypass for endpoint, group and registry access is
//! applied by callers (the `filter_*` helpers do it for listings).

use crate::models::{
    AuthorizationContext, Endpoint, EndpointGroup, MembershipRole, Registry, ResourceControl,
    Stack, TeamId, TeamMembership, UserId,
};

fn authorized_by_lists(
    users: &[UserId],
    teams: &[TeamId],
    user_id: UserId,
    memberships: &[TeamMembership],
) -> bool {
    users.contains(&user_id)
        || memberships
            .iter()
            .any(|membership| teams.contains(&membership.team_id))
}

pub fn authorized_endpoint_access(
    endpoint: &Endpoint,
    group: Option<&EndpointGroup>,
    user_id: UserId,
    memberships: &[TeamMembership],
) -> bool {
    if let Some(group) = group
        && authorized_endpoint_group_access(group, user_id, memberships)
    {
        return true;
    }
    authorized_by_lists(
        &endpoint.authorized_users,
        &endpoint.authorized_teams,
        user_id,
        memberships,
    )
}

pub fn authorized_endpoint_group_access(
    group: &EndpointGroup,
    user_id: UserId,
    memberships: &[TeamMembership],
) -> bool {
    authorized_by_lists(
        &group.authorized_users,
        &group.authorized_teams,
        user_id,
        memberships,
    )
}

pub fn authorized_registry_access(
    registry: &Registry,
    user_id: UserId,
    memberships: &[TeamMembership],
) -> bool {
    authorized_by_lists(
        &registry.authorized_users,
        &registry.authorized_teams,
        user_id,
        memberships,
    )
}

/// Whether the caller may see or operate on a resource covered by `control`.
pub fn authorized_resource_control_access(
    control: &ResourceControl,
    ctx: &AuthorizationContext,
) -> bool {
    if ctx.is_admin {
        return true;
    }
    if control.administrators_only {
        return false;
    }
    control
        .user_accesses
        .iter()
        .any(|access| access.user_id == ctx.user_id)
        || control
            .team_accesses
            .iter()
            .any(|access| ctx.team_ids().any(|team| team == access.team_id))
}

/// A non-admin may only create a control naming themselves as the single
/// user, or teams they belong to.
pub fn authorized_resource_control_creation(
    control: &ResourceControl,
    ctx: &AuthorizationContext,
) -> bool {
    if ctx.is_admin {
        return true;
    }
    if control.administrators_only {
        return false;
    }

    if !control.user_accesses.is_empty() {
        if control.user_accesses.len() > 1 {
            return false;
        }
        if control.user_accesses[0].user_id == ctx.user_id {
            return true;
        }
    }

    control
        .team_accesses
        .iter()
        .any(|access| ctx.team_ids().any(|team| team == access.team_id))
}

pub fn authorized_resource_control_update(
    control: &ResourceControl,
    ctx: &AuthorizationContext,
) -> bool {
    authorized_resource_control_access(control, ctx)
}

pub fn authorized_resource_control_deletion(
    control: &ResourceControl,
    ctx: &AuthorizationContext,
) -> bool {
    authorized_resource_control_access(control, ctx)
}

pub fn authorized_team_management(team_id: TeamId, ctx: &AuthorizationContext) -> bool {
    if ctx.is_admin {
        return true;
    }
    ctx.memberships
        .iter()
        .any(|membership| membership.team_id == team_id && membership.role == MembershipRole::Leader)
}

/// Finds the control whose primary id or one of its sub-resource ids matches.
pub fn resource_control_by_resource_id<'a>(
    resource_id: &str,
    controls: &'a [ResourceControl],
) -> Option<&'a ResourceControl> {
    controls.iter().find(|control| control.covers(resource_id))
}

pub fn filter_endpoints(
    endpoints: Vec<Endpoint>,
    groups: &[EndpointGroup],
    ctx: &AuthorizationContext,
) -> Vec<Endpoint> {
    if ctx.is_admin {
        return endpoints;
    }
    endpoints
        .into_iter()
        .filter(|endpoint| {
            let group = groups.iter().find(|group| group.id == endpoint.group_id);
            authorized_endpoint_access(endpoint, group, ctx.user_id, &ctx.memberships)
        })
        .collect()
}

pub fn filter_endpoint_groups(
    groups: Vec<EndpointGroup>,
    ctx: &AuthorizationContext,
) -> Vec<EndpointGroup> {
    if ctx.is_admin {
        return groups;
    }
    groups
        .into_iter()
        .filter(|group| authorized_endpoint_group_access(group, ctx.user_id, &ctx.memberships))
        .collect()
}

pub fn filter_registries(registries: Vec<Registry>, ctx: &AuthorizationContext) -> Vec<Registry> {
    if ctx.is_admin {
        return registries;
    }
    registries
        .into_iter()
        .filter(|registry| authorized_registry_access(registry, ctx.user_id, &ctx.memberships))
        .collect()
}

/// Stacks without a control are visible to everyone.
pub fn filter_stacks(
    stacks: Vec<Stack>,
    controls: &[ResourceControl],
    ctx: &AuthorizationContext,
) -> Vec<Stack> {
    if ctx.is_admin {
        return stacks;
    }
    stacks
        .into_iter()
        .filter(
            |stack| match resource_control_by_resource_id(&stack.name, controls) {
                Some(control) => authorized_resource_control_access(control, ctx),
                None => true,
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AccessLevel, AuthorizationContext, EndpointGroupId, EndpointId, EndpointType,
        ResourceControlId, ResourceControlType, TeamMembershipId, TeamResourceAccess,
        UserResourceAccess,
    };

    fn endpoint(id: u32, group: u32, users: Vec<u32>, teams: Vec<u32>) -> Endpoint {
        Endpoint {
            id: EndpointId(id),
            name: format!("endpoint-{id}"),
            endpoint_type: EndpointType::Docker,
            url: "tcp://127.0.0.1:2375".to_string(),
            public_url: String::new(),
            group_id: EndpointGroupId(group),
            tls_config: Default::default(),
            azure_credentials: Default::default(),
            authorized_users: users.into_iter().map(UserId).collect(),
            authorized_teams: teams.into_iter().map(TeamId).collect(),
            extensions: Vec::new(),
        }
    }

    fn group(id: u32, users: Vec<u32>, teams: Vec<u32>) -> EndpointGroup {
        EndpointGroup {
            id: EndpointGroupId(id),
            name: format!("group-{id}"),
            description: String::new(),
            authorized_users: users.into_iter().map(UserId).collect(),
            authorized_teams: teams.into_iter().map(TeamId).collect(),
        }
    }

    fn membership(user: u32, team: u32, role: MembershipRole) -> TeamMembership {
        TeamMembership {
            id: TeamMembershipId(team * 100 + user),
            user_id: UserId(user),
            team_id: TeamId(team),
            role,
        }
    }

    fn standard(user: u32, memberships: Vec<TeamMembership>) -> AuthorizationContext {
        AuthorizationContext {
            is_admin: false,
            is_team_leader: memberships
                .iter()
                .any(|membership| membership.role == MembershipRole::Leader),
            user_id: UserId(user),
            memberships,
        }
    }

    fn control(users: Vec<u32>, teams: Vec<u32>, admins_only: bool) -> ResourceControl {
        ResourceControl {
            id: ResourceControlId(1),
            resource_id: "abc".to_string(),
            sub_resource_ids: vec!["sub-1".to_string()],
            resource_type: ResourceControlType::Container,
            administrators_only: admins_only,
            user_accesses: users
                .into_iter()
                .map(|user| UserResourceAccess {
                    user_id: UserId(user),
                    access_level: AccessLevel::ReadWrite,
                })
                .collect(),
            team_accesses: teams
                .into_iter()
                .map(|team| TeamResourceAccess {
                    team_id: TeamId(team),
                    access_level: AccessLevel::ReadWrite,
                })
                .collect(),
        }
    }

    #[test]
    fn endpoint_access_is_granted_through_group() {
        let endpoint = endpoint(1, 2, vec![], vec![]);
        let group = group(2, vec![], vec![9]);
        let memberships = vec![membership(5, 9, MembershipRole::Member)];
        assert!(authorized_endpoint_access(
            &endpoint,
            Some(&group),
            UserId(5),
            &memberships
        ));
        assert!(!authorized_endpoint_access(
            &endpoint,
            None,
            UserId(5),
            &memberships
        ));
    }

    #[test]
    fn endpoint_team_access_follows_membership() {
        let endpoint = endpoint(1, 2, vec![], vec![1]);
        let group = group(2, vec![], vec![]);
        let memberships = vec![membership(5, 1, MembershipRole::Member)];
        assert!(authorized_endpoint_access(
            &endpoint,
            Some(&group),
            UserId(5),
            &memberships
        ));
        assert!(!authorized_endpoint_access(
            &endpoint,
            Some(&group),
            UserId(5),
            &[]
        ));
    }

    #[test]
    fn endpoint_access_is_granted_directly() {
        let endpoint = endpoint(1, 1, vec![5], vec![]);
        assert!(authorized_endpoint_access(&endpoint, None, UserId(5), &[]));
        assert!(!authorized_endpoint_access(&endpoint, None, UserId(6), &[]));
    }

    #[test]
    fn group_access_requires_membership_in_listed_team() {
        let group = group(3, vec![], vec![4]);
        let memberships = vec![membership(5, 7, MembershipRole::Member)];
        assert!(!authorized_endpoint_group_access(
            &group,
            UserId(5),
            &memberships
        ));
    }

    #[test]
    fn filter_endpoints_keeps_order_and_authorized_items() {
        let endpoints = vec![
            endpoint(1, 1, vec![5], vec![]),
            endpoint(2, 1, vec![], vec![]),
            endpoint(3, 2, vec![], vec![]),
            endpoint(4, 1, vec![5], vec![8]),
        ];
        let groups = vec![group(1, vec![], vec![]), group(2, vec![], vec![8])];
        let ctx = standard(5, vec![membership(5, 8, MembershipRole::Member)]);
        let ids = filter_endpoints(endpoints, &groups, &ctx)
            .into_iter()
            .map(|endpoint| endpoint.id.0)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn filters_are_identity_for_admins() {
        let endpoints = vec![endpoint(1, 1, vec![], vec![]), endpoint(2, 1, vec![], vec![])];
        let filtered = filter_endpoints(
            endpoints.clone(),
            &[],
            &AuthorizationContext::administrator(UserId(1)),
        );
        assert_eq!(filtered, endpoints);
    }

    #[test]
    fn administrators_only_controls_reject_non_admins() {
        let control = control(vec![5], vec![], true);
        let ctx = standard(5, vec![]);
        assert!(!authorized_resource_control_access(&control, &ctx));
        assert!(!authorized_resource_control_creation(&control, &ctx));
        assert!(!authorized_resource_control_update(&control, &ctx));
        assert!(!authorized_resource_control_deletion(&control, &ctx));
        let admin = AuthorizationContext::administrator(UserId(1));
        assert!(authorized_resource_control_access(&control, &admin));
    }

    #[test]
    fn resource_control_access_through_team() {
        let control = control(vec![], vec![3], false);
        let member = standard(5, vec![membership(5, 3, MembershipRole::Member)]);
        let outsider = standard(6, vec![membership(6, 4, MembershipRole::Member)]);
        assert!(authorized_resource_control_access(&control, &member));
        assert!(!authorized_resource_control_access(&control, &outsider));
    }

    #[test]
    fn creation_rejects_multiple_users_for_non_admin() {
        let ctx = standard(5, vec![]);
        assert!(authorized_resource_control_creation(
            &control(vec![5], vec![], false),
            &ctx
        ));
        assert!(!authorized_resource_control_creation(
            &control(vec![5, 6], vec![], false),
            &ctx
        ));
        assert!(!authorized_resource_control_creation(
            &control(vec![6], vec![], false),
            &ctx
        ));
    }

    #[test]
    fn resource_control_lookup_matches_sub_resources() {
        let controls = vec![control(vec![1], vec![], false)];
        assert!(resource_control_by_resource_id("abc", &controls).is_some());
        assert!(resource_control_by_resource_id("sub-1", &controls).is_some());
        assert!(resource_control_by_resource_id("other", &controls).is_none());
    }

    #[test]
    fn team_management_requires_leadership_of_that_team() {
        let ctx = standard(
            5,
            vec![
                membership(5, 1, MembershipRole::Leader),
                membership(5, 2, MembershipRole::Member),
            ],
        );
        assert!(authorized_team_management(TeamId(1), &ctx));
        assert!(!authorized_team_management(TeamId(2), &ctx));
        assert!(!authorized_team_management(TeamId(3), &ctx));
        assert!(authorized_team_management(
            TeamId(3),
            &AuthorizationContext::administrator(UserId(1))
        ));
    }

    #[test]
    fn stacks_without_control_stay_visible() {
        let stacks = vec![
            Stack {
                id: "web_swarm".to_string(),
                name: "web".to_string(),
                swarm_id: "swarm".to_string(),
                entry_point: "docker-compose.yml".to_string(),
                project_path: "/data/compose/web_swarm".to_string(),
                env: vec![],
            },
            Stack {
                id: "abc_swarm".to_string(),
                name: "abc".to_string(),
                swarm_id: "swarm".to_string(),
                entry_point: "docker-compose.yml".to_string(),
                project_path: "/data/compose/abc_swarm".to_string(),
                env: vec![],
            },
        ];
        let controls = vec![control(vec![9], vec![], false)];
        let visible = filter_stacks(stacks, &controls, &standard(5, vec![]));
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "web");
    }
}
