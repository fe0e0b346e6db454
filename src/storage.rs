use crate::{
    config::Config,
    constants::{
        API_ERROR_ENDPOINT_NOT_FOUND, API_ERROR_GROUP_NOT_FOUND, API_ERROR_MEMBERSHIP_EXISTS,
        API_ERROR_MEMBERSHIP_NOT_FOUND, API_ERROR_REGISTRY_NOT_FOUND,
        API_ERROR_RESOURCE_CONTROL_EXISTS, API_ERROR_RESOURCE_CONTROL_NOT_FOUND,
        API_ERROR_STACK_NOT_FOUND, API_ERROR_USER_EXISTS, API_ERROR_USER_NOT_FOUND,
        DEFAULT_ENDPOINT_GROUP_ID,
    },
    error::GatewayError,
    models::{
        DockerHub, Endpoint, EndpointGroup, EndpointGroupId, EndpointId, PersistedState, Registry,
        RegistryId, ResourceControl, ResourceControlId, Settings, Stack, TeamMembership,
        TeamMembershipId, User, UserId, UserRole,
    },
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Entity persistence used by the gateway. Lookups by id return
/// `GatewayError::NotFound` when the record does not exist.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn user(&self, id: UserId) -> Result<User, GatewayError>;
    async fn users(&self) -> Result<Vec<User>, GatewayError>;
    async fn create_user(&self, username: &str, role: UserRole) -> Result<User, GatewayError>;

    async fn endpoint(&self, id: EndpointId) -> Result<Endpoint, GatewayError>;
    async fn endpoints(&self) -> Result<Vec<Endpoint>, GatewayError>;
    async fn create_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, GatewayError>;
    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), GatewayError>;
    async fn delete_endpoint(&self, id: EndpointId) -> Result<(), GatewayError>;

    async fn endpoint_group(&self, id: EndpointGroupId) -> Result<EndpointGroup, GatewayError>;
    async fn endpoint_groups(&self) -> Result<Vec<EndpointGroup>, GatewayError>;
    async fn create_endpoint_group(
        &self,
        group: EndpointGroup,
    ) -> Result<EndpointGroup, GatewayError>;
    async fn update_endpoint_group(&self, group: &EndpointGroup) -> Result<(), GatewayError>;
    /// Removes the group and moves its endpoints back to the default group.
    async fn delete_endpoint_group(&self, id: EndpointGroupId) -> Result<(), GatewayError>;

    async fn resource_control(
        &self,
        id: ResourceControlId,
    ) -> Result<ResourceControl, GatewayError>;
    async fn resource_control_by_resource_id(
        &self,
        resource_id: &str,
    ) -> Result<ResourceControl, GatewayError>;
    async fn resource_controls(&self) -> Result<Vec<ResourceControl>, GatewayError>;
    async fn create_resource_control(
        &self,
        control: ResourceControl,
    ) -> Result<ResourceControl, GatewayError>;
    async fn update_resource_control(&self, control: &ResourceControl)
    -> Result<(), GatewayError>;
    async fn delete_resource_control(&self, id: ResourceControlId) -> Result<(), GatewayError>;

    async fn team_membership(
        &self,
        id: TeamMembershipId,
    ) -> Result<TeamMembership, GatewayError>;
    async fn team_memberships(&self) -> Result<Vec<TeamMembership>, GatewayError>;
    async fn team_memberships_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TeamMembership>, GatewayError>;
    async fn create_team_membership(
        &self,
        membership: TeamMembership,
    ) -> Result<TeamMembership, GatewayError>;
    async fn update_team_membership(
        &self,
        membership: &TeamMembership,
    ) -> Result<(), GatewayError>;
    async fn delete_team_membership(&self, id: TeamMembershipId) -> Result<(), GatewayError>;

    async fn registry(&self, id: RegistryId) -> Result<Registry, GatewayError>;
    async fn registries(&self) -> Result<Vec<Registry>, GatewayError>;
    async fn create_registry(&self, registry: Registry) -> Result<Registry, GatewayError>;
    async fn update_registry(&self, registry: &Registry) -> Result<(), GatewayError>;

    async fn dockerhub(&self) -> Result<DockerHub, GatewayError>;
    async fn update_dockerhub(&self, dockerhub: DockerHub) -> Result<(), GatewayError>;

    async fn stack(&self, id: &str) -> Result<Stack, GatewayError>;
    async fn stacks(&self) -> Result<Vec<Stack>, GatewayError>;
    /// Fails with a conflict when the id or, ignoring case, the name is
    /// already taken.
    async fn create_stack(&self, stack: Stack) -> Result<(), GatewayError>;
    async fn update_stack(&self, stack: &Stack) -> Result<(), GatewayError>;
    async fn delete_stack(&self, id: &str) -> Result<(), GatewayError>;

    async fn settings(&self) -> Result<Settings, GatewayError>;
    async fn update_settings(&self, settings: Settings) -> Result<(), GatewayError>;
}

/// JSON-file backed store. Every mutation is applied to a copy of the state,
/// written to disk, then swapped in under the same write lock.
pub struct Store {
    state: RwLock<PersistedState>,
    state_file: PathBuf,
}

impl Store {
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: &Config) -> Result<Self, GatewayError> {
        Self::open_at(&config.data_dir).await
    }

    pub async fn open_at(data_dir: &Path) -> Result<Self, GatewayError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let state_file = data_dir.join("state.json");
        let state = if tokio::fs::try_exists(&state_file).await.unwrap_or(false) {
            let bytes = tokio::fs::read(&state_file).await?;
            if bytes.is_empty() {
                PersistedState::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            PersistedState::default()
        };

        debug!(
            endpoints = state.endpoints.len(),
            resource_controls = state.resource_controls.len(),
            "store initialized"
        );
        Ok(Self {
            state: RwLock::new(state),
            state_file,
        })
    }

    async fn persist_snapshot(&self, snapshot: &PersistedState) -> Result<(), GatewayError> {
        let tmp_file = self.state_file.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp_file, bytes).await?;
        tokio::fs::rename(&tmp_file, &self.state_file).await?;
        Ok(())
    }

    async fn mutate<T, F>(&self, apply: F) -> Result<T, GatewayError>
    where
        F: FnOnce(&mut PersistedState) -> Result<T, GatewayError> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let output = apply(&mut next)?;
        self.persist_snapshot(&next).await?;
        *state = next;
        Ok(output)
    }

    async fn read<T, F>(&self, view: F) -> T
    where
        F: FnOnce(&PersistedState) -> T + Send,
    {
        let state = self.state.read().await;
        view(&state)
    }
}

fn next_id<I: Iterator<Item = u32>>(ids: I) -> u32 {
    ids.max().unwrap_or(0) + 1
}

fn replace_by<T, P>(items: &mut [T], matches: P, value: T, missing: &str) -> Result<(), GatewayError>
where
    P: Fn(&T) -> bool,
{
    match items.iter_mut().find(|item| matches(item)) {
        Some(slot) => {
            *slot = value;
            Ok(())
        }
        None => Err(GatewayError::not_found(missing)),
    }
}

fn remove_by<T, P>(items: &mut Vec<T>, matches: P, missing: &str) -> Result<(), GatewayError>
where
    P: Fn(&T) -> bool,
{
    let before = items.len();
    items.retain(|item| !matches(item));
    if items.len() == before {
        return Err(GatewayError::not_found(missing));
    }
    Ok(())
}

#[async_trait]
impl DataStore for Store {
    async fn user(&self, id: UserId) -> Result<User, GatewayError> {
        self.read(|state| state.users.iter().find(|user| user.id == id).cloned())
            .await
            .ok_or_else(|| GatewayError::not_found(API_ERROR_USER_NOT_FOUND))
    }

    async fn users(&self) -> Result<Vec<User>, GatewayError> {
        Ok(self.read(|state| state.users.clone()).await)
    }

    #[instrument(skip(self))]
    async fn create_user(&self, username: &str, role: UserRole) -> Result<User, GatewayError> {
        let username = username.to_string();
        self.mutate(move |state| {
            if state
                .users
                .iter()
                .any(|user| user.username.eq_ignore_ascii_case(&username))
            {
                return Err(GatewayError::conflict(API_ERROR_USER_EXISTS));
            }
            let user = User {
                id: UserId(next_id(state.users.iter().map(|user| user.id.0))),
                username,
                role,
            };
            state.users.push(user.clone());
            Ok(user)
        })
        .await
    }

    async fn endpoint(&self, id: EndpointId) -> Result<Endpoint, GatewayError> {
        self.read(|state| {
            state
                .endpoints
                .iter()
                .find(|endpoint| endpoint.id == id)
                .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_ENDPOINT_NOT_FOUND))
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>, GatewayError> {
        Ok(self.read(|state| state.endpoints.clone()).await)
    }

    #[instrument(skip(self, endpoint), fields(name = %endpoint.name))]
    async fn create_endpoint(&self, mut endpoint: Endpoint) -> Result<Endpoint, GatewayError> {
        self.mutate(move |state| {
            endpoint.id = EndpointId(next_id(state.endpoints.iter().map(|e| e.id.0)));
            state.endpoints.push(endpoint.clone());
            Ok(endpoint)
        })
        .await
    }

    #[instrument(skip(self, endpoint), fields(endpoint_id = %endpoint.id))]
    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), GatewayError> {
        let endpoint = endpoint.clone();
        self.mutate(move |state| {
            let id = endpoint.id;
            replace_by(
                &mut state.endpoints,
                |item| item.id == id,
                endpoint,
                API_ERROR_ENDPOINT_NOT_FOUND,
            )
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_endpoint(&self, id: EndpointId) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            remove_by(
                &mut state.endpoints,
                |item| item.id == id,
                API_ERROR_ENDPOINT_NOT_FOUND,
            )
        })
        .await
    }

    async fn endpoint_group(&self, id: EndpointGroupId) -> Result<EndpointGroup, GatewayError> {
        self.read(|state| {
            state
                .endpoint_groups
                .iter()
                .find(|group| group.id == id)
                .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_GROUP_NOT_FOUND))
    }

    async fn endpoint_groups(&self) -> Result<Vec<EndpointGroup>, GatewayError> {
        Ok(self.read(|state| state.endpoint_groups.clone()).await)
    }

    #[instrument(skip(self, group), fields(name = %group.name))]
    async fn create_endpoint_group(
        &self,
        mut group: EndpointGroup,
    ) -> Result<EndpointGroup, GatewayError> {
        self.mutate(move |state| {
            if group.id.0 == 0 {
                group.id =
                    EndpointGroupId(next_id(state.endpoint_groups.iter().map(|g| g.id.0)));
            } else if state.endpoint_groups.iter().any(|g| g.id == group.id) {
                return Err(GatewayError::conflict("endpoint group already exists"));
            }
            state.endpoint_groups.push(group.clone());
            Ok(group)
        })
        .await
    }

    async fn update_endpoint_group(&self, group: &EndpointGroup) -> Result<(), GatewayError> {
        let group = group.clone();
        self.mutate(move |state| {
            let id = group.id;
            replace_by(
                &mut state.endpoint_groups,
                |item| item.id == id,
                group,
                API_ERROR_GROUP_NOT_FOUND,
            )
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_endpoint_group(&self, id: EndpointGroupId) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            remove_by(
                &mut state.endpoint_groups,
                |item| item.id == id,
                API_ERROR_GROUP_NOT_FOUND,
            )?;
            for endpoint in state
                .endpoints
                .iter_mut()
                .filter(|endpoint| endpoint.group_id == id)
            {
                endpoint.group_id = EndpointGroupId(DEFAULT_ENDPOINT_GROUP_ID);
            }
            Ok(())
        })
        .await
    }

    async fn resource_control(
        &self,
        id: ResourceControlId,
    ) -> Result<ResourceControl, GatewayError> {
        self.read(|state| {
            state
                .resource_controls
                .iter()
                .find(|control| control.id == id)
                .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_RESOURCE_CONTROL_NOT_FOUND))
    }

    async fn resource_control_by_resource_id(
        &self,
        resource_id: &str,
    ) -> Result<ResourceControl, GatewayError> {
        self.read(|state| {
            crate::authorization::resource_control_by_resource_id(
                resource_id,
                &state.resource_controls,
            )
            .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_RESOURCE_CONTROL_NOT_FOUND))
    }

    async fn resource_controls(&self) -> Result<Vec<ResourceControl>, GatewayError> {
        Ok(self.read(|state| state.resource_controls.clone()).await)
    }

    #[instrument(skip(self, control), fields(resource_id = %control.resource_id))]
    async fn create_resource_control(
        &self,
        mut control: ResourceControl,
    ) -> Result<ResourceControl, GatewayError> {
        self.mutate(move |state| {
            if state
                .resource_controls
                .iter()
                .any(|existing| existing.overlaps(&control))
            {
                return Err(GatewayError::conflict(API_ERROR_RESOURCE_CONTROL_EXISTS));
            }
            control.id = ResourceControlId(next_id(
                state.resource_controls.iter().map(|existing| existing.id.0),
            ));
            state.resource_controls.push(control.clone());
            Ok(control)
        })
        .await
    }

    #[instrument(skip(self, control), fields(resource_control_id = %control.id))]
    async fn update_resource_control(
        &self,
        control: &ResourceControl,
    ) -> Result<(), GatewayError> {
        let control = control.clone();
        self.mutate(move |state| {
            let id = control.id;
            if state
                .resource_controls
                .iter()
                .any(|existing| existing.id != id && existing.overlaps(&control))
            {
                return Err(GatewayError::conflict(API_ERROR_RESOURCE_CONTROL_EXISTS));
            }
            replace_by(
                &mut state.resource_controls,
                |item| item.id == id,
                control,
                API_ERROR_RESOURCE_CONTROL_NOT_FOUND,
            )
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_resource_control(&self, id: ResourceControlId) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            remove_by(
                &mut state.resource_controls,
                |item| item.id == id,
                API_ERROR_RESOURCE_CONTROL_NOT_FOUND,
            )
        })
        .await
    }

    async fn team_membership(
        &self,
        id: TeamMembershipId,
    ) -> Result<TeamMembership, GatewayError> {
        self.read(|state| {
            state
                .team_memberships
                .iter()
                .find(|membership| membership.id == id)
                .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_MEMBERSHIP_NOT_FOUND))
    }

    async fn team_memberships(&self) -> Result<Vec<TeamMembership>, GatewayError> {
        Ok(self.read(|state| state.team_memberships.clone()).await)
    }

    async fn team_memberships_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<TeamMembership>, GatewayError> {
        Ok(self
            .read(|state| {
                state
                    .team_memberships
                    .iter()
                    .filter(|membership| membership.user_id == user_id)
                    .cloned()
                    .collect()
            })
            .await)
    }

    #[instrument(skip(self, membership), fields(user_id = %membership.user_id, team_id = %membership.team_id))]
    async fn create_team_membership(
        &self,
        mut membership: TeamMembership,
    ) -> Result<TeamMembership, GatewayError> {
        self.mutate(move |state| {
            if state.team_memberships.iter().any(|existing| {
                existing.user_id == membership.user_id && existing.team_id == membership.team_id
            }) {
                return Err(GatewayError::conflict(API_ERROR_MEMBERSHIP_EXISTS));
            }
            membership.id = TeamMembershipId(next_id(
                state.team_memberships.iter().map(|existing| existing.id.0),
            ));
            state.team_memberships.push(membership.clone());
            Ok(membership)
        })
        .await
    }

    async fn update_team_membership(
        &self,
        membership: &TeamMembership,
    ) -> Result<(), GatewayError> {
        let membership = membership.clone();
        self.mutate(move |state| {
            let id = membership.id;
            replace_by(
                &mut state.team_memberships,
                |item| item.id == id,
                membership,
                API_ERROR_MEMBERSHIP_NOT_FOUND,
            )
        })
        .await
    }

    async fn delete_team_membership(&self, id: TeamMembershipId) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            remove_by(
                &mut state.team_memberships,
                |item| item.id == id,
                API_ERROR_MEMBERSHIP_NOT_FOUND,
            )
        })
        .await
    }

    async fn registry(&self, id: RegistryId) -> Result<Registry, GatewayError> {
        self.read(|state| {
            state
                .registries
                .iter()
                .find(|registry| registry.id == id)
                .cloned()
        })
        .await
        .ok_or_else(|| GatewayError::not_found(API_ERROR_REGISTRY_NOT_FOUND))
    }

    async fn registries(&self) -> Result<Vec<Registry>, GatewayError> {
        Ok(self.read(|state| state.registries.clone()).await)
    }

    #[instrument(skip(self, registry), fields(url = %registry.url))]
    async fn create_registry(&self, mut registry: Registry) -> Result<Registry, GatewayError> {
        self.mutate(move |state| {
            registry.id = RegistryId(next_id(state.registries.iter().map(|r| r.id.0)));
            state.registries.push(registry.clone());
            Ok(registry)
        })
        .await
    }

    async fn update_registry(&self, registry: &Registry) -> Result<(), GatewayError> {
        let registry = registry.clone();
        self.mutate(move |state| {
            let id = registry.id;
            replace_by(
                &mut state.registries,
                |item| item.id == id,
                registry,
                API_ERROR_REGISTRY_NOT_FOUND,
            )
        })
        .await
    }

    async fn dockerhub(&self) -> Result<DockerHub, GatewayError> {
        Ok(self
            .read(|state| state.dockerhub.clone().unwrap_or_default())
            .await)
    }

    async fn update_dockerhub(&self, dockerhub: DockerHub) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            state.dockerhub = Some(dockerhub);
            Ok(())
        })
        .await
    }

    async fn stack(&self, id: &str) -> Result<Stack, GatewayError> {
        self.read(|state| state.stacks.iter().find(|stack| stack.id == id).cloned())
            .await
            .ok_or_else(|| GatewayError::not_found(API_ERROR_STACK_NOT_FOUND))
    }

    async fn stacks(&self) -> Result<Vec<Stack>, GatewayError> {
        Ok(self.read(|state| state.stacks.clone()).await)
    }

    #[instrument(skip(self, stack), fields(stack_id = %stack.id))]
    async fn create_stack(&self, stack: Stack) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            if state.stacks.iter().any(|existing| {
                existing.id == stack.id || existing.name.eq_ignore_ascii_case(&stack.name)
            }) {
                return Err(GatewayError::conflict(
                    crate::constants::API_ERROR_STACK_EXISTS,
                ));
            }
            state.stacks.push(stack);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, stack), fields(stack_id = %stack.id))]
    async fn update_stack(&self, stack: &Stack) -> Result<(), GatewayError> {
        let stack = stack.clone();
        self.mutate(move |state| {
            let id = stack.id.clone();
            replace_by(
                &mut state.stacks,
                |item| item.id == id,
                stack,
                API_ERROR_STACK_NOT_FOUND,
            )
        })
        .await
    }

    async fn delete_stack(&self, id: &str) -> Result<(), GatewayError> {
        let id = id.to_string();
        self.mutate(move |state| {
            remove_by(
                &mut state.stacks,
                |item| item.id == id,
                API_ERROR_STACK_NOT_FOUND,
            )
        })
        .await
    }

    async fn settings(&self) -> Result<Settings, GatewayError> {
        Ok(self
            .read(|state| state.settings.clone().unwrap_or_default())
            .await)
    }

    async fn update_settings(&self, settings: Settings) -> Result<(), GatewayError> {
        self.mutate(move |state| {
            state.settings = Some(settings);
            Ok(())
        })
        .await
    }
}

/// Store-level bootstrap: the default endpoint group and the singleton
/// records must exist before the first request is served.
pub async fn ensure_defaults(
    store: &dyn DataStore,
    hidden_labels: &[crate::models::Pair],
) -> Result<(), GatewayError> {
    match store
        .endpoint_group(EndpointGroupId(DEFAULT_ENDPOINT_GROUP_ID))
        .await
    {
        Ok(_) => {}
        Err(err) if err.is_not_found() => {
            store
                .create_endpoint_group(EndpointGroup {
                    id: EndpointGroupId(DEFAULT_ENDPOINT_GROUP_ID),
                    name: crate::constants::DEFAULT_ENDPOINT_GROUP_NAME.to_string(),
                    description: "Unassigned endpoints".to_string(),
                    authorized_users: Vec::new(),
                    authorized_teams: Vec::new(),
                })
                .await?;
            debug!("created default endpoint group");
        }
        Err(err) => return Err(err),
    }

    let settings = store.settings().await?;
    if settings.black_listed_labels.is_empty() && !hidden_labels.is_empty() {
        store
            .update_settings(Settings {
                black_listed_labels: hidden_labels.to_vec(),
            })
            .await?;
    }
    Ok(())
}
