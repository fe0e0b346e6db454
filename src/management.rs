//! Entity management handlers behind the `/api` dispatcher. Each handler
//! runs after the request gate has established the caller for its tier.

use crate::{
    api::{json_response, no_content, parse_json},
    app::AppState,
    authorization::{
        authorized_endpoint_access, authorized_resource_control_access,
        authorized_resource_control_creation, authorized_resource_control_deletion,
        authorized_resource_control_update, authorized_team_management, filter_endpoint_groups,
        filter_endpoints, filter_registries, filter_stacks, resource_control_by_resource_id,
    },
    config::validate_endpoint_url,
    constants::{
        API_ERROR_ACCESS_DENIED, API_ERROR_CANNOT_REMOVE_DEFAULT_GROUP,
        API_ERROR_ENDPOINT_MANAGEMENT_DISABLED, API_ERROR_EXTENSION_NOT_SUPPORTED,
        API_ERROR_INVALID_REQUEST_PAYLOAD, API_ERROR_INVALID_STACK_NAME,
        API_ERROR_STACK_FILE_UNREADABLE, AZURE_MANAGEMENT_RESOURCE, DEFAULT_ENDPOINT_GROUP_ID,
    },
    error::GatewayError,
    models::{
        AccessLevel, AuthorizationContext, AzureCredentials, DockerHub, Endpoint,
        EndpointExtension, EndpointGroup, EndpointGroupId, EndpointId, EndpointType,
        ExtensionType, MembershipRole, Pair, RegistryId, Registry, ResourceControl,
        ResourceControlId, ResourceControlType, Settings, Stack, TeamId, TeamMembership,
        TeamMembershipId, TeamResourceAccess, TlsConfiguration, UserId, UserResourceAccess,
        UserRole,
    },
    proxy::ExtensionProxyKey,
    stacks::{
        COMPOSE_FILE_NAME, is_valid_project_name, project_dir, remove_project,
        write_compose_file,
    },
};
use axum::{
    body::{Body, Bytes},
    http::{Response, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointCreatePayload {
    name: String,
    #[serde(rename = "Type", default)]
    endpoint_type: Option<EndpointType>,
    #[serde(rename = "URL", default)]
    url: String,
    #[serde(rename = "PublicURL", default)]
    public_url: String,
    #[serde(rename = "GroupID", default)]
    group_id: Option<EndpointGroupId>,
    #[serde(rename = "TLSConfig", default)]
    tls_config: TlsConfiguration,
    #[serde(default)]
    azure_credentials: AzureCredentials,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct EndpointUpdatePayload {
    name: Option<String>,
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "PublicURL")]
    public_url: Option<String>,
    #[serde(rename = "GroupID")]
    group_id: Option<EndpointGroupId>,
    #[serde(rename = "TLSConfig")]
    tls_config: Option<TlsConfiguration>,
    azure_credentials: Option<AzureCredentials>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct AccessPayload {
    authorized_users: Vec<UserId>,
    authorized_teams: Vec<TeamId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExtensionPayload {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "URL")]
    url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointGroupCreatePayload {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RegistryCreatePayload {
    name: String,
    #[serde(rename = "URL")]
    url: String,
    #[serde(default)]
    authentication: bool,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UserCreatePayload {
    username: String,
    role: UserRole,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceControlCreatePayload {
    #[serde(rename = "ResourceID")]
    resource_id: String,
    #[serde(rename = "SubResourceIDs", default)]
    sub_resource_ids: Vec<String>,
    #[serde(rename = "Type")]
    resource_type: String,
    #[serde(default)]
    administrators_only: bool,
    #[serde(default)]
    users: Vec<UserId>,
    #[serde(default)]
    teams: Vec<TeamId>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ResourceControlUpdatePayload {
    administrators_only: bool,
    users: Vec<UserId>,
    teams: Vec<TeamId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TeamMembershipPayload {
    #[serde(rename = "UserID")]
    user_id: UserId,
    #[serde(rename = "TeamID")]
    team_id: TeamId,
    role: MembershipRole,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackCreatePayload {
    name: String,
    #[serde(rename = "SwarmID")]
    swarm_id: String,
    stack_file_content: String,
    #[serde(default)]
    env: Vec<Pair>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct StackUpdatePayload {
    stack_file_content: String,
    env: Vec<Pair>,
    prune: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StackFileView {
    stack_file_content: String,
}

#[derive(Debug, Serialize)]
struct StackView {
    #[serde(flatten)]
    stack: Stack,
    #[serde(rename = "ResourceControl", skip_serializing_if = "Option::is_none")]
    resource_control: Option<ResourceControl>,
}

fn ensure_endpoint_management(state: &AppState) -> Result<(), GatewayError> {
    if state.endpoint_management {
        return Ok(());
    }
    Err(GatewayError::http(
        StatusCode::SERVICE_UNAVAILABLE,
        API_ERROR_ENDPOINT_MANAGEMENT_DISABLED,
    ))
}

fn require(value: &str, field: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::bad_request(format!(
            "{API_ERROR_INVALID_REQUEST_PAYLOAD}: {field} is required"
        )));
    }
    Ok(())
}

/// Checks that `endpoint` is usable by the caller, through its own lists or
/// its group's.
pub async fn ensure_endpoint_access(
    state: &AppState,
    endpoint: &Endpoint,
    ctx: &AuthorizationContext,
) -> Result<(), GatewayError> {
    if ctx.is_admin {
        return Ok(());
    }
    let group = match state.store.endpoint_group(endpoint.group_id).await {
        Ok(group) => Some(group),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err),
    };
    if authorized_endpoint_access(endpoint, group.as_ref(), ctx.user_id, &ctx.memberships) {
        return Ok(());
    }
    Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED))
}

fn validate_connection(endpoint: &Endpoint) -> Result<(), GatewayError> {
    if endpoint.endpoint_type == EndpointType::Azure {
        if !endpoint.azure_credentials.is_complete() {
            return Err(GatewayError::bad_request(format!(
                "{API_ERROR_INVALID_REQUEST_PAYLOAD}: azure credentials are required"
            )));
        }
        return Ok(());
    }
    validate_endpoint_url(&endpoint.url).map_err(GatewayError::bad_request)
}

pub async fn list_endpoints(
    state: &AppState,
    ctx: &AuthorizationContext,
) -> Result<Response<Body>, GatewayError> {
    let endpoints = state.store.endpoints().await?;
    let groups = state.store.endpoint_groups().await?;
    let mut endpoints = filter_endpoints(endpoints, &groups, ctx);
    if !ctx.is_admin {
        for endpoint in &mut endpoints {
            endpoint.azure_credentials = AzureCredentials::default();
        }
    }
    json_response(StatusCode::OK, &endpoints)
}

#[instrument(skip_all)]
pub async fn create_endpoint(state: &AppState, body: Bytes) -> Result<Response<Body>, GatewayError> {
    ensure_endpoint_management(state)?;
    let payload: EndpointCreatePayload = parse_json(&body)?;
    require(&payload.name, "Name")?;

    let endpoint_type = payload.endpoint_type.unwrap_or(EndpointType::Docker);
    let url = if endpoint_type == EndpointType::Azure && payload.url.is_empty() {
        AZURE_MANAGEMENT_RESOURCE.to_string()
    } else {
        payload.url
    };
    let group_id = payload
        .group_id
        .unwrap_or(EndpointGroupId(DEFAULT_ENDPOINT_GROUP_ID));
    state.store.endpoint_group(group_id).await?;

    let endpoint = Endpoint {
        id: EndpointId(0),
        name: payload.name,
        endpoint_type,
        url,
        public_url: payload.public_url,
        group_id,
        tls_config: payload.tls_config,
        azure_credentials: payload.azure_credentials,
        authorized_users: Vec::new(),
        authorized_teams: Vec::new(),
        extensions: Vec::new(),
    };
    validate_connection(&endpoint)?;
    state.proxies.validate(&endpoint).await?;

    let endpoint = state.store.create_endpoint(endpoint).await?;
    info!(endpoint_id = %endpoint.id, name = %endpoint.name, "endpoint created");
    json_response(StatusCode::OK, &endpoint)
}

pub async fn inspect_endpoint(
    state: &AppState,
    endpoint_id: EndpointId,
) -> Result<Response<Body>, GatewayError> {
    let endpoint = state.store.endpoint(endpoint_id).await?;
    json_response(StatusCode::OK, &endpoint)
}

/// Connection material may change, so the cached handler is dropped after
/// the new record is persisted and rebuilt on the next proxied request.
#[instrument(skip_all, fields(endpoint_id = %endpoint_id))]
pub async fn update_endpoint(
    state: &AppState,
    endpoint_id: EndpointId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    ensure_endpoint_management(state)?;
    let payload: EndpointUpdatePayload = parse_json(&body)?;
    let mut endpoint = state.store.endpoint(endpoint_id).await?;

    if let Some(name) = payload.name {
        require(&name, "Name")?;
        endpoint.name = name;
    }
    if let Some(url) = payload.url {
        endpoint.url = url;
    }
    if let Some(public_url) = payload.public_url {
        endpoint.public_url = public_url;
    }
    if let Some(group_id) = payload.group_id {
        state.store.endpoint_group(group_id).await?;
        endpoint.group_id = group_id;
    }
    if let Some(tls_config) = payload.tls_config {
        endpoint.tls_config = tls_config;
    }
    if let Some(azure_credentials) = payload.azure_credentials {
        endpoint.azure_credentials = azure_credentials;
    }

    validate_connection(&endpoint)?;
    state.proxies.validate(&endpoint).await?;
    state.store.update_endpoint(&endpoint).await?;
    state.proxies.delete_proxy(endpoint.id);
    info!("endpoint updated");
    json_response(StatusCode::OK, &endpoint)
}

#[instrument(skip_all, fields(endpoint_id = %endpoint_id))]
pub async fn delete_endpoint(
    state: &AppState,
    endpoint_id: EndpointId,
) -> Result<Response<Body>, GatewayError> {
    ensure_endpoint_management(state)?;
    state.store.delete_endpoint(endpoint_id).await?;
    state.proxies.delete_proxy(endpoint_id);
    state.proxies.delete_extension_proxies(endpoint_id);
    info!("endpoint deleted");
    Ok(no_content())
}

pub async fn update_endpoint_access(
    state: &AppState,
    endpoint_id: EndpointId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: AccessPayload = parse_json(&body)?;
    let mut endpoint = state.store.endpoint(endpoint_id).await?;
    endpoint.authorized_users = payload.authorized_users;
    endpoint.authorized_teams = payload.authorized_teams;
    state.store.update_endpoint(&endpoint).await?;
    json_response(StatusCode::OK, &endpoint)
}

#[instrument(skip_all, fields(endpoint_id = %endpoint_id))]
pub async fn add_endpoint_extension(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: ExtensionPayload = parse_json(&body)?;
    let kind = ExtensionType::parse(&payload.kind)
        .ok_or_else(|| GatewayError::bad_request(API_ERROR_EXTENSION_NOT_SUPPORTED))?;
    require(&payload.url, "URL")?;

    let mut endpoint = state.store.endpoint(endpoint_id).await?;
    ensure_endpoint_access(state, &endpoint, ctx).await?;

    match endpoint
        .extensions
        .iter_mut()
        .find(|extension| extension.kind == kind)
    {
        Some(extension) => extension.url = payload.url,
        None => endpoint.extensions.push(EndpointExtension {
            kind,
            url: payload.url,
        }),
    }
    state.store.update_endpoint(&endpoint).await?;
    state
        .proxies
        .delete_extension_proxy(ExtensionProxyKey { endpoint_id, kind });
    info!(extension = kind.as_str(), "endpoint extension registered");
    Ok(no_content())
}

pub async fn remove_endpoint_extension(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    raw_kind: &str,
) -> Result<Response<Body>, GatewayError> {
    let kind = ExtensionType::parse(raw_kind)
        .ok_or_else(|| GatewayError::bad_request(API_ERROR_EXTENSION_NOT_SUPPORTED))?;
    let mut endpoint = state.store.endpoint(endpoint_id).await?;
    ensure_endpoint_access(state, &endpoint, ctx).await?;

    endpoint.extensions.retain(|extension| extension.kind != kind);
    state.store.update_endpoint(&endpoint).await?;
    state
        .proxies
        .delete_extension_proxy(ExtensionProxyKey { endpoint_id, kind });
    Ok(no_content())
}

pub async fn list_endpoint_groups(
    state: &AppState,
    ctx: &AuthorizationContext,
) -> Result<Response<Body>, GatewayError> {
    let groups = state.store.endpoint_groups().await?;
    json_response(StatusCode::OK, &filter_endpoint_groups(groups, ctx))
}

pub async fn create_endpoint_group(
    state: &AppState,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: EndpointGroupCreatePayload = parse_json(&body)?;
    require(&payload.name, "Name")?;
    let group = state
        .store
        .create_endpoint_group(EndpointGroup {
            id: EndpointGroupId(0),
            name: payload.name,
            description: payload.description,
            authorized_users: Vec::new(),
            authorized_teams: Vec::new(),
        })
        .await?;
    json_response(StatusCode::OK, &group)
}

pub async fn update_endpoint_group_access(
    state: &AppState,
    group_id: EndpointGroupId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: AccessPayload = parse_json(&body)?;
    let mut group = state.store.endpoint_group(group_id).await?;
    group.authorized_users = payload.authorized_users;
    group.authorized_teams = payload.authorized_teams;
    state.store.update_endpoint_group(&group).await?;
    json_response(StatusCode::OK, &group)
}

pub async fn delete_endpoint_group(
    state: &AppState,
    group_id: EndpointGroupId,
) -> Result<Response<Body>, GatewayError> {
    if group_id.0 == DEFAULT_ENDPOINT_GROUP_ID {
        return Err(GatewayError::http(
            StatusCode::FORBIDDEN,
            API_ERROR_CANNOT_REMOVE_DEFAULT_GROUP,
        ));
    }
    state.store.delete_endpoint_group(group_id).await?;
    Ok(no_content())
}

pub async fn list_registries(
    state: &AppState,
    ctx: &AuthorizationContext,
) -> Result<Response<Body>, GatewayError> {
    let registries = state.store.registries().await?;
    let mut registries = filter_registries(registries, ctx);
    if !ctx.is_admin {
        for registry in &mut registries {
            registry.password.clear();
        }
    }
    json_response(StatusCode::OK, &registries)
}

pub async fn create_registry(state: &AppState, body: Bytes) -> Result<Response<Body>, GatewayError> {
    let payload: RegistryCreatePayload = parse_json(&body)?;
    require(&payload.name, "Name")?;
    require(&payload.url, "URL")?;
    if payload.authentication {
        require(&payload.username, "Username")?;
    }
    let registry = state
        .store
        .create_registry(Registry {
            id: RegistryId(0),
            name: payload.name,
            url: payload.url,
            authentication: payload.authentication,
            username: payload.username,
            password: payload.password,
            authorized_users: Vec::new(),
            authorized_teams: Vec::new(),
        })
        .await?;
    json_response(StatusCode::OK, &registry)
}

pub async fn update_registry_access(
    state: &AppState,
    registry_id: RegistryId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: AccessPayload = parse_json(&body)?;
    let mut registry = state.store.registry(registry_id).await?;
    registry.authorized_users = payload.authorized_users;
    registry.authorized_teams = payload.authorized_teams;
    state.store.update_registry(&registry).await?;
    json_response(StatusCode::OK, &registry)
}

pub async fn update_dockerhub(state: &AppState, body: Bytes) -> Result<Response<Body>, GatewayError> {
    let payload: DockerHub = parse_json(&body)?;
    if payload.authentication {
        require(&payload.username, "Username")?;
    }
    state.store.update_dockerhub(payload).await?;
    Ok(no_content())
}

pub async fn inspect_settings(state: &AppState) -> Result<Response<Body>, GatewayError> {
    json_response(StatusCode::OK, &state.store.settings().await?)
}

pub async fn update_settings(state: &AppState, body: Bytes) -> Result<Response<Body>, GatewayError> {
    let payload: Settings = parse_json(&body)?;
    state.store.update_settings(payload.clone()).await?;
    json_response(StatusCode::OK, &payload)
}

pub async fn create_user(state: &AppState, body: Bytes) -> Result<Response<Body>, GatewayError> {
    let payload: UserCreatePayload = parse_json(&body)?;
    require(&payload.username, "Username")?;
    let user = state
        .store
        .create_user(payload.username.trim(), payload.role)
        .await?;
    json_response(StatusCode::OK, &user)
}

#[instrument(skip_all, fields(user_id = %ctx.user_id))]
pub async fn create_resource_control(
    state: &AppState,
    ctx: &AuthorizationContext,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: ResourceControlCreatePayload = parse_json(&body)?;
    require(&payload.resource_id, "ResourceID")?;
    let resource_type = ResourceControlType::parse(&payload.resource_type).ok_or_else(|| {
        GatewayError::bad_request(format!(
            "{API_ERROR_INVALID_REQUEST_PAYLOAD}: unsupported resource type"
        ))
    })?;
    if !payload.administrators_only && payload.users.is_empty() && payload.teams.is_empty() {
        return Err(GatewayError::bad_request(format!(
            "{API_ERROR_INVALID_REQUEST_PAYLOAD}: users, teams or administrators only must be set"
        )));
    }

    let control = ResourceControl {
        id: ResourceControlId(0),
        resource_id: payload.resource_id,
        sub_resource_ids: payload.sub_resource_ids,
        resource_type,
        administrators_only: payload.administrators_only,
        user_accesses: user_accesses(payload.users),
        team_accesses: team_accesses(payload.teams),
    };
    if !authorized_resource_control_creation(&control, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }

    let control = state.store.create_resource_control(control).await?;
    info!(resource_control_id = %control.id, "resource control created");
    json_response(StatusCode::OK, &control)
}

#[instrument(skip_all, fields(resource_control_id = %control_id))]
pub async fn update_resource_control(
    state: &AppState,
    ctx: &AuthorizationContext,
    control_id: ResourceControlId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: ResourceControlUpdatePayload = parse_json(&body)?;
    let existing = state.store.resource_control(control_id).await?;
    if !authorized_resource_control_update(&existing, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }

    let updated = ResourceControl {
        administrators_only: payload.administrators_only,
        user_accesses: user_accesses(payload.users),
        team_accesses: team_accesses(payload.teams),
        ..existing
    };
    if !authorized_resource_control_creation(&updated, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }

    state.store.update_resource_control(&updated).await?;
    json_response(StatusCode::OK, &updated)
}

pub async fn delete_resource_control(
    state: &AppState,
    ctx: &AuthorizationContext,
    control_id: ResourceControlId,
) -> Result<Response<Body>, GatewayError> {
    let existing = state.store.resource_control(control_id).await?;
    if !authorized_resource_control_deletion(&existing, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    state.store.delete_resource_control(control_id).await?;
    Ok(no_content())
}

fn user_accesses(users: Vec<UserId>) -> Vec<UserResourceAccess> {
    users
        .into_iter()
        .map(|user_id| UserResourceAccess {
            user_id,
            access_level: AccessLevel::ReadWrite,
        })
        .collect()
}

fn team_accesses(teams: Vec<TeamId>) -> Vec<TeamResourceAccess> {
    teams
        .into_iter()
        .map(|team_id| TeamResourceAccess {
            team_id,
            access_level: AccessLevel::ReadWrite,
        })
        .collect()
}

/// Admins see every membership; team leaders see the teams they lead.
pub async fn list_team_memberships(
    state: &AppState,
    ctx: &AuthorizationContext,
) -> Result<Response<Body>, GatewayError> {
    if !ctx.is_admin && !ctx.is_team_leader {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    let memberships = state
        .store
        .team_memberships()
        .await?
        .into_iter()
        .filter(|membership| authorized_team_management(membership.team_id, ctx))
        .collect::<Vec<_>>();
    json_response(StatusCode::OK, &memberships)
}

pub async fn create_team_membership(
    state: &AppState,
    ctx: &AuthorizationContext,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: TeamMembershipPayload = parse_json(&body)?;
    if !authorized_team_management(payload.team_id, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    state.store.user(payload.user_id).await?;
    let membership = state
        .store
        .create_team_membership(TeamMembership {
            id: TeamMembershipId(0),
            user_id: payload.user_id,
            team_id: payload.team_id,
            role: payload.role,
        })
        .await?;
    json_response(StatusCode::OK, &membership)
}

pub async fn update_team_membership(
    state: &AppState,
    ctx: &AuthorizationContext,
    membership_id: TeamMembershipId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: TeamMembershipPayload = parse_json(&body)?;
    let existing = state.store.team_membership(membership_id).await?;
    if !authorized_team_management(existing.team_id, ctx)
        || !authorized_team_management(payload.team_id, ctx)
    {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    if !ctx.is_admin && existing.role != payload.role {
        return Err(GatewayError::access_denied(
            "Only administrators can change a team membership role",
        ));
    }
    state.store.user(payload.user_id).await?;

    let updated = TeamMembership {
        id: existing.id,
        user_id: payload.user_id,
        team_id: payload.team_id,
        role: payload.role,
    };
    state.store.update_team_membership(&updated).await?;
    json_response(StatusCode::OK, &updated)
}

pub async fn delete_team_membership(
    state: &AppState,
    ctx: &AuthorizationContext,
    membership_id: TeamMembershipId,
) -> Result<Response<Body>, GatewayError> {
    let existing = state.store.team_membership(membership_id).await?;
    if !authorized_team_management(existing.team_id, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    state.store.delete_team_membership(membership_id).await?;
    Ok(no_content())
}

fn stack_view(stack: Stack, controls: &[ResourceControl]) -> StackView {
    let resource_control = resource_control_by_resource_id(&stack.name, controls).cloned();
    StackView {
        stack,
        resource_control,
    }
}

async fn docker_endpoint(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
) -> Result<Endpoint, GatewayError> {
    let endpoint = state.store.endpoint(endpoint_id).await?;
    ensure_endpoint_access(state, &endpoint, ctx).await?;
    if !endpoint.endpoint_type.is_docker_kind() {
        return Err(GatewayError::bad_request(
            "Stacks are only supported on docker endpoints",
        ));
    }
    Ok(endpoint)
}

pub async fn list_stacks(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    swarm_id: Option<&str>,
) -> Result<Response<Body>, GatewayError> {
    docker_endpoint(state, ctx, endpoint_id).await?;
    let controls = state.store.resource_controls().await?;
    let stacks = state
        .store
        .stacks()
        .await?
        .into_iter()
        .filter(|stack| swarm_id.is_none_or(|swarm_id| stack.swarm_id == swarm_id))
        .collect::<Vec<_>>();
    let views = filter_stacks(stacks, &controls, ctx)
        .into_iter()
        .map(|stack| stack_view(stack, &controls))
        .collect::<Vec<_>>();
    json_response(StatusCode::OK, &views)
}

/// Resource control guarding `stack`, denying callers who cannot access it.
async fn authorized_stack_control(
    state: &AppState,
    ctx: &AuthorizationContext,
    stack: &Stack,
) -> Result<Option<ResourceControl>, GatewayError> {
    let control = match state.store.resource_control_by_resource_id(&stack.name).await {
        Ok(control) => control,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    if !authorized_resource_control_access(&control, ctx) {
        return Err(GatewayError::access_denied(API_ERROR_ACCESS_DENIED));
    }
    Ok(Some(control))
}

pub async fn inspect_stack(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    stack_id: &str,
) -> Result<Response<Body>, GatewayError> {
    docker_endpoint(state, ctx, endpoint_id).await?;
    let stack = state.store.stack(stack_id).await?;
    let resource_control = authorized_stack_control(state, ctx, &stack).await?;
    json_response(
        StatusCode::OK,
        &StackView {
            stack,
            resource_control,
        },
    )
}

pub async fn stack_file(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    stack_id: &str,
) -> Result<Response<Body>, GatewayError> {
    docker_endpoint(state, ctx, endpoint_id).await?;
    let stack = state.store.stack(stack_id).await?;
    authorized_stack_control(state, ctx, &stack).await?;

    let path = Path::new(&stack.project_path).join(&stack.entry_point);
    let content = tokio::fs::read_to_string(&path).await.map_err(|err| {
        warn!(error = %err, path = %path.display(), "unable to read stack file");
        GatewayError::bad_request(API_ERROR_STACK_FILE_UNREADABLE)
    })?;
    json_response(
        StatusCode::OK,
        &StackFileView {
            stack_file_content: content,
        },
    )
}

/// The stack is reserved in the store before anything touches disk or the
/// deploy tool. Failures release the reservation.
#[instrument(skip_all, fields(endpoint_id = %endpoint_id))]
pub async fn create_stack(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let payload: StackCreatePayload = parse_json(&body)?;
    require(&payload.name, "Name")?;
    require(&payload.swarm_id, "SwarmID")?;
    require(&payload.stack_file_content, "StackFileContent")?;
    if !is_valid_project_name(&payload.name) || !is_valid_project_name(&payload.swarm_id) {
        return Err(GatewayError::bad_request(API_ERROR_INVALID_STACK_NAME));
    }
    let endpoint = docker_endpoint(state, ctx, endpoint_id).await?;

    let stack_id = Stack::identifier(&payload.name, &payload.swarm_id);
    let project_path = project_dir(&state.compose_dir, &stack_id)?;
    let stack = Stack {
        id: stack_id,
        name: payload.name,
        swarm_id: payload.swarm_id,
        entry_point: COMPOSE_FILE_NAME.to_string(),
        project_path: project_path.display().to_string(),
        env: payload.env,
    };
    state.store.create_stack(stack.clone()).await?;

    let deployed =
        deploy_new_stack(state, ctx, &stack, &endpoint, &payload.stack_file_content).await;
    if let Err(err) = deployed {
        if let Err(cleanup) = remove_project(&project_path).await {
            warn!(error = %cleanup, "unable to clean up compose project");
        }
        if let Err(cleanup) = state.store.delete_stack(&stack.id).await {
            warn!(error = %cleanup, "unable to release stack reservation");
        }
        return Err(err);
    }
    info!(stack_id = %stack.id, "stack created");
    json_response(StatusCode::OK, &stack)
}

async fn deploy_new_stack(
    state: &AppState,
    ctx: &AuthorizationContext,
    stack: &Stack,
    endpoint: &Endpoint,
    content: &str,
) -> Result<(), GatewayError> {
    write_compose_file(&state.compose_dir, &stack.id, content).await?;
    let registries = filter_registries(state.store.registries().await?, ctx);
    let dockerhub = state.store.dockerhub().await?;
    state
        .stacks
        .deploy(stack, endpoint, &registries, &dockerhub, false)
        .await
}

/// Rewrites the compose file and environment, then redeploys.
#[instrument(skip_all, fields(endpoint_id = %endpoint_id, stack_id = %stack_id))]
pub async fn update_stack(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    stack_id: &str,
    body: Bytes,
) -> Result<Response<Body>, GatewayError> {
    let endpoint = docker_endpoint(state, ctx, endpoint_id).await?;
    let mut stack = state.store.stack(stack_id).await?;
    authorized_stack_control(state, ctx, &stack).await?;
    let payload: StackUpdatePayload = parse_json(&body)?;
    require(&payload.stack_file_content, "StackFileContent")?;

    write_compose_file(&state.compose_dir, &stack.id, &payload.stack_file_content).await?;
    stack.env = payload.env;
    state.store.update_stack(&stack).await?;

    let registries = filter_registries(state.store.registries().await?, ctx);
    let dockerhub = state.store.dockerhub().await?;
    state
        .stacks
        .deploy(&stack, &endpoint, &registries, &dockerhub, payload.prune)
        .await?;
    info!("stack updated");
    json_response(StatusCode::OK, &stack)
}

#[instrument(skip_all, fields(endpoint_id = %endpoint_id, stack_id = %stack_id))]
pub async fn delete_stack(
    state: &AppState,
    ctx: &AuthorizationContext,
    endpoint_id: EndpointId,
    stack_id: &str,
) -> Result<Response<Body>, GatewayError> {
    let endpoint = docker_endpoint(state, ctx, endpoint_id).await?;
    let stack = state.store.stack(stack_id).await?;
    let control = authorized_stack_control(state, ctx, &stack).await?;

    state.stacks.remove(&stack, &endpoint).await?;
    state.store.delete_stack(&stack.id).await?;
    if let Some(control) = control {
        state.store.delete_resource_control(control.id).await?;
    }
    if let Err(err) = remove_project(Path::new(&stack.project_path)).await {
        warn!(error = %err, "unable to remove compose project");
    }
    Ok(no_content())
}
