use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                value.parse::<u32>().map(Self)
            }
        }
    };
}

id_type!(EndpointId);
id_type!(EndpointGroupId);
id_type!(UserId);
id_type!(TeamId);
id_type!(ResourceControlId);
id_type!(TeamMembershipId);
id_type!(RegistryId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Docker,
    Agent,
    Azure,
}

impl EndpointType {
    pub fn is_docker_kind(self) -> bool {
        matches!(self, Self::Docker | Self::Agent)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TlsConfiguration {
    #[serde(rename = "TLS")]
    pub tls: bool,
    #[serde(rename = "TLSSkipVerify")]
    pub tls_skip_verify: bool,
    #[serde(rename = "TLSCACert", skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert_path: Option<String>,
    #[serde(rename = "TLSCert", skip_serializing_if = "Option::is_none")]
    pub tls_cert_path: Option<String>,
    #[serde(rename = "TLSKey", skip_serializing_if = "Option::is_none")]
    pub tls_key_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AzureCredentials {
    #[serde(rename = "ApplicationID")]
    pub application_id: String,
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    pub authentication_key: String,
}

impl AzureCredentials {
    pub fn is_complete(&self) -> bool {
        !self.application_id.is_empty()
            && !self.tenant_id.is_empty()
            && !self.authentication_key.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    Storidge,
}

impl ExtensionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Storidge => "storidge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "storidge" | "1" => Some(Self::Storidge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointExtension {
    #[serde(rename = "Type")]
    pub kind: ExtensionType,
    #[serde(rename = "URL")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    #[serde(rename = "Type")]
    pub endpoint_type: EndpointType,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "PublicURL", default)]
    pub public_url: String,
    #[serde(rename = "GroupID")]
    pub group_id: EndpointGroupId,
    #[serde(rename = "TLSConfig", default)]
    pub tls_config: TlsConfiguration,
    #[serde(default)]
    pub azure_credentials: AzureCredentials,
    #[serde(default)]
    pub authorized_users: Vec<UserId>,
    #[serde(default)]
    pub authorized_teams: Vec<TeamId>,
    #[serde(default)]
    pub extensions: Vec<EndpointExtension>,
}

impl Endpoint {
    pub fn extension(&self, kind: ExtensionType) -> Option<&EndpointExtension> {
        self.extensions.iter().find(|ext| ext.kind == kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointGroup {
    pub id: EndpointGroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub authorized_users: Vec<UserId>,
    #[serde(default)]
    pub authorized_teams: Vec<TeamId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceControlType {
    Container,
    Service,
    Volume,
    Network,
    Secret,
    Stack,
    Config,
}

impl ResourceControlType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "container" => Some(Self::Container),
            "service" => Some(Self::Service),
            "volume" => Some(Self::Volume),
            "network" => Some(Self::Network),
            "secret" => Some(Self::Secret),
            "stack" => Some(Self::Stack),
            "config" => Some(Self::Config),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserResourceAccess {
    #[serde(rename = "UserID")]
    pub user_id: UserId,
    #[serde(default)]
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TeamResourceAccess {
    #[serde(rename = "TeamID")]
    pub team_id: TeamId,
    #[serde(default)]
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceControl {
    pub id: ResourceControlId,
    #[serde(rename = "ResourceID")]
    pub resource_id: String,
    #[serde(rename = "SubResourceIDs", default)]
    pub sub_resource_ids: Vec<String>,
    #[serde(rename = "Type")]
    pub resource_type: ResourceControlType,
    #[serde(rename = "AdministratorsOnly", default)]
    pub administrators_only: bool,
    #[serde(default)]
    pub user_accesses: Vec<UserResourceAccess>,
    #[serde(default)]
    pub team_accesses: Vec<TeamResourceAccess>,
}

impl ResourceControl {
    pub fn covers(&self, resource_id: &str) -> bool {
        self.resource_id == resource_id || self.sub_resource_ids.iter().any(|id| id == resource_id)
    }

    pub fn overlaps(&self, other: &ResourceControl) -> bool {
        std::iter::once(&other.resource_id)
            .chain(other.sub_resource_ids.iter())
            .any(|id| self.covers(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Leader,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TeamMembership {
    pub id: TeamMembershipId,
    #[serde(rename = "UserID")]
    pub user_id: UserId,
    #[serde(rename = "TeamID")]
    pub team_id: TeamId,
    pub role: MembershipRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Administrator,
    Standard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Registry {
    pub id: RegistryId,
    pub name: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub authentication: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub authorized_users: Vec<UserId>,
    #[serde(default)]
    pub authorized_teams: Vec<TeamId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DockerHub {
    pub authentication: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Pair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stack {
    pub id: String,
    pub name: String,
    #[serde(rename = "SwarmID")]
    pub swarm_id: String,
    pub entry_point: String,
    pub project_path: String,
    #[serde(default)]
    pub env: Vec<Pair>,
}

impl Stack {
    pub fn identifier(name: &str, swarm_id: &str) -> String {
        format!("{name}_{swarm_id}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub black_listed_labels: Vec<Pair>,
}

/// Verified identity extracted from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub id: UserId,
    pub username: String,
    pub role: UserRole,
}

impl TokenData {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Administrator
    }
}

/// Per-request view of who the caller is. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationContext {
    pub is_admin: bool,
    pub is_team_leader: bool,
    pub user_id: UserId,
    pub memberships: Vec<TeamMembership>,
}

impl AuthorizationContext {
    pub fn administrator(user_id: UserId) -> Self {
        Self {
            is_admin: true,
            is_team_leader: false,
            user_id,
            memberships: Vec::new(),
        }
    }

    pub fn team_ids(&self) -> impl Iterator<Item = TeamId> + '_ {
        self.memberships.iter().map(|membership| membership.team_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub users: Vec<User>,
    pub endpoints: Vec<Endpoint>,
    pub endpoint_groups: Vec<EndpointGroup>,
    pub resource_controls: Vec<ResourceControl>,
    pub team_memberships: Vec<TeamMembership>,
    pub registries: Vec<Registry>,
    pub dockerhub: Option<DockerHub>,
    pub stacks: Vec<Stack>,
    pub settings: Option<Settings>,
}
