pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEADER_JSON: &str = "application/json";
pub const HEADER_REGISTRY_AUTH: &str = "x-registry-auth";

pub const DEFAULT_ENDPOINT_GROUP_ID: u32 = 1;
pub const DEFAULT_ENDPOINT_GROUP_NAME: &str = "Unassigned";
pub const DOCKER_HUB_SERVER_ADDRESS: &str = "docker.io";

pub const RESOURCE_ANNOTATION_KEY: &str = "Berth";

pub const SWARM_SERVICE_ID_LABEL: &str = "com.docker.swarm.service.id";
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

pub const AZURE_LOGIN_URL: &str = "https://login.microsoftonline.com";
pub const AZURE_MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

pub const API_ERROR_UNAUTHORIZED: &str = "Unauthorized";
pub const API_ERROR_INVALID_TOKEN: &str = "Invalid JWT token";
pub const API_ERROR_ACCESS_DENIED: &str = "Access denied to resource";
pub const API_ERROR_ADMIN_REQUIRED: &str = "Access denied: administrator role required";
pub const API_ERROR_ENDPOINT_NOT_FOUND: &str = "Unable to find an endpoint with the specified identifier";
pub const API_ERROR_GROUP_NOT_FOUND: &str =
    "Unable to find an endpoint group with the specified identifier";
pub const API_ERROR_RESOURCE_CONTROL_NOT_FOUND: &str =
    "Unable to find a resource control with the specified identifier";
pub const API_ERROR_RESOURCE_CONTROL_EXISTS: &str =
    "A resource control is already applied on this resource";
pub const API_ERROR_MEMBERSHIP_NOT_FOUND: &str =
    "Unable to find a team membership with the specified identifier";
pub const API_ERROR_MEMBERSHIP_EXISTS: &str = "Team membership already registered";
pub const API_ERROR_REGISTRY_NOT_FOUND: &str =
    "Unable to find a registry with the specified identifier";
pub const API_ERROR_STACK_NOT_FOUND: &str = "Unable to find a stack with the specified identifier";
pub const API_ERROR_STACK_EXISTS: &str = "A stack with this name is already running";
pub const API_ERROR_INVALID_STACK_NAME: &str =
    "Stack name and swarm identifier may only contain letters, digits, '_', '.' and '-'";
pub const API_ERROR_STACK_FILE_UNREADABLE: &str = "Unable to read the stack file";
pub const API_ERROR_USER_NOT_FOUND: &str = "Unable to find a user with the specified identifier";
pub const API_ERROR_USER_EXISTS: &str = "User already exists";
pub const API_ERROR_EXTENSION_NOT_SUPPORTED: &str = "Extension not supported by this endpoint";
pub const API_ERROR_ENDPOINT_MANAGEMENT_DISABLED: &str =
    "Endpoint management is disabled";
pub const API_ERROR_INVALID_REQUEST_PAYLOAD: &str = "Invalid request payload";
pub const API_ERROR_INVALID_IDENTIFIER: &str = "Invalid identifier route variable";
pub const API_ERROR_CANNOT_REMOVE_DEFAULT_GROUP: &str =
    "Cannot remove the default endpoint group";
pub const API_ERROR_NOT_FOUND: &str = "not found";
