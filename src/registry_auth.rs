use crate::{
    authorization::authorized_registry_access,
    constants::DOCKER_HUB_SERVER_ADDRESS,
    error::GatewayError,
    models::{AuthorizationContext, DockerHub, Registry},
};
use axum::http::{HeaderValue, Method};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD},
};
use serde::{Deserialize, Serialize};

/// Payload of the Docker `X-Registry-Auth` header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "serveraddress", default)]
    pub server_address: String,
}

impl RegistryCredential {
    pub fn to_header_value(&self) -> Result<HeaderValue, GatewayError> {
        let json = serde_json::to_vec(self)?;
        HeaderValue::from_str(&URL_SAFE.encode(json)).map_err(|_| GatewayError::Internal)
    }
}

pub struct RegistryAccessContext<'a> {
    pub ctx: &'a AuthorizationContext,
    pub dockerhub: &'a DockerHub,
    pub registries: &'a [Registry],
}

/// Picks the credential to forward for `server_address`. An empty address
/// means Docker Hub.
pub fn select_registry_credential(
    server_address: &str,
    access: &RegistryAccessContext<'_>,
) -> Option<RegistryCredential> {
    if server_address.is_empty() {
        if !access.dockerhub.authentication {
            return None;
        }
        return Some(RegistryCredential {
            username: access.dockerhub.username.clone(),
            password: access.dockerhub.password.clone(),
            server_address: DOCKER_HUB_SERVER_ADDRESS.to_string(),
        });
    }

    access
        .registries
        .iter()
        .find(|registry| {
            registry.url == server_address
                && (access.ctx.is_admin
                    || authorized_registry_access(
                        registry,
                        access.ctx.user_id,
                        &access.ctx.memberships,
                    ))
        })
        .map(|registry| RegistryCredential {
            username: registry.username.clone(),
            password: registry.password.clone(),
            server_address: registry.url.clone(),
        })
}

/// Reads the server address the client asked for. A missing header means
/// Docker Hub; a header that does not decode yields `None`.
pub fn requested_server_address(header: Option<&HeaderValue>) -> Option<String> {
    let Some(value) = header else {
        return Some(String::new());
    };
    let raw = value.to_str().ok()?.trim();
    let bytes = URL_SAFE
        .decode(raw)
        .or_else(|_| URL_SAFE_NO_PAD.decode(raw))
        .or_else(|_| STANDARD.decode(raw))
        .ok()?;
    serde_json::from_slice::<RegistryCredential>(&bytes)
        .ok()
        .map(|credential| credential.server_address)
}

/// Image pulls and service create/update carry registry credentials.
pub fn carries_registry_auth(method: &Method, path: &str) -> bool {
    if method != Method::POST {
        return false;
    }
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    matches!(
        segments.as_slice(),
        ["images", "create"] | ["services", "create"] | ["services", _, "update"]
    )
}
