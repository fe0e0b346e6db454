use crate::{
    app::AppState,
    bouncer::{AccessTier, RequestAccess},
    constants::{
        API_ERROR_EXTENSION_NOT_SUPPORTED, API_ERROR_INVALID_IDENTIFIER,
        API_ERROR_INVALID_REQUEST_PAYLOAD, API_ERROR_NOT_FOUND, APP_VERSION, HEADER_JSON,
    },
    error::GatewayError,
    management::{self, ensure_endpoint_access},
    models::{AuthorizationContext, EndpointId, EndpointType, ExtensionType},
    proxy::{ExtensionProxyKey, ProxyScope},
    transport::ForwardRequest,
};
use axum::{
    body::{Body, Bytes, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, Response, StatusCode, header},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use std::str::FromStr;
use tracing::{debug, instrument};

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
pub async fn dispatch(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(ToOwned::to_owned);

    let Some(api_path) = path.strip_prefix("/api") else {
        return Err(GatewayError::not_found(API_ERROR_NOT_FOUND));
    };
    let segments = api_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    debug!(has_query = query.is_some(), "dispatching request");

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["status"]) => status(&state),

        ("GET", ["endpoints"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::list_endpoints(&state, access.context()?).await
        }
        ("POST", ["endpoints"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::create_endpoint(&state, read_body(req, state.max_body_size).await?).await
        }
        ("GET", ["endpoints", id]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::inspect_endpoint(&state, parse_id(id)?).await
        }
        ("PUT", ["endpoints", id]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            let id = parse_id(id)?;
            management::update_endpoint(&state, id, read_body(req, state.max_body_size).await?)
                .await
        }
        ("DELETE", ["endpoints", id]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::delete_endpoint(&state, parse_id(id)?).await
        }
        ("PUT", ["endpoints", id, "access"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            let id = parse_id(id)?;
            management::update_endpoint_access(
                &state,
                id,
                read_body(req, state.max_body_size).await?,
            )
            .await
        }
        ("POST", ["endpoints", id, "extensions"]) => {
            let ctx = authenticated_context(&state, req.headers()).await?;
            let id = parse_id(id)?;
            management::add_endpoint_extension(
                &state,
                &ctx,
                id,
                read_body(req, state.max_body_size).await?,
            )
            .await
        }
        ("DELETE", ["endpoints", id, "extensions", kind]) => {
            let ctx = authenticated_context(&state, req.headers()).await?;
            management::remove_endpoint_extension(&state, &ctx, parse_id(id)?, kind).await
        }
        ("GET", ["endpoints", id, "stacks"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let swarm_id = query_param(query.as_deref(), "swarmId");
            management::list_stacks(&state, access.context()?, parse_id(id)?, swarm_id.as_deref())
                .await
        }
        ("POST", ["endpoints", id, "stacks"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let id = parse_id(id)?;
            let body = read_body(req, state.max_body_size).await?;
            management::create_stack(&state, access.context()?, id, body).await
        }
        ("GET", ["endpoints", id, "stacks", stack_id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::inspect_stack(&state, access.context()?, parse_id(id)?, stack_id).await
        }
        ("PUT", ["endpoints", id, "stacks", stack_id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let id = parse_id(id)?;
            let body = read_body(req, state.max_body_size).await?;
            management::update_stack(&state, access.context()?, id, stack_id, body).await
        }
        ("GET", ["endpoints", id, "stacks", stack_id, "stackfile"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::stack_file(&state, access.context()?, parse_id(id)?, stack_id).await
        }
        ("DELETE", ["endpoints", id, "stacks", stack_id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::delete_stack(&state, access.context()?, parse_id(id)?, stack_id).await
        }
        (_, ["endpoints", id, "docker", ..]) => {
            let prefix = format!("/api/endpoints/{id}/docker");
            let id = parse_id(id)?;
            let forward_path = forwarded_path(&path, &prefix, query.as_deref());
            proxy_endpoint_request(&state, id, ProxyKind::Docker, forward_path, req).await
        }
        (_, ["endpoints", id, "azure", ..]) => {
            let prefix = format!("/api/endpoints/{id}/azure");
            let id = parse_id(id)?;
            let forward_path = forwarded_path(&path, &prefix, query.as_deref());
            proxy_endpoint_request(&state, id, ProxyKind::Azure, forward_path, req).await
        }
        (_, ["endpoints", id, "extensions", kind, ..]) => {
            let prefix = format!("/api/endpoints/{id}/extensions/{kind}");
            let id = parse_id(id)?;
            let kind = ExtensionType::parse(kind)
                .ok_or_else(|| GatewayError::not_found(API_ERROR_EXTENSION_NOT_SUPPORTED))?;
            let forward_path = forwarded_path(&path, &prefix, query.as_deref());
            proxy_extension_request(&state, id, kind, forward_path, req).await
        }

        ("GET", ["endpoint_groups"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::list_endpoint_groups(&state, access.context()?).await
        }
        ("POST", ["endpoint_groups"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::create_endpoint_group(&state, read_body(req, state.max_body_size).await?)
                .await
        }
        ("PUT", ["endpoint_groups", id, "access"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            let id = parse_id(id)?;
            management::update_endpoint_group_access(
                &state,
                id,
                read_body(req, state.max_body_size).await?,
            )
            .await
        }
        ("DELETE", ["endpoint_groups", id]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::delete_endpoint_group(&state, parse_id(id)?).await
        }

        ("GET", ["registries"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::list_registries(&state, access.context()?).await
        }
        ("POST", ["registries"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::create_registry(&state, read_body(req, state.max_body_size).await?).await
        }
        ("PUT", ["registries", id, "access"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            let id = parse_id(id)?;
            management::update_registry_access(
                &state,
                id,
                read_body(req, state.max_body_size).await?,
            )
            .await
        }
        ("PUT", ["dockerhub"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::update_dockerhub(&state, read_body(req, state.max_body_size).await?).await
        }
        ("GET", ["settings"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::inspect_settings(&state).await
        }
        ("PUT", ["settings"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::update_settings(&state, read_body(req, state.max_body_size).await?).await
        }
        ("POST", ["users"]) => {
            authorize(&state, AccessTier::AdministratorOnly, req.headers()).await?;
            management::create_user(&state, read_body(req, state.max_body_size).await?).await
        }

        ("POST", ["resource_controls"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let body = read_body(req, state.max_body_size).await?;
            management::create_resource_control(&state, access.context()?, body).await
        }
        ("PUT", ["resource_controls", id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let id = parse_id(id)?;
            let body = read_body(req, state.max_body_size).await?;
            management::update_resource_control(&state, access.context()?, id, body).await
        }
        ("DELETE", ["resource_controls", id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::delete_resource_control(&state, access.context()?, parse_id(id)?).await
        }

        ("GET", ["team_memberships"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::list_team_memberships(&state, access.context()?).await
        }
        ("POST", ["team_memberships"]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let body = read_body(req, state.max_body_size).await?;
            management::create_team_membership(&state, access.context()?, body).await
        }
        ("PUT", ["team_memberships", id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            let id = parse_id(id)?;
            let body = read_body(req, state.max_body_size).await?;
            management::update_team_membership(&state, access.context()?, id, body).await
        }
        ("DELETE", ["team_memberships", id]) => {
            let access = authorize(&state, AccessTier::Restricted, req.headers()).await?;
            management::delete_team_membership(&state, access.context()?, parse_id(id)?).await
        }

        _ => Err(GatewayError::not_found(API_ERROR_NOT_FOUND)),
    }
}

fn status(state: &AppState) -> Result<Response<Body>, GatewayError> {
    json_response(
        StatusCode::OK,
        &json!({
            "Authentication": state.bouncer.authentication_enabled(),
            "EndpointManagement": state.endpoint_management,
            "Version": APP_VERSION,
        }),
    )
}

async fn authorize(
    state: &AppState,
    tier: AccessTier,
    headers: &HeaderMap,
) -> Result<RequestAccess, GatewayError> {
    state.bouncer.authorize(tier, headers).await
}

/// Authenticated routes still need memberships to check endpoint access.
async fn authenticated_context(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthorizationContext, GatewayError> {
    let access = authorize(state, AccessTier::Authenticated, headers).await?;
    state
        .bouncer
        .build_authorization_context(access.token()?)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    Docker,
    Azure,
}

#[instrument(skip_all, fields(endpoint_id = %endpoint_id, kind = ?kind))]
async fn proxy_endpoint_request(
    state: &AppState,
    endpoint_id: EndpointId,
    kind: ProxyKind,
    forward_path: String,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let access = authorize(state, AccessTier::Restricted, req.headers()).await?;
    let ctx = access.context()?;
    let endpoint = state.store.endpoint(endpoint_id).await?;
    ensure_endpoint_access(state, &endpoint, ctx).await?;

    let type_matches = match kind {
        ProxyKind::Docker => endpoint.endpoint_type.is_docker_kind(),
        ProxyKind::Azure => endpoint.endpoint_type == EndpointType::Azure,
    };
    if !type_matches {
        return Err(GatewayError::bad_request(format!(
            "endpoint {endpoint_id} does not serve {kind:?} requests"
        )));
    }

    let proxy = match state.proxies.get_proxy(endpoint_id) {
        Some(proxy) => proxy,
        None => {
            state
                .proxies
                .create_and_register_proxy(state.store.as_ref(), endpoint_id)
                .await?
        }
    };
    let request = forward_request(req, forward_path, state.max_body_size).await?;
    let scope = ProxyScope {
        ctx,
        store: state.store.as_ref(),
    };
    proxy.serve(request, &scope).await
}

#[instrument(skip_all, fields(endpoint_id = %endpoint_id, extension = kind.as_str()))]
async fn proxy_extension_request(
    state: &AppState,
    endpoint_id: EndpointId,
    kind: ExtensionType,
    forward_path: String,
    req: Request<Body>,
) -> Result<Response<Body>, GatewayError> {
    let access = authorize(state, AccessTier::Restricted, req.headers()).await?;
    let endpoint = state.store.endpoint(endpoint_id).await?;
    ensure_endpoint_access(state, &endpoint, access.context()?).await?;

    if endpoint.extension(kind).is_none() {
        return Err(GatewayError::not_found(API_ERROR_EXTENSION_NOT_SUPPORTED));
    }
    let key = ExtensionProxyKey { endpoint_id, kind };
    let proxy = match state.proxies.get_extension_proxy(key) {
        Some(proxy) => proxy,
        None => {
            state
                .proxies
                .create_and_register_extension_proxy(state.store.as_ref(), key)
                .await?
        }
    };
    let request = forward_request(req, forward_path, state.max_body_size).await?;
    proxy.serve(request).await
}

async fn forward_request(
    req: Request<Body>,
    path_and_query: String,
    max_body_size: usize,
) -> Result<ForwardRequest, GatewayError> {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = read_body(req, max_body_size).await?;
    Ok(ForwardRequest {
        method,
        path_and_query,
        headers,
        body,
    })
}

/// Path sent upstream once the gateway route prefix is removed.
fn forwarded_path(path: &str, prefix: &str, query: Option<&str>) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or_default();
    let rest = if rest.is_empty() { "/" } else { rest };
    match query {
        Some(query) if !query.is_empty() => format!("{rest}?{query}"),
        _ => rest.to_string(),
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
}

fn parse_id<T: FromStr>(raw: &str) -> Result<T, GatewayError> {
    raw.parse::<T>()
        .map_err(|_| GatewayError::bad_request(API_ERROR_INVALID_IDENTIFIER))
}

pub(crate) fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "rejected request payload");
        GatewayError::bad_request(API_ERROR_INVALID_REQUEST_PAYLOAD)
    })
}

pub(crate) fn json_response<T: Serialize + ?Sized>(
    status: StatusCode,
    body: &T,
) -> Result<Response<Body>, GatewayError> {
    let payload = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, HEADER_JSON)
        .body(Body::from(payload))
        .unwrap_or_else(|_| Response::new(Body::from("{}"))))
}

pub(crate) fn no_content() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn read_body(req: Request<Body>, max_body_size: usize) -> Result<Bytes, GatewayError> {
    to_bytes(req.into_body(), max_body_size)
        .await
        .map_err(|_| GatewayError::http(StatusCode::PAYLOAD_TOO_LARGE, "request entity too large"))
}
