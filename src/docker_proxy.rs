//! Docker-specific interception around a transport: registry credential
//! injection on the way out, listing filtering on the way back.

use crate::{
    constants::HEADER_REGISTRY_AUTH,
    error::GatewayError,
    proxy::ProxyScope,
    registry_auth::{
        RegistryAccessContext, carries_registry_auth, requested_server_address,
        select_registry_credential,
    },
    response_filter::{FilterPolicy, ListingRoute, filter_listing_response, strip_api_version},
    transport::{ForwardRequest, Transport},
};
use axum::{body::Body, http::Response};
use tracing::debug;

pub async fn forward(
    transport: &Transport,
    mut request: ForwardRequest,
    scope: &ProxyScope<'_>,
) -> Result<Response<Body>, GatewayError> {
    let path = request
        .path_and_query
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();

    if carries_registry_auth(&request.method, strip_api_version(&path)) {
        inject_registry_auth(&mut request, scope).await?;
    }

    let listing = ListingRoute::match_request(&request.method, &path);
    let response = transport.send(request).await?;
    let Some(route) = listing else {
        return Ok(response);
    };

    let resource_controls = scope.store.resource_controls().await?;
    let settings = scope.store.settings().await?;
    let policy = FilterPolicy {
        ctx: scope.ctx,
        resource_controls: &resource_controls,
        blacklisted_labels: &settings.black_listed_labels,
    };
    filter_listing_response(route, response, &policy).await
}

async fn inject_registry_auth(
    request: &mut ForwardRequest,
    scope: &ProxyScope<'_>,
) -> Result<(), GatewayError> {
    let Some(server_address) = requested_server_address(request.headers.get(HEADER_REGISTRY_AUTH))
    else {
        debug!("registry auth header does not decode, forwarding it untouched");
        return Ok(());
    };
    let registries = scope.store.registries().await?;
    let dockerhub = scope.store.dockerhub().await?;
    let access = RegistryAccessContext {
        ctx: scope.ctx,
        dockerhub: &dockerhub,
        registries: &registries,
    };

    match select_registry_credential(&server_address, &access) {
        Some(credential) => {
            debug!(server_address = %credential.server_address, "injecting registry credentials");
            request
                .headers
                .insert(HEADER_REGISTRY_AUTH, credential.to_header_value()?);
        }
        None => debug!(server_address = %server_address, "no registry credentials to inject"),
    }
    Ok(())
}
