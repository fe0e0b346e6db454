use crate::{
    api,
    bouncer::{RequestBouncer, secure_headers},
    proxy::ProxyManager,
    stacks::StackDeployer,
    storage::DataStore,
};
use axum::{Router, middleware::map_response, routing::any};
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub bouncer: Arc<RequestBouncer>,
    pub proxies: Arc<ProxyManager>,
    pub stacks: Arc<StackDeployer>,
    pub compose_dir: PathBuf,
    pub endpoint_management: bool,
    pub max_body_size: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .fallback(any(api::dispatch))
        .layer(map_response(secure_headers))
        .with_state(state)
}
