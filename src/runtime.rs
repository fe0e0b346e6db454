use crate::{
    app::{AppState, build_router},
    auth::{DisabledTokenVerifier, JwtTokenVerifier, TokenVerifier},
    bouncer::RequestBouncer,
    config::Config,
    constants::DEFAULT_ENDPOINT_GROUP_ID,
    error::GatewayError,
    models::{AzureCredentials, Endpoint, EndpointGroupId, EndpointId, EndpointType, UserRole},
    observability,
    proxy::ProxyManager,
    stacks::{DockerCliStackManager, StackDeployer, StackManager},
    storage::{DataStore, Store, ensure_defaults},
    transport::TransportOptions,
};
use std::sync::Arc;
use tracing::{info, instrument};

#[instrument(skip(config, stack_manager))]
pub async fn build_state(
    config: &Config,
    stack_manager: Option<Arc<dyn StackManager>>,
) -> Result<AppState, GatewayError> {
    let store: Arc<dyn DataStore> = Arc::new(Store::open(config).await?);
    ensure_defaults(store.as_ref(), &config.hidden_labels).await?;
    bootstrap_initial_endpoint(config, store.as_ref()).await?;
    bootstrap_admin(config, store.as_ref()).await?;

    let verifier: Arc<dyn TokenVerifier> = if config.auth_disabled {
        Arc::new(DisabledTokenVerifier)
    } else {
        let secret = config.jwt_secret.as_deref().ok_or_else(|| {
            GatewayError::Configuration(
                "a jwt secret is required when authentication is enabled".to_string(),
            )
        })?;
        Arc::new(JwtTokenVerifier::new(secret.as_bytes()))
    };

    let stack_manager = stack_manager.unwrap_or_else(|| {
        Arc::new(DockerCliStackManager::new(
            config.docker_binary.clone(),
            config.data_dir.join("docker"),
        ))
    });

    Ok(AppState {
        bouncer: Arc::new(RequestBouncer::new(
            verifier,
            store.clone(),
            !config.auth_disabled,
        )),
        store,
        proxies: Arc::new(ProxyManager::new(TransportOptions {
            azure_login_url: config.azure_login_url.clone(),
        })),
        stacks: Arc::new(StackDeployer::new(stack_manager)),
        compose_dir: config.data_dir.join("compose"),
        endpoint_management: config.endpoint_management,
        max_body_size: config.max_body_size,
    })
}

async fn bootstrap_initial_endpoint(
    config: &Config,
    store: &dyn DataStore,
) -> Result<(), GatewayError> {
    let Some(initial) = &config.initial_endpoint else {
        return Ok(());
    };
    if !store.endpoints().await?.is_empty() {
        return Ok(());
    }
    let endpoint = store
        .create_endpoint(Endpoint {
            id: EndpointId(0),
            name: "primary".to_string(),
            endpoint_type: EndpointType::Docker,
            url: initial.url.clone(),
            public_url: String::new(),
            group_id: EndpointGroupId(DEFAULT_ENDPOINT_GROUP_ID),
            tls_config: initial.tls.clone(),
            azure_credentials: AzureCredentials::default(),
            authorized_users: Vec::new(),
            authorized_teams: Vec::new(),
            extensions: Vec::new(),
        })
        .await?;
    info!(endpoint_id = %endpoint.id, url = %endpoint.url, "registered initial endpoint");
    Ok(())
}

async fn bootstrap_admin(config: &Config, store: &dyn DataStore) -> Result<(), GatewayError> {
    let Some(username) = config.admin_username.as_deref() else {
        return Ok(());
    };
    let users = store.users().await?;
    if users
        .iter()
        .any(|user| user.username.eq_ignore_ascii_case(username))
    {
        return Ok(());
    }
    let user = store
        .create_user(username, UserRole::Administrator)
        .await?;
    info!(user_id = %user.id, username, "created administrator");
    Ok(())
}

pub async fn run(
    config: Config,
    stack_manager: Option<Arc<dyn StackManager>>,
) -> Result<(), GatewayError> {
    let bind = config.bind;
    let data_dir = config.data_dir.display().to_string();
    let state = build_state(&config, stack_manager).await?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;

    info!(
        bind = %bind,
        data_dir,
        authentication = !config.auth_disabled,
        endpoint_management = config.endpoint_management,
        "berth listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|_| GatewayError::Internal)
}

pub async fn run_standalone(config: Config) -> Result<(), GatewayError> {
    let default_level = startup_log_level(&config).to_string();
    let tracing_settings = observability::init_from_env(&default_level);
    tracing::debug!(
        log_filter = tracing_settings.filter,
        log_format = tracing_settings.log_format.as_str(),
        "initialized tracing subscriber"
    );
    run(config, None).await
}

fn startup_log_level(config: &Config) -> &str {
    config.log_level.as_str()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                let _ = sigterm.recv().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
