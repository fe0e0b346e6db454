use crate::{
    constants::API_ERROR_EXTENSION_NOT_SUPPORTED,
    docker_proxy,
    error::GatewayError,
    models::{AuthorizationContext, Endpoint, EndpointId, EndpointType, ExtensionType},
    storage::DataStore,
    transport::{ForwardRequest, Transport, TransportOptions},
};
use axum::{body::Body, http::Response};
use dashmap::DashMap;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionProxyKey {
    pub endpoint_id: EndpointId,
    pub kind: ExtensionType,
}

impl fmt::Display for ExtensionProxyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.endpoint_id, self.kind.as_str())
    }
}

/// Per-request data the docker interceptors need.
pub struct ProxyScope<'a> {
    pub ctx: &'a AuthorizationContext,
    pub store: &'a dyn DataStore,
}

pub struct EndpointProxy {
    endpoint_id: EndpointId,
    endpoint_type: EndpointType,
    transport: Transport,
}

impl EndpointProxy {
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint_id
    }

    pub fn transport_kind(&self) -> &'static str {
        self.transport.kind()
    }

    pub async fn serve(
        &self,
        request: ForwardRequest,
        scope: &ProxyScope<'_>,
    ) -> Result<Response<Body>, GatewayError> {
        if self.endpoint_type.is_docker_kind() {
            docker_proxy::forward(&self.transport, request, scope).await
        } else {
            self.transport.send(request).await
        }
    }
}

pub struct ExtensionProxy {
    key: ExtensionProxyKey,
    transport: Transport,
}

impl ExtensionProxy {
    pub fn key(&self) -> ExtensionProxyKey {
        self.key
    }

    pub async fn serve(&self, request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        self.transport.send(request).await
    }
}

type Slot<T> = Arc<OnceCell<Arc<T>>>;

/// Cache of forwarding handlers. Building is once per key: concurrent first
/// requests for the same endpoint wait on the same cell instead of racing.
pub struct ProxyManager {
    options: TransportOptions,
    endpoint_proxies: DashMap<EndpointId, Slot<EndpointProxy>>,
    extension_proxies: DashMap<ExtensionProxyKey, Slot<ExtensionProxy>>,
    transports_built: AtomicUsize,
}

impl ProxyManager {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            endpoint_proxies: DashMap::new(),
            extension_proxies: DashMap::new(),
            transports_built: AtomicUsize::new(0),
        }
    }

    /// Number of transports constructed since startup.
    pub fn transports_built(&self) -> usize {
        self.transports_built.load(Ordering::Relaxed)
    }

    pub fn get_proxy(&self, endpoint_id: EndpointId) -> Option<Arc<EndpointProxy>> {
        self.endpoint_proxies
            .get(&endpoint_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Returns the cached handler for `endpoint_id`, building it on a miss.
    /// The build reads connection material from `store`, never from a copy
    /// the caller looked up before an eviction.
    pub async fn create_and_register_proxy(
        &self,
        store: &dyn DataStore,
        endpoint_id: EndpointId,
    ) -> Result<Arc<EndpointProxy>, GatewayError> {
        let slot = self.endpoint_proxies.entry(endpoint_id).or_default().clone();
        let proxy = slot
            .get_or_try_init(|| async {
                let endpoint = store.endpoint(endpoint_id).await?;
                let transport = Transport::for_endpoint(&endpoint, &self.options).await?;
                self.transports_built.fetch_add(1, Ordering::Relaxed);
                info!(
                    endpoint_id = %endpoint.id,
                    transport = transport.kind(),
                    "registered endpoint proxy"
                );
                Ok::<_, GatewayError>(Arc::new(EndpointProxy {
                    endpoint_id: endpoint.id,
                    endpoint_type: endpoint.endpoint_type,
                    transport,
                }))
            })
            .await?;
        Ok(proxy.clone())
    }

    pub fn get_extension_proxy(&self, key: ExtensionProxyKey) -> Option<Arc<ExtensionProxy>> {
        self.extension_proxies
            .get(&key)
            .and_then(|slot| slot.get().cloned())
    }

    pub async fn create_and_register_extension_proxy(
        &self,
        store: &dyn DataStore,
        key: ExtensionProxyKey,
    ) -> Result<Arc<ExtensionProxy>, GatewayError> {
        let slot = self.extension_proxies.entry(key).or_default().clone();
        let proxy = slot
            .get_or_try_init(|| async {
                let endpoint = store.endpoint(key.endpoint_id).await?;
                let extension = endpoint
                    .extension(key.kind)
                    .ok_or_else(|| GatewayError::not_found(API_ERROR_EXTENSION_NOT_SUPPORTED))?;
                let transport = Transport::for_url(&extension.url).await?;
                self.transports_built.fetch_add(1, Ordering::Relaxed);
                info!(extension = %key, "registered extension proxy");
                Ok::<_, GatewayError>(Arc::new(ExtensionProxy { key, transport }))
            })
            .await?;
        Ok(proxy.clone())
    }

    pub fn delete_proxy(&self, endpoint_id: EndpointId) {
        if self.endpoint_proxies.remove(&endpoint_id).is_some() {
            debug!(endpoint_id = %endpoint_id, "evicted endpoint proxy");
        }
    }

    pub fn delete_extension_proxy(&self, key: ExtensionProxyKey) {
        if self.extension_proxies.remove(&key).is_some() {
            debug!(extension = %key, "evicted extension proxy");
        }
    }

    pub fn delete_extension_proxies(&self, endpoint_id: EndpointId) {
        self.extension_proxies
            .retain(|key, _| key.endpoint_id != endpoint_id);
    }

    /// Builds a transport for `endpoint` without caching it, surfacing
    /// malformed connection material before it is persisted.
    pub async fn validate(&self, endpoint: &Endpoint) -> Result<(), GatewayError> {
        Transport::for_endpoint(endpoint, &self.options)
            .await
            .map(|_| ())
    }
}
