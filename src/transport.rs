//! Outbound transports, one per connection kind.
//!
//! A transport owns everything needed to reach one upstream: the socket
//! path, a TLS-configured HTTP client, or an Azure client plus its cached
//! bearer token. Transports are built once per endpoint by the proxy
//! registry and shared by every request to that endpoint.

use crate::{
    constants::AZURE_MANAGEMENT_RESOURCE,
    error::GatewayError,
    models::{AzureCredentials, Endpoint, EndpointType, TlsConfiguration},
};
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode, header},
};
use chrono::Utc;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// A buffered request already stripped of the gateway route prefix.
pub struct ForwardRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub azure_login_url: String,
}

pub enum Transport {
    Socket(SocketTransport),
    Http(HttpTransport),
    Azure(AzureTransport),
}

impl Transport {
    pub async fn for_endpoint(
        endpoint: &Endpoint,
        options: &TransportOptions,
    ) -> Result<Self, GatewayError> {
        if endpoint.endpoint_type == EndpointType::Azure {
            if !endpoint.azure_credentials.is_complete() {
                return Err(GatewayError::Configuration(
                    "azure endpoint is missing credentials".to_string(),
                ));
            }
            let client = http_client(&TlsConfiguration::default()).await?;
            return Ok(Self::Azure(AzureTransport::new(
                client,
                &endpoint.url,
                &options.azure_login_url,
                endpoint.azure_credentials.clone(),
            )));
        }

        if let Some(path) = endpoint.url.strip_prefix("unix://") {
            return Ok(Self::Socket(SocketTransport {
                path: PathBuf::from(path),
            }));
        }

        let base_url = http_base_url(&endpoint.url, endpoint.tls_config.tls)?;
        let client = http_client(&endpoint.tls_config).await?;
        Ok(Self::Http(HttpTransport { client, base_url }))
    }

    /// Plain HTTP forwarding, used for endpoint extensions.
    pub async fn for_url(url: &str) -> Result<Self, GatewayError> {
        let base_url = http_base_url(url, false)?;
        let client = http_client(&TlsConfiguration::default()).await?;
        Ok(Self::Http(HttpTransport { client, base_url }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Socket(_) => "socket",
            Self::Http(_) => "http",
            Self::Azure(_) => "azure",
        }
    }

    pub async fn send(&self, request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        match self {
            Self::Socket(transport) => transport.send(request).await,
            Self::Http(transport) => transport.send(request).await,
            Self::Azure(transport) => transport.send(request).await,
        }
    }
}

fn http_base_url(url: &str, tls: bool) -> Result<String, GatewayError> {
    let url = url.trim().trim_end_matches('/');
    if let Some(address) = url.strip_prefix("tcp://") {
        let scheme = if tls { "https" } else { "http" };
        return Ok(format!("{scheme}://{address}"));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(url.to_string());
    }
    Err(GatewayError::Configuration(format!(
        "unsupported endpoint url '{url}'"
    )))
}

async fn read_material(kind: &str, path: &str) -> Result<Vec<u8>, GatewayError> {
    tokio::fs::read(path).await.map_err(|err| {
        GatewayError::Configuration(format!("unable to read TLS {kind} at {path}: {err}"))
    })
}

async fn http_client(tls: &TlsConfiguration) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if tls.tls {
        if tls.tls_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(path) = tls.tls_ca_cert_path.as_deref() {
            let pem = read_material("CA certificate", path).await?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                GatewayError::Configuration(format!("invalid CA certificate: {err}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        match (tls.tls_cert_path.as_deref(), tls.tls_key_path.as_deref()) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = read_material("certificate", cert_path).await?;
                pem.push(b'\n');
                pem.extend(read_material("key", key_path).await?);
                let identity = reqwest::Identity::from_pem(&pem).map_err(|err| {
                    GatewayError::Configuration(format!("invalid client certificate: {err}"))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(GatewayError::Configuration(
                    "client certificate and key must be provided together".to_string(),
                ));
            }
        }
    }
    builder
        .build()
        .map_err(|err| GatewayError::Configuration(format!("unable to build client: {err}")))
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers forwarded upstream. The gateway's own credential never leaves.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::AUTHORIZATION {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            kept.append(name.clone(), value.clone());
        }
    }
    kept
}

fn into_axum_response(response: reqwest::Response) -> Response<Body> {
    let status = response.status();
    let headers = response_headers(response.headers());
    let mut out = Response::new(Body::from_stream(response.bytes_stream()));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

fn upstream_error(context: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::Upstream(format!("{context}: {err}"))
}

pub struct SocketTransport {
    path: PathBuf,
}

impl SocketTransport {
    #[cfg(unix)]
    #[instrument(skip_all, fields(socket = %self.path.display(), method = %request.method))]
    async fn send(&self, request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        use hyper_util::rt::TokioIo;

        let stream = tokio::net::UnixStream::connect(&self.path)
            .await
            .map_err(|err| upstream_error("unable to reach docker socket", err))?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| upstream_error("socket handshake failed", err))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "socket connection closed with error");
            }
        });

        let mut outbound = hyper::Request::builder()
            .method(request.method)
            .uri(request.path_and_query)
            .body(Body::from(request.body))
            .map_err(|err| GatewayError::bad_request(format!("invalid upstream request: {err}")))?;
        *outbound.headers_mut() = forwardable_headers(&request.headers);
        outbound
            .headers_mut()
            .insert(header::HOST, HeaderValue::from_static("docker"));

        let response = sender
            .send_request(outbound)
            .await
            .map_err(|err| upstream_error("docker socket request failed", err))?;
        let (mut parts, body) = response.into_parts();
        parts.headers = response_headers(&parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    #[cfg(not(unix))]
    async fn send(&self, _request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        Err(GatewayError::Configuration(format!(
            "unix sockets are not supported on this platform ({})",
            self.path.display()
        )))
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    #[instrument(skip_all, fields(upstream = %self.base_url, method = %request.method))]
    async fn send(&self, request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        let url = format!("{}{}", self.base_url, request.path_and_query);
        let mut builder = self
            .client
            .request(request.method, url)
            .headers(forwardable_headers(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| upstream_error("upstream request failed", err))?;
        Ok(into_axum_response(response))
    }
}

#[derive(Debug, Clone)]
struct AzureToken {
    access_token: String,
    expires_at: i64,
}

impl AzureToken {
    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_EXPIRY_SKEW_SECS < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct AzureTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<serde_json::Value>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

fn json_i64(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Bearer-token transport for the Azure management API. Token acquisition
/// is serialized through `token`, so concurrent requests share one refresh.
pub struct AzureTransport {
    client: reqwest::Client,
    management_url: String,
    token_url: String,
    credentials: AzureCredentials,
    token: Mutex<Option<AzureToken>>,
}

impl AzureTransport {
    fn new(
        client: reqwest::Client,
        management_url: &str,
        login_url: &str,
        credentials: AzureCredentials,
    ) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/token",
            login_url.trim_end_matches('/'),
            credentials.tenant_id
        );
        Self {
            client,
            management_url: management_url.trim_end_matches('/').to_string(),
            token_url,
            credentials,
            token: Mutex::new(None),
        }
    }

    async fn acquire_token(&self) -> Result<AzureToken, GatewayError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.application_id.as_str()),
            ("client_secret", self.credentials.authentication_key.as_str()),
            ("resource", AZURE_MANAGEMENT_RESOURCE),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| upstream_error("azure authentication request failed", err))?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "azure authentication rejected");
            return Err(GatewayError::Upstream(format!(
                "azure authentication failed with status {}",
                response.status()
            )));
        }
        let payload = response
            .json::<AzureTokenResponse>()
            .await
            .map_err(|err| upstream_error("invalid azure token response", err))?;

        let now = Utc::now().timestamp();
        let expires_at = json_i64(payload.expires_on.as_ref())
            .or_else(|| json_i64(payload.expires_in.as_ref()).map(|secs| now + secs))
            .unwrap_or(now + DEFAULT_TOKEN_LIFETIME_SECS);
        debug!(expires_at, "acquired azure token");
        Ok(AzureToken {
            access_token: payload.access_token,
            expires_at,
        })
    }

    async fn current_token(&self) -> Result<String, GatewayError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref()
            && token.is_fresh(Utc::now().timestamp())
        {
            return Ok(token.access_token.clone());
        }
        let token = self.acquire_token().await?;
        let value = token.access_token.clone();
        *guard = Some(token);
        Ok(value)
    }

    async fn invalidate(&self, rejected: &str) {
        let mut guard = self.token.lock().await;
        if guard
            .as_ref()
            .is_some_and(|token| token.access_token == rejected)
        {
            *guard = None;
        }
    }

    async fn dispatch(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
        token: &str,
    ) -> Result<reqwest::Response, GatewayError> {
        self.client
            .request(
                method.clone(),
                format!("{}{}", self.management_url, path_and_query),
            )
            .headers(headers.clone())
            .bearer_auth(token)
            .body(body)
            .send()
            .await
            .map_err(|err| upstream_error("azure request failed", err))
    }

    #[instrument(skip_all, fields(upstream = %self.management_url, method = %request.method))]
    async fn send(&self, request: ForwardRequest) -> Result<Response<Body>, GatewayError> {
        let body = request.body;
        let headers = forwardable_headers(&request.headers);

        let token = self.current_token().await?;
        let response = self
            .dispatch(
                &request.method,
                &request.path_and_query,
                &headers,
                body.clone(),
                &token,
            )
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(into_axum_response(response));
        }

        debug!("azure rejected cached token, refreshing once");
        self.invalidate(&token).await;
        let token = self.current_token().await?;
        let response = self
            .dispatch(
                &request.method,
                &request.path_and_query,
                &headers,
                body,
                &token,
            )
            .await?;
        Ok(into_axum_response(response))
    }
}
