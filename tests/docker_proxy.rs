use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use berth::{
    app::{AppState, build_router},
    auth::TokenClaims,
    config::Config,
    models::{
        AccessLevel, AzureCredentials, DockerHub, Endpoint, EndpointGroupId, EndpointId,
        EndpointType, MembershipRole, Pair, Registry, RegistryId, ResourceControl,
        ResourceControlId, ResourceControlType, Settings, TeamId, TeamMembership,
        TeamMembershipId, TeamResourceAccess, TlsConfiguration, UserId, UserResourceAccess,
        UserRole,
    },
    registry_auth::RegistryCredential,
    runtime,
};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use std::path::PathBuf;
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::{
    Match, Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

const SECRET: &str = "docker-proxy-secret";

struct Fixture {
    _dir: TempDir,
    state: AppState,
    app: Router,
    admin: String,
    alice: String,
    bob: String,
}

fn base_config(data_dir: PathBuf) -> Config {
    let mut cfg = Config::defaults();
    cfg.bind = "127.0.0.1:0".parse().expect("bind");
    cfg.data_dir = data_dir;
    cfg.jwt_secret = Some(SECRET.to_string());
    cfg
}

fn token(id: u32, username: &str, role: UserRole) -> String {
    let claims = TokenClaims {
        id,
        username: username.to_string(),
        role,
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

fn tcp_url(server: &MockServer) -> String {
    server.uri().replacen("http://", "tcp://", 1)
}

fn docker_endpoint(url: String, users: Vec<UserId>) -> Endpoint {
    Endpoint {
        id: EndpointId(0),
        name: "local".to_string(),
        endpoint_type: EndpointType::Docker,
        url,
        public_url: String::new(),
        group_id: EndpointGroupId(1),
        tls_config: TlsConfiguration::default(),
        azure_credentials: AzureCredentials::default(),
        authorized_users: users,
        authorized_teams: Vec::new(),
        extensions: Vec::new(),
    }
}

/// admin (1), alice (2, leader of team 7) and bob (3); endpoint 1 is
/// authorized for alice only.
async fn fixture(upstream: &MockServer) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let cfg = base_config(dir.path().to_path_buf());
    let state = runtime::build_state(&cfg, None).await.expect("state");

    let admin = state
        .store
        .create_user("admin", UserRole::Administrator)
        .await
        .expect("admin");
    let alice = state
        .store
        .create_user("alice", UserRole::Standard)
        .await
        .expect("alice");
    let bob = state
        .store
        .create_user("bob", UserRole::Standard)
        .await
        .expect("bob");
    state
        .store
        .create_team_membership(TeamMembership {
            id: TeamMembershipId(0),
            user_id: alice.id,
            team_id: TeamId(7),
            role: MembershipRole::Leader,
        })
        .await
        .expect("membership");
    state
        .store
        .create_endpoint(docker_endpoint(tcp_url(upstream), vec![alice.id]))
        .await
        .expect("endpoint");

    Fixture {
        app: build_router(state.clone()),
        admin: token(admin.id.0, "admin", UserRole::Administrator),
        alice: token(alice.id.0, "alice", UserRole::Standard),
        bob: token(bob.id.0, "bob", UserRole::Standard),
        state,
        _dir: dir,
    }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(body).expect("request")
}

async fn send(app: &Router, req: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(req).await.expect("response")
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

async fn json_body(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

fn ids(listing: &Value) -> Vec<&str> {
    listing
        .as_array()
        .expect("array")
        .iter()
        .map(|entry| entry["Id"].as_str().expect("id"))
        .collect()
}

fn owned_by_user(resource_id: &str, user: u32) -> ResourceControl {
    ResourceControl {
        id: ResourceControlId(0),
        resource_id: resource_id.to_string(),
        sub_resource_ids: Vec::new(),
        resource_type: ResourceControlType::Container,
        administrators_only: false,
        user_accesses: vec![UserResourceAccess {
            user_id: UserId(user),
            access_level: AccessLevel::ReadWrite,
        }],
        team_accesses: Vec::new(),
    }
}

struct WithoutAuthorization;

impl Match for WithoutAuthorization {
    fn matches(&self, request: &wiremock::Request) -> bool {
        !request.headers.contains_key("authorization")
    }
}

#[tokio::test]
async fn status_is_public_and_carries_security_headers() {
    let upstream = MockServer::start().await;
    let fx = fixture(&upstream).await;

    let res = send(&fx.app, request(Method::GET, "/api/status", None, Body::empty())).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers()
            .get("x-content-type-options")
            .and_then(|value| value.to_str().ok()),
        Some("nosniff")
    );
    let body = json_body(res).await;
    assert_eq!(body["Authentication"], json!(true));
    assert_eq!(body["EndpointManagement"], json!(true));
}

#[tokio::test]
async fn proxied_requests_require_a_token() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/docker/containers/json",
            None,
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/docker/containers/json",
            Some("not-a-jwt"),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unauthorized_endpoint_is_forbidden_before_reaching_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/docker/_ping",
            Some(&fx.bob),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(fx.state.proxies.transports_built(), 0);
}

#[tokio::test]
async fn unknown_endpoint_is_not_found() {
    let upstream = MockServer::start().await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/42/docker/_ping",
            Some(&fx.admin),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = send(
        &fx.app,
        request(Method::GET, "/api/nowhere", Some(&fx.admin), Body::empty()),
    )
    .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(res.headers().contains_key("x-frame-options"));
}

#[tokio::test]
async fn container_listing_is_filtered_per_caller() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1.41/containers/json"))
        .and(query_param("all", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "Id": "c1", "Labels": {} },
            { "Id": "c2", "Labels": {} },
            { "Id": "c3", "Labels": { "internal": "true" } },
            { "Id": "c4", "Labels": {} },
        ])))
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    fx.state
        .store
        .create_resource_control(owned_by_user("c2", 3))
        .await
        .expect("c2 control");
    let mut team_owned = owned_by_user("c4", 3);
    team_owned.user_accesses.clear();
    team_owned.team_accesses.push(TeamResourceAccess {
        team_id: TeamId(7),
        access_level: AccessLevel::ReadWrite,
    });
    fx.state
        .store
        .create_resource_control(team_owned)
        .await
        .expect("c4 control");
    fx.state
        .store
        .update_settings(Settings {
            black_listed_labels: vec![Pair {
                name: "internal".to_string(),
                value: "true".to_string(),
            }],
        })
        .await
        .expect("settings");

    let uri = "/api/endpoints/1/docker/v1.41/containers/json?all=1";
    let res = send(&fx.app, request(Method::GET, uri, Some(&fx.alice), Body::empty())).await;
    assert_eq!(res.status(), StatusCode::OK);
    let listing = json_body(res).await;
    assert_eq!(ids(&listing), vec!["c1", "c4"]);
    assert!(listing[0].get("Berth").is_none());
    assert_eq!(
        listing[1]["Berth"]["ResourceControl"]["ResourceID"],
        json!("c4")
    );

    let res = send(&fx.app, request(Method::GET, uri, Some(&fx.admin), Body::empty())).await;
    assert_eq!(res.status(), StatusCode::OK);
    let listing = json_body(res).await;
    assert_eq!(ids(&listing), vec!["c1", "c2", "c4"]);
    assert_eq!(
        listing[1]["Berth"]["ResourceControl"]["ResourceID"],
        json!("c2")
    );
}

#[tokio::test]
async fn failed_listings_pass_through_untouched() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/containers/json"))
        .respond_with(ResponseTemplate::new(500).set_body_string("daemon unavailable"))
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/docker/containers/json",
            Some(&fx.alice),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_bytes(res).await, b"daemon unavailable");
}

#[tokio::test]
async fn gateway_credentials_are_not_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_ping"))
        .and(WithoutAuthorization)
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/docker/_ping",
            Some(&fx.alice),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_bytes(res).await, b"OK");
}

#[tokio::test]
async fn registry_credentials_replace_the_client_header() {
    let upstream = MockServer::start().await;
    let expected = RegistryCredential {
        username: "ci".to_string(),
        password: "s3cret".to_string(),
        server_address: "registry.example.com".to_string(),
    }
    .to_header_value()
    .expect("header value");
    Mock::given(method("POST"))
        .and(path("/images/create"))
        .and(query_param("fromImage", "registry.example.com/app"))
        .and(wiremock::matchers::header(
            "x-registry-auth",
            expected.to_str().expect("ascii"),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("pulled"))
        .expect(1)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;
    fx.state
        .store
        .create_registry(Registry {
            id: RegistryId(0),
            name: "private".to_string(),
            url: "registry.example.com".to_string(),
            authentication: true,
            username: "ci".to_string(),
            password: "s3cret".to_string(),
            authorized_users: vec![UserId(2)],
            authorized_teams: Vec::new(),
        })
        .await
        .expect("registry");

    let requested = URL_SAFE.encode(
        serde_json::to_vec(&json!({ "serveraddress": "registry.example.com" })).expect("json"),
    );
    let mut req = request(
        Method::POST,
        "/api/endpoints/1/docker/images/create?fromImage=registry.example.com/app",
        Some(&fx.alice),
        Body::empty(),
    );
    req.headers_mut()
        .insert("x-registry-auth", requested.parse().expect("header"));

    let res = send(&fx.app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_bytes(res).await, b"pulled");
}

#[tokio::test]
async fn undecodable_registry_header_is_forwarded_untouched() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/create"))
        .and(wiremock::matchers::header("x-registry-auth", "opaque%%token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("pulled"))
        .expect(1)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;
    fx.state
        .store
        .update_dockerhub(DockerHub {
            authentication: true,
            username: "hub".to_string(),
            password: "hub-pass".to_string(),
        })
        .await
        .expect("dockerhub");

    let mut req = request(
        Method::POST,
        "/api/endpoints/1/docker/images/create?fromImage=quay.io/app",
        Some(&fx.alice),
        Body::empty(),
    );
    req.headers_mut()
        .insert("x-registry-auth", "opaque%%token".parse().expect("header"));

    let res = send(&fx.app, req).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_transport() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(16)
        .mount(&upstream)
        .await;
    let fx = fixture(&upstream).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let app = fx.app.clone();
        let token = fx.alice.clone();
        handles.push(tokio::spawn(async move {
            let req = request(
                Method::GET,
                "/api/endpoints/1/docker/_ping",
                Some(&token),
                Body::empty(),
            );
            app.oneshot(req).await.expect("response").status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("join"), StatusCode::OK);
    }
    assert_eq!(fx.state.proxies.transports_built(), 1);
}

#[tokio::test]
async fn endpoint_update_repoints_the_proxy() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/_ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("first"))
        .mount(&first)
        .await;
    Mock::given(method("GET"))
        .and(path("/_ping"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second"))
        .mount(&second)
        .await;
    let fx = fixture(&first).await;
    let ping = || {
        request(
            Method::GET,
            "/api/endpoints/1/docker/_ping",
            Some(&fx.admin),
            Body::empty(),
        )
    };

    let res = send(&fx.app, ping()).await;
    assert_eq!(body_bytes(res).await, b"first");

    let update = json!({ "URL": tcp_url(&second) }).to_string();
    let res = send(
        &fx.app,
        request(
            Method::PUT,
            "/api/endpoints/1",
            Some(&fx.admin),
            Body::from(update),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = send(&fx.app, ping()).await;
    assert_eq!(body_bytes(res).await, b"second");
    assert_eq!(fx.state.proxies.transports_built(), 2);
}

#[tokio::test]
async fn docker_endpoints_reject_azure_routes() {
    let upstream = MockServer::start().await;
    let fx = fixture(&upstream).await;

    let res = send(
        &fx.app,
        request(
            Method::GET,
            "/api/endpoints/1/azure/subscriptions",
            Some(&fx.alice),
            Body::empty(),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let upstream = MockServer::start().await;
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = base_config(dir.path().to_path_buf());
    cfg.max_body_size = 16;
    let state = runtime::build_state(&cfg, None).await.expect("state");
    state
        .store
        .create_user("admin", UserRole::Administrator)
        .await
        .expect("admin");
    state
        .store
        .create_endpoint(docker_endpoint(tcp_url(&upstream), Vec::new()))
        .await
        .expect("endpoint");
    let app = build_router(state);
    let admin = token(1, "admin", UserRole::Administrator);

    let res = send(
        &app,
        request(
            Method::POST,
            "/api/endpoints/1/docker/containers/create",
            Some(&admin),
            Body::from(vec![b'x'; 64]),
        ),
    )
    .await;
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
