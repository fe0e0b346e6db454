//! Request gate: resolves the caller and builds the per-request
//! authorization context for the tier a route requires.

use crate::{
    auth::TokenVerifier,
    constants::{API_ERROR_ADMIN_REQUIRED, API_ERROR_INVALID_TOKEN, API_ERROR_UNAUTHORIZED},
    error::GatewayError,
    models::{AuthorizationContext, MembershipRole, TokenData, UserId, UserRole},
    storage::DataStore,
};
use axum::{
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTier {
    Public,
    Authenticated,
    Restricted,
    AdministratorOnly,
}

/// What the gate established about the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestAccess {
    pub token: Option<TokenData>,
    pub context: Option<AuthorizationContext>,
}

impl RequestAccess {
    pub fn token(&self) -> Result<&TokenData, GatewayError> {
        self.token
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized(API_ERROR_UNAUTHORIZED))
    }

    pub fn context(&self) -> Result<&AuthorizationContext, GatewayError> {
        self.context
            .as_ref()
            .ok_or_else(|| GatewayError::unauthorized(API_ERROR_UNAUTHORIZED))
    }
}

pub struct RequestBouncer {
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn DataStore>,
    authentication_enabled: bool,
}

impl RequestBouncer {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn DataStore>,
        authentication_enabled: bool,
    ) -> Self {
        Self {
            verifier,
            store,
            authentication_enabled,
        }
    }

    pub fn authentication_enabled(&self) -> bool {
        self.authentication_enabled
    }

    #[instrument(skip_all, fields(tier = ?tier))]
    pub async fn authorize(
        &self,
        tier: AccessTier,
        headers: &HeaderMap,
    ) -> Result<RequestAccess, GatewayError> {
        match tier {
            AccessTier::Public => Ok(RequestAccess::default()),
            AccessTier::Authenticated => Ok(RequestAccess {
                token: Some(self.resolve_principal(headers).await?),
                context: None,
            }),
            AccessTier::AdministratorOnly => {
                let token = self.resolve_principal(headers).await?;
                if !token.is_admin() {
                    debug!(user_id = %token.id, "administrator route refused");
                    return Err(GatewayError::access_denied(API_ERROR_ADMIN_REQUIRED));
                }
                Ok(RequestAccess {
                    context: Some(AuthorizationContext::administrator(token.id)),
                    token: Some(token),
                })
            }
            AccessTier::Restricted => {
                let token = self.resolve_principal(headers).await?;
                let context = self.build_authorization_context(&token).await?;
                Ok(RequestAccess {
                    token: Some(token),
                    context: Some(context),
                })
            }
        }
    }

    /// Verifies the bearer token and confirms the user still exists. The
    /// returned role is the stored one, so a demotion takes effect at once.
    pub async fn resolve_principal(&self, headers: &HeaderMap) -> Result<TokenData, GatewayError> {
        if !self.authentication_enabled {
            return Ok(TokenData {
                id: UserId(0),
                username: "admin".to_string(),
                role: UserRole::Administrator,
            });
        }

        let Some(token) = bearer_token(headers) else {
            return Err(GatewayError::unauthorized(API_ERROR_UNAUTHORIZED));
        };
        let token_data = self.verifier.verify(&token).await?;

        match self.store.user(token_data.id).await {
            Ok(user) => Ok(TokenData {
                id: user.id,
                username: user.username,
                role: user.role,
            }),
            Err(err) if err.is_not_found() => {
                warn!(user_id = %token_data.id, "token references unknown user");
                Err(GatewayError::unauthorized(API_ERROR_INVALID_TOKEN))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn build_authorization_context(
        &self,
        token: &TokenData,
    ) -> Result<AuthorizationContext, GatewayError> {
        if token.is_admin() {
            return Ok(AuthorizationContext::administrator(token.id));
        }

        let memberships = self.store.team_memberships_by_user(token.id).await?;
        let is_team_leader = memberships
            .iter()
            .any(|membership| membership.role == MembershipRole::Leader);
        Ok(AuthorizationContext {
            is_admin: false,
            is_team_leader,
            user_id: token.id,
            memberships,
        })
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Response layer applied to every route, public ones included.
pub async fn secure_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::{AccessTier, RequestBouncer, bearer_token};
    use crate::{
        auth::TokenVerifier,
        error::GatewayError,
        models::{MembershipRole, TeamId, TeamMembership, TeamMembershipId, TokenData, UserId, UserRole},
        storage::{DataStore, Store},
    };
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct IdTokenVerifier;

    #[async_trait]
    impl TokenVerifier for IdTokenVerifier {
        async fn verify(&self, token: &str) -> Result<TokenData, GatewayError> {
            let id = token
                .parse::<u32>()
                .map_err(|_| GatewayError::unauthorized("bad token"))?;
            Ok(TokenData {
                id: UserId(id),
                username: String::new(),
                role: UserRole::Standard,
            })
        }
    }

    fn headers_with_token(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).expect("header"),
        );
        headers
    }

    async fn bouncer(dir: &TempDir, enabled: bool) -> (RequestBouncer, Arc<Store>) {
        let store = Arc::new(Store::open_at(dir.path()).await.expect("store"));
        store
            .create_user("admin", UserRole::Administrator)
            .await
            .expect("admin");
        store
            .create_user("bob", UserRole::Standard)
            .await
            .expect("bob");
        store
            .create_team_membership(TeamMembership {
                id: TeamMembershipId(0),
                user_id: UserId(2),
                team_id: TeamId(4),
                role: MembershipRole::Leader,
            })
            .await
            .expect("membership");
        (
            RequestBouncer::new(Arc::new(IdTokenVerifier), store.clone(), enabled),
            store,
        )
    }

    #[test]
    fn extracts_bearer_token() {
        assert_eq!(
            bearer_token(&headers_with_token("abc")).as_deref(),
            Some("abc")
        );
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, _) = bouncer(&dir, true).await;
        let err = bouncer
            .authorize(AccessTier::Authenticated, &HeaderMap::new())
            .await
            .expect_err("no token");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_user_is_unauthorized() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, _) = bouncer(&dir, true).await;
        let err = bouncer
            .authorize(AccessTier::Restricted, &headers_with_token("99"))
            .await
            .expect_err("unknown user");
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn restricted_tier_loads_memberships() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, _) = bouncer(&dir, true).await;
        let access = bouncer
            .authorize(AccessTier::Restricted, &headers_with_token("2"))
            .await
            .expect("restricted");
        let ctx = access.context().expect("context");
        assert!(!ctx.is_admin);
        assert!(ctx.is_team_leader);
        assert_eq!(ctx.memberships.len(), 1);
    }

    #[tokio::test]
    async fn stored_role_wins_over_token_role() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, _) = bouncer(&dir, true).await;
        let access = bouncer
            .authorize(AccessTier::Restricted, &headers_with_token("1"))
            .await
            .expect("admin");
        let ctx = access.context().expect("context");
        assert!(ctx.is_admin);
        assert!(ctx.memberships.is_empty());
    }

    #[tokio::test]
    async fn administrator_tier_rejects_standard_users() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, _) = bouncer(&dir, true).await;
        let err = bouncer
            .authorize(AccessTier::AdministratorOnly, &headers_with_token("2"))
            .await
            .expect_err("standard user");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn disabled_authentication_yields_administrator() {
        let dir = TempDir::new().expect("tempdir");
        let (bouncer, store) = bouncer(&dir, false).await;
        let access = bouncer
            .authorize(AccessTier::AdministratorOnly, &HeaderMap::new())
            .await
            .expect("synthetic admin");
        assert!(access.token().expect("token").is_admin());
        assert_eq!(store.users().await.expect("users").len(), 2);
    }
}
