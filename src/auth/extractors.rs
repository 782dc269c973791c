use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;

use super::{claims::TokenKind, cookie::SESSION_COOKIE, jwt::JwtKeys};
use crate::{
    error::ApiError,
    state::AppState,
    users::{
        repo as users,
        repo_types::User,
        services::{has_role, ADMIN_ROLE},
    },
};

/// Session token from the `auth-token` cookie, falling back to a bearer header.
pub fn session_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(c) = jar.get(SESSION_COOKIE).filter(|c| !c.value().is_empty()) {
        return Some(c.value().to_string());
    }
    let header = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

/// Signed-in, non-deleted user with the names of their active roles.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user: User,
    pub roles: Vec<String>,
}

impl SessionUser {
    pub fn id(&self) -> &str {
        &self.user.id
    }

    pub fn is_admin(&self) -> bool {
        has_role(&self.roles, ADMIN_ROLE)
    }
}

/// Resolves the session if there is one. `Ok(None)` means "not signed in".
pub async fn resolve_session(
    parts: &Parts,
    state: &AppState,
) -> Result<Option<SessionUser>, ApiError> {
    let Some(token) = session_token(parts) else {
        return Ok(None);
    };
    let keys = JwtKeys::from_ref(state);
    let claims = match keys.verify_kind(&token, TokenKind::Session) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "invalid or expired session token");
            return Ok(None);
        }
    };
    let user = match users::find_by_id(&state.db, &claims.sub).await? {
        Some(u) if !u.is_deleted() => u,
        _ => {
            warn!(user_id = %claims.sub, "session for missing or deleted user");
            return Ok(None);
        }
    };
    let roles = users::role_names_for_user(&state.db, &user.id).await?;
    Ok(Some(SessionUser { user, roles }))
}

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        resolve_session(parts, state)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Not signed in"))
    }
}

/// Optional variant for endpoints that answer both signed-in and anonymous callers.
pub struct MaybeSession(pub Option<SessionUser>);

#[async_trait]
impl FromRequestParts<AppState> for MaybeSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(MaybeSession(resolve_session(parts, state).await?))
    }
}

/// Session user holding the `admin` role.
pub struct AdminUser(pub SessionUser);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let session = SessionUser::from_request_parts(parts, state).await?;
        if !session.is_admin() {
            warn!(user_id = %session.id(), "admin route refused");
            return Err(ApiError::forbidden("Admin role required"));
        }
        Ok(AdminUser(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut req = Request::builder().uri("/");
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        req.body(()).unwrap().into_parts().0
    }

    #[test]
    fn token_from_cookie_wins() {
        let p = parts(&[
            ("cookie", "theme=dark; auth-token=abc"),
            ("authorization", "Bearer xyz"),
        ]);
        assert_eq!(session_token(&p).as_deref(), Some("abc"));
    }

    #[test]
    fn token_from_bearer_header() {
        let p = parts(&[("authorization", "Bearer xyz")]);
        assert_eq!(session_token(&p).as_deref(), Some("xyz"));
        let p = parts(&[("cookie", "auth-token="), ("authorization", "bearer q")]);
        assert_eq!(session_token(&p).as_deref(), Some("q"));
    }

    #[test]
    fn no_token() {
        assert!(session_token(&parts(&[])).is_none());
        assert!(session_token(&parts(&[("authorization", "Basic Zm9v")])).is_none());
    }

    #[tokio::test]
    async fn garbage_token_resolves_to_anonymous() {
        let state = AppState::fake();
        let p = parts(&[("cookie", "auth-token=not-a-jwt")]);
        assert!(resolve_session(&p, &state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oauth_state_token_is_not_a_session() {
        let state = AppState::fake();
        let token = JwtKeys::from_ref(&state).sign_oauth_state("github").unwrap();
        let cookie = format!("auth-token={}", token);
        let p = parts(&[("cookie", cookie.as_str())]);
        assert!(resolve_session(&p, &state).await.unwrap().is_none());
    }
}
