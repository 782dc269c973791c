use axum::{
    extract::{FromRef, Path, Query, State},
    response::Redirect,
    routing::get,
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use super::{
    providers::{self, Provider},
    services::{sign_in_with_profile, OAuthError},
};
use crate::{
    auth::{
        claims::TokenKind,
        cookie::{self, OAUTH_STATE_COOKIE},
        handlers::start_session,
        jwt::JwtKeys,
    },
    error::{ApiError, ApiResult},
    state::AppState,
};

pub fn oauth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/oauth/:provider", get(start))
        .route("/auth/callback/:provider", get(callback))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Redirects the browser to the provider's consent screen.
#[instrument(skip(state, jar))]
pub async fn start(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(provider): Path<String>,
) -> ApiResult<(CookieJar, Redirect)> {
    let provider = Provider::parse(&provider)
        .ok_or_else(|| ApiError::not_found("Unknown provider"))?;
    let client = provider
        .client(&state.config)
        .ok_or_else(|| ApiError::not_found("Provider not available"))?;

    let oauth_state = JwtKeys::from_ref(&state).sign_oauth_state(provider.name())?;
    let url = providers::build_authorize_url(
        provider,
        &client.client_id,
        &provider.redirect_uri(&state.config.base_url),
        &oauth_state,
    )?;
    let jar = jar.add(cookie::oauth_state(oauth_state, state.config.cookie_secure));
    Ok((jar, Redirect::to(&url)))
}

/// State must be a live oauth_state token for this provider and equal the cookie copy.
fn check_state(
    keys: &JwtKeys,
    provider: Provider,
    from_query: Option<&str>,
    from_cookie: Option<&str>,
) -> Result<(), OAuthError> {
    let (Some(q), Some(c)) = (from_query, from_cookie) else {
        return Err(OAuthError::InvalidState);
    };
    if q != c {
        return Err(OAuthError::InvalidState);
    }
    let claims = keys
        .verify_kind(q, TokenKind::OauthState)
        .map_err(|_| OAuthError::InvalidState)?;
    if claims.sub != provider.name() {
        return Err(OAuthError::InvalidState);
    }
    Ok(())
}

async fn run_callback(
    state: &AppState,
    jar: &CookieJar,
    provider: &str,
    q: &CallbackQuery,
) -> Result<(Provider, crate::users::repo_types::User), OAuthError> {
    let provider = Provider::parse(provider).ok_or(OAuthError::ProviderDisabled)?;
    let client = provider
        .client(&state.config)
        .ok_or(OAuthError::ProviderDisabled)?;
    if let Some(err) = &q.error {
        return Err(OAuthError::Denied(err.clone()));
    }
    check_state(
        &JwtKeys::from_ref(state),
        provider,
        q.state.as_deref(),
        jar.get(OAUTH_STATE_COOKIE).map(|c| c.value()),
    )?;
    let code = q.code.as_deref().ok_or(OAuthError::InvalidState)?;

    let redirect_uri = provider.redirect_uri(&state.config.base_url);
    let token = providers::exchange_code(&state.http, provider, client, code, &redirect_uri).await?;
    let profile = providers::fetch_profile(&state.http, provider, &token).await?;
    let user = sign_in_with_profile(state, provider, &profile).await?;
    Ok((provider, user))
}

/// Provider redirect target. Always answers with a redirect: `/` on success,
/// `/sign-in?error=<code>` otherwise.
#[instrument(skip(state, jar, q))]
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(provider): Path<String>,
    Query(q): Query<CallbackQuery>,
) -> (CookieJar, Redirect) {
    let outcome = run_callback(&state, &jar, &provider, &q).await;
    let jar = jar.add(cookie::clear_oauth_state(state.config.cookie_secure));

    let failure = |jar: CookieJar, err: &OAuthError| {
        (jar, Redirect::to(&format!("/sign-in?error={}", err.code())))
    };

    let (provider, user) = match outcome {
        Ok(v) => v,
        Err(e @ OAuthError::Other(_)) => {
            error!(error = ?e, %provider, "oauth callback failed");
            return failure(jar, &e);
        }
        Err(e) => {
            warn!(error = %e, %provider, "oauth sign-in refused");
            return failure(jar, &e);
        }
    };

    match start_session(&state, jar.clone(), user).await {
        Ok((jar, view)) => {
            info!(user_id = %view.id, provider = provider.name(), "oauth sign-in");
            (jar, Redirect::to("/"))
        }
        Err(e) => {
            error!(error = %e, "starting session after oauth failed");
            failure(jar, &OAuthError::Other(anyhow::anyhow!("session")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> JwtKeys {
        JwtKeys::new(&crate::config::AppConfig::for_tests().jwt)
    }

    #[test]
    fn state_must_match_cookie_and_provider() {
        let keys = keys();
        let st = keys.sign_oauth_state("github").unwrap();
        let st = Some(st.as_str());
        assert!(check_state(&keys, Provider::Github, st, st).is_ok());
        assert!(check_state(&keys, Provider::Google, st, st).is_err());
        assert!(check_state(&keys, Provider::Github, st, None).is_err());
        assert!(check_state(&keys, Provider::Github, None, st).is_err());

        let other = keys.sign_oauth_state("github").unwrap();
        assert!(check_state(&keys, Provider::Github, st, Some(other.as_str())).is_err());
    }

    #[test]
    fn session_token_is_not_a_state() {
        let keys = keys();
        let st = keys.sign_session("01HX0000000000000000000000").unwrap();
        let err = check_state(&keys, Provider::Github, Some(st.as_str()), Some(st.as_str()))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }
}
