use axum::{
    extract::{FromRef, Query, State},
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        cookie,
        dto::{
            EmailRequest, MessageResponse, ProviderInfo, ResetPasswordRequest, SessionResponse,
            SessionView, SignInRequest, SignUpRequest, TokenQuery,
        },
        extractors::{MaybeSession, SessionUser},
        jwt::JwtKeys,
        services,
    },
    error::{ApiError, ApiResult},
    oauth::providers::Provider,
    state::AppState,
    users::{repo as users, repo_types::User},
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/providers", get(providers))
        .route("/auth/session", get(session))
        .route("/auth/sign-up", post(sign_up))
        .route("/auth/sign-in", post(sign_in))
        .route("/auth/sign-out", post(sign_out))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/magic-link", post(magic_link))
        .route("/auth/magic-link/verify", get(verify_magic_link))
}

/// Issues the session cookie for a user who just proved who they are.
pub async fn start_session(
    state: &AppState,
    jar: CookieJar,
    user: User,
) -> ApiResult<(CookieJar, SessionView)> {
    services::complete_sign_in(state, &user).await?;
    let keys = JwtKeys::from_ref(state);
    let token = keys.sign_session(&user.id)?;
    let roles = users::role_names_for_user(&state.db, &user.id).await?;
    let jar = jar.add(cookie::session(
        token,
        state.config.cookie_secure,
        keys.session_ttl(),
    ));
    Ok((jar, SessionView::from(SessionUser { user, roles })))
}

pub fn provider_list(state: &AppState) -> Vec<ProviderInfo> {
    let features = &state.config.features;
    let mut out = Vec::new();
    if features.credentials {
        out.push(ProviderInfo {
            id: "credentials",
            name: "Email and password",
            kind: "credentials",
        });
    }
    if features.magic_link {
        out.push(ProviderInfo {
            id: "email",
            name: "Magic link",
            kind: "email",
        });
    }
    for p in Provider::ALL {
        if p.client(&state.config).is_some() {
            out.push(ProviderInfo {
                id: p.name(),
                name: p.display_name(),
                kind: "oauth",
            });
        }
    }
    out
}

#[instrument(skip(state))]
pub async fn providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    Json(provider_list(&state))
}

#[instrument(skip_all)]
pub async fn session(MaybeSession(session): MaybeSession) -> Json<SessionResponse> {
    Json(SessionResponse {
        user: session.map(SessionView::from),
    })
}

#[instrument(skip(state, jar, payload))]
pub async fn sign_up(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignUpRequest>,
) -> ApiResult<(CookieJar, Json<SessionView>)> {
    let user = services::sign_up(
        &state,
        &payload.email,
        &payload.password,
        payload.name.as_deref(),
    )
    .await?;
    let (jar, view) = start_session(&state, jar, user).await?;
    Ok((jar, Json(view)))
}

#[instrument(skip(state, jar, payload))]
pub async fn sign_in(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<SignInRequest>,
) -> ApiResult<(CookieJar, Json<SessionView>)> {
    let user = services::authorize_credentials(&state, &payload.email, &payload.password)
        .await?
        .ok_or_else(|| {
            warn!(email = %payload.email.trim(), "credential sign-in refused");
            ApiError::unauthorized("Invalid credentials")
        })?;
    let (jar, view) = start_session(&state, jar, user).await?;
    Ok((jar, Json(view)))
}

#[instrument(skip_all)]
pub async fn sign_out(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Json<MessageResponse>) {
    info!("sign out");
    (
        jar.add(cookie::clear_session(state.config.cookie_secure)),
        Json(MessageResponse {
            message: "Signed out",
        }),
    )
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> ApiResult<Json<MessageResponse>> {
    services::request_password_reset(&state, &payload.email).await?;
    Ok(Json(MessageResponse {
        message: "If the address is registered, a reset link is on its way",
    }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    services::reset_password(&state, &payload.token, &payload.password).await?;
    Ok(Json(MessageResponse {
        message: "Password updated",
    }))
}

#[instrument(skip(state, payload))]
pub async fn magic_link(
    State(state): State<AppState>,
    Json(payload): Json<EmailRequest>,
) -> ApiResult<Json<MessageResponse>> {
    services::request_magic_link(&state, &payload.email).await?;
    Ok(Json(MessageResponse {
        message: "Check your inbox for a sign-in link",
    }))
}

#[instrument(skip(state, jar, q))]
pub async fn verify_magic_link(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(q): Query<TokenQuery>,
) -> ApiResult<(CookieJar, Redirect)> {
    let user = match services::verify_magic_link(&state, &q.token).await {
        Ok(u) => u,
        Err(ApiError::Unauthorized(_)) => {
            return Ok((jar, Redirect::to("/sign-in?error=invalid_token")));
        }
        Err(ApiError::Forbidden(_)) => {
            return Ok((jar, Redirect::to("/sign-in?error=access_denied")));
        }
        Err(e) => return Err(e),
    };
    let (jar, _) = start_session(&state, jar, user).await?;
    Ok((jar, Redirect::to("/")))
}
