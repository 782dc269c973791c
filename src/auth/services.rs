use lazy_static::lazy_static;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::{
    auth::{
        password,
        repo::{self as tokens, TokenPurpose},
    },
    error::{ApiError, ApiResult},
    state::AppState,
    users::{
        repo as users,
        repo_types::{NewUser, User},
        services::ensure_sign_in_roles,
    },
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    email.len() <= 254 && EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Random URL-safe token and the SHA-256 digest that gets stored.
pub fn generate_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = hex::encode(bytes);
    let digest = hash_token(&raw);
    (raw, digest)
}

pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// `Some(user)` only for an active account whose stored hash matches.
pub fn check_user_password(user: User, plain: &str) -> anyhow::Result<Option<User>> {
    if user.is_deleted() {
        debug!(user_id = %user.id, "sign-in for deleted user");
        return Ok(None);
    }
    let Some(hash) = user.password_hash.as_deref() else {
        debug!(user_id = %user.id, "sign-in for account without password");
        return Ok(None);
    };
    if !password::verify_password(plain, hash)? {
        return Ok(None);
    }
    Ok(Some(user))
}

/// Credential check behind `POST /auth/sign-in`. `None` covers every refusal:
/// provider disabled, unknown email, deleted user, no password, wrong password.
pub async fn authorize_credentials(
    state: &AppState,
    email: &str,
    plain: &str,
) -> anyhow::Result<Option<User>> {
    if !state.config.features.credentials {
        debug!("credentials provider disabled");
        return Ok(None);
    }
    let email = normalize_email(email);
    if !is_valid_email(&email) || plain.is_empty() {
        return Ok(None);
    }
    let Some(user) = users::find_by_email(&state.db, &email).await? else {
        return Ok(None);
    };
    check_user_password(user, plain)
}

/// Role bookkeeping every successful sign-in goes through.
pub async fn complete_sign_in(state: &AppState, user: &User) -> anyhow::Result<()> {
    let mut conn = state.db.acquire().await?;
    ensure_sign_in_roles(&mut conn, &state.config, user).await?;
    info!(user_id = %user.id, "user signed in");
    Ok(())
}

pub async fn sign_up(
    state: &AppState,
    email: &str,
    plain: &str,
    name: Option<&str>,
) -> ApiResult<User> {
    let features = &state.config.features;
    if !features.credentials || !features.signup {
        return Err(ApiError::forbidden("Sign-up is disabled"));
    }
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(ApiError::bad_request("Invalid email"));
    }
    password::check_policy(plain).map_err(ApiError::bad_request)?;

    if users::find_by_email(&state.db, &email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(ApiError::conflict("Email already registered"));
    }

    let hash = password::hash_password(plain)?;
    let name = name.map(str::trim).filter(|n| !n.is_empty());

    let mut tx = state.db.begin().await?;
    let user = match users::insert_user(
        &mut *tx,
        &NewUser {
            email: &email,
            password_hash: Some(&hash),
            name,
            image: None,
            email_verified: false,
        },
    )
    .await
    {
        Ok(u) => u,
        Err(e) if users::is_unique_violation(&e) => {
            return Err(ApiError::conflict("Email already registered"));
        }
        Err(e) => return Err(e.into()),
    };
    users::upsert_profile(&mut *tx, &user.id, None, None).await?;
    ensure_sign_in_roles(&mut tx, &state.config, &user).await?;
    tx.commit().await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(user)
}

fn link(state: &AppState, path: &str, token: &str) -> String {
    format!("{}{}?token={}", state.config.base_url, path, token)
}

/// Always succeeds from the caller's view, whether or not the address is known.
pub async fn request_password_reset(state: &AppState, email: &str) -> anyhow::Result<()> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        return Ok(());
    }
    let user = match users::find_by_email(&state.db, &email).await? {
        Some(u) if !u.is_deleted() => u,
        _ => {
            debug!(email = %email, "password reset for unknown address");
            return Ok(());
        }
    };
    tokens::purge_tokens(&state.db, &user.email, TokenPurpose::PasswordReset).await?;
    let (raw, digest) = generate_token();
    tokens::insert_token(&state.db, &user.email, &digest, TokenPurpose::PasswordReset).await?;
    // Delivery failures must not change the response.
    if let Err(e) = state
        .mailer
        .send_password_reset(&user.email, &link(state, "/reset-password", &raw))
        .await
    {
        error!(error = ?e, user_id = %user.id, "sending password reset mail failed");
        return Ok(());
    }
    info!(user_id = %user.id, "password reset requested");
    Ok(())
}

pub async fn reset_password(state: &AppState, raw_token: &str, plain: &str) -> ApiResult<()> {
    password::check_policy(plain).map_err(ApiError::bad_request)?;
    let hash = password::hash_password(plain)?;

    let mut tx = state.db.begin().await?;
    let digest = hash_token(raw_token.trim());
    let email = tokens::consume_token(&mut *tx, &digest, TokenPurpose::PasswordReset)
        .await?
        .ok_or_else(|| ApiError::bad_request("Invalid or expired token"))?;
    let user = users::find_by_email(&mut *tx, &email)
        .await?
        .filter(|u| !u.is_deleted())
        .ok_or_else(|| ApiError::bad_request("Invalid or expired token"))?;
    users::update_password(&mut *tx, &user.id, &hash).await?;
    // Receiving the mail proves the address.
    users::mark_email_verified(&mut *tx, &user.id).await?;
    tx.commit().await?;

    info!(user_id = %user.id, "password reset");
    Ok(())
}

pub async fn request_magic_link(state: &AppState, email: &str) -> ApiResult<()> {
    if !state.config.features.magic_link {
        return Err(ApiError::forbidden("Magic link sign-in is disabled"));
    }
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        debug!(email = %email, "magic link for malformed address");
        return Ok(());
    }
    if let Some(user) = users::find_by_email(&state.db, &email).await? {
        if user.is_deleted() {
            debug!(user_id = %user.id, "magic link for deleted user");
            return Ok(());
        }
    }
    tokens::purge_tokens(&state.db, &email, TokenPurpose::MagicLink).await?;
    let (raw, digest) = generate_token();
    tokens::insert_token(&state.db, &email, &digest, TokenPurpose::MagicLink).await?;
    if let Err(e) = state
        .mailer
        .send_magic_link(&email, &link(state, "/api/auth/magic-link/verify", &raw))
        .await
    {
        error!(error = ?e, email = %email, "sending magic link failed");
        return Ok(());
    }
    info!(email = %email, "magic link sent");
    Ok(())
}

/// Consumes the token; first use of an unknown address creates the account.
pub async fn verify_magic_link(state: &AppState, raw_token: &str) -> ApiResult<User> {
    if !state.config.features.magic_link {
        return Err(ApiError::forbidden("Magic link sign-in is disabled"));
    }
    let mut tx = state.db.begin().await?;
    let digest = hash_token(raw_token.trim());
    let email = tokens::consume_token(&mut *tx, &digest, TokenPurpose::MagicLink)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    let user = match users::find_by_email(&mut *tx, &email).await? {
        Some(u) if u.is_deleted() => return Err(ApiError::forbidden("Account disabled")),
        Some(mut u) => {
            users::mark_email_verified(&mut *tx, &u.id).await?;
            u.email_verified_at.get_or_insert_with(OffsetDateTime::now_utc);
            u
        }
        None => {
            let u = users::insert_user(
                &mut *tx,
                &NewUser {
                    email: &email,
                    email_verified: true,
                    ..Default::default()
                },
            )
            .await?;
            users::upsert_profile(&mut *tx, &u.id, None, None).await?;
            info!(user_id = %u.id, "user created from magic link");
            u
        }
    };
    ensure_sign_in_roles(&mut tx, &state.config, &user).await?;
    tx.commit().await?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use sqlx::PgPool;
    use std::sync::Arc;

    fn user_with(hash: Option<String>, deleted: bool) -> User {
        let now = OffsetDateTime::now_utc();
        User {
            id: crate::ids::new_id(),
            email: "ann@example.com".into(),
            password_hash: hash,
            name: None,
            image: None,
            email_verified_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: deleted.then_some(now),
        }
    }

    #[test]
    fn email_shape() {
        assert!(is_valid_email("ann@example.com"));
        assert!(!is_valid_email("ann@example"));
        assert!(!is_valid_email("ann example@x.com"));
        assert!(!is_valid_email(""));
        assert_eq!(normalize_email("  Ann@Example.COM "), "ann@example.com");
    }

    #[test]
    fn tokens_are_random_and_hashed() {
        let (raw_a, digest_a) = generate_token();
        let (raw_b, _) = generate_token();
        assert_ne!(raw_a, raw_b);
        assert_eq!(raw_a.len(), 64);
        assert_eq!(digest_a, hash_token(&raw_a));
        assert_ne!(digest_a, raw_a);
        assert_eq!(digest_a.len(), 64);
    }

    #[test]
    fn wrong_password_returns_none() {
        let hash = password::hash_password("right-password").unwrap();
        let user = user_with(Some(hash.clone()), false);
        assert!(check_user_password(user, "wrong-password").unwrap().is_none());
        let user = user_with(Some(hash), false);
        assert!(check_user_password(user, "right-password").unwrap().is_some());
    }

    #[test]
    fn deleted_or_passwordless_users_are_refused() {
        let hash = password::hash_password("right-password").unwrap();
        assert!(check_user_password(user_with(Some(hash), true), "right-password")
            .unwrap()
            .is_none());
        assert!(check_user_password(user_with(None, false), "anything")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn disabled_credentials_provider_returns_none() {
        let mut cfg = AppConfig::for_tests();
        cfg.features.credentials = false;
        let state = AppState::fake_with(cfg);
        let res = authorize_credentials(&state, "ann@example.com", "whatever")
            .await
            .unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn malformed_email_returns_none_without_lookup() {
        let state = AppState::fake();
        assert!(authorize_credentials(&state, "not-an-email", "pw")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sign_up_respects_toggles_and_validation() {
        let mut cfg = AppConfig::for_tests();
        cfg.features.signup = false;
        let state = AppState::fake_with(cfg);
        let err = sign_up(&state, "ann@example.com", "long-enough", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let state = AppState::fake();
        let err = sign_up(&state, "nope", "long-enough", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = sign_up(&state, "ann@example.com", "short", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn magic_link_disabled_is_forbidden() {
        let state = AppState::fake();
        let err = request_magic_link(&state, "ann@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = verify_magic_link(&state, "token").await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    struct FailingMailer;

    #[axum::async_trait]
    impl crate::mail::Mailer for FailingMailer {
        async fn send_password_reset(&self, _to: &str, _link: &str) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
        async fn send_magic_link(&self, _to: &str, _link: &str) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
        fn kind(&self) -> &'static str {
            "failing"
        }
    }

    fn db_state(pool: PgPool, cfg: AppConfig) -> AppState {
        AppState {
            config: Arc::new(cfg),
            ..AppState::fake_with_pool(pool)
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn reset_request_looks_the_same_when_mail_fails(pool: PgPool) {
        let mut state = AppState::fake_with_pool(pool);
        state.mailer = Arc::new(FailingMailer);
        sign_up(&state, "ann@example.com", "long-enough", None)
            .await
            .unwrap();

        for email in ["ann@example.com", "bob@example.com"] {
            let res = request_password_reset(&state, email).await;
            assert!(res.is_ok(), "{}", email);
        }

        let mut cfg = AppConfig::for_tests();
        cfg.features.magic_link = true;
        state.config = Arc::new(cfg);
        let res = request_magic_link(&state, "ann@example.com").await;
        assert!(res.is_ok());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn sign_up_of_admin_address_is_not_admin_until_verified(pool: PgPool) {
        let state = AppState::fake_with_pool(pool);
        let user = sign_up(&state, "Root@Example.com", "long-enough", None)
            .await
            .unwrap();
        assert!(user.email_verified_at.is_none());
        let roles = users::role_names_for_user(&state.db, &user.id)
            .await
            .unwrap();
        assert_eq!(roles, vec!["user"]);

        let (raw, digest) = generate_token();
        tokens::insert_token(&state.db, &user.email, &digest, TokenPurpose::PasswordReset)
            .await
            .unwrap();
        reset_password(&state, &raw, "another-password")
            .await
            .unwrap();

        let user = users::find_by_id(&state.db, &user.id)
            .await
            .unwrap()
            .unwrap();
        assert!(user.email_verified_at.is_some());
        complete_sign_in(&state, &user).await.unwrap();
        let roles = users::role_names_for_user(&state.db, &user.id)
            .await
            .unwrap();
        assert_eq!(roles, vec!["admin", "user"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn duplicate_sign_up_is_a_conflict(pool: PgPool) {
        let state = AppState::fake_with_pool(pool);
        sign_up(&state, "ann@example.com", "long-enough", None)
            .await
            .unwrap();
        let err = sign_up(&state, " ANN@example.com", "long-enough", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn magic_link_creates_verified_user_once(pool: PgPool) {
        let mut cfg = AppConfig::for_tests();
        cfg.features.magic_link = true;
        let state = db_state(pool, cfg);

        let (raw, digest) = generate_token();
        tokens::insert_token(&state.db, "root@example.com", &digest, TokenPurpose::MagicLink)
            .await
            .unwrap();
        let user = verify_magic_link(&state, &raw).await.unwrap();
        assert_eq!(user.email, "root@example.com");
        assert!(user.email_verified_at.is_some());
        let roles = users::role_names_for_user(&state.db, &user.id)
            .await
            .unwrap();
        assert_eq!(roles, vec!["admin", "user"]);

        let err = verify_magic_link(&state, &raw).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn wrong_password_against_the_db_is_none(pool: PgPool) {
        let state = AppState::fake_with_pool(pool);
        sign_up(&state, "ann@example.com", "long-enough", None)
            .await
            .unwrap();
        let hit = authorize_credentials(&state, "ann@example.com", "long-enough")
            .await
            .unwrap();
        assert!(hit.is_some());
        let miss = authorize_credentials(&state, "ann@example.com", "wrong-password")
            .await
            .unwrap();
        assert!(miss.is_none());
        let unknown = authorize_credentials(&state, "bob@example.com", "long-enough")
            .await
            .unwrap();
        assert!(unknown.is_none());
    }
}
