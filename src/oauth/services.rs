use time::OffsetDateTime;
use tracing::info;

use super::providers::{OAuthProfile, Provider};
use crate::{
    auth::services::normalize_email,
    state::AppState,
    users::{
        repo as users,
        repo_types::{NewUser, User, UserPatch},
        services::ensure_sign_in_roles,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("provider is not enabled")]
    ProviderDisabled,
    #[error("state parameter did not match")]
    InvalidState,
    #[error("provider denied access: {0}")]
    Denied(String),
    #[error("provider returned no email")]
    MissingEmail,
    #[error("email is not verified by the provider")]
    EmailNotVerified,
    #[error("account is disabled")]
    AccountDisabled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OAuthError {
    /// Value for the `error` query parameter of the sign-in page.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProviderDisabled => "provider_disabled",
            Self::InvalidState => "invalid_state",
            Self::Denied(_) => "access_denied",
            Self::MissingEmail => "missing_email",
            Self::EmailNotVerified => "email_not_verified",
            Self::AccountDisabled => "account_disabled",
            Self::Other(_) => "oauth_callback",
        }
    }
}

impl From<sqlx::Error> for OAuthError {
    fn from(e: sqlx::Error) -> Self {
        Self::Other(e.into())
    }
}

/// Which user an OAuth profile signs in as.
#[derive(Debug)]
pub enum LinkDecision {
    /// The provider account is already linked.
    Linked(User),
    /// An account with the same email exists; link it.
    LinkByEmail(User),
    /// Nobody matches; create a user.
    Create { email: String },
}

/// Decides from the two lookups, in order: provider link, then email.
pub fn decide_link(
    by_account: Option<User>,
    by_email: Option<User>,
    profile: &OAuthProfile,
) -> Result<LinkDecision, OAuthError> {
    if let Some(user) = by_account {
        if user.is_deleted() {
            return Err(OAuthError::AccountDisabled);
        }
        return Ok(LinkDecision::Linked(user));
    }
    let email = profile
        .email
        .as_deref()
        .map(normalize_email)
        .ok_or(OAuthError::MissingEmail)?;
    match by_email {
        Some(user) if user.is_deleted() => Err(OAuthError::AccountDisabled),
        Some(_) if !profile.email_verified => Err(OAuthError::EmailNotVerified),
        Some(user) => Ok(LinkDecision::LinkByEmail(user)),
        None => Ok(LinkDecision::Create { email }),
    }
}

/// The provider vouches for this user's own address, not just some address.
fn provider_verified(profile: &OAuthProfile, user: &User) -> bool {
    profile.email_verified
        && profile
            .email
            .as_deref()
            .map(normalize_email)
            .is_some_and(|e| e == user.email)
}

/// Sign-in callback chain: find or link or create the user, make sure the
/// sign-in roles are held, then copy name, image and first/last name from
/// the provider when it supplies them.
pub async fn sign_in_with_profile(
    state: &AppState,
    provider: Provider,
    profile: &OAuthProfile,
) -> Result<User, OAuthError> {
    let mut tx = state.db.begin().await?;

    let by_account = match users::find_account_user_id(
        &mut *tx,
        provider.name(),
        &profile.provider_account_id,
    )
    .await?
    {
        Some(user_id) => users::find_by_id(&mut *tx, &user_id).await?,
        None => None,
    };
    let by_email = match (&by_account, profile.email.as_deref()) {
        (None, Some(email)) => {
            users::find_by_email(&mut *tx, &normalize_email(email)).await?
        }
        _ => None,
    };

    let mut user = match decide_link(by_account, by_email, profile)? {
        LinkDecision::Linked(user) => user,
        LinkDecision::LinkByEmail(user) => {
            users::link_account(
                &mut *tx,
                &user.id,
                provider.name(),
                &profile.provider_account_id,
            )
            .await?;
            info!(
                user_id = %user.id,
                provider = provider.name(),
                "linked provider account by email"
            );
            user
        }
        LinkDecision::Create { email } => {
            let user = users::insert_user(
                &mut *tx,
                &NewUser {
                    email: &email,
                    email_verified: profile.email_verified,
                    ..Default::default()
                },
            )
            .await?;
            users::link_account(
                &mut *tx,
                &user.id,
                provider.name(),
                &profile.provider_account_id,
            )
            .await?;
            info!(
                user_id = %user.id,
                provider = provider.name(),
                "user created from provider"
            );
            user
        }
    };

    if provider_verified(profile, &user) {
        users::mark_email_verified(&mut *tx, &user.id).await?;
        user.email_verified_at.get_or_insert_with(OffsetDateTime::now_utc);
    }
    ensure_sign_in_roles(&mut tx, &state.config, &user).await?;

    let patch = UserPatch {
        email: None,
        name: profile.name.clone(),
        image: profile.image.clone(),
    };
    let user = users::update_user(&mut *tx, &user.id, &patch)
        .await?
        .unwrap_or(user);
    users::upsert_profile(
        &mut *tx,
        &user.id,
        profile.first_name.as_deref(),
        profile.last_name.as_deref(),
    )
    .await?;

    tx.commit().await?;
    Ok(user)
}
