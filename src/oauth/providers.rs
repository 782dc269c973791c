//! OAuth provider registry: endpoints, code exchange and profile fetching.
//!
//! Each provider speaks the standard authorization-code flow; they differ in
//! endpoints, scopes and the shape of the profile they return. Profiles are
//! normalised into [`OAuthProfile`] before anything touches the database.

use anyhow::Context;
use reqwest::{header::ACCEPT, Url};
use serde::Deserialize;

use crate::config::{AppConfig, OAuthClientConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Github, Provider::Google];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::Github),
            "google" => Some(Self::Google),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Google => "google",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Github => "GitHub",
            Self::Google => "Google",
        }
    }

    fn authorize_url(&self) -> &'static str {
        match self {
            Self::Github => "https://github.com/login/oauth/authorize",
            Self::Google => "https://accounts.google.com/o/oauth2/v2/auth",
        }
    }

    fn token_url(&self) -> &'static str {
        match self {
            Self::Github => "https://github.com/login/oauth/access_token",
            Self::Google => "https://oauth2.googleapis.com/token",
        }
    }

    fn userinfo_url(&self) -> &'static str {
        match self {
            Self::Github => "https://api.github.com/user",
            Self::Google => "https://openidconnect.googleapis.com/v1/userinfo",
        }
    }

    fn scopes(&self) -> &'static str {
        match self {
            Self::Github => "read:user user:email",
            Self::Google => "openid email profile",
        }
    }

    /// Client credentials when the provider is switched on and fully
    /// configured, `None` otherwise.
    pub fn client<'a>(&self, cfg: &'a AppConfig) -> Option<&'a OAuthClientConfig> {
        match self {
            Self::Github if cfg.features.github => cfg.github.as_ref(),
            Self::Google if cfg.features.google => cfg.google.as_ref(),
            _ => None,
        }
    }

    /// Client id and secret are both present.
    pub fn configured(&self, cfg: &AppConfig) -> bool {
        match self {
            Self::Github => cfg.github.is_some(),
            Self::Google => cfg.google.is_some(),
        }
    }

    pub fn enabled(&self, cfg: &AppConfig) -> bool {
        match self {
            Self::Github => cfg.features.github,
            Self::Google => cfg.features.google,
        }
    }

    pub fn redirect_uri(&self, base_url: &str) -> String {
        format!("{}/api/auth/callback/{}", base_url, self.name())
    }
}

/// Provider-independent view of the signed-in account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProfile {
    pub provider_account_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub image: Option<String>,
}

pub fn build_authorize_url(
    provider: Provider,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> anyhow::Result<String> {
    let url = Url::parse_with_params(
        provider.authorize_url(),
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", provider.scopes()),
            ("state", state),
        ],
    )
    .context("build authorize url")?;
    Ok(url.into())
}

/// Exchange the authorization code for an access token.
pub async fn exchange_code(
    http: &reqwest::Client,
    provider: Provider,
    client: &OAuthClientConfig,
    code: &str,
    redirect_uri: &str,
) -> anyhow::Result<String> {
    let params = [
        ("grant_type", "authorization_code"),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
        ("code", code),
        ("redirect_uri", redirect_uri),
    ];

    let response = http
        .post(provider.token_url())
        .header(ACCEPT, "application/json")
        .form(&params)
        .send()
        .await
        .context("token request")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("token exchange failed: status={}, body={}", status, body);
    }

    // GitHub answers 200 with an `error` field on failure.
    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: Option<String>,
        error: Option<String>,
    }

    let token: TokenResponse = response.json().await.context("parse token response")?;
    match (token.access_token, token.error) {
        (Some(t), _) => Ok(t),
        (None, err) => anyhow::bail!(
            "token exchange failed: {}",
            err.unwrap_or_else(|| "no access_token".into())
        ),
    }
}

pub async fn fetch_profile(
    http: &reqwest::Client,
    provider: Provider,
    access_token: &str,
) -> anyhow::Result<OAuthProfile> {
    match provider {
        Provider::Github => {
            let user: GithubUser = get_json(http, provider.userinfo_url(), access_token).await?;
            let fallback = if user.email.is_none() {
                let emails: Vec<GithubEmail> =
                    get_json(http, "https://api.github.com/user/emails", access_token).await?;
                primary_verified_email(&emails)
            } else {
                None
            };
            Ok(normalize_github(user, fallback))
        }
        Provider::Google => {
            let info: GoogleUserInfo = get_json(http, provider.userinfo_url(), access_token).await?;
            Ok(normalize_google(info))
        }
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> anyhow::Result<T> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .with_context(|| format!("GET {}", url))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("GET {} failed: status={}, body={}", url, status, body);
    }
    response
        .json()
        .await
        .with_context(|| format!("parse {}", url))
}

// --- Provider-specific payloads ---

#[derive(Debug, Deserialize)]
pub struct GithubUser {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GithubEmail {
    pub email: String,
    pub primary: bool,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct GoogleUserInfo {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// "Ada King Lovelace" -> ("Ada", "King Lovelace"); a single word has no last name.
pub fn split_name(full: &str) -> (Option<String>, Option<String>) {
    let full = full.trim();
    match full.split_once(char::is_whitespace) {
        Some((first, rest)) => (
            Some(first.to_string()),
            non_blank(Some(rest.to_string())),
        ),
        None if !full.is_empty() => (Some(full.to_string()), None),
        None => (None, None),
    }
}

pub fn primary_verified_email(emails: &[GithubEmail]) -> Option<String> {
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .map(|e| e.email.clone())
}

/// GitHub only exposes verified addresses, on the profile or via `/user/emails`.
pub fn normalize_github(user: GithubUser, fallback_email: Option<String>) -> OAuthProfile {
    // The login handle is not a person's name.
    let name = non_blank(user.name);
    let (first_name, last_name) = name.as_deref().map(split_name).unwrap_or((None, None));
    let email = non_blank(user.email).or(fallback_email);
    OAuthProfile {
        provider_account_id: user.id.to_string(),
        email_verified: email.is_some(),
        email,
        name,
        first_name,
        last_name,
        image: non_blank(user.avatar_url),
    }
}

pub fn normalize_google(info: GoogleUserInfo) -> OAuthProfile {
    let name = non_blank(info.name);
    let (split_first, split_last) = name.as_deref().map(split_name).unwrap_or((None, None));
    OAuthProfile {
        provider_account_id: info.sub,
        email: non_blank(info.email),
        email_verified: info.email_verified.unwrap_or(false),
        name,
        first_name: non_blank(info.given_name).or(split_first),
        last_name: non_blank(info.family_name).or(split_last),
        image: non_blank(info.picture),
    }
}
