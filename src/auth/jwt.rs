use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::{distributions::Alphanumeric, Rng};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;

use super::claims::{Claims, TokenKind};
use crate::{config::JwtConfig, state::AppState};

pub const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
    session_ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::new(&state.config.jwt)
    }
}

impl JwtKeys {
    pub fn new(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            issuer: cfg.issuer.clone(),
            audience: cfg.audience.clone(),
            session_ttl: Duration::from_secs((cfg.session_ttl_minutes.max(1) as u64) * 60),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    fn ttl(&self, kind: TokenKind) -> Duration {
        match kind {
            TokenKind::Session => self.session_ttl,
            TokenKind::OauthState => OAUTH_STATE_TTL,
        }
    }

    fn sign(&self, sub: &str, kind: TokenKind, nonce: Option<String>) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(self.ttl(kind).as_secs() as i64);
        let claims = Claims {
            sub: sub.to_string(),
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            kind,
            nonce,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(sub = %sub, kind = ?kind, "jwt signed");
        Ok(token)
    }

    pub fn sign_session(&self, user_id: &str) -> anyhow::Result<String> {
        self.sign(user_id, TokenKind::Session, None)
    }

    /// State parameter for an OAuth redirect; the nonce makes each one unique.
    pub fn sign_oauth_state(&self, provider: &str) -> anyhow::Result<String> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        self.sign(provider, TokenKind::OauthState, Some(nonce))
    }

    /// Checks signature, expiry, issuer and audience.
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        debug!(sub = %data.claims.sub, kind = ?data.claims.kind, "jwt verified");
        Ok(data.claims)
    }

    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> anyhow::Result<Claims> {
        let claims = self.verify(token)?;
        if claims.kind != kind {
            anyhow::bail!("unexpected token kind");
        }
        Ok(claims)
    }
}
