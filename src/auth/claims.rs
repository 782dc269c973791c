use serde::{Deserialize, Serialize};

/// Type tag carried in every token so one kind cannot stand in for another.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Session,
    OauthState,
}

/// JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,     // user id, or provider name for oauth_state
    pub iat: usize,      // issued at (unix timestamp)
    pub exp: usize,      // expires at (unix timestamp)
    pub iss: String,     // issuer
    pub aud: String,     // audience
    pub kind: TokenKind, // token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}
