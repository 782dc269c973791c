use serde::{Deserialize, Serialize};

use crate::auth::extractors::SessionUser;

/// Request body for credential sign-up.
#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
}

/// Request body for credential sign-in.
#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub roles: Vec<String>,
}

impl From<SessionUser> for SessionView {
    fn from(s: SessionUser) -> Self {
        Self {
            id: s.user.id,
            email: s.user.email,
            name: s.user.name,
            image: s.user.image,
            roles: s.roles,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub user: Option<SessionView>,
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}
