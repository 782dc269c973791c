use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration;

pub const SESSION_COOKIE: &str = "auth-token";
pub const OAUTH_STATE_COOKIE: &str = "oauth-state";

fn base(name: &'static str, value: String, secure: bool, max_age: Duration) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(max_age)
        .build()
}

pub fn session(token: String, secure: bool, ttl: std::time::Duration) -> Cookie<'static> {
    base(SESSION_COOKIE, token, secure, Duration::seconds(ttl.as_secs() as i64))
}

/// Expired, empty session cookie. Browsers drop the stored one on receipt.
pub fn clear_session(secure: bool) -> Cookie<'static> {
    base(SESSION_COOKIE, String::new(), secure, Duration::ZERO)
}

pub fn oauth_state(token: String, secure: bool) -> Cookie<'static> {
    base(
        OAUTH_STATE_COOKIE,
        token,
        secure,
        Duration::seconds(super::jwt::OAUTH_STATE_TTL.as_secs() as i64),
    )
}

pub fn clear_oauth_state(secure: bool) -> Cookie<'static> {
    base(OAUTH_STATE_COOKIE, String::new(), secure, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_attributes() {
        let c = session("tok".into(), true, std::time::Duration::from_secs(600));
        let s = c.to_string();
        assert!(s.starts_with("auth-token=tok"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("SameSite=Lax"));
        assert!(s.contains("Secure"));
        assert!(s.contains("Path=/"));
        assert!(s.contains("Max-Age=600"));
    }

    #[test]
    fn cleared_cookie_expires_immediately() {
        let s = clear_session(false).to_string();
        assert!(s.starts_with("auth-token=;"));
        assert!(s.contains("Max-Age=0"));
        assert!(!s.contains("Secure"));
    }
}
