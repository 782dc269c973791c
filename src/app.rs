use std::net::SocketAddr;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::state::AppState;
use crate::{auth, database, media, oauth, settings, users};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest(
            "/api",
            Router::new()
                .merge(auth::router())
                .merge(oauth::router())
                .merge(users::router())
                .merge(database::router())
                .merge(media::router())
                .merge(settings::router())
                .route("/health", get(health)),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!(
                        "http_request",
                        %method,
                        uri = %uri,
                        status = tracing::field::Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, ms, "response");
                        } else {
                            tracing::info!(%status, ms, "response");
                        }
                    },
                ),
        )
}

pub async fn serve(app: Router, config: &AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    async fn send(state: AppState, req: Request<Body>) -> Response {
        build_app(state).oneshot(req).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(res: Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let res = send(AppState::fake(), get("/api/health")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["status"], "ok");
    }

    #[tokio::test]
    async fn sign_out_clears_the_cookie() {
        let res = send(AppState::fake(), post_json("/api/auth/sign-out", json!({}))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let cookie = res
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("auth-token="));
        assert!(cookie.contains("Max-Age=0"));
        assert!(cookie.contains("HttpOnly"));
    }

    #[tokio::test]
    async fn anonymous_session_is_null() {
        let res = send(AppState::fake(), get("/api/auth/session")).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await["user"], Value::Null);
    }

    #[tokio::test]
    async fn me_requires_a_session() {
        let res = send(AppState::fake(), get("/api/me")).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(res).await["error"], "Not signed in");
    }

    #[tokio::test]
    async fn admin_routes_require_a_session() {
        for uri in [
            "/api/admin/users",
            "/api/admin/roles",
            "/api/admin/database/tables",
            "/api/admin/database/tables/users",
            "/api/admin/media",
            "/api/admin/settings",
        ] {
            let res = send(AppState::fake(), get(uri)).await;
            assert_eq!(res.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[tokio::test]
    async fn providers_follow_toggles() {
        let res = send(AppState::fake(), get("/api/auth/providers")).await;
        let ids: Vec<String> = body_json(res)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["credentials"]);
    }

    #[tokio::test]
    async fn disabled_oauth_provider_is_not_found() {
        let res = send(AppState::fake(), get("/api/auth/oauth/github")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = send(AppState::fake(), get("/api/auth/oauth/myspace")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn enabled_oauth_provider_redirects_with_state_cookie() {
        let mut cfg = AppConfig::for_tests();
        cfg.features.github = true;
        cfg.github = Some(crate::config::OAuthClientConfig {
            client_id: "gh-id".into(),
            client_secret: "gh-secret".into(),
        });
        let res = send(AppState::fake_with(cfg), get("/api/auth/oauth/github")).await;
        assert!(res.status().is_redirection());
        let location = res.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(location.contains("client_id=gh-id"));
        let cookie = res.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("oauth-state="));
    }

    #[tokio::test]
    async fn callback_for_disabled_provider_redirects_to_sign_in() {
        let res = send(
            AppState::fake(),
            get("/api/auth/callback/github?code=abc&state=xyz"),
        )
        .await;
        assert!(res.status().is_redirection());
        assert_eq!(
            res.headers()[header::LOCATION],
            "/sign-in?error=provider_disabled"
        );
    }

    #[tokio::test]
    async fn sign_up_rejects_bad_email_and_respects_toggle() {
        let res = send(
            AppState::fake(),
            post_json("/api/auth/sign-up", json!({"email": "nope", "password": "longenough"})),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let mut cfg = AppConfig::for_tests();
        cfg.features.signup = false;
        let res = send(
            AppState::fake_with(cfg),
            post_json(
                "/api/auth/sign-up",
                json!({"email": "ann@example.com", "password": "longenough"}),
            ),
        )
        .await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn public_media_with_bad_id_is_not_found() {
        let res = send(AppState::fake(), get("/api/media/not-an-id")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
