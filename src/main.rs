mod app;
mod auth;
mod config;
mod database;
mod error;
mod ids;
mod mail;
mod media;
mod oauth;
mod pagination;
mod settings;
mod state;
mod storage;
mod users;

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "admin_console=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let config = AppConfig::from_env()?;
    tracing::info!(
        env = %config.environment,
        base_url = %config.base_url,
        smtp = config.mail.smtp.is_some(),
        "starting admin console"
    );
    let app_state = AppState::init(config).await?;

    sqlx::migrate!("./migrations").run(&app_state.db).await?;

    let config = app_state.config.clone();
    let app = app::build_app(app_state);
    app::serve(app, &config).await
}
