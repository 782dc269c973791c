use serde::Serialize;

use crate::{
    config::{AppConfig, FeatureFlags},
    oauth::providers::Provider,
};

#[derive(Debug, Serialize)]
pub struct AppInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub environment: String,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub id: &'static str,
    pub name: &'static str,
    pub configured: bool,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct StorageInfo {
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
}

#[derive(Debug, Serialize)]
pub struct MailInfo {
    pub transport: &'static str,
    pub from: String,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub ttl_minutes: i64,
    pub cookie_secure: bool,
    pub default_role: String,
    pub admin_emails: usize,
}

/// Read-only settings screen. Never carries secrets.
#[derive(Debug, Serialize)]
pub struct SettingsView {
    pub app: AppInfo,
    pub features: FeatureFlags,
    pub providers: Vec<ProviderStatus>,
    pub session: SessionInfo,
    pub storage: StorageInfo,
    pub mail: MailInfo,
}

impl SettingsView {
    pub fn from_config(cfg: &AppConfig, mail_transport: &'static str) -> Self {
        Self {
            app: AppInfo {
                name: env!("CARGO_PKG_NAME"),
                version: env!("CARGO_PKG_VERSION"),
                environment: cfg.environment.clone(),
                base_url: cfg.base_url.clone(),
            },
            features: cfg.features.clone(),
            providers: Provider::ALL
                .iter()
                .map(|p| ProviderStatus {
                    id: p.name(),
                    name: p.display_name(),
                    configured: p.configured(cfg),
                    enabled: p.enabled(cfg),
                })
                .collect(),
            session: SessionInfo {
                ttl_minutes: cfg.jwt.session_ttl_minutes,
                cookie_secure: cfg.cookie_secure,
                default_role: cfg.default_role.clone(),
                admin_emails: cfg.admin_emails.len(),
            },
            storage: StorageInfo {
                bucket: cfg.storage.bucket.clone(),
                endpoint: cfg.storage.endpoint.clone(),
                region: cfg.storage.region.clone(),
            },
            mail: MailInfo {
                transport: mail_transport,
                from: cfg.mail.from.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OAuthClientConfig, SmtpConfig};

    #[test]
    fn provider_status_reflects_toggle_and_credentials() {
        let mut cfg = AppConfig::for_tests();
        cfg.github = Some(OAuthClientConfig {
            client_id: "gh-id".into(),
            client_secret: "gh-secret".into(),
        });
        cfg.features.google = true;
        let view = SettingsView::from_config(&cfg, "log");
        let gh = &view.providers[0];
        assert_eq!((gh.id, gh.configured, gh.enabled), ("github", true, false));
        let g = &view.providers[1];
        assert_eq!((g.id, g.configured, g.enabled), ("google", false, true));
    }

    #[test]
    fn secrets_never_serialized() {
        let mut cfg = AppConfig::for_tests();
        cfg.github = Some(OAuthClientConfig {
            client_id: "gh-id".into(),
            client_secret: "gh-super-secret".into(),
        });
        cfg.storage.secret_key = "s3-super-secret".into();
        cfg.mail.smtp = Some(SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: Some("mailer".into()),
            password: Some("smtp-super-secret".into()),
        });
        let json = serde_json::to_string(&SettingsView::from_config(&cfg, "smtp")).unwrap();
        assert!(!json.contains("super-secret"));
        assert!(!json.contains("test-secret"));
        assert!(json.contains("\"transport\":\"smtp\""));
    }
}
