use std::sync::Arc;

use anyhow::Context;
use axum::async_trait;
use lettre::{
    message::header::ContentType, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::MailConfig;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()>;
    async fn send_magic_link(&self, to: &str, link: &str) -> anyhow::Result<()>;

    /// Short transport name shown on the settings screen.
    fn kind(&self) -> &'static str;
}

/// Writes links to the log instead of sending mail. Used when no SMTP host is set.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        info!(%to, %link, "password reset mail (log transport)");
        Ok(())
    }

    async fn send_magic_link(&self, to: &str, link: &str) -> anyhow::Result<()> {
        info!(%to, %link, "magic link mail (log transport)");
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "log"
    }
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    pub fn new(cfg: &MailConfig) -> anyhow::Result<Self> {
        let smtp = cfg.smtp.as_ref().context("smtp not configured")?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
            .context("smtp relay")?
            .port(smtp.port);
        if let (Some(user), Some(pass)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            from: cfg.from.clone(),
        })
    }

    async fn send(&self, to: &str, subject: &str, body: String) -> anyhow::Result<()> {
        let message = Message::builder()
            .from(self.from.parse().context("parse from address")?)
            .to(to.parse().context("parse recipient address")?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .context("build message")?;
        self.transport.send(message).await.context("smtp send")?;
        info!(%to, %subject, "mail sent");
        Ok(())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        let body = format!(
            "Someone asked to reset the password for this account.\n\n\
             Open this link within one hour to choose a new password:\n{}\n\n\
             If it was not you, ignore this message.",
            link
        );
        self.send(to, "Reset your password", body).await
    }

    async fn send_magic_link(&self, to: &str, link: &str) -> anyhow::Result<()> {
        let body = format!(
            "Use this link to sign in. It works once and expires in 15 minutes:\n{}",
            link
        );
        self.send(to, "Your sign-in link", body).await
    }

    fn kind(&self) -> &'static str {
        "smtp"
    }
}

pub fn from_config(cfg: &MailConfig) -> anyhow::Result<Arc<dyn Mailer>> {
    Ok(match cfg.smtp {
        Some(_) => Arc::new(SmtpMailer::new(cfg)?) as Arc<dyn Mailer>,
        None => Arc::new(LogMailer) as Arc<dyn Mailer>,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmtpConfig;

    #[test]
    fn log_transport_without_smtp_host() {
        let cfg = MailConfig {
            from: "a@b.c".into(),
            smtp: None,
        };
        assert_eq!(from_config(&cfg).unwrap().kind(), "log");
    }

    #[tokio::test]
    async fn smtp_transport_when_host_is_set() {
        let cfg = MailConfig {
            from: "Admin <a@example.com>".into(),
            smtp: Some(SmtpConfig {
                host: "smtp.example.com".into(),
                port: 587,
                username: None,
                password: None,
            }),
        };
        assert_eq!(from_config(&cfg).unwrap().kind(), "smtp");
    }
}
