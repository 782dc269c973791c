use anyhow::Context;
use sqlx::PgExecutor;
use time::OffsetDateTime;

use crate::ids::new_id;

/// What an emailed token may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    PasswordReset,
    MagicLink,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenPurpose::PasswordReset => "password_reset",
            TokenPurpose::MagicLink => "magic_link",
        }
    }

    pub fn ttl(self) -> time::Duration {
        match self {
            TokenPurpose::PasswordReset => time::Duration::hours(1),
            TokenPurpose::MagicLink => time::Duration::minutes(15),
        }
    }
}

pub async fn insert_token<'e, E: PgExecutor<'e>>(
    db: E,
    email: &str,
    token_hash: &str,
    purpose: TokenPurpose,
) -> anyhow::Result<()> {
    let expires_at = OffsetDateTime::now_utc() + purpose.ttl();
    sqlx::query(
        r#"
        INSERT INTO verification_tokens (id, email, token_hash, purpose, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(new_id())
    .bind(email)
    .bind(token_hash)
    .bind(purpose.as_str())
    .bind(expires_at)
    .execute(db)
    .await
    .context("insert verification token")?;
    Ok(())
}

/// Marks the token used and returns its email. `None` when the token is
/// unknown, already used, expired or meant for something else.
pub async fn consume_token<'e, E: PgExecutor<'e>>(
    db: E,
    token_hash: &str,
    purpose: TokenPurpose,
) -> anyhow::Result<Option<String>> {
    let email = sqlx::query_scalar::<_, String>(
        r#"
        UPDATE verification_tokens
           SET used_at = now()
         WHERE token_hash = $1
           AND purpose = $2
           AND used_at IS NULL
           AND expires_at > now()
        RETURNING email
        "#,
    )
    .bind(token_hash)
    .bind(purpose.as_str())
    .fetch_optional(db)
    .await
    .context("consume verification token")?;
    Ok(email)
}

/// Drops expired and used tokens for an email before issuing a new one.
pub async fn purge_tokens<'e, E: PgExecutor<'e>>(
    db: E,
    email: &str,
    purpose: TokenPurpose,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        DELETE FROM verification_tokens
         WHERE email = $1 AND purpose = $2
           AND (used_at IS NOT NULL OR expires_at <= now())
        "#,
    )
    .bind(email)
    .bind(purpose.as_str())
    .execute(db)
    .await
    .context("purge verification tokens")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    #[sqlx::test(migrations = "./migrations")]
    async fn token_is_consumed_once(pool: PgPool) {
        insert_token(&pool, "ann@example.com", "digest-1", TokenPurpose::PasswordReset)
            .await
            .unwrap();

        let first = consume_token(&pool, "digest-1", TokenPurpose::PasswordReset)
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("ann@example.com"));

        let second = consume_token(&pool, "digest-1", TokenPurpose::PasswordReset)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn expired_token_is_refused(pool: PgPool) {
        insert_token(&pool, "ann@example.com", "digest-2", TokenPurpose::MagicLink)
            .await
            .unwrap();
        sqlx::query(
            "UPDATE verification_tokens SET expires_at = now() - interval '1 minute' \
             WHERE token_hash = $1",
        )
        .bind("digest-2")
        .execute(&pool)
        .await
        .unwrap();

        let got = consume_token(&pool, "digest-2", TokenPurpose::MagicLink)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn token_only_serves_its_purpose(pool: PgPool) {
        insert_token(&pool, "ann@example.com", "digest-3", TokenPurpose::MagicLink)
            .await
            .unwrap();

        let wrong = consume_token(&pool, "digest-3", TokenPurpose::PasswordReset)
            .await
            .unwrap();
        assert!(wrong.is_none());
        let right = consume_token(&pool, "digest-3", TokenPurpose::MagicLink)
            .await
            .unwrap();
        assert_eq!(right.as_deref(), Some("ann@example.com"));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn purge_keeps_live_tokens(pool: PgPool) {
        for digest in ["live", "used"] {
            insert_token(&pool, "ann@example.com", digest, TokenPurpose::PasswordReset)
                .await
                .unwrap();
        }
        consume_token(&pool, "used", TokenPurpose::PasswordReset)
            .await
            .unwrap();

        purge_tokens(&pool, "ann@example.com", TokenPurpose::PasswordReset)
            .await
            .unwrap();

        let left: Vec<String> = sqlx::query_scalar("SELECT token_hash FROM verification_tokens")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(left, vec!["live"]);
    }
}
