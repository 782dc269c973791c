use anyhow::Context;
use sqlx::PgExecutor;

use crate::ids::new_id;
use crate::users::repo_types::{NewUser, Role, RoleWithCount, User, UserPatch, UserProfile};

// ---- Users ----

/// Find a user by email, soft-deleted ones included.
pub async fn find_by_email<'e, E: PgExecutor<'e>>(
    db: E,
    email: &str,
) -> anyhow::Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, email, password_hash, name, image, email_verified_at,
               created_at, updated_at, deleted_at
          FROM users
         WHERE email = $1
        "#,
    )
    .bind(email)
    .fetch_optional(db)
    .await
    .context("find user by email")?;
    Ok(user)
}

pub async fn find_by_id<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        SELECT id, email, password_hash, name, image, email_verified_at,
               created_at, updated_at, deleted_at
          FROM users
         WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(db)
    .await
    .context("find user by id")?;
    Ok(user)
}

pub async fn insert_user<'e, E: PgExecutor<'e>>(db: E, new: &NewUser<'_>) -> anyhow::Result<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, email, password_hash, name, image, email_verified_at)
        VALUES ($1, $2, $3, $4, $5, CASE WHEN $6 THEN now() END)
        RETURNING id, email, password_hash, name, image, email_verified_at,
                  created_at, updated_at, deleted_at
        "#,
    )
    .bind(new_id())
    .bind(new.email)
    .bind(new.password_hash)
    .bind(new.name)
    .bind(new.image)
    .bind(new.email_verified)
    .fetch_one(db)
    .await
    .context("insert user")?;
    Ok(user)
}

pub async fn update_user<'e, E: PgExecutor<'e>>(
    db: E,
    id: &str,
    patch: &UserPatch,
) -> anyhow::Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        r#"
        UPDATE users
           SET email = COALESCE($2, email),
               name = COALESCE($3, name),
               image = COALESCE($4, image),
               updated_at = now()
         WHERE id = $1
        RETURNING id, email, password_hash, name, image, email_verified_at,
                  created_at, updated_at, deleted_at
        "#,
    )
    .bind(id)
    .bind(patch.email.as_deref())
    .bind(patch.name.as_deref())
    .bind(patch.image.as_deref())
    .fetch_optional(db)
    .await
    .context("update user")?;
    Ok(user)
}

pub async fn update_password<'e, E: PgExecutor<'e>>(
    db: E,
    id: &str,
    hash: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(hash)
        .execute(db)
        .await
        .context("update password")?;
    Ok(())
}

pub async fn mark_email_verified<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE users SET email_verified_at = COALESCE(email_verified_at, now()) WHERE id = $1",
    )
    .bind(id)
    .execute(db)
    .await
    .context("mark email verified")?;
    Ok(())
}

/// Returns false when the user was missing or already deleted.
pub async fn soft_delete_user<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE users
           SET deleted_at = now(), updated_at = now()
         WHERE id = $1 AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .execute(db)
    .await
    .context("soft delete user")?;
    Ok(res.rows_affected() == 1)
}

pub async fn restore_user<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE users
           SET deleted_at = NULL, updated_at = now()
         WHERE id = $1 AND deleted_at IS NOT NULL
        "#,
    )
    .bind(id)
    .execute(db)
    .await
    .context("restore user")?;
    Ok(res.rows_affected() == 1)
}

pub struct UserFilter<'a> {
    pub query: Option<&'a str>,
    pub include_deleted: bool,
    pub limit: i64,
    pub offset: i64,
}

/// ILIKE pattern with `%`, `_` and `\` escaped.
pub fn like_pattern(raw: &str) -> String {
    let escaped = raw
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

pub async fn list_users<'e, E: PgExecutor<'e>>(
    db: E,
    f: &UserFilter<'_>,
) -> anyhow::Result<Vec<User>> {
    let pattern = f.query.map(like_pattern);
    let rows = sqlx::query_as::<_, User>(
        r#"
        SELECT id, email, password_hash, name, image, email_verified_at,
               created_at, updated_at, deleted_at
          FROM users
         WHERE ($1::text IS NULL OR email ILIKE $1 OR name ILIKE $1)
           AND ($2 OR deleted_at IS NULL)
         ORDER BY id DESC
         LIMIT $3 OFFSET $4
        "#,
    )
    .bind(pattern)
    .bind(f.include_deleted)
    .bind(f.limit)
    .bind(f.offset)
    .fetch_all(db)
    .await
    .context("list users")?;
    Ok(rows)
}

pub async fn count_users<'e, E: PgExecutor<'e>>(db: E, f: &UserFilter<'_>) -> anyhow::Result<i64> {
    let pattern = f.query.map(like_pattern);
    let total = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT count(*)
          FROM users
         WHERE ($1::text IS NULL OR email ILIKE $1 OR name ILIKE $1)
           AND ($2 OR deleted_at IS NULL)
        "#,
    )
    .bind(pattern)
    .bind(f.include_deleted)
    .fetch_one(db)
    .await
    .context("count users")?;
    Ok(total)
}

// ---- Profiles ----

pub async fn get_profile<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
) -> anyhow::Result<Option<UserProfile>> {
    let profile = sqlx::query_as::<_, UserProfile>(
        "SELECT user_id, first_name, last_name FROM user_profiles WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await
    .context("get profile")?;
    Ok(profile)
}

/// Creates the profile row if missing; provided names overwrite, `None` keeps.
pub async fn upsert_profile<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_profiles (id, user_id, first_name, last_name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (user_id) DO UPDATE
           SET first_name = COALESCE(EXCLUDED.first_name, user_profiles.first_name),
               last_name = COALESCE(EXCLUDED.last_name, user_profiles.last_name),
               updated_at = now()
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(first_name)
    .bind(last_name)
    .execute(db)
    .await
    .context("upsert profile")?;
    Ok(())
}

// ---- Roles ----

pub async fn list_roles<'e, E: PgExecutor<'e>>(db: E) -> anyhow::Result<Vec<RoleWithCount>> {
    let rows = sqlx::query_as::<_, RoleWithCount>(
        r#"
        SELECT r.id, r.name, r.created_at,
               count(u.id) AS member_count
          FROM roles r
          LEFT JOIN user_roles ur ON ur.role_id = r.id AND ur.deleted_at IS NULL
          LEFT JOIN users u ON u.id = ur.user_id AND u.deleted_at IS NULL
         GROUP BY r.id, r.name, r.created_at
         ORDER BY r.name
        "#,
    )
    .fetch_all(db)
    .await
    .context("list roles")?;
    Ok(rows)
}

pub async fn find_role_by_id<'e, E: PgExecutor<'e>>(
    db: E,
    id: &str,
) -> anyhow::Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>("SELECT id, name, created_at FROM roles WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await
        .context("find role by id")?;
    Ok(role)
}

pub async fn find_roles_by_names<'e, E: PgExecutor<'e>>(
    db: E,
    names: &[String],
) -> anyhow::Result<Vec<Role>> {
    let roles = sqlx::query_as::<_, Role>(
        "SELECT id, name, created_at FROM roles WHERE name = ANY($1) ORDER BY name",
    )
    .bind(names)
    .fetch_all(db)
    .await
    .context("find roles by names")?;
    Ok(roles)
}

pub async fn insert_role<'e, E: PgExecutor<'e>>(db: E, name: &str) -> anyhow::Result<Role> {
    let role = sqlx::query_as::<_, Role>(
        "INSERT INTO roles (id, name) VALUES ($1, $2) RETURNING id, name, created_at",
    )
    .bind(new_id())
    .bind(name)
    .fetch_one(db)
    .await
    .context("insert role")?;
    Ok(role)
}

/// Returns the role with that name, creating it when absent.
pub async fn ensure_role<'e, E: PgExecutor<'e>>(db: E, name: &str) -> anyhow::Result<Role> {
    let role = sqlx::query_as::<_, Role>(
        r#"
        INSERT INTO roles (id, name) VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
        RETURNING id, name, created_at
        "#,
    )
    .bind(new_id())
    .bind(name)
    .fetch_one(db)
    .await
    .with_context(|| format!("ensure role {}", name))?;
    Ok(role)
}

pub async fn rename_role<'e, E: PgExecutor<'e>>(
    db: E,
    id: &str,
    name: &str,
) -> anyhow::Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>(
        "UPDATE roles SET name = $2 WHERE id = $1 RETURNING id, name, created_at",
    )
    .bind(id)
    .bind(name)
    .fetch_optional(db)
    .await
    .context("rename role")?;
    Ok(role)
}

pub async fn delete_role<'e, E: PgExecutor<'e>>(db: E, id: &str) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM roles WHERE id = $1")
        .bind(id)
        .execute(db)
        .await
        .context("delete role")?;
    Ok(res.rows_affected() == 1)
}

pub async fn count_active_members<'e, E: PgExecutor<'e>>(
    db: E,
    role_id: &str,
) -> anyhow::Result<i64> {
    let n = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT count(*)
          FROM user_roles ur
          JOIN users u ON u.id = ur.user_id
         WHERE ur.role_id = $1 AND ur.deleted_at IS NULL AND u.deleted_at IS NULL
        "#,
    )
    .bind(role_id)
    .fetch_one(db)
    .await
    .context("count role members")?;
    Ok(n)
}

// ---- User roles ----

pub async fn role_names_for_user<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
) -> anyhow::Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        r#"
        SELECT r.name
          FROM user_roles ur
          JOIN roles r ON r.id = ur.role_id
         WHERE ur.user_id = $1 AND ur.deleted_at IS NULL
         ORDER BY r.name
        "#,
    )
    .bind(user_id)
    .fetch_all(db)
    .await
    .context("role names for user")?;
    Ok(names)
}

/// (user_id, role name) pairs for a page of users.
pub async fn role_names_for_users<'e, E: PgExecutor<'e>>(
    db: E,
    user_ids: &[String],
) -> anyhow::Result<Vec<(String, String)>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        r#"
        SELECT ur.user_id, r.name
          FROM user_roles ur
          JOIN roles r ON r.id = ur.role_id
         WHERE ur.user_id = ANY($1) AND ur.deleted_at IS NULL
         ORDER BY r.name
        "#,
    )
    .bind(user_ids)
    .fetch_all(db)
    .await
    .context("role names for users")?;
    Ok(rows)
}

pub async fn assign_role<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
    role_id: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_roles (id, user_id, role_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, role_id) WHERE deleted_at IS NULL DO NOTHING
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(role_id)
    .execute(db)
    .await
    .context("assign role")?;
    Ok(())
}

/// Soft-deletes every active link of the user whose role is not in `keep`.
pub async fn revoke_roles_except<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
    keep: &[String],
) -> anyhow::Result<u64> {
    let res = sqlx::query(
        r#"
        UPDATE user_roles
           SET deleted_at = now()
         WHERE user_id = $1 AND deleted_at IS NULL AND NOT (role_id = ANY($2))
        "#,
    )
    .bind(user_id)
    .bind(keep)
    .execute(db)
    .await
    .context("revoke roles")?;
    Ok(res.rows_affected())
}

// ---- OAuth accounts ----

pub async fn find_account_user_id<'e, E: PgExecutor<'e>>(
    db: E,
    provider: &str,
    provider_account_id: &str,
) -> anyhow::Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT user_id FROM accounts WHERE provider = $1 AND provider_account_id = $2",
    )
    .bind(provider)
    .bind(provider_account_id)
    .fetch_optional(db)
    .await
    .context("find account")?;
    Ok(id)
}

pub async fn link_account<'e, E: PgExecutor<'e>>(
    db: E,
    user_id: &str,
    provider: &str,
    provider_account_id: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO accounts (id, user_id, provider, provider_account_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (provider, provider_account_id) DO NOTHING
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(provider)
    .bind(provider_account_id)
    .execute(db)
    .await
    .context("link account")?;
    Ok(())
}

/// True when the error chain holds a Postgres unique violation (23505).
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .and_then(|d| d.code())
            .map(|code| code == "23505")
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("ann"), "%ann%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
        assert_eq!(like_pattern("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn plain_errors_are_not_unique_violations() {
        let err = anyhow::anyhow!("boom").context("insert user");
        assert!(!is_unique_violation(&err));
        let err = anyhow::Error::new(sqlx::Error::RowNotFound).context("insert user");
        assert!(!is_unique_violation(&err));
    }
}
