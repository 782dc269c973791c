use std::collections::{BTreeSet, HashMap};

use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};

use crate::{
    auth::{
        password,
        services::{is_valid_email, normalize_email},
    },
    config::AppConfig,
    error::{ApiError, ApiResult},
    ids::is_valid_id,
    pagination::{Page, PageParams},
    state::AppState,
    users::{
        dto::{
            ChangePasswordRequest, CreateUserRequest, ListUsersQuery, UpdateMeRequest,
            UpdateUserRequest, UserDetail, UserView,
        },
        repo::{self, UserFilter},
        repo_types::{NewUser, Role, RoleWithCount, User, UserPatch},
    },
};

pub const ADMIN_ROLE: &str = "admin";
pub const USER_ROLE: &str = "user";

/// Roles seeded by the first migration; they can be neither renamed nor deleted.
pub const PROTECTED_ROLES: &[&str] = &[ADMIN_ROLE, USER_ROLE];

pub fn has_role(roles: &[String], name: &str) -> bool {
    roles.iter().any(|r| r == name)
}

pub fn is_protected_role(name: &str) -> bool {
    PROTECTED_ROLES.contains(&name)
}

/// Roles every sign-in must leave in place: the default role, plus admin for
/// verified addresses listed in `ADMIN_EMAILS`.
pub fn roles_for_sign_in(config: &AppConfig, email: &str, email_verified: bool) -> Vec<String> {
    let mut roles = vec![config.default_role.clone()];
    if email_verified && config.is_admin_email(email) && config.default_role != ADMIN_ROLE {
        roles.push(ADMIN_ROLE.to_string());
    }
    roles
}

pub fn validate_role_name(raw: &str) -> ApiResult<String> {
    lazy_static! {
        static ref ROLE_RE: Regex = Regex::new(r"^[a-z][a-z0-9_-]{1,31}$").unwrap();
    }
    let name = raw.trim().to_lowercase();
    if !ROLE_RE.is_match(&name) {
        return Err(ApiError::bad_request(
            "Role name must be 2-32 characters: lowercase letters, digits, '-' or '_'",
        ));
    }
    Ok(name)
}

/// Validated, de-duplicated and sorted role names.
pub fn normalize_role_names(raw: &[String]) -> ApiResult<Vec<String>> {
    let set: BTreeSet<String> = raw
        .iter()
        .map(|r| validate_role_name(r))
        .collect::<ApiResult<_>>()?;
    Ok(set.into_iter().collect())
}

/// Trimmed value, with blank strings treated as absent.
fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_id(id: &str, what: &str) -> ApiResult<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("{} not found", what)))
    }
}

pub async fn ensure_sign_in_roles(
    conn: &mut PgConnection,
    config: &AppConfig,
    user: &User,
) -> anyhow::Result<()> {
    let verified = user.email_verified_at.is_some();
    for name in roles_for_sign_in(config, &user.email, verified) {
        let role = repo::ensure_role(&mut *conn, &name).await?;
        repo::assign_role(&mut *conn, &user.id, &role.id).await?;
    }
    Ok(())
}

async fn load_detail(db: &PgPool, id: &str) -> ApiResult<UserDetail> {
    let user = repo::find_by_id(db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let roles = repo::role_names_for_user(db, id).await?;
    let profile = repo::get_profile(db, id).await?;
    let has_password = user.password_hash.is_some();
    Ok(UserDetail {
        user: UserView::new(user, roles),
        profile,
        has_password,
    })
}

// ---- Admin: users ----

pub async fn list_users(state: &AppState, q: ListUsersQuery) -> ApiResult<Page<UserView>> {
    let params = PageParams {
        page: q.page,
        page_size: q.page_size,
    };
    let query = clean(q.q);
    let filter = UserFilter {
        query: query.as_deref(),
        include_deleted: q.include_deleted,
        limit: params.limit(),
        offset: params.offset(),
    };
    let users = repo::list_users(&state.db, &filter).await?;
    let total = repo::count_users(&state.db, &filter).await?;

    let ids: Vec<String> = users.iter().map(|u| u.id.clone()).collect();
    let mut roles: HashMap<String, Vec<String>> = HashMap::new();
    for (user_id, role) in repo::role_names_for_users(&state.db, &ids).await? {
        roles.entry(user_id).or_default().push(role);
    }

    let items = users
        .into_iter()
        .map(|u| {
            let r = roles.remove(&u.id).unwrap_or_default();
            UserView::new(u, r)
        })
        .collect();
    Ok(Page::new(items, &params, total))
}

pub async fn get_user(state: &AppState, id: &str) -> ApiResult<UserDetail> {
    check_id(id, "User")?;
    load_detail(&state.db, id).await
}

pub async fn create_user(state: &AppState, req: CreateUserRequest) -> ApiResult<UserDetail> {
    let email = normalize_email(&req.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("Invalid email"));
    }
    let hash = match req.password.as_deref() {
        Some(p) => {
            password::check_policy(p).map_err(ApiError::bad_request)?;
            Some(password::hash_password(p)?)
        }
        None => None,
    };
    let role_names = match &req.roles {
        Some(r) => normalize_role_names(r)?,
        None => vec![state.config.default_role.clone()],
    };
    let roles = repo::find_roles_by_names(&state.db, &role_names).await?;
    if roles.len() != role_names.len() {
        return Err(ApiError::bad_request(unknown_roles_message(&role_names, &roles)));
    }

    let name = clean(req.name);
    let mut tx = state.db.begin().await?;
    let user = match repo::insert_user(
        &mut *tx,
        &NewUser {
            email: &email,
            password_hash: hash.as_deref(),
            name: name.as_deref(),
            image: None,
            email_verified: false,
        },
    )
    .await
    {
        Ok(u) => u,
        Err(e) if repo::is_unique_violation(&e) => {
            return Err(ApiError::conflict("Email already registered"));
        }
        Err(e) => return Err(e.into()),
    };
    repo::upsert_profile(
        &mut *tx,
        &user.id,
        clean(req.first_name).as_deref(),
        clean(req.last_name).as_deref(),
    )
    .await?;
    for role in &roles {
        repo::assign_role(&mut *tx, &user.id, &role.id).await?;
    }
    tx.commit().await?;

    info!(user_id = %user.id, email = %user.email, "user created by admin");
    load_detail(&state.db, &user.id).await
}

pub async fn update_user(
    state: &AppState,
    id: &str,
    req: UpdateUserRequest,
) -> ApiResult<UserDetail> {
    check_id(id, "User")?;
    let email = match clean(req.email) {
        Some(e) => {
            let e = normalize_email(&e);
            if !is_valid_email(&e) {
                return Err(ApiError::bad_request("Invalid email"));
            }
            Some(e)
        }
        None => None,
    };
    let patch = UserPatch {
        email,
        name: clean(req.name),
        image: clean(req.image),
    };

    let mut tx = state.db.begin().await?;
    match repo::update_user(&mut *tx, id, &patch).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(ApiError::not_found("User not found")),
        Err(e) if repo::is_unique_violation(&e) => {
            return Err(ApiError::conflict("Email already registered"));
        }
        Err(e) => return Err(e.into()),
    }
    let first = clean(req.first_name);
    let last = clean(req.last_name);
    if first.is_some() || last.is_some() {
        repo::upsert_profile(&mut *tx, id, first.as_deref(), last.as_deref()).await?;
    }
    tx.commit().await?;

    info!(user_id = %id, "user updated");
    load_detail(&state.db, id).await
}

pub async fn delete_user(state: &AppState, actor_id: &str, id: &str) -> ApiResult<()> {
    check_id(id, "User")?;
    if actor_id == id {
        return Err(ApiError::bad_request("You cannot delete your own account"));
    }
    let mut tx = state.db.begin().await?;
    if !repo::soft_delete_user(&mut *tx, id).await? {
        return Err(ApiError::not_found("User not found"));
    }
    let revoked = repo::revoke_roles_except(&mut *tx, id, &[]).await?;
    tx.commit().await?;
    info!(user_id = %id, actor_id = %actor_id, revoked, "user soft-deleted");
    Ok(())
}

/// Restored users get the sign-in roles back; other roles must be re-granted.
pub async fn restore_user(state: &AppState, id: &str) -> ApiResult<UserDetail> {
    check_id(id, "User")?;
    let mut tx = state.db.begin().await?;
    if !repo::restore_user(&mut *tx, id).await? {
        return Err(ApiError::not_found("No deleted user with that id"));
    }
    let user = repo::find_by_id(&mut *tx, id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    ensure_sign_in_roles(&mut tx, &state.config, &user).await?;
    tx.commit().await?;
    info!(user_id = %id, "user restored");
    load_detail(&state.db, id).await
}

pub async fn set_user_roles(
    state: &AppState,
    actor_id: &str,
    id: &str,
    names: &[String],
) -> ApiResult<UserDetail> {
    check_id(id, "User")?;
    let names = normalize_role_names(names)?;
    if actor_id == id && !has_role(&names, ADMIN_ROLE) {
        return Err(ApiError::bad_request("You cannot remove your own admin role"));
    }
    let user = repo::find_by_id(&state.db, id)
        .await?
        .filter(|u| !u.is_deleted())
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    let roles = repo::find_roles_by_names(&state.db, &names).await?;
    if roles.len() != names.len() {
        return Err(ApiError::bad_request(unknown_roles_message(&names, &roles)));
    }

    let keep: Vec<String> = roles.iter().map(|r| r.id.clone()).collect();
    let mut tx = state.db.begin().await?;
    repo::revoke_roles_except(&mut *tx, &user.id, &keep).await?;
    for role_id in &keep {
        repo::assign_role(&mut *tx, &user.id, role_id).await?;
    }
    tx.commit().await?;
    info!(user_id = %user.id, actor_id = %actor_id, roles = ?names, "roles replaced");
    load_detail(&state.db, id).await
}

fn unknown_roles_message(wanted: &[String], found: &[Role]) -> String {
    let missing: Vec<&str> = wanted
        .iter()
        .filter(|w| !found.iter().any(|r| &r.name == *w))
        .map(String::as_str)
        .collect();
    format!("Unknown roles: {}", missing.join(", "))
}

// ---- Admin: roles ----

pub async fn list_roles(state: &AppState) -> ApiResult<Vec<RoleWithCount>> {
    Ok(repo::list_roles(&state.db).await?)
}

pub async fn create_role(state: &AppState, raw: &str) -> ApiResult<Role> {
    let name = validate_role_name(raw)?;
    match repo::insert_role(&state.db, &name).await {
        Ok(role) => {
            info!(role = %role.name, "role created");
            Ok(role)
        }
        Err(e) if repo::is_unique_violation(&e) => Err(ApiError::conflict("Role already exists")),
        Err(e) => Err(e.into()),
    }
}

pub async fn rename_role(state: &AppState, id: &str, raw: &str) -> ApiResult<Role> {
    check_id(id, "Role")?;
    let name = validate_role_name(raw)?;
    let current = repo::find_role_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;
    if is_protected_role(&current.name) {
        return Err(ApiError::bad_request("Built-in roles cannot be renamed"));
    }
    match repo::rename_role(&state.db, id, &name).await {
        Ok(Some(role)) => Ok(role),
        Ok(None) => Err(ApiError::not_found("Role not found")),
        Err(e) if repo::is_unique_violation(&e) => Err(ApiError::conflict("Role already exists")),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_role(state: &AppState, id: &str) -> ApiResult<()> {
    check_id(id, "Role")?;
    let role = repo::find_role_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Role not found"))?;
    if is_protected_role(&role.name) {
        return Err(ApiError::bad_request("Built-in roles cannot be deleted"));
    }
    let members = repo::count_active_members(&state.db, id).await?;
    if members > 0 {
        warn!(role = %role.name, members, "refusing to delete role in use");
        return Err(ApiError::conflict(format!(
            "Role is assigned to {} user(s)",
            members
        )));
    }
    repo::delete_role(&state.db, id).await?;
    info!(role = %role.name, "role deleted");
    Ok(())
}

// ---- Self service ----

pub async fn me(state: &AppState, user_id: &str) -> ApiResult<UserDetail> {
    load_detail(&state.db, user_id).await
}

pub async fn update_me(
    state: &AppState,
    user_id: &str,
    req: UpdateMeRequest,
) -> ApiResult<UserDetail> {
    let patch = UserPatch {
        email: None,
        name: clean(req.name),
        image: clean(req.image),
    };
    let mut tx = state.db.begin().await?;
    repo::update_user(&mut *tx, user_id, &patch).await?;
    let first = clean(req.first_name);
    let last = clean(req.last_name);
    if first.is_some() || last.is_some() {
        repo::upsert_profile(&mut *tx, user_id, first.as_deref(), last.as_deref()).await?;
    }
    tx.commit().await?;
    load_detail(&state.db, user_id).await
}

/// Accounts that never had a password (OAuth, magic link) may set one
/// without `current_password`.
pub async fn change_password(
    state: &AppState,
    user: &User,
    req: ChangePasswordRequest,
) -> ApiResult<()> {
    password::check_policy(&req.new_password).map_err(ApiError::bad_request)?;
    if let Some(existing) = &user.password_hash {
        let current = req
            .current_password
            .as_deref()
            .ok_or_else(|| ApiError::bad_request("Current password required"))?;
        if !password::verify_password(current, existing)? {
            warn!(user_id = %user.id, "change password with wrong current password");
            return Err(ApiError::unauthorized("Invalid credentials"));
        }
    }
    let hash = password::hash_password(&req.new_password)?;
    repo::update_password(&state.db, &user.id, &hash).await?;
    info!(user_id = %user.id, "password changed");
    Ok(())
}
