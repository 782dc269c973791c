use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post, put},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::{
        dto::MessageResponse,
        extractors::{AdminUser, SessionUser},
    },
    error::ApiResult,
    pagination::Page,
    state::AppState,
    users::{
        dto::{
            ChangePasswordRequest, CreateUserRequest, ListUsersQuery, RoleRequest,
            SetRolesRequest, UpdateMeRequest, UpdateUserRequest, UserDetail, UserView,
        },
        repo_types::{Role, RoleWithCount},
        services,
    },
};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users).post(create_user))
        .route(
            "/admin/users/:id",
            get(get_user).patch(update_user).delete(delete_user),
        )
        .route("/admin/users/:id/restore", post(restore_user))
        .route("/admin/users/:id/roles", put(set_roles))
        .route("/admin/roles", get(list_roles).post(create_role))
        .route("/admin/roles/:id", patch(rename_role).delete(delete_role))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(me).patch(update_me))
        .route("/me/password", post(change_password))
}

// --- admin: users ---

#[instrument(skip(state, _admin))]
pub async fn list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(q): Query<ListUsersQuery>,
) -> ApiResult<Json<Page<UserView>>> {
    Ok(Json(services::list_users(&state, q).await?))
}

#[instrument(skip(state, _admin, payload))]
pub async fn create_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<UserDetail>)> {
    let detail = services::create_user(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

#[instrument(skip(state, _admin))]
pub async fn get_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<UserDetail>> {
    Ok(Json(services::get_user(&state, &id).await?))
}

#[instrument(skip(state, _admin, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserDetail>> {
    Ok(Json(services::update_user(&state, &id, payload).await?))
}

#[instrument(skip(state, admin))]
pub async fn delete_user(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    services::delete_user(&state, admin.id(), &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state, _admin))]
pub async fn restore_user(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<UserDetail>> {
    Ok(Json(services::restore_user(&state, &id).await?))
}

#[instrument(skip(state, admin, payload))]
pub async fn set_roles(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<SetRolesRequest>,
) -> ApiResult<Json<UserDetail>> {
    let detail = services::set_user_roles(&state, admin.id(), &id, &payload.roles).await?;
    Ok(Json(detail))
}

// --- admin: roles ---

#[instrument(skip(state, _admin))]
pub async fn list_roles(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<Vec<RoleWithCount>>> {
    Ok(Json(services::list_roles(&state).await?))
}

#[instrument(skip(state, _admin))]
pub async fn create_role(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(payload): Json<RoleRequest>,
) -> ApiResult<(StatusCode, Json<Role>)> {
    let role = services::create_role(&state, &payload.name).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

#[instrument(skip(state, _admin))]
pub async fn rename_role(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(payload): Json<RoleRequest>,
) -> ApiResult<Json<Role>> {
    Ok(Json(services::rename_role(&state, &id, &payload.name).await?))
}

#[instrument(skip(state, _admin))]
pub async fn delete_role(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    services::delete_role(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- self service ---

#[instrument(skip_all)]
pub async fn me(
    State(state): State<AppState>,
    session: SessionUser,
) -> ApiResult<Json<UserDetail>> {
    Ok(Json(services::me(&state, session.id()).await?))
}

#[instrument(skip_all)]
pub async fn update_me(
    State(state): State<AppState>,
    session: SessionUser,
    Json(payload): Json<UpdateMeRequest>,
) -> ApiResult<Json<UserDetail>> {
    Ok(Json(services::update_me(&state, session.id(), payload).await?))
}

#[instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    session: SessionUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    services::change_password(&state, &session.user, payload).await?;
    Ok(Json(MessageResponse {
        message: "Password updated",
    }))
}
