/// Authentication endpoints under /auth
use super::middleware::json_body;
use crate::{
    account::{
        AuthResponse, ChangePasswordRequest, LoginHistoryResponse, LoginRequest, LogoutRequest,
        MessageResponse, RefreshRequest, RequestPasswordResetRequest, ResetPasswordRequest,
        SessionsResponse, SignupRequest, TokensResponse,
    },
    auth::AuthContext,
    context::AppContext,
    error::IdentityResult,
    sessions::ClientInfo,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

/// Build auth routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/login", post(login))
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
        .route("/auth/sessions", get(sessions))
        .route("/auth/change-password", post(change_password))
        .route("/auth/request-password-reset", post(request_password_reset))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/login-history", get(login_history))
}

async fn signup(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> IdentityResult<(StatusCode, Json<AuthResponse>)> {
    let request = json_body(payload)?;
    let response = ctx.account_manager.signup(request, &client).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> IdentityResult<Json<AuthResponse>> {
    let request = json_body(payload)?;
    Ok(Json(ctx.account_manager.login(request, &client).await?))
}

async fn refresh_token(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> IdentityResult<Json<TokensResponse>> {
    let request = json_body(payload)?;
    Ok(Json(ctx.account_manager.refresh(request, &client).await?))
}

/// Body is optional; a missing or malformed one still logs out
async fn logout(
    State(ctx): State<AppContext>,
    payload: Option<Json<LogoutRequest>>,
) -> Json<MessageResponse> {
    let request = payload.map(|Json(body)| body).unwrap_or_default();
    Json(ctx.account_manager.logout(request).await)
}

async fn logout_all(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> IdentityResult<Json<MessageResponse>> {
    Ok(Json(ctx.account_manager.logout_all(&auth.account_id).await?))
}

async fn sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> IdentityResult<Json<SessionsResponse>> {
    Ok(Json(ctx.account_manager.sessions(&auth.account_id).await?))
}

async fn change_password(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> IdentityResult<Json<MessageResponse>> {
    let request = json_body(payload)?;
    Ok(Json(
        ctx.account_manager
            .change_password(&auth.account_id, request)
            .await?,
    ))
}

async fn request_password_reset(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    payload: Result<Json<RequestPasswordResetRequest>, JsonRejection>,
) -> IdentityResult<Json<MessageResponse>> {
    let request = json_body(payload)?;
    Ok(Json(
        ctx.account_manager
            .request_password_reset(request, &client)
            .await?,
    ))
}

async fn reset_password(
    State(ctx): State<AppContext>,
    client: ClientInfo,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> IdentityResult<Json<AuthResponse>> {
    let request = json_body(payload)?;
    Ok(Json(
        ctx.account_manager.reset_password(request, &client).await?,
    ))
}

async fn login_history(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> IdentityResult<Json<LoginHistoryResponse>> {
    Ok(Json(
        ctx.account_manager.login_history(&auth.account_id).await?,
    ))
}
