/// Current-user endpoints
use super::middleware::json_body;
use crate::{
    account::{SwitchRoleRequest, UserView},
    auth::AuthContext,
    context::AppContext,
    error::IdentityResult,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/users/me", get(me))
        .route("/users/me/role", post(switch_role))
}

async fn me(auth: AuthContext) -> Json<UserView> {
    Json(UserView::from(&auth.account))
}

async fn switch_role(
    State(ctx): State<AppContext>,
    auth: AuthContext,
    payload: Result<Json<SwitchRoleRequest>, JsonRejection>,
) -> IdentityResult<Json<UserView>> {
    let request = json_body(payload)?;
    Ok(Json(
        ctx.account_manager
            .switch_role(&auth.account_id, request)
            .await?,
    ))
}
