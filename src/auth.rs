/// Authentication extractors
use crate::{context::AppContext, db::account::Account, error::IdentityError};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

/// Authenticated context - resolves the bearer access token to its account
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: String,
    pub account: Account,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthContext {
    type Rejection = IdentityError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| {
                    IdentityError::Authentication("Missing authorization header".to_string())
                })?;

        let account = state
            .account_manager
            .validate_access_token(bearer.token())
            .await?;

        Ok(AuthContext {
            account_id: account.id.clone(),
            account,
        })
    }
}
