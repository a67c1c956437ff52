/// Account management system
///
/// Handles signup, login, token refresh, sessions, password changes and
/// resets, role switching and login history.

mod manager;

pub use manager::AccountManager;

use crate::{
    db::account::{Account, LoginHistoryEntry, Role},
    error::{IdentityError, IdentityResult},
    sessions::ActiveSession,
    tokens::TokenPair,
    trial::{Trial, TrialState},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Signup request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[validate(email(message = "Email address is not valid"))]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,

    #[validate(length(min = 1, max = 100, message = "Name must be between 1 and 100 characters"))]
    pub name: String,

    #[validate(length(min = 7, max = 20, message = "Phone must be between 7 and 20 characters"))]
    pub phone: Option<String>,

    /// Defaults to buyer
    pub role: Option<String>,
}

/// Login request; one of email or phone identifies the account
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: Option<String>,
    pub phone: Option<String>,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

/// Token refresh request
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

/// Logout request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 1, message = "New password is required"))]
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RequestPasswordResetRequest {
    #[validate(email(message = "Email address is not valid"))]
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    #[validate(length(min = 1, message = "Reset token is required"))]
    pub token: String,

    #[validate(length(min = 1, message = "New password is required"))]
    pub new_password: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRoleRequest {
    #[validate(length(min = 1, message = "Role is required"))]
    pub role: String,
}

/// Trial entitlement as shown to its owner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialView {
    #[serde(flatten)]
    pub trial: Trial,
    pub state: TrialState,
}

/// Account as returned by the API. Never carries the password hash.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub email: String,
    pub phone: Option<String>,
    pub name: String,
    pub role: Role,
    pub available_roles: Vec<Role>,
    pub active_role: Option<Role>,
    pub primary_role: Option<Role>,
    pub listings_quota: i64,
    pub is_subscribed: bool,
    pub subscription_plan: Option<String>,
    pub subscription_expires_at: Option<DateTime<Utc>>,
    pub trial: Option<TrialView>,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for UserView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            email: account.email.clone(),
            phone: account.phone.clone(),
            name: account.name.clone(),
            role: account.role,
            available_roles: account.available_roles.clone(),
            active_role: account.active_role,
            primary_role: account.primary_role,
            listings_quota: account.listings_quota,
            is_subscribed: account.subscription.is_subscribed,
            subscription_plan: account.subscription.plan.clone(),
            subscription_expires_at: account.subscription.expires_at,
            trial: account.trial.map(|trial| TrialView {
                trial,
                state: trial.state(),
            }),
            created_at: account.created_at,
        }
    }
}

/// Signup, login and password reset response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserView,
}

impl AuthResponse {
    pub fn new(pair: TokenPair, account: &Account) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            user: UserView::from(account),
        }
    }
}

/// Refresh response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokensResponse {
    pub access_token: String,
    pub refresh_token: String,
}

impl From<TokenPair> for TokensResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<ActiveSession>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginHistoryResponse {
    pub entries: Vec<LoginHistoryEntry>,
}

/// Run derive validation and flatten the failures into one message
pub fn validate_request<T: Validate>(request: &T) -> IdentityResult<()> {
    request
        .validate()
        .map_err(|errors| IdentityError::Validation(errors.to_string()))
}
