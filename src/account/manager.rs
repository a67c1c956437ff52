/// Account manager implementation using runtime queries
///
/// Composes the rate limiter, lockout, password hashing, session store and
/// trial policy into the signup, login and credential-recovery flows.
use super::{
    validate_request, AuthResponse, ChangePasswordRequest, LoginHistoryResponse, LoginRequest,
    LogoutRequest, MessageResponse, RefreshRequest, RequestPasswordResetRequest,
    ResetPasswordRequest, SessionsResponse, SignupRequest, SwitchRoleRequest, TokensResponse,
    UserView,
};
use crate::{
    clock::{to_chrono, SharedClock},
    config::ServerConfig,
    credentials,
    crypto::{random_token, sha256_hex, PasswordHasher},
    db::{
        account::{join_roles, Account, LoginHistoryEntry, Role, ACCOUNT_COLUMNS},
        bounded,
    },
    error::{IdentityError, IdentityResult},
    lockout::AccountLockout,
    mailer::Notifier,
    metrics,
    rate_limit::{AuthRateLimiter, Scope},
    sessions::{ClientInfo, SessionStore},
    tokens::TokenKind,
    trial::{self, TrialEvent, TrialPolicy, TrialState},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Newest login history rows kept per account
pub const LOGIN_HISTORY_LIMIT: i64 = 100;

const MAX_ROLE_SWITCH_ATTEMPTS: usize = 8;

const INVALID_CREDENTIALS: &str = "Invalid credentials";
const RESET_REQUESTED: &str =
    "If an account exists for that email, a password reset link has been sent";

/// Account manager service
pub struct AccountManager {
    db: SqlitePool,
    hasher: PasswordHasher,
    sessions: Arc<SessionStore>,
    lockout: Arc<AccountLockout>,
    rate_limiter: Arc<AuthRateLimiter>,
    notifier: Arc<dyn Notifier>,
    trial_policy: TrialPolicy,
    reset_token_ttl: Duration,
    clock: SharedClock,
    timeout: std::time::Duration,
}

impl AccountManager {
    /// Create a new account manager
    pub fn new(
        db: SqlitePool,
        config: &ServerConfig,
        clock: SharedClock,
        sessions: Arc<SessionStore>,
        lockout: Arc<AccountLockout>,
        rate_limiter: Arc<AuthRateLimiter>,
        notifier: Arc<dyn Notifier>,
    ) -> IdentityResult<Self> {
        Ok(Self {
            db,
            hasher: PasswordHasher::new(config.authentication.hash_cost)?,
            sessions,
            lockout,
            rate_limiter,
            notifier,
            trial_policy: TrialPolicy::from_config(&config.trial),
            reset_token_ttl: to_chrono(config.authentication.reset_token_ttl),
            clock,
            timeout: config.storage.timeout,
        })
    }

    /// Create an account and sign it in
    pub async fn signup(&self, request: SignupRequest, client: &ClientInfo) -> IdentityResult<AuthResponse> {
        self.rate_limiter
            .enforce(Scope::SignupIp, &client.ip_address)
            .await?;

        validate_request(&request)?;

        let email = normalize_email(&request.email);
        let name = request.name.trim().to_string();
        let phone = request
            .phone
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        credentials::check_new_password(&request.password, &email, &name)?;

        let role = match request.role.as_deref() {
            Some(raw) => parse_selectable_role(raw)?,
            None => Role::Buyer,
        };

        if self.email_exists(&email).await? {
            return Err(IdentityError::Validation("Email is already registered".to_string()));
        }
        if let Some(phone) = &phone {
            if self.phone_exists(phone).await? {
                return Err(IdentityError::Validation(
                    "Phone number is already registered".to_string(),
                ));
            }
        }

        let password_hash = self.hasher.hash(&request.password).await?;

        let now = self.clock.now();
        let trial = if role.is_trial_eligible() {
            trial::transition(None, TrialEvent::Adopt, now, &self.trial_policy).ok()
        } else {
            None
        };
        let listings_quota = trial
            .map(|t| t.listings_quota)
            .unwrap_or(self.trial_policy.free_listings_quota);

        let id = Uuid::new_v4().to_string();
        bounded(self.timeout, "account insert", async {
            sqlx::query(
                "INSERT INTO account (id, email, phone, name, password_hash, role, available_roles,
                                      active_role, primary_role, password_changed_at, listings_quota,
                                      trial_start, trial_end, trial_listings_quota, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6, ?6, ?8, ?9, ?10, ?11, ?12, ?8)",
            )
            .bind(&id)
            .bind(&email)
            .bind(&phone)
            .bind(&name)
            .bind(&password_hash)
            .bind(role.as_str())
            .bind(join_roles(&[role]))
            .bind(now)
            .bind(listings_quota)
            .bind(trial.map(|t| t.start))
            .bind(trial.map(|t| t.end))
            .bind(trial.map(|t| t.listings_quota))
            .execute(&self.db)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    IdentityError::Validation("Email or phone is already registered".to_string())
                }
                _ => IdentityError::Database(e),
            })?;
            Ok(())
        })
        .await?;

        info!(account_id = %id, role = %role, "Account created");
        metrics::record_account_creation(role.as_str());
        if trial.is_some() {
            metrics::record_trial_transition("started");
        }

        let account = self.get_account(&id).await?;
        let pair = self.sessions.issue(&id, client).await?;
        Ok(AuthResponse::new(pair, &account))
    }

    /// Password login by email or phone
    pub async fn login(&self, request: LoginRequest, client: &ClientInfo) -> IdentityResult<AuthResponse> {
        let identifier = login_identifier(&request)?;

        self.rate_limiter
            .enforce(Scope::LoginIp, &client.ip_address)
            .await?;
        self.rate_limiter
            .enforce(Scope::LoginAccount, &identifier.key())
            .await?;

        validate_request(&request)?;

        let Some(account) = self.find_by_identifier(&identifier).await? else {
            self.hasher.dummy_verify(&request.password).await;
            debug!("Login for unknown account");
            metrics::record_login("unknown_account");
            return Err(invalid_credentials());
        };

        if let Err(e) = self.lockout.check(&account).await {
            if matches!(e, IdentityError::Locked { .. }) {
                self.record_login(&account.id, false, client, Some("locked")).await?;
                metrics::record_login("locked");
            }
            return Err(e);
        }

        let Some(password_hash) = account.password_hash.as_deref() else {
            self.hasher.dummy_verify(&request.password).await;
            self.record_login(&account.id, false, client, Some("no_password")).await?;
            metrics::record_login("no_password");
            return Err(invalid_credentials());
        };

        if !self.hasher.verify(&request.password, password_hash).await? {
            let state = self.lockout.record_failure(&account.id).await?;
            self.record_login(&account.id, false, client, Some("invalid_password")).await?;
            metrics::record_login("invalid_password");
            debug!(account_id = %account.id, failed_count = state.failed_count, "Failed login");
            return Err(invalid_credentials());
        }

        if let Err(e) = self.lockout.reset(&account.id).await {
            if matches!(e, IdentityError::Locked { .. }) {
                self.record_login(&account.id, false, client, Some("locked")).await?;
                metrics::record_login("locked");
            }
            return Err(e);
        }
        self.rate_limiter
            .reset(Scope::LoginAccount, &identifier.key())
            .await?;
        self.record_login(&account.id, true, client, None).await?;
        metrics::record_login("success");

        let pair = self.sessions.issue(&account.id, client).await?;
        info!(account_id = %account.id, "Login succeeded");

        let account = self.get_account(&account.id).await?;
        Ok(AuthResponse::new(pair, &account))
    }

    /// Exchange a refresh token for a new pair
    pub async fn refresh(&self, request: RefreshRequest, client: &ClientInfo) -> IdentityResult<TokensResponse> {
        validate_request(&request)?;
        let pair = self.sessions.rotate(&request.refresh_token, client).await?;
        Ok(pair.into())
    }

    /// End one session. Always succeeds from the caller's point of view.
    pub async fn logout(&self, request: LogoutRequest) -> MessageResponse {
        if let Some(token) = request.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            match self.sessions.revoke_token(token).await {
                Ok(true) => debug!("Session revoked on logout"),
                Ok(false) => debug!("Logout for unknown session"),
                Err(e) => debug!("Logout token ignored: {}", e),
            }
        }
        MessageResponse::new("Logged out")
    }

    /// End every session for the account
    pub async fn logout_all(&self, account_id: &str) -> IdentityResult<MessageResponse> {
        let removed = self.sessions.revoke_all(account_id).await?;
        info!(account_id, removed, "Logged out of all sessions");
        Ok(MessageResponse::new(format!("Logged out of {} sessions", removed)))
    }

    pub async fn sessions(&self, account_id: &str) -> IdentityResult<SessionsResponse> {
        Ok(SessionsResponse {
            sessions: self.sessions.list_active(account_id).await?,
        })
    }

    /// Change password with the current one; signs out everywhere
    pub async fn change_password(
        &self,
        account_id: &str,
        request: ChangePasswordRequest,
    ) -> IdentityResult<MessageResponse> {
        validate_request(&request)?;
        let account = self.get_account(account_id).await?;

        let current_ok = match account.password_hash.as_deref() {
            Some(hash) => self.hasher.verify(&request.current_password, hash).await?,
            None => false,
        };
        if !current_ok {
            return Err(IdentityError::Authentication(
                "Current password is incorrect".to_string(),
            ));
        }

        if request.new_password == request.current_password {
            return Err(IdentityError::Validation(
                "New password must differ from the current password".to_string(),
            ));
        }
        credentials::check_new_password(&request.new_password, &account.email, &account.name)?;

        let password_hash = self.hasher.hash(&request.new_password).await?;
        let now = self.clock.now();
        bounded(self.timeout, "password update", async {
            sqlx::query("UPDATE account SET password_hash = ?1, password_changed_at = ?2 WHERE id = ?3")
                .bind(&password_hash)
                .bind(now)
                .bind(account_id)
                .execute(&self.db)
                .await?;
            Ok(())
        })
        .await?;

        let removed = self.sessions.revoke_all(account_id).await?;
        info!(account_id, removed, "Password changed, sessions revoked");
        Ok(MessageResponse::new(
            "Password changed. Please sign in again on your other devices",
        ))
    }

    /// Email a single-use reset token. Answers the same whether or not the
    /// account exists.
    pub async fn request_password_reset(
        &self,
        request: RequestPasswordResetRequest,
        client: &ClientInfo,
    ) -> IdentityResult<MessageResponse> {
        let email = normalize_email(&request.email);

        self.rate_limiter
            .enforce(Scope::ResetIp, &client.ip_address)
            .await?;
        self.rate_limiter.enforce(Scope::ResetAccount, &email).await?;

        validate_request(&request)?;

        let Some(account) = self.find_by_identifier(&Identifier::Email(email)).await? else {
            debug!("Password reset requested for unknown email");
            return Ok(MessageResponse::new(RESET_REQUESTED));
        };

        let raw = random_token();
        let now = self.clock.now();
        let expires_at = now + self.reset_token_ttl;

        bounded(self.timeout, "reset token insert", async {
            let mut tx = self.db.begin().await?;
            sqlx::query(
                "UPDATE password_reset_token SET used_at = ?1
                 WHERE account_id = ?2 AND used_at IS NULL",
            )
            .bind(now)
            .bind(&account.id)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO password_reset_token (token_hash, account_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(sha256_hex(&raw))
            .bind(&account.id)
            .bind(now)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        if let Err(e) = self
            .notifier
            .password_reset(&account.email, &account.name, &raw)
            .await
        {
            warn!(account_id = %account.id, "Password reset delivery failed: {}", e);
        }
        info!(account_id = %account.id, "Password reset token issued");

        Ok(MessageResponse::new(RESET_REQUESTED))
    }

    /// Redeem a reset token, set the new password and sign in fresh
    pub async fn reset_password(
        &self,
        request: ResetPasswordRequest,
        client: &ClientInfo,
    ) -> IdentityResult<AuthResponse> {
        validate_request(&request)?;

        let token_hash = sha256_hex(&request.token);
        let now = self.clock.now();

        let found: Option<(String, DateTime<Utc>, Option<DateTime<Utc>>)> =
            bounded(self.timeout, "reset token lookup", async {
                let row = sqlx::query_as(
                    "SELECT account_id, expires_at, used_at FROM password_reset_token WHERE token_hash = ?1",
                )
                .bind(&token_hash)
                .fetch_optional(&self.db)
                .await?;
                Ok(row)
            })
            .await?;

        let account_id = match found {
            Some((account_id, expires_at, None)) if expires_at > now => account_id,
            _ => return Err(invalid_reset_token()),
        };

        let account = self.get_account(&account_id).await?;
        credentials::check_new_password(&request.new_password, &account.email, &account.name)?;
        let password_hash = self.hasher.hash(&request.new_password).await?;

        bounded(self.timeout, "password reset", async {
            let mut tx = self.db.begin().await?;

            let claimed = sqlx::query(
                "UPDATE password_reset_token SET used_at = ?1
                 WHERE token_hash = ?2 AND used_at IS NULL",
            )
            .bind(now)
            .bind(&token_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if claimed != 1 {
                return Err(invalid_reset_token());
            }

            sqlx::query(
                "UPDATE account SET password_hash = ?1, password_changed_at = ?2,
                        failed_login_count = 0, lock_until = NULL
                 WHERE id = ?3",
            )
            .bind(&password_hash)
            .bind(now)
            .bind(&account_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM refresh_session WHERE account_id = ?1")
                .bind(&account_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;

        info!(account_id = %account_id, "Password reset, sessions revoked");

        let pair = self.sessions.issue(&account_id, client).await?;
        let account = self.get_account(&account_id).await?;
        Ok(AuthResponse::new(pair, &account))
    }

    /// Switch the active role. Taking on the trial role starts a fresh trial
    /// unless one is already running.
    pub async fn switch_role(&self, account_id: &str, request: SwitchRoleRequest) -> IdentityResult<UserView> {
        validate_request(&request)?;
        let role = parse_selectable_role(&request.role)?;

        for _ in 0..MAX_ROLE_SWITCH_ATTEMPTS {
            let account = self.get_account(account_id).await?;
            if self.apply_role_switch(&account, role).await? {
                let account = self.get_account(account_id).await?;
                return Ok(UserView::from(&account));
            }
            debug!(account_id, "Role switch raced with another account update, retrying");
        }

        Err(IdentityError::Conflict(
            "Account changed during role switch, try again".to_string(),
        ))
    }

    /// Write a role switch computed from `account`. Returns false without
    /// writing when the stored role, quota or trial no longer match it.
    ///
    /// Trial columns are only written when a fresh trial is adopted, so the
    /// scheduler's reminder and expiry flags are never rolled back.
    async fn apply_role_switch(&self, account: &Account, role: Role) -> IdentityResult<bool> {
        let now = self.clock.now();

        let fresh_trial = if role.is_trial_eligible()
            && matches!(
                trial::state_of(account.trial.as_ref()),
                TrialState::NoTrial | TrialState::Expired
            ) {
            Some(
                trial::transition(account.trial.as_ref(), TrialEvent::Adopt, now, &self.trial_policy)
                    .map_err(|e| IdentityError::Internal(e.to_string()))?,
            )
        } else {
            None
        };

        let mut available_roles = account.available_roles.clone();
        if !available_roles.contains(&role) {
            available_roles.push(role);
        }
        let primary_role = account.primary_role.unwrap_or(role);

        let seen_end = account.trial.map(|t| t.end);
        let seen_reminder = account.trial.map_or(false, |t| t.reminder_sent);
        let seen_expired = account.trial.map_or(false, |t| t.expired);

        let updated = bounded(self.timeout, "role update", async {
            let result = match fresh_trial {
                Some(fresh) => {
                    sqlx::query(
                        "UPDATE account SET role = ?1, available_roles = ?2, active_role = ?1,
                                primary_role = ?3, listings_quota = ?4, trial_start = ?5,
                                trial_end = ?6, trial_reminder_sent = 0, trial_expired = 0,
                                trial_listings_quota = ?7
                         WHERE id = ?8 AND role = ?9 AND listings_quota = ?10
                           AND trial_end IS ?11 AND trial_reminder_sent = ?12 AND trial_expired = ?13",
                    )
                    .bind(role.as_str())
                    .bind(join_roles(&available_roles))
                    .bind(primary_role.as_str())
                    .bind(fresh.listings_quota)
                    .bind(fresh.start)
                    .bind(fresh.end)
                    .bind(fresh.listings_quota)
                    .bind(&account.id)
                    .bind(account.role.as_str())
                    .bind(account.listings_quota)
                    .bind(seen_end)
                    .bind(seen_reminder)
                    .bind(seen_expired)
                    .execute(&self.db)
                    .await?
                }
                None => {
                    sqlx::query(
                        "UPDATE account SET role = ?1, available_roles = ?2, active_role = ?1,
                                primary_role = ?3
                         WHERE id = ?4 AND role = ?5 AND listings_quota = ?6
                           AND trial_end IS ?7 AND trial_reminder_sent = ?8 AND trial_expired = ?9",
                    )
                    .bind(role.as_str())
                    .bind(join_roles(&available_roles))
                    .bind(primary_role.as_str())
                    .bind(&account.id)
                    .bind(account.role.as_str())
                    .bind(account.listings_quota)
                    .bind(seen_end)
                    .bind(seen_reminder)
                    .bind(seen_expired)
                    .execute(&self.db)
                    .await?
                }
            };
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Ok(false);
        }

        if fresh_trial.is_some() {
            metrics::record_trial_transition("started");
            info!(account_id = %account.id, "Trial started on role switch");
        }
        Ok(true)
    }

    /// Newest-first login attempts
    pub async fn login_history(&self, account_id: &str) -> IdentityResult<LoginHistoryResponse> {
        let entries = bounded(self.timeout, "login history", async {
            let entries = sqlx::query_as::<_, LoginHistoryEntry>(
                "SELECT at, success, ip_address, user_agent, failure_reason
                 FROM login_history WHERE account_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .bind(account_id)
            .bind(LOGIN_HISTORY_LIMIT)
            .fetch_all(&self.db)
            .await?;
            Ok(entries)
        })
        .await?;

        Ok(LoginHistoryResponse { entries })
    }

    /// Get account by id
    pub async fn get_account(&self, account_id: &str) -> IdentityResult<Account> {
        bounded(self.timeout, "account lookup", async {
            let account = sqlx::query_as::<_, Account>(&format!(
                "SELECT {} FROM account WHERE id = ?1",
                ACCOUNT_COLUMNS
            ))
            .bind(account_id)
            .fetch_optional(&self.db)
            .await?;
            account.ok_or_else(|| IdentityError::NotFound("Account not found".to_string()))
        })
        .await
    }

    /// Resolve a bearer access token to its account. Tokens minted before
    /// the last password change are refused.
    pub async fn validate_access_token(&self, token: &str) -> IdentityResult<Account> {
        let claims = self.sessions.signer().verify(token, TokenKind::Access)?;

        let account = match self.get_account(&claims.sub).await {
            Ok(account) => account,
            Err(IdentityError::NotFound(_)) => {
                return Err(IdentityError::Authentication("Invalid token".to_string()))
            }
            Err(e) => return Err(e),
        };

        if claims.iat < account.password_changed_at.timestamp() {
            return Err(IdentityError::Authentication(
                "Token was issued before the last password change".to_string(),
            ));
        }

        Ok(account)
    }

    async fn find_by_identifier(&self, identifier: &Identifier) -> IdentityResult<Option<Account>> {
        let (column, value) = match identifier {
            Identifier::Email(email) => ("email", email.as_str()),
            Identifier::Phone(phone) => ("phone", phone.as_str()),
        };

        bounded(self.timeout, "account lookup", async {
            let account = sqlx::query_as::<_, Account>(&format!(
                "SELECT {} FROM account WHERE {} = ?1",
                ACCOUNT_COLUMNS, column
            ))
            .bind(value)
            .fetch_optional(&self.db)
            .await?;
            Ok(account)
        })
        .await
    }

    async fn email_exists(&self, email: &str) -> IdentityResult<bool> {
        Ok(self
            .find_by_identifier(&Identifier::Email(email.to_string()))
            .await?
            .is_some())
    }

    async fn phone_exists(&self, phone: &str) -> IdentityResult<bool> {
        Ok(self
            .find_by_identifier(&Identifier::Phone(phone.to_string()))
            .await?
            .is_some())
    }

    /// Append to the account's login history, dropping rows past the limit
    async fn record_login(
        &self,
        account_id: &str,
        success: bool,
        client: &ClientInfo,
        failure_reason: Option<&str>,
    ) -> IdentityResult<()> {
        let now = self.clock.now();
        bounded(self.timeout, "login history insert", async {
            let mut tx = self.db.begin().await?;
            sqlx::query(
                "INSERT INTO login_history (account_id, at, success, ip_address, user_agent, failure_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(account_id)
            .bind(now)
            .bind(success)
            .bind(&client.ip_address)
            .bind(&client.user_agent)
            .bind(failure_reason)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "DELETE FROM login_history
                 WHERE account_id = ?1 AND id NOT IN (
                     SELECT id FROM login_history WHERE account_id = ?1
                     ORDER BY id DESC LIMIT ?2
                 )",
            )
            .bind(account_id)
            .bind(LOGIN_HISTORY_LIMIT)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }
}

enum Identifier {
    Email(String),
    Phone(String),
}

impl Identifier {
    /// Account-scoped rate limit key
    fn key(&self) -> String {
        match self {
            Identifier::Email(email) => email.clone(),
            Identifier::Phone(phone) => phone.clone(),
        }
    }
}

fn login_identifier(request: &LoginRequest) -> IdentityResult<Identifier> {
    let email = request.email.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let phone = request.phone.as_deref().map(str::trim).filter(|s| !s.is_empty());

    match (email, phone) {
        (Some(email), _) => Ok(Identifier::Email(normalize_email(email))),
        (None, Some(phone)) => Ok(Identifier::Phone(phone.to_string())),
        (None, None) => Err(IdentityError::Validation(
            "Email or phone is required".to_string(),
        )),
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn parse_selectable_role(raw: &str) -> IdentityResult<Role> {
    let role = Role::from_str(raw).map_err(IdentityError::Validation)?;
    if !role.is_self_selectable() {
        return Err(IdentityError::Validation(format!(
            "Role {} cannot be self-selected",
            role
        )));
    }
    Ok(role)
}

fn invalid_credentials() -> IdentityError {
    IdentityError::Authentication(INVALID_CREDENTIALS.to_string())
}

fn invalid_reset_token() -> IdentityError {
    IdentityError::Validation("Invalid or expired reset token".to_string())
}
