/// Refresh session storage
///
/// A session is one outstanding refresh token, stored as its SHA-256 digest
/// with the device it was issued to. Issuance and rotation each run in a
/// single transaction so a pair is only handed out once its session exists.
use crate::{
    clock::SharedClock,
    crypto::sha256_hex,
    db::bounded,
    error::{IdentityError, IdentityResult},
    metrics,
    tokens::{TokenKind, TokenPair, TokenSigner},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a request came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

/// Session as shown to its owner
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    #[serde(skip)]
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
}

pub struct SessionStore {
    db: SqlitePool,
    signer: Arc<TokenSigner>,
    clock: SharedClock,
    max_sessions: u32,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(
        db: SqlitePool,
        signer: Arc<TokenSigner>,
        clock: SharedClock,
        max_sessions: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            signer,
            clock,
            max_sessions: max_sessions.max(1),
            timeout,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Mint a token pair and record its refresh session
    pub async fn issue(&self, account_id: &str, client: &ClientInfo) -> IdentityResult<TokenPair> {
        let pair = bounded(self.timeout, "session issue", async {
            let mut tx = self.db.begin().await?;
            let pair = self.persist_new(&mut tx, account_id, client).await?;
            tx.commit().await?;
            Ok(pair)
        })
        .await?;

        metrics::record_session("issued");
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// consumed in the same transaction, so a replay finds nothing.
    pub async fn rotate(&self, raw_refresh: &str, client: &ClientInfo) -> IdentityResult<TokenPair> {
        let claims = self.signer.decode(raw_refresh, TokenKind::Refresh)?;
        let token_hash = sha256_hex(raw_refresh);

        let pair = bounded(self.timeout, "session rotate", async {
            let mut tx = self.db.begin().await?;

            let consumed: Option<(String, DateTime<Utc>)> = sqlx::query_as(
                "DELETE FROM refresh_session WHERE token_hash = ?1 RETURNING account_id, expires_at",
            )
            .bind(&token_hash)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((account_id, expires_at)) = consumed else {
                debug!("Refresh token not found, possibly replayed");
                return Err(IdentityError::Authentication("Invalid refresh token".to_string()));
            };

            if account_id != claims.sub {
                // Leave the session in place; this token does not own it
                return Err(IdentityError::Authentication("Invalid refresh token".to_string()));
            }

            if expires_at <= self.clock.now() {
                tx.commit().await?;
                return Err(IdentityError::Authentication(
                    "Refresh token has expired".to_string(),
                ));
            }

            let pair = self.persist_new(&mut tx, &account_id, client).await?;
            tx.commit().await?;
            Ok(pair)
        })
        .await?;

        metrics::record_session("rotated");
        Ok(pair)
    }

    /// Remove one session. Returns whether it existed.
    pub async fn revoke(&self, account_id: &str, raw_refresh: &str) -> IdentityResult<bool> {
        let token_hash = sha256_hex(raw_refresh);
        let removed = bounded(self.timeout, "session revoke", async {
            let result =
                sqlx::query("DELETE FROM refresh_session WHERE token_hash = ?1 AND account_id = ?2")
                    .bind(&token_hash)
                    .bind(account_id)
                    .execute(&self.db)
                    .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if removed > 0 {
            metrics::record_session("revoked");
        }
        Ok(removed > 0)
    }

    /// Remove a session by token alone, for logout without a bearer token
    pub async fn revoke_token(&self, raw_refresh: &str) -> IdentityResult<bool> {
        let claims = self.signer.decode(raw_refresh, TokenKind::Refresh)?;
        self.revoke(&claims.sub, raw_refresh).await
    }

    /// Remove every session for the account
    pub async fn revoke_all(&self, account_id: &str) -> IdentityResult<u64> {
        let removed = bounded(self.timeout, "session revoke all", async {
            let result = sqlx::query("DELETE FROM refresh_session WHERE account_id = ?1")
                .bind(account_id)
                .execute(&self.db)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        debug!(account_id, removed, "Revoked all sessions");
        Ok(removed)
    }

    /// Unexpired sessions, newest first. Expired rows are left for the sweep.
    pub async fn list_active(&self, account_id: &str) -> IdentityResult<Vec<ActiveSession>> {
        let now = self.clock.now();
        bounded(self.timeout, "session list", async {
            let sessions = sqlx::query_as::<_, ActiveSession>(
                "SELECT id, created_at, expires_at, device_info, ip_address
                 FROM refresh_session
                 WHERE account_id = ?1 AND expires_at > ?2
                 ORDER BY created_at DESC, id DESC",
            )
            .bind(account_id)
            .bind(now)
            .fetch_all(&self.db)
            .await?;
            Ok(sessions)
        })
        .await
    }

    /// Delete expired sessions across all accounts
    pub async fn sweep_expired(&self) -> IdentityResult<u64> {
        let now = self.clock.now();
        let removed = bounded(self.timeout, "session sweep", async {
            let result = sqlx::query("DELETE FROM refresh_session WHERE expires_at <= ?1")
                .bind(now)
                .execute(&self.db)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if removed > 0 {
            metrics::record_sessions_purged(removed);
        }
        Ok(removed)
    }

    /// Insert a fresh session and trim the account to its newest sessions
    async fn persist_new(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        account_id: &str,
        client: &ClientInfo,
    ) -> IdentityResult<TokenPair> {
        let pair = self.signer.issue_pair(account_id)?;

        sqlx::query(
            "INSERT INTO refresh_session (account_id, token_hash, created_at, expires_at, device_info, ip_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(account_id)
        .bind(sha256_hex(&pair.refresh_token))
        .bind(pair.issued_at)
        .bind(pair.refresh_expires_at)
        .bind(&client.user_agent)
        .bind(&client.ip_address)
        .execute(&mut **tx)
        .await?;

        let evicted = sqlx::query(
            "DELETE FROM refresh_session
             WHERE account_id = ?1 AND id NOT IN (
                 SELECT id FROM refresh_session
                 WHERE account_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2
             )",
        )
        .bind(account_id)
        .bind(i64::from(self.max_sessions))
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if evicted > 0 {
            debug!(account_id, evicted, "Evicted oldest sessions over the cap");
        }

        Ok(pair)
    }
}
