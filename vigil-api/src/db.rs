//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling using deadpool-postgres, and the two store
//! seams the service reads through: [`UserStore`] for user and account state
//! and [`NotificationStore`] for unread counts and mailbox access.
//!
//! Table names are never global. Every query is built from an explicit
//! [`UserTables`] handle whose identifiers are validated once at construction.

use crate::constants::{DEFAULT_DB_POOL_SIZE, DEFAULT_DB_TIMEOUT_SECS};
use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::time::Duration;
use tokio_postgres::{NoTls, Row};
use tracing::warn;
use vigil_core::{
    AccountId, ConfigError, JobGrade, PollRequest, StoreError, UserId, UserInfo, UserStateRow,
};

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Connection timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "vigil".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: DEFAULT_DB_POOL_SIZE,
            timeout: Duration::from_secs(DEFAULT_DB_TIMEOUT_SECS),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("VIGIL_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("VIGIL_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("VIGIL_DB_NAME").unwrap_or_else(|_| "vigil".to_string()),
            user: std::env::var("VIGIL_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("VIGIL_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("VIGIL_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DB_POOL_SIZE),
            timeout: Duration::from_secs(
                std::env::var("VIGIL_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_DB_TIMEOUT_SECS),
            ),
        }
    }

    /// Create a connection pool from this configuration.
    ///
    /// Connections are opened lazily, so this succeeds without a reachable
    /// database.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_config.timeouts.wait = Some(self.timeout);
        pool_config.timeouts.create = Some(self.timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))?;

        Ok(pool)
    }
}

// ============================================================================
// SCHEMA HANDLES
// ============================================================================

/// Names of the tables the stores query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTables {
    /// Characters: `id, account_id, job, job_grade`
    pub users: String,
    /// Accounts: `id, enabled, license, group_name, last_char, superuser,
    /// override_job, override_job_grade`
    pub accounts: String,
    /// Notifications: `id, user_id, read_at`
    pub notifications: String,
    /// Mailbox grants: `mailbox_id, user_id, job, job_grade`
    pub mailbox_access: String,
}

impl Default for UserTables {
    fn default() -> Self {
        Self {
            users: "users".to_string(),
            accounts: "accounts".to_string(),
            notifications: "notifications".to_string(),
            mailbox_access: "mailbox_access".to_string(),
        }
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let first = parts.next().is_some_and(valid_part);
    let rest: Vec<&str> = parts.collect();
    first && rest.len() <= 1 && rest.into_iter().all(valid_part)
}

impl UserTables {
    /// Build handles with custom names, optionally schema-qualified.
    pub fn new(
        users: impl Into<String>,
        accounts: impl Into<String>,
        notifications: impl Into<String>,
        mailbox_access: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let tables = Self {
            users: users.into(),
            accounts: accounts.into(),
            notifications: notifications.into(),
            mailbox_access: mailbox_access.into(),
        };
        tables.validate()?;
        Ok(tables)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, name) in [
            ("users", &self.users),
            ("accounts", &self.accounts),
            ("notifications", &self.notifications),
            ("mailbox_access", &self.mailbox_access),
        ] {
            if !is_valid_identifier(name) {
                return Err(ConfigError::InvalidValue {
                    field: format!("tables.{}", field),
                    value: name.clone(),
                    reason: "not a plain SQL identifier".to_string(),
                });
            }
        }
        Ok(())
    }

    fn batch_states_query(&self) -> String {
        format!(
            "SELECT u.account_id, u.id, u.job, u.job_grade \
             FROM {users} u \
             JOIN unnest($1::bigint[], $2::int[]) AS req(account_id, user_id) \
               ON u.account_id = req.account_id AND u.id = req.user_id",
            users = self.users
        )
    }

    fn user_info_query(&self, with_account: bool) -> String {
        let filter = if with_account {
            "u.id = $1 AND u.account_id = $2"
        } else {
            "u.id = $1"
        };
        format!(
            "SELECT u.account_id, u.id, a.enabled, a.license, a.group_name, a.last_char, \
                    u.job, u.job_grade, a.superuser, a.override_job, a.override_job_grade \
             FROM {users} u \
             JOIN {accounts} a ON a.id = u.account_id \
             WHERE {filter} \
             LIMIT 1",
            users = self.users,
            accounts = self.accounts,
            filter = filter
        )
    }

    fn set_overrides_query(&self) -> String {
        format!(
            "UPDATE {accounts} SET superuser = $2, override_job = $3, override_job_grade = $4 \
             WHERE id = $1",
            accounts = self.accounts
        )
    }

    fn unread_count_query(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {notifications} WHERE user_id = $1 AND read_at IS NULL",
            notifications = self.notifications
        )
    }

    fn mailboxes_query(&self) -> String {
        format!(
            "SELECT DISTINCT mailbox_id FROM {access} \
             WHERE user_id = $1 \
                OR (job = $2 AND job_grade <= $3) \
             ORDER BY mailbox_id",
            access = self.mailbox_access
        )
    }
}

// ============================================================================
// ROW TYPES
// ============================================================================

/// Raw joined user/account row before superuser resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfoRow {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub enabled: bool,
    pub license: String,
    pub group: String,
    pub last_char_id: Option<UserId>,
    pub job: String,
    pub job_grade: JobGrade,
    /// Stored flag; only honoured when the account may be superuser.
    pub superuser: bool,
    pub override_job: Option<String>,
    pub override_job_grade: Option<JobGrade>,
}

impl UserInfoRow {
    /// Convert, masking the stored superuser flag with `can_be_superuser`.
    /// The override job and grade are carried over but not applied.
    pub fn into_user_info(self, can_be_superuser: bool) -> UserInfo {
        UserInfo {
            account_id: self.account_id,
            user_id: self.user_id,
            enabled: self.enabled,
            license: self.license,
            group: self.group,
            last_char_id: self.last_char_id,
            job: self.job,
            job_grade: self.job_grade,
            can_be_superuser,
            superuser: self.superuser && can_be_superuser,
            override_job: self.override_job,
            override_job_grade: self.override_job_grade,
        }
    }
}

/// Superuser state written back to the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOverrides {
    pub superuser: bool,
    pub job: Option<String>,
    pub job_grade: Option<JobGrade>,
}

// ============================================================================
// STORE TRAITS
// ============================================================================

/// User and account state.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// One combined lookup for a batch of poll requests.
    ///
    /// The outer error means the whole query failed. Inner errors are
    /// per-row decode failures; the remaining rows are still usable.
    async fn load_user_states(
        &self,
        requests: &[PollRequest],
    ) -> Result<Vec<Result<UserStateRow, StoreError>>, StoreError>;

    async fn get_user_info(
        &self,
        user_id: UserId,
        account_id: AccountId,
    ) -> Result<Option<UserInfoRow>, StoreError>;

    async fn get_user_info_without_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserInfoRow>, StoreError>;

    async fn set_user_overrides(
        &self,
        account_id: AccountId,
        overrides: &UserOverrides,
    ) -> Result<(), StoreError>;
}

/// Notification state used by stream sessions.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn unread_count(&self, user_id: UserId) -> Result<i64, StoreError>;

    /// Mailboxes the user can read, by direct grant or by job and grade.
    async fn accessible_mailboxes(&self, user: &UserInfo) -> Result<Vec<u64>, StoreError>;
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn column<'a, T>(row: &'a Row, table: &str, name: &str) -> Result<T, StoreError>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(name).map_err(|e| StoreError::InvalidRow {
        table: table.to_string(),
        column: name.to_string(),
        reason: e.to_string(),
    })
}

fn id_from_db(table: &str, column_name: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidRow {
        table: table.to_string(),
        column: column_name.to_string(),
        reason: format!("negative identifier {}", value),
    })
}

fn id_to_db(table: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::QueryFailed {
        table: table.to_string(),
        reason: format!("identifier {} out of range", value),
    })
}

fn decode_state_row(table: &str, row: &Row) -> Result<UserStateRow, StoreError> {
    Ok(UserStateRow {
        account_id: id_from_db(table, "account_id", column(row, table, "account_id")?)?,
        user_id: column(row, table, "id")?,
        job: column(row, table, "job")?,
        job_grade: column(row, table, "job_grade")?,
    })
}

fn decode_user_info_row(table: &str, row: &Row) -> Result<UserInfoRow, StoreError> {
    Ok(UserInfoRow {
        account_id: id_from_db(table, "account_id", column(row, table, "account_id")?)?,
        user_id: column(row, table, "id")?,
        enabled: column(row, table, "enabled")?,
        license: column(row, table, "license")?,
        group: column(row, table, "group_name")?,
        last_char_id: column(row, table, "last_char")?,
        job: column(row, table, "job")?,
        job_grade: column(row, table, "job_grade")?,
        superuser: column(row, table, "superuser")?,
        override_job: column(row, table, "override_job")?,
        override_job_grade: column(row, table, "override_job_grade")?,
    })
}

fn pool_error(e: deadpool_postgres::PoolError) -> StoreError {
    StoreError::Unavailable {
        reason: e.to_string(),
    }
}

fn query_error(table: &str, e: tokio_postgres::Error) -> StoreError {
    StoreError::QueryFailed {
        table: table.to_string(),
        reason: e.to_string(),
    }
}

// ============================================================================
// POSTGRES STORES
// ============================================================================

/// [`UserStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgUserStore {
    pool: Pool,
    tables: UserTables,
}

impl PgUserStore {
    pub fn new(pool: Pool, tables: UserTables) -> Self {
        Self { pool, tables }
    }

    async fn fetch_user_info(
        &self,
        user_id: UserId,
        account_id: Option<AccountId>,
    ) -> Result<Option<UserInfoRow>, StoreError> {
        let table = self.tables.users.as_str();
        let client = self.pool.get().await.map_err(pool_error)?;
        let sql = self.tables.user_info_query(account_id.is_some());

        let row = match account_id {
            Some(account_id) => {
                let account_id = id_to_db(table, account_id)?;
                client.query_opt(&sql, &[&user_id, &account_id]).await
            }
            None => client.query_opt(&sql, &[&user_id]).await,
        }
        .map_err(|e| query_error(table, e))?;

        row.map(|row| decode_user_info_row(table, &row)).transpose()
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn load_user_states(
        &self,
        requests: &[PollRequest],
    ) -> Result<Vec<Result<UserStateRow, StoreError>>, StoreError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.tables.users.as_str();
        let mut account_ids = Vec::with_capacity(requests.len());
        let mut user_ids = Vec::with_capacity(requests.len());
        for request in requests {
            match i64::try_from(request.account_id) {
                Ok(account_id) => {
                    account_ids.push(account_id);
                    user_ids.push(request.user_id);
                }
                Err(_) => warn!(
                    account_id = request.account_id,
                    user_id = request.user_id,
                    "Skipping poll request with out-of-range account id"
                ),
            }
        }

        let client = self.pool.get().await.map_err(pool_error)?;
        let rows = client
            .query(&self.tables.batch_states_query(), &[&account_ids, &user_ids])
            .await
            .map_err(|e| query_error(table, e))?;

        Ok(rows
            .iter()
            .map(|row| decode_state_row(table, row))
            .collect())
    }

    async fn get_user_info(
        &self,
        user_id: UserId,
        account_id: AccountId,
    ) -> Result<Option<UserInfoRow>, StoreError> {
        self.fetch_user_info(user_id, Some(account_id)).await
    }

    async fn get_user_info_without_account(
        &self,
        user_id: UserId,
    ) -> Result<Option<UserInfoRow>, StoreError> {
        self.fetch_user_info(user_id, None).await
    }

    async fn set_user_overrides(
        &self,
        account_id: AccountId,
        overrides: &UserOverrides,
    ) -> Result<(), StoreError> {
        let table = self.tables.accounts.as_str();
        let account_id = id_to_db(table, account_id)?;
        let client = self.pool.get().await.map_err(pool_error)?;

        let updated = client
            .execute(
                &self.tables.set_overrides_query(),
                &[
                    &account_id,
                    &overrides.superuser,
                    &overrides.job,
                    &overrides.job_grade,
                ],
            )
            .await
            .map_err(|e| StoreError::WriteFailed {
                table: table.to_string(),
                reason: e.to_string(),
            })?;

        if updated == 0 {
            return Err(StoreError::WriteFailed {
                table: table.to_string(),
                reason: format!("account {} not found", account_id),
            });
        }
        Ok(())
    }
}

/// [`NotificationStore`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: Pool,
    tables: UserTables,
}

impl PgNotificationStore {
    pub fn new(pool: Pool, tables: UserTables) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn unread_count(&self, user_id: UserId) -> Result<i64, StoreError> {
        let table = self.tables.notifications.as_str();
        let client = self.pool.get().await.map_err(pool_error)?;
        let row = client
            .query_one(&self.tables.unread_count_query(), &[&user_id])
            .await
            .map_err(|e| query_error(table, e))?;

        row.try_get::<_, i64>(0).map_err(|e| StoreError::InvalidRow {
            table: table.to_string(),
            column: "count".to_string(),
            reason: e.to_string(),
        })
    }

    async fn accessible_mailboxes(&self, user: &UserInfo) -> Result<Vec<u64>, StoreError> {
        let table = self.tables.mailbox_access.as_str();
        let client = self.pool.get().await.map_err(pool_error)?;
        let rows = client
            .query(
                &self.tables.mailboxes_query(),
                &[&user.user_id, &user.job, &user.job_grade],
            )
            .await
            .map_err(|e| query_error(table, e))?;

        rows.iter()
            .map(|row| id_from_db(table, "mailbox_id", column(row, table, "mailbox_id")?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_default() {
        let config = DbConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.dbname, "vigil");
        assert_eq!(config.max_size, DEFAULT_DB_POOL_SIZE);
    }

    #[test]
    fn test_create_pool_is_lazy() {
        let pool = DbConfig::default().create_pool();
        assert!(pool.is_ok());
    }

    #[test]
    fn test_table_identifiers_validated() {
        assert!(UserTables::default().validate().is_ok());
        assert!(UserTables::new("game.users", "game.accounts", "notes", "access").is_ok());
        assert!(UserTables::new("users; DROP TABLE x", "a", "n", "m").is_err());
        assert!(UserTables::new("a.b.c", "a", "n", "m").is_err());
        assert!(UserTables::new("1users", "a", "n", "m").is_err());
        assert!(UserTables::new("", "a", "n", "m").is_err());
    }

    #[test]
    fn test_queries_use_configured_tables() {
        let tables = UserTables::new("chars", "accts", "notes", "grants").unwrap_or_default();
        assert!(tables.batch_states_query().contains("FROM chars u"));
        assert!(tables.user_info_query(true).contains("JOIN accts a"));
        assert!(tables.user_info_query(true).contains("u.account_id = $2"));
        assert!(!tables.user_info_query(false).contains("$2"));
        assert!(tables.unread_count_query().contains("FROM notes"));
        assert!(tables.mailboxes_query().contains("FROM grants"));
        assert!(tables.set_overrides_query().starts_with("UPDATE accts"));
    }

    #[test]
    fn test_id_conversion() {
        assert_eq!(id_from_db("users", "account_id", 5).ok(), Some(5));
        assert!(matches!(
            id_from_db("users", "account_id", -1),
            Err(StoreError::InvalidRow { .. })
        ));
        assert!(id_to_db("users", u64::MAX).is_err());
    }

    #[test]
    fn test_row_conversion_masks_superuser() {
        let row = UserInfoRow {
            account_id: 1,
            user_id: 2,
            enabled: true,
            license: "lic".to_string(),
            group: "user".to_string(),
            last_char_id: Some(2),
            job: "police".to_string(),
            job_grade: 3,
            superuser: true,
            override_job: Some("ambulance".to_string()),
            override_job_grade: Some(1),
        };
        assert!(!row.clone().into_user_info(false).superuser);

        let info = row.into_user_info(true);
        assert!(info.superuser);
        assert_eq!((info.job.as_str(), info.job_grade), ("police", 3));
        assert_eq!(info.override_job.as_deref(), Some("ambulance"));
    }
}
