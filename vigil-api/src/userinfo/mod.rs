//! User Info Retrieval
//!
//! The read path for user information. Lookups by `(user, account)` go
//! through a shared TTL/LRU cache and fall back to one join query. The
//! change subscriber in [`subscriber`] keeps cached entries in step with
//! job changes reported by the poller.

pub mod subscriber;
pub mod superuser;

pub use subscriber::{handle_change_message, run_change_subscriber};
pub use superuser::SuperuserPolicy;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use vigil_cache::{CacheConfig, TtlLruCache};
use vigil_core::{AccountId, JobGrade, UserAccountKey, UserId, UserInfo, UserInfoChanged};

use crate::config::UserInfoConfig;
use crate::db::{UserOverrides, UserStore};
use crate::error::ApiResult;
use crate::telemetry::metrics::with_metrics;

/// Cache shared by every reader of user info.
pub type UserInfoCache = TtlLruCache<UserAccountKey, UserInfo>;

/// Cached user info lookups with superuser resolution.
pub struct UserInfoRetriever {
    store: Arc<dyn UserStore>,
    cache: Arc<UserInfoCache>,
    policy: SuperuserPolicy,
    ttl: Duration,
}

impl UserInfoRetriever {
    /// Build a retriever with its own cache sized by `cache_config`.
    pub fn new(
        store: Arc<dyn UserStore>,
        config: &UserInfoConfig,
        cache_config: &CacheConfig,
    ) -> ApiResult<Self> {
        let cache = Arc::new(TtlLruCache::from_config(cache_config)?);
        Ok(Self::with_cache(store, cache, config))
    }

    /// Build a retriever around an existing cache.
    pub fn with_cache(
        store: Arc<dyn UserStore>,
        cache: Arc<UserInfoCache>,
        config: &UserInfoConfig,
    ) -> Self {
        Self {
            store,
            cache,
            policy: SuperuserPolicy::new(
                config.superuser_groups.iter().cloned(),
                config.superuser_users.iter().cloned(),
            ),
            ttl: config.cache_ttl,
        }
    }

    pub fn cache(&self) -> &Arc<UserInfoCache> {
        &self.cache
    }

    pub fn policy(&self) -> &SuperuserPolicy {
        &self.policy
    }

    /// Look up a user of an account, from cache when possible.
    ///
    /// Unknown users are not cached.
    pub async fn get_user_info(
        &self,
        user_id: UserId,
        account_id: AccountId,
    ) -> ApiResult<Option<UserInfo>> {
        let key = UserAccountKey::new(user_id, account_id);
        if let Some(info) = self.cache.get(&key) {
            with_metrics(|m| m.record_cache_lookup(true));
            trace!(key = %key, "User info cache hit");
            return Ok(Some(info));
        }
        with_metrics(|m| m.record_cache_lookup(false));

        let Some(row) = self.store.get_user_info(user_id, account_id).await? else {
            debug!(key = %key, "User info not found");
            return Ok(None);
        };

        let info = self.policy.resolve(row);
        self.cache.put(key, info.clone(), self.ttl);
        Ok(Some(info))
    }

    /// Look up a user without knowing the account. Never cached.
    pub async fn get_user_info_without_account_id(
        &self,
        user_id: UserId,
    ) -> ApiResult<Option<UserInfo>> {
        let row = self.store.get_user_info_without_account(user_id).await?;
        Ok(row.map(|row| self.policy.resolve(row)))
    }

    /// Persist superuser state for an account.
    ///
    /// Cached entries are left alone and pick the change up on expiry.
    pub async fn set_user_info(
        &self,
        account_id: AccountId,
        superuser: bool,
        job: Option<String>,
        job_grade: Option<JobGrade>,
    ) -> ApiResult<()> {
        let overrides = UserOverrides {
            superuser,
            job,
            job_grade,
        };
        self.store.set_user_overrides(account_id, &overrides).await?;
        debug!(account_id, superuser, "Stored user overrides");
        Ok(())
    }

    /// Apply a change event to the cached entry, if there is one.
    ///
    /// Returns whether an entry was updated. The entry gets a fresh TTL.
    /// An active superuser override job keeps precedence over the stored
    /// job; only a missing override grade falls back to the new grade.
    pub fn apply_change(&self, event: &UserInfoChanged) -> bool {
        let key = UserAccountKey::new(event.user_id, event.account_id);
        let Some(mut info) = self.cache.get(&key) else {
            return false;
        };

        if info.superuser && info.override_job.is_some() {
            info.job_grade = info.override_job_grade.unwrap_or(event.new_job_grade);
        } else {
            info.job = event.new_job.clone();
            info.job_grade = event.new_job_grade;
        }
        self.cache.put(key, info, self.ttl);
        true
    }
}
