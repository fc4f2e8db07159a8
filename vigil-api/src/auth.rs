//! Session Token Authentication
//!
//! Streams are opened with a bearer session token (JWT, HS256 by default).
//! The token names the account and the character the session was opened
//! for. Time validation is done here against an injectable clock instead
//! of inside `jsonwebtoken`, which keeps tests deterministic.

use crate::constants::{
    DEFAULT_JWT_CLOCK_SKEW_SECS, DEFAULT_JWT_EXPIRATION_SECS, INSECURE_DEFAULT_JWT_SECRET,
    MIN_JWT_SECRET_LENGTH,
};
use crate::error::{ApiError, ApiResult};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vigil_core::{AccountId, ConfigError, UserId};

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Clock abstraction for token time validation.
pub trait JwtClock: Send + Sync {
    /// Current time as Unix epoch seconds.
    fn now_epoch_secs(&self) -> i64;
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl JwtClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl JwtClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}


// ============================================================================
// JWT SECRET (TYPE-SAFE)
// ============================================================================

/// JWT secret that never shows up in logs.
#[derive(Clone)]
pub struct JwtSecret(SecretString);

impl JwtSecret {
    /// Create a new JWT secret. Empty secrets are rejected.
    pub fn new(secret: String) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::MissingField {
                field: "jwt_secret".to_string(),
            });
        }
        Ok(Self(SecretString::new(secret.into())))
    }

    /// Expose the secret value (only for cryptographic operations).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub fn is_insecure_default(&self) -> bool {
        self.0.expose_secret() == INSECURE_DEFAULT_JWT_SECRET
    }
}

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtSecret([REDACTED, {} chars])", self.len())
    }
}

fn build_jwt_secret(secret_str: String) -> JwtSecret {
    let normalized = if secret_str.trim().is_empty() {
        INSECURE_DEFAULT_JWT_SECRET.to_string()
    } else {
        secret_str
    };

    match JwtSecret::new(normalized) {
        Ok(secret) => secret,
        Err(_) => JwtSecret(SecretString::new(INSECURE_DEFAULT_JWT_SECRET.into())),
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Secret used to sign and verify session tokens
    pub jwt_secret: JwtSecret,

    /// Signing algorithm (default: HS256)
    pub jwt_algorithm: Algorithm,

    /// Lifetime of generated tokens in seconds
    pub jwt_expiration_secs: i64,

    /// Clock skew tolerance in seconds
    pub jwt_clock_skew_secs: i64,

    /// Clock for time validation (injected for testing)
    pub clock: Arc<dyn JwtClock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &self.jwt_secret)
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("jwt_expiration_secs", &self.jwt_expiration_secs)
            .field("jwt_clock_skew_secs", &self.jwt_clock_skew_secs)
            .field("clock", &"<JwtClock>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: build_jwt_secret(INSECURE_DEFAULT_JWT_SECRET.to_string()),
            jwt_algorithm: Algorithm::HS256,
            jwt_expiration_secs: DEFAULT_JWT_EXPIRATION_SECS,
            jwt_clock_skew_secs: DEFAULT_JWT_CLOCK_SKEW_SECS,
            clock: Arc::new(SystemClock),
        }
    }
}

impl AuthConfig {
    /// Create authentication configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `VIGIL_JWT_SECRET`: Token signing secret
    /// - `VIGIL_JWT_EXPIRATION_SECS`: Token lifetime (default: 3600)
    /// - `VIGIL_JWT_CLOCK_SKEW_SECS`: Clock skew tolerance (default: 60)
    pub fn from_env() -> Self {
        let secret_str = std::env::var("VIGIL_JWT_SECRET")
            .unwrap_or_else(|_| INSECURE_DEFAULT_JWT_SECRET.to_string());

        Self {
            jwt_secret: build_jwt_secret(secret_str),
            jwt_algorithm: Algorithm::HS256,
            jwt_expiration_secs: std::env::var("VIGIL_JWT_EXPIRATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_JWT_EXPIRATION_SECS),
            jwt_clock_skew_secs: std::env::var("VIGIL_JWT_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_JWT_CLOCK_SKEW_SECS),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn JwtClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Refuse insecure secrets in production, warn about them elsewhere.
    pub fn validate_for_environment(&self, environment: &str) -> ApiResult<()> {
        let environment = environment.to_lowercase();
        let is_production = environment == "production" || environment == "prod";

        if self.jwt_secret.is_insecure_default() {
            if is_production {
                return Err(ApiError::invalid_config(format!(
                    "Cannot start in production with the default JWT secret. \
                     Set VIGIL_JWT_SECRET. VIGIL_ENVIRONMENT={}",
                    environment
                )));
            }
            tracing::warn!(
                "Using the default JWT secret. Set VIGIL_JWT_SECRET before deploying."
            );
        } else if self.jwt_secret.len() < MIN_JWT_SECRET_LENGTH {
            if is_production {
                return Err(ApiError::invalid_config(format!(
                    "JWT secret is too short for production use ({} chars), minimum is {}",
                    self.jwt_secret.len(),
                    MIN_JWT_SECRET_LENGTH
                )));
            }
            tracing::warn!(
                length = self.jwt_secret.len(),
                "JWT secret is shorter than recommended"
            );
        }

        Ok(())
    }
}

// ============================================================================
// SESSION CLAIMS
// ============================================================================

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject (account ID as a string)
    pub sub: String,

    /// Account the session belongs to
    pub account_id: AccountId,

    /// Character the session was opened for
    pub user_id: UserId,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl SessionClaims {
    pub fn new(
        account_id: AccountId,
        user_id: UserId,
        expiration_secs: i64,
        clock: &dyn JwtClock,
    ) -> Self {
        let now = clock.now_epoch_secs();
        Self {
            sub: account_id.to_string(),
            account_id,
            user_id,
            iat: now,
            exp: now + expiration_secs,
        }
    }

    pub fn is_expired(&self, clock: &dyn JwtClock) -> bool {
        self.exp < clock.now_epoch_secs()
    }

    /// Seconds until expiry, negative once expired.
    pub fn remaining_secs(&self, clock: &dyn JwtClock) -> i64 {
        self.exp - clock.now_epoch_secs()
    }

    /// Whether the token expires within `window_secs`.
    pub fn expires_within(&self, window_secs: i64, clock: &dyn JwtClock) -> bool {
        self.remaining_secs(clock) <= window_secs
    }
}

// ============================================================================
// TOKEN FUNCTIONS
// ============================================================================

fn validate_claim_times(now: i64, exp: i64, leeway_secs: i64) -> ApiResult<()> {
    if exp < now - leeway_secs {
        return Err(ApiError::token_expired());
    }
    Ok(())
}

/// Validate a session token and extract its claims.
///
/// Signature validation is delegated to `jsonwebtoken`; expiry is checked
/// against the configured clock with skew tolerance.
pub fn validate_session_token(config: &AuthConfig, token: &str) -> ApiResult<SessionClaims> {
    if token.is_empty() {
        return Err(ApiError::unauthorized("Missing session token"));
    }

    let decoding_key = DecodingKey::from_secret(config.jwt_secret.expose().as_bytes());

    let mut validation = Validation::new(config.jwt_algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims = std::collections::HashSet::from(["exp".to_string()]);

    let token_data =
        decode::<SessionClaims>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                ApiError::invalid_token("Token signature is invalid")
            }
            jsonwebtoken::errors::ErrorKind::InvalidToken => {
                ApiError::invalid_token("Token is invalid")
            }
            _ => ApiError::invalid_token(format!("Token validation failed: {}", e)),
        })?;

    let now = config.clock.now_epoch_secs();
    if now < 0 {
        tracing::error!(
            timestamp = now,
            "System clock returned pre-epoch time - server time is broken"
        );
        return Err(ApiError::internal_error("Server time configuration error"));
    }

    validate_claim_times(now, token_data.claims.exp, config.jwt_clock_skew_secs)?;
    Ok(token_data.claims)
}

/// Generate a session token for a character of an account.
pub fn generate_session_token(
    config: &AuthConfig,
    account_id: AccountId,
    user_id: UserId,
) -> ApiResult<String> {
    let claims = SessionClaims::new(
        account_id,
        user_id,
        config.jwt_expiration_secs,
        &*config.clock,
    );

    let encoding_key = EncodingKey::from_secret(config.jwt_secret.expose().as_bytes());
    let header = Header::new(config.jwt_algorithm);

    encode(&header, &claims, &encoding_key)
        .map_err(|e| ApiError::internal_error(format!("Failed to generate token: {}", e)))
}

/// Strip an optional `Bearer ` prefix from an authorization value.
pub fn extract_bearer(value: &str) -> ApiResult<&str> {
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .unwrap_or(trimmed)
        .trim();

    if token.is_empty() {
        Err(ApiError::unauthorized("Missing session token"))
    } else {
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn test_config() -> ApiResult<AuthConfig> {
        let mut config = AuthConfig::default();
        config.jwt_secret = JwtSecret::new("test_secret_for_session_tokens_32b".to_string())?;
        config.clock = Arc::new(test_clocks::valid());
        Ok(config)
    }

    #[test]
    fn test_token_round_trip() -> ApiResult<()> {
        let config = test_config()?;
        let token = generate_session_token(&config, 12, 7)?;
        let claims = validate_session_token(&config, &token)?;

        assert_eq!(claims.account_id, 12);
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.sub, "12");
        assert!(!claims.is_expired(&test_clocks::valid()));
        Ok(())
    }

    #[test]
    fn test_expired_token() -> ApiResult<()> {
        let mut config = test_config()?;
        let token = generate_session_token(&config, 1, 1)?;

        config.clock = Arc::new(test_clocks::future());
        let result = validate_session_token(&config, &token);
        assert!(matches!(result, Err(ref e) if e.code == ErrorCode::TokenExpired));
        Ok(())
    }

    #[test]
    fn test_clock_skew_tolerated() -> ApiResult<()> {
        let mut config = test_config()?;
        let token = generate_session_token(&config, 1, 1)?;

        let just_after_expiry = test_clocks::valid().0 + config.jwt_expiration_secs + 30;
        config.clock = Arc::new(FixedClock(just_after_expiry));
        assert!(validate_session_token(&config, &token).is_ok());
        Ok(())
    }

    #[test]
    fn test_wrong_secret_rejected() -> ApiResult<()> {
        let config = test_config()?;
        let token = generate_session_token(&config, 1, 1)?;

        let mut other = test_config()?;
        other.jwt_secret = JwtSecret::new("another_secret_another_secret_xx".to_string())?;
        let result = validate_session_token(&other, &token);
        assert!(matches!(result, Err(ref e) if e.code == ErrorCode::InvalidToken));
        Ok(())
    }

    #[test]
    fn test_garbage_and_empty_tokens() -> ApiResult<()> {
        let config = test_config()?;
        assert!(validate_session_token(&config, "not.a.jwt").is_err());
        let empty = validate_session_token(&config, "");
        assert!(matches!(empty, Err(ref e) if e.code == ErrorCode::Unauthorized));
        Ok(())
    }

    #[test]
    fn test_expires_within_window() {
        let clock = test_clocks::valid();
        let claims = SessionClaims::new(1, 1, 300, &clock);
        assert!(claims.expires_within(600, &clock));
        assert!(!claims.expires_within(60, &clock));
        assert_eq!(claims.remaining_secs(&clock), 300);
    }

    #[test]
    fn test_extract_bearer() -> ApiResult<()> {
        assert_eq!(extract_bearer("Bearer abc")?, "abc");
        assert_eq!(extract_bearer("  abc  ")?, "abc");
        assert!(extract_bearer("Bearer ").is_err());
        Ok(())
    }

    #[test]
    fn test_environment_validation() -> ApiResult<()> {
        let insecure = AuthConfig::default();
        assert!(insecure.validate_for_environment("development").is_ok());
        assert!(insecure.validate_for_environment("production").is_err());

        let secure = test_config()?;
        assert!(secure.validate_for_environment("production").is_ok());

        let mut short = test_config()?;
        short.jwt_secret = JwtSecret::new("short".to_string())?;
        assert!(short.validate_for_environment("prod").is_err());
        Ok(())
    }

    #[test]
    fn test_secret_debug_is_redacted() -> ApiResult<()> {
        let secret = JwtSecret::new("super-secret".to_string())?;
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
        Ok(())
    }
}
