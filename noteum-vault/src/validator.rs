//! Token validation: format detection, security scoring and policy checks.
//!
//! The detected wire format (JWT, bearer, basic, API key) is kept apart from
//! the token's [`TokenType`] classification. The policy's allowed types apply
//! to the classification the caller supplies; the format only feeds the score.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use noteum_core::constants::{
    DEFAULT_GRACE_PERIOD_MS, DEFAULT_MIN_SECURITY_SCORE, DEFAULT_REFRESH_THRESHOLD_MS,
    DEFAULT_TOKEN_EXPIRATION_MS, MAX_TOKEN_LENGTH, MIN_TOKEN_LENGTH,
};
use noteum_core::{Timestamp, TokenRecord, TokenType, VaultConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

// ============================================================================
// FORMATS
// ============================================================================

static JWT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*$").expect("valid JWT regex")
});

static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Bearer\s+[A-Za-z0-9._-]+$").expect("valid bearer regex"));

static BASIC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^Basic\s+[A-Za-z0-9+/=]+$").expect("valid basic regex"));

static API_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]{20,}$").expect("valid API key regex"));

static PLACEHOLDER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(test|demo|example|default)").expect("valid placeholder regex"));

static KEYWORD_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(password|secret|key)").expect("valid keyword regex"));

/// Run length of one repeated character that marks a token as suspicious.
const SUSPICIOUS_RUN: usize = 11;

/// Tokens expiring within this window get a warning.
const EXPIRY_WARNING: Duration = Duration::from_millis(5 * 60 * 1000);

/// Wire format recognised from a token's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenFormat {
    Jwt,
    Bearer,
    Basic,
    ApiKey,
    Unknown,
}

impl TokenFormat {
    /// Detection order; the first matching pattern wins.
    const DETECTABLE: [TokenFormat; 4] = [
        TokenFormat::Jwt,
        TokenFormat::Bearer,
        TokenFormat::Basic,
        TokenFormat::ApiKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenFormat::Jwt => "jwt",
            TokenFormat::Bearer => "bearer",
            TokenFormat::Basic => "basic",
            TokenFormat::ApiKey => "api_key",
            TokenFormat::Unknown => "unknown",
        }
    }

    /// Whether `token` has this format. `Unknown` matches everything.
    pub fn matches(&self, token: &str) -> bool {
        match self {
            TokenFormat::Jwt => JWT_PATTERN.is_match(token),
            TokenFormat::Bearer => BEARER_PATTERN.is_match(token),
            TokenFormat::Basic => BASIC_PATTERN.is_match(token),
            TokenFormat::ApiKey => API_KEY_PATTERN.is_match(token),
            TokenFormat::Unknown => true,
        }
    }

    pub fn detect(token: &str) -> TokenFormat {
        Self::DETECTABLE
            .into_iter()
            .find(|format| format.matches(token))
            .unwrap_or(TokenFormat::Unknown)
    }
}

// ============================================================================
// POLICY AND RESULTS
// ============================================================================

/// Rules a token must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub min_security_score: u8,
    /// Classifications accepted; `Unknown` is always accepted.
    pub allowed_types: Vec<TokenType>,
    pub flag_suspicious: bool,
    /// Suspicious tokens are rejected rather than warned about.
    pub strict: bool,
    /// Expired tokens stay usable for this long.
    pub grace_period: Duration,
    /// Records older than this get a warning.
    pub max_age: Duration,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_TOKEN_LENGTH,
            max_length: MAX_TOKEN_LENGTH,
            min_security_score: DEFAULT_MIN_SECURITY_SCORE,
            allowed_types: vec![TokenType::Access, TokenType::Refresh, TokenType::Api],
            flag_suspicious: true,
            strict: false,
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            max_age: Duration::from_millis(DEFAULT_TOKEN_EXPIRATION_MS),
        }
    }
}

impl From<&VaultConfig> for ValidationPolicy {
    fn from(config: &VaultConfig) -> Self {
        Self {
            strict: config.strict_validation,
            grace_period: config.grace_period(),
            max_age: config.default_expiration(),
            ..Self::default()
        }
    }
}

/// Outcome of validating one token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub format: TokenFormat,
    pub security_score: u8,
    /// Milliseconds until expiry; negative once expired.
    pub expires_in_ms: Option<i64>,
    pub age_ms: Option<i64>,
}

impl TokenValidation {
    fn error(&mut self, message: String) {
        self.errors.push(message);
        self.valid = false;
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct TokenValidator {
    policy: ValidationPolicy,
}

impl TokenValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate a plaintext token against the policy.
    pub fn validate(&self, token: &str, token_type: Option<TokenType>) -> TokenValidation {
        let format = TokenFormat::detect(token);
        let security_score = security_score(token, format);
        let mut result = TokenValidation {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            format,
            security_score,
            expires_in_ms: None,
            age_ms: None,
        };

        let length = token.chars().count();
        if length < self.policy.min_length {
            result.error(format!("Token too short (min: {})", self.policy.min_length));
        }
        if length > self.policy.max_length {
            result.error(format!("Token too long (max: {})", self.policy.max_length));
        }

        if security_score < self.policy.min_security_score {
            result.error(format!(
                "Token security score too low: {security_score} (min: {})",
                self.policy.min_security_score
            ));
        }

        if let Some(token_type) = token_type {
            if token_type != TokenType::Unknown && !self.policy.allowed_types.contains(&token_type) {
                result.error(format!("Token type not allowed: {token_type}"));
            }
        }

        if self.policy.flag_suspicious && is_suspicious(token) {
            result.warnings.push("Token matches suspicious pattern".to_string());
            if self.policy.strict {
                result.error("Suspicious token pattern detected".to_string());
            }
        }

        result
    }

    /// Validate a plaintext token together with its record's timing.
    pub fn validate_record(&self, token: &str, record: &TokenRecord, now: Timestamp) -> TokenValidation {
        let mut result = self.validate(token, record.token_type);

        if let Some(expires_at) = record.expires_at {
            let remaining = expires_at - now;
            result.expires_in_ms = Some(remaining.num_milliseconds());

            if remaining < ChronoDuration::zero() {
                let expired_for = -remaining;
                if expired_for > chrono_duration(self.policy.grace_period) {
                    result.error(format!("Token expired {} minutes ago", expired_for.num_minutes()));
                } else {
                    result.warnings.push("Token expired recently (within grace period)".to_string());
                }
            } else if remaining < chrono_duration(EXPIRY_WARNING) {
                result
                    .warnings
                    .push(format!("Token expires soon (in {} minutes)", remaining.num_minutes()));
            }
        }

        let age = now - record.created_at;
        result.age_ms = Some(age.num_milliseconds());
        if age > chrono_duration(self.policy.max_age) {
            result.warnings.push("Token is older than recommended maximum age".to_string());
        }

        result
    }

    /// Expired beyond the grace period. Records without expiry never expire.
    pub fn is_expired(&self, record: &TokenRecord, now: Timestamp) -> bool {
        record
            .expires_at
            .is_some_and(|at| at + chrono_duration(self.policy.grace_period) < now)
    }

    /// Still valid but expiring within `threshold`.
    pub fn needs_refresh(&self, record: &TokenRecord, threshold: Duration, now: Timestamp) -> bool {
        record.expires_at.is_some_and(|at| {
            let remaining = at - now;
            remaining > ChronoDuration::zero() && remaining <= chrono_duration(threshold)
        })
    }

    pub fn default_refresh_threshold() -> Duration {
        Duration::from_millis(DEFAULT_REFRESH_THRESHOLD_MS)
    }

    /// Mask a token for log output, keeping the first and last four
    /// characters of tokens longer than ten.
    pub fn sanitize_for_logging(token: &str) -> String {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() <= 10 {
            return "*".repeat(chars.len());
        }
        let start: String = chars[..4].iter().collect();
        let end: String = chars[chars.len() - 4..].iter().collect();
        format!("{start}{}{end}", "*".repeat(chars.len() - 8))
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Heuristic strength score in `0..=100`.
pub fn security_score(token: &str, format: TokenFormat) -> u8 {
    let length = token.chars().count();
    let mut score: i32 = 50;

    if length >= 32 {
        score += 20;
    } else if length >= 16 {
        score += 10;
    }

    let classes = [
        token.chars().any(|c| c.is_ascii_digit()),
        token.chars().any(|c| c.is_ascii_lowercase()),
        token.chars().any(|c| c.is_ascii_uppercase()),
        token.chars().any(|c| !c.is_ascii_alphanumeric()),
    ];
    score += 5 * classes.iter().filter(|present| **present).count() as i32;

    score += match format {
        TokenFormat::Jwt => 15,
        TokenFormat::ApiKey => 10,
        _ => 0,
    };

    let mut unique: Vec<char> = token.chars().collect();
    unique.sort_unstable();
    unique.dedup();
    score += (unique.len() as i32 / 4).min(15);

    score.clamp(0, 100) as u8
}

/// Long runs of one character, placeholder prefixes and obvious keywords.
pub fn is_suspicious(token: &str) -> bool {
    has_repeated_run(token, SUSPICIOUS_RUN)
        || PLACEHOLDER_PREFIX.is_match(token)
        || KEYWORD_PREFIX.is_match(token)
}

fn has_repeated_run(token: &str, run: usize) -> bool {
    let mut previous = None;
    let mut length = 0;
    for c in token.chars() {
        if Some(c) == previous {
            length += 1;
        } else {
            previous = Some(c);
            length = 1;
        }
        if length >= run {
            return true;
        }
    }
    false
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRONG: &str = "a1B2c3D4e5F6g7H8i9J0k1L2m3N4o5P6";

    #[test]
    fn test_format_detection() {
        assert_eq!(TokenFormat::detect("eyJhbGciOi.eyJzdWIiOi.c2lnbmF0dXJl"), TokenFormat::Jwt);
        assert_eq!(TokenFormat::detect("Bearer abc.def-ghi"), TokenFormat::Bearer);
        assert_eq!(TokenFormat::detect("basic dXNlcjpwYXNz"), TokenFormat::Basic);
        assert_eq!(TokenFormat::detect(STRONG), TokenFormat::ApiKey);
        assert_eq!(TokenFormat::detect("short!"), TokenFormat::Unknown);
    }

    #[test]
    fn test_security_score() {
        assert_eq!(security_score(STRONG, TokenFormat::ApiKey), 100);
        // 50 base, one character class, two points of variety.
        assert_eq!(security_score("abcdefghij", TokenFormat::Unknown), 57);
    }

    #[test]
    fn test_strong_token_is_valid() {
        let validator = TokenValidator::default();
        let result = validator.validate(STRONG, Some(TokenType::Access));
        assert!(result.valid, "errors: {:?}", result.errors);
        assert_eq!(result.format, TokenFormat::ApiKey);
    }

    #[test]
    fn test_weak_and_short_tokens_fail() {
        let validator = TokenValidator::default();
        let short = validator.validate("abc", None);
        assert!(!short.valid);
        assert!(short.errors.iter().any(|e| e.contains("too short")));

        let weak = validator.validate("abcdefghij", None);
        assert!(!weak.valid);
        assert!(weak.errors.iter().any(|e| e.contains("security score")));
    }

    #[test]
    fn test_disallowed_type_is_rejected() {
        let policy = ValidationPolicy {
            allowed_types: vec![TokenType::Access],
            ..ValidationPolicy::default()
        };
        let validator = TokenValidator::new(policy);
        assert!(!validator.validate(STRONG, Some(TokenType::Refresh)).valid);
        assert!(validator.validate(STRONG, Some(TokenType::Unknown)).valid);
    }

    #[test]
    fn test_suspicious_warns_and_strict_rejects() {
        let token = "testA1b2C3d4E5f6G7h8I9j0K1l2M3n4";
        let lenient = TokenValidator::default().validate(token, None);
        assert!(lenient.valid);
        assert_eq!(lenient.warnings.len(), 1);

        let strict = TokenValidator::new(ValidationPolicy {
            strict: true,
            ..ValidationPolicy::default()
        })
        .validate(token, None);
        assert!(!strict.valid);

        assert!(is_suspicious("aaaaaaaaaaaBcd1234"));
        assert!(!is_suspicious("aaaaaaaaaaBcd1234"));
    }

    #[test]
    fn test_expiry_with_grace_period() {
        let validator = TokenValidator::default();
        let now = noteum_core::now();

        let recent = TokenRecord::new("k", STRONG).with_expires_at(now - ChronoDuration::minutes(2));
        assert!(!validator.is_expired(&recent, now));
        let result = validator.validate_record(STRONG, &recent, now);
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.contains("grace period")));

        let old = TokenRecord::new("k", STRONG).with_expires_at(now - ChronoDuration::minutes(10));
        assert!(validator.is_expired(&old, now));
        assert!(!validator.validate_record(STRONG, &old, now).valid);

        let forever = TokenRecord::new("k", STRONG);
        assert!(!validator.is_expired(&forever, now));
    }

    #[test]
    fn test_needs_refresh_window() {
        let validator = TokenValidator::default();
        let now = noteum_core::now();
        let threshold = TokenValidator::default_refresh_threshold();

        let soon = TokenRecord::new("k", STRONG).with_expires_at(now + ChronoDuration::minutes(3));
        let later = TokenRecord::new("k", STRONG).with_expires_at(now + ChronoDuration::hours(1));
        let gone = TokenRecord::new("k", STRONG).with_expires_at(now - ChronoDuration::minutes(1));

        assert!(validator.needs_refresh(&soon, threshold, now));
        assert!(!validator.needs_refresh(&later, threshold, now));
        assert!(!validator.needs_refresh(&gone, threshold, now));
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(TokenValidator::sanitize_for_logging("short"), "*****");
        assert_eq!(TokenValidator::sanitize_for_logging("0123456789"), "**********");
        assert_eq!(TokenValidator::sanitize_for_logging("abcd12345678wxyz"), "abcd********wxyz");
    }
}
