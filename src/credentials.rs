//! Credential discovery and the token provider contract
//!
//! The transport only needs one thing: a blocking accessor returning the
//! current bearer token. Discovery of the underlying key/secret pair walks
//! a priority chain:
//!
//! 1. `SATFETCH_KEY` / `SATFETCH_SECRET` / `SATFETCH_TOKEN_VALIDITY` env vars
//! 2. `.env` file in the current working directory
//! 3. `~/.satfetch/credentials` (comma-separated: `key,secret`)
//!
//! Token validity can only come from env vars or the `.env` file; the
//! credentials file stores just the pair.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable carrying the API key
pub const KEY_VAR: &str = "SATFETCH_KEY";
/// Environment variable carrying the API secret
pub const SECRET_VAR: &str = "SATFETCH_SECRET";
/// Environment variable carrying the token validity in seconds
pub const VALIDITY_VAR: &str = "SATFETCH_TOKEN_VALIDITY";

/// Default token validity: 24 hours in seconds
pub const DEFAULT_VALIDITY: u64 = 86_400;

/// Source of the current bearer token.
///
/// `current_token` may block (token endpoints, retry loops); callers on the
/// async runtime bridge it through `spawn_blocking`. Implementations
/// synchronize internally.
pub trait TokenProvider: Send + Sync {
    /// The current bearer token string
    fn current_token(&self) -> Result<String>;
}

/// Token provider returning a fixed string; useful for tests and for
/// embedders that manage token renewal themselves.
#[derive(Clone, Debug)]
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    /// Wrap a fixed token string
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticTokenProvider {
    fn current_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Discovered API credentials
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// API key
    pub key: String,
    /// API secret
    pub secret: String,
    /// Token validity in seconds
    pub validity: u64,
}

/// Discover credentials through the priority chain.
///
/// Fails with [`Error::Credentials`] when no complete key/secret pair can
/// be found.
pub fn discover() -> Result<Credentials> {
    let dotenv_path = PathBuf::from(".env");
    let cred_file = std::env::home_dir().map(|home| home.join(".satfetch").join("credentials"));
    discover_at(&dotenv_path, cred_file.as_deref())
}

/// Discovery with explicit file locations (exercised directly by tests)
pub(crate) fn discover_at(dotenv_path: &Path, cred_file: Option<&Path>) -> Result<Credentials> {
    let mut validity = DEFAULT_VALIDITY;

    // 1. Environment variables
    let mut key = std::env::var(KEY_VAR).ok().filter(|v| !v.is_empty());
    let mut secret = std::env::var(SECRET_VAR).ok().filter(|v| !v.is_empty());
    if let Ok(raw) = std::env::var(VALIDITY_VAR)
        && !raw.is_empty()
        && let Some(parsed) = parse_validity(&raw, "environment variable")
    {
        validity = parsed;
    }
    if let (Some(key), Some(secret)) = (&key, &secret) {
        return Ok(Credentials {
            key: key.clone(),
            secret: secret.clone(),
            validity,
        });
    }

    // 2. .env file in the working directory
    if dotenv_path.exists() {
        match std::fs::read_to_string(dotenv_path) {
            Ok(contents) => {
                let vars = parse_dotenv(&contents);
                key = key.or_else(|| vars.get(KEY_VAR).cloned().filter(|v| !v.is_empty()));
                secret = secret.or_else(|| vars.get(SECRET_VAR).cloned().filter(|v| !v.is_empty()));
                if let Some(raw) = vars.get(VALIDITY_VAR)
                    && let Some(parsed) = parse_validity(raw, ".env file")
                {
                    validity = parsed;
                }
                if let (Some(key), Some(secret)) = (&key, &secret) {
                    return Ok(Credentials {
                        key: key.clone(),
                        secret: secret.clone(),
                        validity,
                    });
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read .env file");
            }
        }
    }

    // 3. ~/.satfetch/credentials ("key,secret")
    if let Some(cred_file) = cred_file
        && cred_file.exists()
    {
        match std::fs::read_to_string(cred_file) {
            Ok(contents) => {
                let mut parts = contents.trim().split(',').map(str::trim);
                key = key.or_else(|| {
                    parts
                        .next()
                        .map(str::to_string)
                        .filter(|v| !v.is_empty())
                });
                secret = secret.or_else(|| {
                    parts
                        .next()
                        .map(str::to_string)
                        .filter(|v| !v.is_empty())
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "Failed to read credentials file");
            }
        }
    }

    match (key, secret) {
        (Some(key), Some(secret)) => Ok(Credentials {
            key,
            secret,
            validity,
        }),
        _ => Err(Error::Credentials(format!(
            "credentials not found; set {KEY_VAR}/{SECRET_VAR} environment variables, \
             provide a .env file, or create ~/.satfetch/credentials"
        ))),
    }
}

/// Parse a dotenv document into a key/value map.
///
/// Handles `KEY=value`, double/single-quoted values, comment lines, and
/// blank lines. Inline comments are not stripped.
pub(crate) fn parse_dotenv(contents: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || !line.contains('=') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if bytes[0] == bytes[value.len() - 1] && (bytes[0] == b'"' || bytes[0] == b'\'') {
                value = &value[1..value.len() - 1];
            }
        }
        if !key.is_empty() {
            result.insert(key.to_string(), value.to_string());
        }
    }
    result
}

/// Parse a validity string as a positive integer of seconds; warns and
/// returns `None` on zero or non-integer values.
pub(crate) fn parse_validity(raw: &str, source: &str) -> Option<u64> {
    match raw.parse::<i64>() {
        Ok(v) if v > 0 => Some(v as u64),
        Ok(v) => {
            tracing::warn!(value = v, source, "token validity must be positive; ignoring");
            None
        }
        Err(_) => {
            tracing::warn!(value = raw, source, "token validity is not an integer; ignoring");
            None
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        // SAFETY: tests touching the environment are serialized
        unsafe {
            std::env::remove_var(KEY_VAR);
            std::env::remove_var(SECRET_VAR);
            std::env::remove_var(VALIDITY_VAR);
        }
    }

    #[test]
    fn dotenv_parses_plain_quoted_and_comments() {
        let contents = r#"
# comment line
SATFETCH_KEY=abc
SATFETCH_SECRET="s e c r e t"
SINGLE='quoted'
NOEQUALS
EMPTY=

"#;
        let vars = parse_dotenv(contents);
        assert_eq!(vars["SATFETCH_KEY"], "abc");
        assert_eq!(vars["SATFETCH_SECRET"], "s e c r e t");
        assert_eq!(vars["SINGLE"], "quoted");
        assert_eq!(vars["EMPTY"], "");
        assert!(!vars.contains_key("NOEQUALS"));
        assert!(!vars.contains_key("# comment line"));
    }

    #[test]
    fn validity_rejects_zero_negative_and_garbage() {
        assert_eq!(parse_validity("3600", "test"), Some(3600));
        assert_eq!(parse_validity("0", "test"), None);
        assert_eq!(parse_validity("-5", "test"), None);
        assert_eq!(parse_validity("soon", "test"), None);
    }

    #[test]
    #[serial]
    fn env_vars_win_over_files() {
        clear_env();
        unsafe {
            std::env::set_var(KEY_VAR, "env-key");
            std::env::set_var(SECRET_VAR, "env-secret");
            std::env::set_var(VALIDITY_VAR, "7200");
        }

        let dir = TempDir::new().unwrap();
        let dotenv = dir.path().join(".env");
        std::fs::write(&dotenv, "SATFETCH_KEY=file-key\nSATFETCH_SECRET=file-secret\n").unwrap();

        let creds = discover_at(&dotenv, None).unwrap();
        assert_eq!(creds.key, "env-key");
        assert_eq!(creds.secret, "env-secret");
        assert_eq!(creds.validity, 7200);

        clear_env();
    }

    #[test]
    #[serial]
    fn dotenv_fills_in_when_env_incomplete() {
        clear_env();
        unsafe { std::env::set_var(KEY_VAR, "env-key") };

        let dir = TempDir::new().unwrap();
        let dotenv = dir.path().join(".env");
        std::fs::write(
            &dotenv,
            "SATFETCH_SECRET=file-secret\nSATFETCH_TOKEN_VALIDITY=600\n",
        )
        .unwrap();

        let creds = discover_at(&dotenv, None).unwrap();
        assert_eq!(creds.key, "env-key");
        assert_eq!(creds.secret, "file-secret");
        assert_eq!(creds.validity, 600);

        clear_env();
    }

    #[test]
    #[serial]
    fn credentials_file_is_last_resort() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let dotenv = dir.path().join(".env"); // absent
        let cred_file = dir.path().join("credentials");
        std::fs::write(&cred_file, "home-key, home-secret\n").unwrap();

        let creds = discover_at(&dotenv, Some(cred_file.as_path())).unwrap();
        assert_eq!(creds.key, "home-key");
        assert_eq!(creds.secret, "home-secret");
        assert_eq!(creds.validity, DEFAULT_VALIDITY);
    }

    #[test]
    #[serial]
    fn missing_everything_fails() {
        clear_env();
        let dir = TempDir::new().unwrap();
        let err = discover_at(&dir.path().join(".env"), None).unwrap_err();
        assert!(err.to_string().contains("credentials not found"));
    }

    #[test]
    #[serial]
    fn invalid_validity_falls_back_to_default() {
        clear_env();
        unsafe {
            std::env::set_var(KEY_VAR, "k");
            std::env::set_var(SECRET_VAR, "s");
            std::env::set_var(VALIDITY_VAR, "not-a-number");
        }

        let dir = TempDir::new().unwrap();
        let creds = discover_at(&dir.path().join(".env"), None).unwrap();
        assert_eq!(creds.validity, DEFAULT_VALIDITY);

        clear_env();
    }

    #[test]
    fn static_provider_returns_its_token() {
        let provider = StaticTokenProvider::new("tok");
        assert_eq!(provider.current_token().unwrap(), "tok");
    }
}
