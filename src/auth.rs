//! Token authorization for realms.
//!
//! Each realm carries a token table mapping opaque tokens to granted
//! capabilities. A realm whose table is missing or unreadable runs with
//! authorization disabled; a realm whose table loaded but is empty refuses
//! everything with `server_problem`, so a broken deployment is never mistaken
//! for a deliberate lock-down.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of a realm's token table.
pub const TOKENS_FILE: &str = "tokens.json";

/// Auth errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No token table at {0}")]
    NoTable(PathBuf),

    #[error("Invalid token table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One operation a token may be allowed to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Search,
    Read,
    Write,
    Delete,
    /// Bypass the policy gate on writes; always checked on top of `Write`.
    Force,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Delete => "delete",
            Capability::Force => "force",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "search" => Ok(Capability::Search),
            "read" => Ok(Capability::Read),
            "write" => Ok(Capability::Write),
            "delete" => Ok(Capability::Delete),
            "force" => Ok(Capability::Force),
            other => Err(AuthError::UnknownCapability(other.to_string())),
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Token unknown or lacking the capability.
    AccessDenied,
    /// The token table loaded but holds no tokens.
    ServerProblem,
}

impl DenyReason {
    /// Wire code for the failure body.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::AccessDenied => "access_denied",
            DenyReason::ServerProblem => "server_problem",
        }
    }
}

/// Authorization outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Grant,
    Deny {
        reason: DenyReason,
        capability: Capability,
    },
}

impl Decision {
    pub fn is_grant(&self) -> bool {
        matches!(self, Decision::Grant)
    }
}

/// Tokens and their capabilities as stored in `tokens.json`.
///
/// ```json
/// { "s3cret": { "search": true, "read": true, "write": false } }
/// ```
///
/// Anything but a literal `true` counts as not granted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TokenTable {
    tokens: HashMap<String, HashMap<String, serde_json::Value>>,
}

impl TokenTable {
    /// Parse a table from JSON text.
    pub fn from_json(text: &str) -> Result<Self, AuthError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a table from disk.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        if !path.exists() {
            return Err(AuthError::NoTable(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Build a table in code (tests, embedding).
    pub fn from_grants<'a>(
        grants: impl IntoIterator<Item = (&'a str, &'a [Capability])>,
    ) -> Self {
        let tokens = grants
            .into_iter()
            .map(|(token, caps)| {
                let caps = caps
                    .iter()
                    .map(|c| (c.as_str().to_string(), serde_json::Value::Bool(true)))
                    .collect();
                (token.to_string(), caps)
            })
            .collect();
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }

    /// Whether `token` is explicitly granted `capability`.
    pub fn grants(&self, token: &str, capability: Capability) -> bool {
        self.tokens
            .get(token)
            .and_then(|caps| caps.get(capability.as_str()))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Authorization state of one realm.
#[derive(Debug, Clone, PartialEq)]
pub enum RealmTokens {
    /// No usable table: every request is granted.
    Disabled,
    Loaded(TokenTable),
}

impl RealmTokens {
    /// Load the table in `realm_dir`, degrading to `Disabled` on any failure.
    pub fn load(realm_dir: &Path) -> Self {
        let path = realm_dir.join(TOKENS_FILE);
        match TokenTable::load(&path) {
            Ok(table) => {
                debug!(path = %path.display(), tokens = table.len(), "Loaded token table");
                RealmTokens::Loaded(table)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Token table unavailable, authorization disabled for realm"
                );
                RealmTokens::Disabled
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, RealmTokens::Loaded(_))
    }
}

/// Resolves (realm tokens, token, capability) to a decision.
#[derive(Debug, Clone, Copy)]
pub struct Authorizer {
    enabled: bool,
}

impl Authorizer {
    /// Authorizer honouring realm token tables.
    pub fn new() -> Self {
        Self { enabled: true }
    }

    /// Authorizer that grants everything, whatever the realms say.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check a single capability.
    pub fn authorize(
        &self,
        tokens: &RealmTokens,
        token: Option<&str>,
        capability: Capability,
    ) -> Decision {
        if !self.enabled {
            return Decision::Grant;
        }

        let table = match tokens {
            RealmTokens::Disabled => return Decision::Grant,
            RealmTokens::Loaded(table) => table,
        };

        let deny = |reason| Decision::Deny { reason, capability };

        if table.is_empty() {
            return deny(DenyReason::ServerProblem);
        }

        match token {
            Some(token) if table.grants(token, capability) => Decision::Grant,
            _ => deny(DenyReason::AccessDenied),
        }
    }

    /// Check every capability in order; the first denial wins.
    pub fn authorize_all(
        &self,
        tokens: &RealmTokens,
        token: Option<&str>,
        capabilities: &[Capability],
    ) -> Decision {
        capabilities
            .iter()
            .map(|&c| self.authorize(tokens, token, c))
            .find(|d| !d.is_grant())
            .unwrap_or(Decision::Grant)
    }
}

impl Default for Authorizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALL: [Capability; 5] = [
        Capability::Search,
        Capability::Read,
        Capability::Write,
        Capability::Delete,
        Capability::Force,
    ];

    fn table() -> RealmTokens {
        RealmTokens::Loaded(
            TokenTable::from_json(
                r#"{
                    "reader": {"search": true, "read": true, "write": false},
                    "writer": {"search": true, "read": true, "write": true, "delete": true},
                    "admin":  {"search": true, "read": true, "write": true, "delete": true, "force": true},
                    "odd":    {"read": "yes"}
                }"#,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_grant_and_deny() {
        let auth = Authorizer::new();
        let tokens = table();

        assert!(auth.authorize(&tokens, Some("reader"), Capability::Read).is_grant());
        assert_eq!(
            auth.authorize(&tokens, Some("reader"), Capability::Write),
            Decision::Deny {
                reason: DenyReason::AccessDenied,
                capability: Capability::Write
            }
        );
        assert!(!auth.authorize(&tokens, Some("reader"), Capability::Delete).is_grant());
        assert!(!auth.authorize(&tokens, Some("odd"), Capability::Read).is_grant());
    }

    #[test]
    fn test_unknown_token_denied_everything() {
        let auth = Authorizer::new();
        let tokens = table();

        for cap in ALL {
            for token in [None, Some("nobody")] {
                assert_eq!(
                    auth.authorize(&tokens, token, cap),
                    Decision::Deny {
                        reason: DenyReason::AccessDenied,
                        capability: cap
                    }
                );
            }
        }
    }

    #[test]
    fn test_empty_table_is_server_problem() {
        let auth = Authorizer::new();
        let tokens = RealmTokens::Loaded(TokenTable::from_json("{}").unwrap());

        for cap in ALL {
            assert_eq!(
                auth.authorize(&tokens, Some("anything"), cap),
                Decision::Deny {
                    reason: DenyReason::ServerProblem,
                    capability: cap
                }
            );
        }
    }

    #[test]
    fn test_force_needs_both() {
        let auth = Authorizer::new();
        let tokens = table();
        let forced = [Capability::Write, Capability::Force];

        assert!(!auth.authorize_all(&tokens, Some("writer"), &forced).is_grant());
        assert!(auth.authorize_all(&tokens, Some("admin"), &forced).is_grant());
        assert_eq!(
            auth.authorize_all(&tokens, Some("reader"), &forced),
            Decision::Deny {
                reason: DenyReason::AccessDenied,
                capability: Capability::Write
            }
        );
    }

    #[test]
    fn test_disabled_grants_everything() {
        let tokens = RealmTokens::Loaded(TokenTable::from_json("{}").unwrap());
        assert!(Authorizer::disabled()
            .authorize(&tokens, None, Capability::Delete)
            .is_grant());
        assert!(Authorizer::new()
            .authorize(&RealmTokens::Disabled, None, Capability::Delete)
            .is_grant());
    }

    #[test]
    fn test_load_degrades_to_disabled() {
        let temp = TempDir::new().unwrap();
        assert_eq!(RealmTokens::load(temp.path()), RealmTokens::Disabled);

        fs::write(temp.path().join(TOKENS_FILE), "not json").unwrap();
        assert_eq!(RealmTokens::load(temp.path()), RealmTokens::Disabled);

        fs::write(temp.path().join(TOKENS_FILE), r#"{"t": {"read": true}}"#).unwrap();
        let tokens = RealmTokens::load(temp.path());
        assert!(tokens.is_enabled());
        assert!(Authorizer::new().authorize(&tokens, Some("t"), Capability::Read).is_grant());
    }

    #[test]
    fn test_capability_parse() {
        assert_eq!("WRITE".parse::<Capability>().unwrap(), Capability::Write);
        assert!(matches!(
            "admin".parse::<Capability>(),
            Err(AuthError::UnknownCapability(_))
        ));
    }
}
