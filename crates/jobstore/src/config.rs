//! Store configuration
//!
//! Reads:
//! - JOBSTORE_BACKEND (optional, `memory` | `surreal`, default: `memory`)
//! - JOBSTORE_URL (optional, default: `mem://`)
//! - JOBSTORE_NAMESPACE (optional, default: `jobstore`)
//! - JOBSTORE_DATABASE (optional, default: `main`)
//! - JOBSTORE_USERNAME / JOBSTORE_PASSWORD (optional, both or neither)
//! - JOBSTORE_ROOT (optional, default: `false`) - sign in as a root user

use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

pub const DEFAULT_URL: &str = "mem://";
pub const DEFAULT_NAMESPACE: &str = "jobstore";
pub const DEFAULT_DATABASE: &str = "main";

/// Which `DocumentStore` implementation to open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Memory,
    Surreal,
}

impl FromStr for Backend {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(Backend::Memory),
            "surreal" | "surrealdb" => Ok(Backend::Surreal),
            other => Err(StoreError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Memory => write!(f, "memory"),
            Backend::Surreal => write!(f, "surreal"),
        }
    }
}

/// Sign-in credentials for a remote store
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Root user (true) or database user (false)
    pub root: bool,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("root", &self.root)
            .finish()
    }
}

/// Connection settings for the store backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Endpoint URL (`mem://`, `surrealkv://path`, `ws://host:port`, `wss://...`)
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub credentials: Option<Credentials>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl StoreConfig {
    /// In-process store, nothing persisted
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            url: DEFAULT_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            credentials: None,
        }
    }

    /// SurrealDB at `url`
    pub fn surreal(url: impl Into<String>) -> Self {
        Self {
            backend: Backend::Surreal,
            url: url.into(),
            ..Self::memory()
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        root: bool,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            root,
        });
        self
    }

    /// Create from environment variables (see module docs)
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let backend = match lookup("JOBSTORE_BACKEND") {
            Some(value) => value.parse()?,
            None => Backend::default(),
        };
        let url = lookup("JOBSTORE_URL").unwrap_or_else(|| DEFAULT_URL.to_string());
        let namespace =
            lookup("JOBSTORE_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let database = lookup("JOBSTORE_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.to_string());
        let root = lookup("JOBSTORE_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let credentials = match (lookup("JOBSTORE_USERNAME"), lookup("JOBSTORE_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials {
                username,
                password,
                root,
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(StoreError::Config("JOBSTORE_PASSWORD not set".to_string()))
            }
            (None, Some(_)) => {
                return Err(StoreError::Config("JOBSTORE_USERNAME not set".to_string()))
            }
        };

        Ok(Self {
            backend,
            url,
            namespace,
            database,
            credentials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_memory_backend() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::memory());
    }

    #[test]
    fn reads_surreal_settings() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("JOBSTORE_BACKEND", "surreal"),
            ("JOBSTORE_URL", "ws://localhost:8000"),
            ("JOBSTORE_NAMESPACE", "ci"),
            ("JOBSTORE_USERNAME", "admin"),
            ("JOBSTORE_PASSWORD", "secret"),
            ("JOBSTORE_ROOT", "TRUE"),
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Surreal);
        assert_eq!(config.url, "ws://localhost:8000");
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.database, DEFAULT_DATABASE);
        let credentials = config.credentials.unwrap();
        assert!(credentials.root);
        assert!(!format!("{credentials:?}").contains("secret"));
    }

    #[test]
    fn half_credentials_are_rejected() {
        let err = StoreConfig::from_lookup(lookup(&[("JOBSTORE_USERNAME", "admin")])).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = StoreConfig::from_lookup(lookup(&[("JOBSTORE_BACKEND", "mongo")])).unwrap_err();
        assert_eq!(err, StoreError::Config("unknown backend 'mongo'".to_string()));
    }
}
