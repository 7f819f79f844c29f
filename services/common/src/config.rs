//! Environment configuration for the hosted store
//!
//! Connection settings are mandatory. There are no fallback URLs or keys:
//! a missing variable is a configuration error reported before any request.

use crate::error::{Result, StoreError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default timeout for store requests, overridable with HTTP_TIMEOUT_SECS.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    ServiceRole,
    Anonymous,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyKind::ServiceRole => write!(f, "service-role"),
            KeyKind::Anonymous => write!(f, "anon"),
        }
    }
}

#[derive(Clone)]
pub struct StoreConfig {
    pub url: String,
    pub key: String,
    pub key_kind: KeyKind,
    pub timeout: Duration,
}

// The key must never end up in logs.
impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("key_kind", &self.key_kind)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source. The service-role key wins
    /// over the anonymous key when both are present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("SUPABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| StoreError::Config("SUPABASE_URL env var missing".to_string()))?;

        let (key, key_kind) = match lookup("SUPABASE_SERVICE_ROLE_KEY").filter(|v| !v.is_empty()) {
            Some(key) => (key, KeyKind::ServiceRole),
            None => match lookup("SUPABASE_ANON_KEY").filter(|v| !v.is_empty()) {
                Some(key) => (key, KeyKind::Anonymous),
                None => {
                    return Err(StoreError::Config(
                        "SUPABASE_SERVICE_ROLE_KEY or SUPABASE_ANON_KEY env var missing"
                            .to_string(),
                    ))
                }
            },
        };

        let timeout_secs = lookup("HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            key,
            key_kind,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Which foreign-key path the deployed schema populates for indicator names.
///
/// `V1` schemas link results to raw data only, `V2` schemas link results to
/// indicator components. `Auto` tries components first and falls back to raw
/// data when that yields nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVersion {
    V1,
    V2,
    #[default]
    Auto,
}

impl SchemaVersion {
    pub fn from_env() -> std::result::Result<Self, String> {
        match std::env::var("BRAINNOVA_SCHEMA_VERSION") {
            Ok(v) => v.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "v1" | "1" => Ok(SchemaVersion::V1),
            "v2" | "2" => Ok(SchemaVersion::V2),
            "auto" => Ok(SchemaVersion::Auto),
            other => Err(format!("Invalid schema version: {} (expected v1, v2 or auto)", other)),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaVersion::V1 => write!(f, "v1"),
            SchemaVersion::V2 => write!(f, "v2"),
            SchemaVersion::Auto => write!(f, "auto"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_missing_url_is_an_error() {
        let result = StoreConfig::from_lookup(lookup(&[("SUPABASE_ANON_KEY", "anon")]));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let result = StoreConfig::from_lookup(lookup(&[("SUPABASE_URL", "https://x.supabase.co")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("SUPABASE_SERVICE_ROLE_KEY"));
    }

    #[test]
    fn test_service_role_key_preferred() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://x.supabase.co/"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("SUPABASE_SERVICE_ROLE_KEY", "service"),
        ]))
        .unwrap();
        assert_eq!(config.key, "service");
        assert_eq!(config.key_kind, KeyKind::ServiceRole);
        assert_eq!(config.url, "https://x.supabase.co");
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
    }

    #[test]
    fn test_debug_hides_key() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_ANON_KEY", "very-secret"),
        ]))
        .unwrap();
        assert!(!format!("{:?}", config).contains("very-secret"));
    }

    #[test]
    fn test_schema_version_parsing() {
        assert_eq!("v1".parse::<SchemaVersion>().unwrap(), SchemaVersion::V1);
        assert_eq!("V2".parse::<SchemaVersion>().unwrap(), SchemaVersion::V2);
        assert_eq!("auto".parse::<SchemaVersion>().unwrap(), SchemaVersion::Auto);
        assert!("v3".parse::<SchemaVersion>().is_err());
    }
}
