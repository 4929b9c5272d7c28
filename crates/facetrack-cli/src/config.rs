use anyhow::{Context, Result};
use facetrack_core::{MatchPolicy, Metric, SessionOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration: optional TOML file, then `FACETRACK_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Length of every embedding the extractor produces.
    pub embedding_dim: usize,
    pub metric: Metric,
    /// Largest distance at which a probe may be accepted.
    pub accept_threshold: f32,
    /// Minimum distance gap between best and runner-up identity.
    pub margin_threshold: f32,
    /// Run scans even when nobody on the roster has face data.
    pub allow_empty_gallery: bool,
}

impl Default for Config {
    fn default() -> Self {
        let policy = MatchPolicy::default();
        Self {
            db_path: data_dir().join("faces.db"),
            embedding_dim: policy.dimension,
            metric: policy.metric,
            accept_threshold: policy.accept_threshold,
            margin_threshold: policy.margin_threshold,
            allow_empty_gallery: false,
        }
    }
}

impl Config {
    /// Load from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("FACETRACK_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.embedding_dim = parsed(&var, "FACETRACK_EMBEDDING_DIM", self.embedding_dim);
        self.metric = parsed(&var, "FACETRACK_METRIC", self.metric);
        self.accept_threshold = parsed(&var, "FACETRACK_ACCEPT_THRESHOLD", self.accept_threshold);
        self.margin_threshold = parsed(&var, "FACETRACK_MARGIN_THRESHOLD", self.margin_threshold);
        if let Some(v) = var("FACETRACK_ALLOW_EMPTY_GALLERY") {
            self.allow_empty_gallery = v != "0" && !v.eq_ignore_ascii_case("false");
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            dimension: self.embedding_dim,
            metric: self.metric,
            accept_threshold: self.accept_threshold,
            margin_threshold: self.margin_threshold,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            allow_empty_gallery: self.allow_empty_gallery,
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrack")
}

/// Unparseable values keep the current setting.
fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match var(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            current
        }),
        None => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            r#"
            db_path = "/var/lib/facetrack/faces.db"
            embedding_dim = 128
            metric = "euclidean"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/facetrack/faces.db"));
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.accept_threshold, MatchPolicy::default().accept_threshold);
        assert!(!config.allow_empty_gallery);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACETRACK_EMBEDDING_DIM", "128"),
            ("FACETRACK_ACCEPT_THRESHOLD", "0.35"),
            ("FACETRACK_MARGIN_THRESHOLD", "not-a-number"),
            ("FACETRACK_METRIC", "Cosine"),
            ("FACETRACK_ALLOW_EMPTY_GALLERY", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.accept_threshold, 0.35);
        assert_eq!(config.margin_threshold, MatchPolicy::default().margin_threshold);
        assert_eq!(config.metric, Metric::Cosine);
        assert!(config.allow_empty_gallery);

        let policy = config.match_policy();
        assert_eq!(policy.dimension, 128);
        assert!(policy.validate().is_ok());
        assert!(config.session_options().allow_empty_gallery);
    }

    #[test]
    fn test_bad_value_type_rejected() {
        assert!(Config::parse("embedding_dim = \"lots\"").is_err());
    }
}
