use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::analytics::MAX_WEEKS;
use crate::db::Database;

pub const DEFAULT_MODEL: &str = "claude-sonnet";
pub const DEFAULT_WEEKS: usize = 8;

/// On-disk settings (`config.toml`). Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    session_path: Option<PathBuf>,
    model: Option<String>,
    dashboard_weeks: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub session_path: PathBuf,
    pub model: String,
    pub dashboard_weeks: usize,
}

impl Config {
    /// Resolution order: built-in defaults, then `config.toml`, then
    /// `JOBTRACK_DB` / `JOBTRACK_MODEL` from the environment or `.env`.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = explicit.map(Path::to_path_buf).or_else(default_config_path);
        let file = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                parse_file(&raw).with_context(|| format!("Invalid config file: {}", p.display()))?
            }
            Some(p) if explicit.is_some() => {
                return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
            }
            _ => FileConfig::default(),
        };

        let mut config = Self::from_file(file);
        if let Ok(db) = std::env::var("JOBTRACK_DB") {
            if !db.trim().is_empty() {
                config.db_path = PathBuf::from(db);
            }
        }
        if let Ok(model) = std::env::var("JOBTRACK_MODEL") {
            if !model.trim().is_empty() {
                config.model = model;
            }
        }
        Ok(config)
    }

    fn from_file(file: FileConfig) -> Self {
        Self {
            db_path: file.db_path.unwrap_or_else(Database::default_path),
            session_path: file.session_path.unwrap_or_else(default_session_path),
            model: file.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dashboard_weeks: file
                .dashboard_weeks
                .unwrap_or(DEFAULT_WEEKS)
                .clamp(1, MAX_WEEKS),
        }
    }
}

fn parse_file(raw: &str) -> Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "jobtrack").map(|d| d.config_dir().join("config.toml"))
}

fn default_session_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobtrack") {
        proj_dirs.data_dir().join("session.json")
    } else {
        PathBuf::from("session.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_file_empty() {
        let config = Config::from_file(parse_file("").unwrap());
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.dashboard_weeks, DEFAULT_WEEKS);
        assert!(config.db_path.ends_with("jobtrack.db"));
        assert!(config.session_path.ends_with("session.json"));
    }

    #[test]
    fn test_file_values_win_over_defaults() {
        let raw = r#"
            db_path = "/tmp/tracker.db"
            model = "gpt-4o"
            dashboard_weeks = 0
        "#;
        let config = Config::from_file(parse_file(raw).unwrap());
        assert_eq!(config.db_path, PathBuf::from("/tmp/tracker.db"));
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.dashboard_weeks, 1);
    }

    #[test]
    fn test_weeks_capped() {
        let config = Config::from_file(parse_file("dashboard_weeks = 20000000").unwrap());
        assert_eq!(config.dashboard_weeks, MAX_WEEKS);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(parse_file("colour = \"blue\"").is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "dashboard_weeks = 12\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.dashboard_weeks, 12);
    }
}
