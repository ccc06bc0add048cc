use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// The signed-in user. Stands in for the hosted identity provider: the id is
/// derived from the email so the same address always maps to the same owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub signed_in_at: DateTime<Utc>,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read session file: {}", self.path.display()))?;
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt session file: {}", self.path.display()))?;
        Ok(Some(session))
    }

    pub fn login(&self, email: &str, display_name: Option<&str>) -> Result<Session> {
        let email = normalize_email(email)?;
        let session = Session {
            user_id: user_id_for(&email),
            email,
            display_name: display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from),
            signed_in_at: Utc::now(),
        };
        self.save(&session)?;
        info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// Returns true when a session was removed.
    pub fn logout(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to remove {}", self.path.display()))?;
        debug!(path = %self.path.display(), "session removed");
        Ok(true)
    }

    pub fn update_profile(&self, display_name: Option<&str>) -> Result<Session> {
        let mut session = self
            .current()?
            .ok_or_else(|| anyhow!("Not signed in. Run 'jobtrack login <email>' first."))?;
        session.display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from);
        self.save(&session)?;
        Ok(session)
    }

    fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(session)?;
        fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write session file: {}", self.path.display()))?;
        Ok(())
    }
}

fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let re = Regex::new(r"^[^@\s]+@[^@\s]+$")?;
    if !re.is_match(&email) {
        return Err(anyhow!("'{}' is not a valid email address", email));
    }
    Ok(email)
}

/// Stable, filesystem-safe id for a normalized email.
fn user_id_for(email: &str) -> String {
    // FNV-1a, 64 bit
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in email.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("u{:016x}", hash)
}
