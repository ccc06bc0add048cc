use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Applied,
    Viewed,
    PhoneScreen,
    Interview,
    Offer,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 7] = [
        ApplicationStatus::Applied,
        ApplicationStatus::Viewed,
        ApplicationStatus::PhoneScreen,
        ApplicationStatus::Interview,
        ApplicationStatus::Offer,
        ApplicationStatus::Rejected,
        ApplicationStatus::Withdrawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Applied => "APPLIED",
            ApplicationStatus::Viewed => "VIEWED",
            ApplicationStatus::PhoneScreen => "PHONE_SCREEN",
            ApplicationStatus::Interview => "INTERVIEW",
            ApplicationStatus::Offer => "OFFER",
            ApplicationStatus::Rejected => "REJECTED",
            ApplicationStatus::Withdrawn => "WITHDRAWN",
        }
    }

    /// Still in play: not offered, rejected or withdrawn.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            ApplicationStatus::Offer | ApplicationStatus::Rejected | ApplicationStatus::Withdrawn
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        ApplicationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| {
                anyhow!(
                    "Unknown status '{}'. Expected one of: applied, viewed, phone_screen, \
                     interview, offer, rejected, withdrawn",
                    s
                )
            })
    }
}

/// Event types offered when logging a milestone by hand.
pub const EVENT_TYPES: [&str; 11] = [
    "viewed",
    "first_response",
    "followed_up",
    "phone_screen_scheduled",
    "online_assessment",
    "technical_interview",
    "hr_interview",
    "interview_scheduled",
    "offer",
    "rejected",
    "withdrawn",
];

pub const EVENT_APPLIED: &str = "applied";
pub const EVENT_STATUS_CHANGED: &str = "status_changed";
pub const EVENT_FIRST_RESPONSE: &str = "first_response";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub id: String,
    pub application_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ApplicationEvent {
    /// "interview_scheduled" -> "Interview Scheduled"
    pub fn display_type(&self) -> String {
        self.event_type
            .split('_')
            .filter(|w| !w.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }

    pub fn note(&self) -> Option<&str> {
        self.metadata.get("note").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub application_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub user_id: String,
    pub company_name: String,
    pub title: String,
    pub source_name: String,
    pub applied_at: DateTime<Utc>,
    pub status: ApplicationStatus,
    pub location: Option<String>,
    pub salary: Option<String>,
    pub url: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Empty on list results; filled by the detail fetch.
    pub notes: Vec<Note>,
    pub events: Vec<ApplicationEvent>,
}

/// Input of the new-application form.
#[derive(Debug, Clone)]
pub struct NewApplication {
    pub user_id: String,
    pub company_name: String,
    pub title: String,
    pub source_name: String,
    pub applied_at: DateTime<Utc>,
    pub status: ApplicationStatus,
    pub location: Option<String>,
    pub salary: Option<String>,
    pub url: Option<String>,
    pub tags: Vec<String>,
    pub note: Option<String>,
}

impl NewApplication {
    pub fn new(user_id: &str, company_name: &str, title: &str, source_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            company_name: company_name.to_string(),
            title: title.to_string(),
            source_name: source_name.to_string(),
            applied_at: Utc::now(),
            status: ApplicationStatus::Applied,
            location: None,
            salary: None,
            url: None,
            tags: Vec::new(),
            note: None,
        }
    }

    /// Trims every field, drops blank optionals and checks the form rules.
    pub fn normalize(mut self) -> Result<Self> {
        self.title = self.title.trim().to_string();
        self.company_name = self.company_name.trim().to_string();
        self.source_name = self.source_name.trim().to_string();
        self.location = non_blank(self.location);
        self.salary = non_blank(self.salary);
        self.url = non_blank(self.url);
        self.note = non_blank(self.note);
        self.tags = self
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let mut seen = HashSet::new();
        self.tags.retain(|t| seen.insert(t.clone()));

        if self.title.chars().count() < 2 {
            return Err(anyhow!("Title must be at least 2 characters."));
        }
        if self.company_name.chars().count() < 2 {
            return Err(anyhow!("Company name must be at least 2 characters."));
        }
        if self.source_name.chars().count() < 2 {
            return Err(anyhow!("Source is required."));
        }
        if let Some(url) = &self.url {
            let valid = reqwest::Url::parse(url)
                .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
                .unwrap_or(false);
            if !valid {
                return Err(anyhow!("Please enter a valid URL."));
            }
        }
        Ok(self)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parses_loosely() {
        assert_eq!("applied".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::Applied);
        assert_eq!("phone-screen".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::PhoneScreen);
        assert_eq!("Phone Screen".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::PhoneScreen);
        assert_eq!("WITHDRAWN".parse::<ApplicationStatus>().unwrap(), ApplicationStatus::Withdrawn);
        assert!("ghosted".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_status_active() {
        assert!(ApplicationStatus::Interview.is_active());
        assert!(ApplicationStatus::Applied.is_active());
        assert!(!ApplicationStatus::Offer.is_active());
        assert!(!ApplicationStatus::Rejected.is_active());
        assert!(!ApplicationStatus::Withdrawn.is_active());
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&ApplicationStatus::PhoneScreen).unwrap();
        assert_eq!(json, "\"PHONE_SCREEN\"");
    }

    #[test]
    fn test_event_display_type() {
        let event = ApplicationEvent {
            id: "e".to_string(),
            application_id: "a".to_string(),
            event_type: "interview_scheduled".to_string(),
            occurred_at: Utc::now(),
            metadata: Map::new(),
        };
        assert_eq!(event.display_type(), "Interview Scheduled");
    }

    #[test]
    fn test_normalize_trims_and_validates() {
        let mut input = NewApplication::new("u1", "  Acme  ", " Staff Engineer ", "LinkedIn");
        input.url = Some("".to_string());
        input.location = Some("   ".to_string());
        input.tags = vec![" rust ".to_string(), "".to_string()];
        let app = input.normalize().unwrap();
        assert_eq!(app.company_name, "Acme");
        assert_eq!(app.title, "Staff Engineer");
        assert_eq!(app.url, None);
        assert_eq!(app.location, None);
        assert_eq!(app.tags, vec!["rust".to_string()]);
    }

    #[test]
    fn test_normalize_drops_repeated_tags_keeping_order() {
        let mut input = NewApplication::new("u1", "Acme", "Engineer", "LinkedIn");
        input.tags = ["rust", "go", " rust", "remote", "go"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let app = input.normalize().unwrap();
        assert_eq!(app.tags, vec!["rust", "go", "remote"]);
    }

    #[test]
    fn test_normalize_rejects_short_fields() {
        let err = NewApplication::new("u1", "A", "Engineer", "LinkedIn")
            .normalize()
            .unwrap_err();
        assert!(err.to_string().contains("Company name"));

        let err = NewApplication::new("u1", "Acme", "E", "LinkedIn")
            .normalize()
            .unwrap_err();
        assert!(err.to_string().contains("Title"));

        let err = NewApplication::new("u1", "Acme", "Engineer", " ")
            .normalize()
            .unwrap_err();
        assert!(err.to_string().contains("Source"));
    }

    #[test]
    fn test_normalize_rejects_bad_url() {
        let mut input = NewApplication::new("u1", "Acme", "Engineer", "LinkedIn");
        input.url = Some("not a url".to_string());
        assert!(input.normalize().is_err());

        let mut input = NewApplication::new("u1", "Acme", "Engineer", "LinkedIn");
        input.url = Some("ftp://acme.example/jobs".to_string());
        assert!(input.normalize().is_err());

        let mut input = NewApplication::new("u1", "Acme", "Engineer", "LinkedIn");
        input.url = Some("https://acme.example/jobs/42".to_string());
        assert!(input.normalize().is_ok());
    }
}
