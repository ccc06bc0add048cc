use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::models::{Application, ApplicationEvent};

/// An event plus the application it belongs to.
#[derive(Debug, Clone)]
pub struct CalendarEntry {
    pub event: ApplicationEvent,
    pub application_title: String,
    pub company_name: String,
}

/// Groups events by calendar day in `tz`, days ascending, events ascending
/// within a day. Events whose application is not in `applications` are dropped.
pub fn group_by_day<Tz: TimeZone>(
    applications: &[Application],
    events: Vec<ApplicationEvent>,
    tz: &Tz,
    since: Option<DateTime<Utc>>,
) -> BTreeMap<NaiveDate, Vec<CalendarEntry>> {
    let apps: HashMap<&str, &Application> =
        applications.iter().map(|a| (a.id.as_str(), a)).collect();

    let mut entries: Vec<CalendarEntry> = events
        .into_iter()
        .filter(|e| since.is_none_or(|s| e.occurred_at >= s))
        .filter_map(|event| {
            let app = apps.get(event.application_id.as_str())?;
            Some(CalendarEntry {
                application_title: app.title.clone(),
                company_name: app.company_name.clone(),
                event,
            })
        })
        .collect();
    entries.sort_by_key(|e| e.event.occurred_at);

    let mut days: BTreeMap<NaiveDate, Vec<CalendarEntry>> = BTreeMap::new();
    for entry in entries {
        let day = entry.event.occurred_at.with_timezone(tz).date_naive();
        days.entry(day).or_default().push(entry);
    }
    days
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApplicationStatus;
    use chrono::FixedOffset;
    use serde_json::Map;

    fn app(id: &str, title: &str, company: &str) -> Application {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Application {
            id: id.to_string(),
            user_id: "alice".to_string(),
            company_name: company.to_string(),
            title: title.to_string(),
            source_name: "LinkedIn".to_string(),
            applied_at: at,
            status: ApplicationStatus::Applied,
            location: None,
            salary: None,
            url: None,
            tags: Vec::new(),
            created_at: at,
            updated_at: at,
            notes: Vec::new(),
            events: Vec::new(),
        }
    }

    fn event(id: &str, app_id: &str, at: DateTime<Utc>) -> ApplicationEvent {
        ApplicationEvent {
            id: id.to_string(),
            application_id: app_id.to_string(),
            event_type: "interview_scheduled".to_string(),
            occurred_at: at,
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_groups_sorted_by_day_and_time() {
        let apps = vec![app("a", "SRE", "Acme"), app("b", "Backend", "Globex")];
        let events = vec![
            event("e3", "b", Utc.with_ymd_and_hms(2024, 2, 2, 9, 0, 0).unwrap()),
            event("e1", "a", Utc.with_ymd_and_hms(2024, 2, 1, 15, 0, 0).unwrap()),
            event("e2", "a", Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()),
            event("orphan", "zzz", Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap()),
        ];

        let days = group_by_day(&apps, events, &Utc, None);
        let keys: Vec<String> = days.keys().map(|d| d.to_string()).collect();
        assert_eq!(keys, vec!["2024-02-01", "2024-02-02"]);

        let first: Vec<&str> = days.values().next().unwrap().iter().map(|e| e.event.id.as_str()).collect();
        assert_eq!(first, vec!["e2", "e1"]);

        let last = &days.values().last().unwrap()[0];
        assert_eq!(last.application_title, "Backend");
        assert_eq!(last.company_name, "Globex");
    }

    #[test]
    fn test_day_follows_timezone() {
        let apps = vec![app("a", "SRE", "Acme")];
        let events = vec![event("e1", "a", Utc.with_ymd_and_hms(2024, 2, 1, 23, 30, 0).unwrap())];
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let days = group_by_day(&apps, events, &plus_two, None);
        assert_eq!(days.keys().next().unwrap().to_string(), "2024-02-02");
    }

    #[test]
    fn test_since_filters_past_events() {
        let apps = vec![app("a", "SRE", "Acme")];
        let events = vec![
            event("old", "a", Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()),
            event("new", "a", Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()),
        ];
        let since = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();
        let days = group_by_day(&apps, events, &Utc, Some(since));
        assert_eq!(days.len(), 1);
        assert_eq!(days.values().next().unwrap()[0].event.id, "new");
    }
}
