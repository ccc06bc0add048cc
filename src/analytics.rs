use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone};
use serde::Serialize;
use std::collections::HashMap;

use crate::models::{
    Application, ApplicationEvent, ApplicationStatus, EVENT_FIRST_RESPONSE, EVENT_STATUS_CHANGED,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Funnel {
    pub applied: usize,
    pub viewed: usize,
    pub interview: usize,
    pub offer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeekCount {
    /// Monday of the week.
    pub week: NaiveDate,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub total: usize,
    pub offers: usize,
    pub offer_rate: String,
    pub active: usize,
    pub avg_hours_to_first_response: Option<f64>,
    pub applications_by_source: Vec<SourceCount>,
    pub funnel: Funnel,
    pub weekly_series: Vec<WeekCount>,
}

/// Longest activity chart, ten years.
pub const MAX_WEEKS: usize = 520;

// Funnel stages, ordered.
const STAGE_APPLIED: u8 = 0;
const STAGE_VIEWED: u8 = 1;
const STAGE_INTERVIEW: u8 = 2;
const STAGE_OFFER: u8 = 3;

fn status_stage(status: ApplicationStatus) -> u8 {
    match status {
        ApplicationStatus::Viewed => STAGE_VIEWED,
        ApplicationStatus::PhoneScreen | ApplicationStatus::Interview => STAGE_INTERVIEW,
        ApplicationStatus::Offer => STAGE_OFFER,
        ApplicationStatus::Applied | ApplicationStatus::Rejected | ApplicationStatus::Withdrawn => {
            STAGE_APPLIED
        }
    }
}

fn event_stage(event: &ApplicationEvent) -> u8 {
    match event.event_type.as_str() {
        "viewed" => STAGE_VIEWED,
        "phone_screen_scheduled" | "online_assessment" | "technical_interview" | "hr_interview"
        | "interview_scheduled" => STAGE_INTERVIEW,
        "offer" => STAGE_OFFER,
        EVENT_STATUS_CHANGED => event
            .metadata
            .get("to")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<ApplicationStatus>().ok())
            .map(status_stage)
            .unwrap_or(STAGE_APPLIED),
        _ => STAGE_APPLIED,
    }
}

/// Aggregates the dashboard for one user. `events` may contain events of
/// other applications; they are matched by application id.
pub fn build_dashboard<Tz: TimeZone>(
    applications: &[Application],
    events: &[ApplicationEvent],
    now: &DateTime<Tz>,
    weeks: usize,
) -> Dashboard {
    let mut by_app: HashMap<&str, Vec<&ApplicationEvent>> = HashMap::new();
    for event in events {
        by_app.entry(event.application_id.as_str()).or_default().push(event);
    }

    let total = applications.len();
    let offers = applications
        .iter()
        .filter(|a| a.status == ApplicationStatus::Offer)
        .count();
    let active = applications.iter().filter(|a| a.status.is_active()).count();
    let offer_rate = if total > 0 {
        format!("{:.1}%", offers as f64 / total as f64 * 100.0)
    } else {
        "0%".to_string()
    };

    Dashboard {
        total,
        offers,
        offer_rate,
        active,
        avg_hours_to_first_response: avg_hours_to_first_response(applications, &by_app),
        applications_by_source: applications_by_source(applications),
        funnel: funnel(applications, &by_app),
        weekly_series: weekly_series(applications, now, weeks),
    }
}

fn applications_by_source(applications: &[Application]) -> Vec<SourceCount> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for app in applications {
        *counts.entry(app.source_name.trim()).or_insert(0) += 1;
    }
    let mut result: Vec<SourceCount> = counts
        .into_iter()
        .map(|(source, count)| SourceCount {
            source: source.to_string(),
            count,
        })
        .collect();
    result.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
    result
}

fn funnel(applications: &[Application], by_app: &HashMap<&str, Vec<&ApplicationEvent>>) -> Funnel {
    let mut funnel = Funnel::default();
    for app in applications {
        let furthest = by_app
            .get(app.id.as_str())
            .into_iter()
            .flatten()
            .map(|e| event_stage(e))
            .chain(std::iter::once(status_stage(app.status)))
            .max()
            .unwrap_or(STAGE_APPLIED);

        funnel.applied += 1;
        if furthest >= STAGE_VIEWED {
            funnel.viewed += 1;
        }
        if furthest >= STAGE_INTERVIEW {
            funnel.interview += 1;
        }
        if furthest >= STAGE_OFFER {
            funnel.offer += 1;
        }
    }
    funnel
}

fn avg_hours_to_first_response(
    applications: &[Application],
    by_app: &HashMap<&str, Vec<&ApplicationEvent>>,
) -> Option<f64> {
    let hours: Vec<f64> = applications
        .iter()
        .filter_map(|app| {
            let first = by_app
                .get(app.id.as_str())?
                .iter()
                .filter(|e| e.event_type == EVENT_FIRST_RESPONSE)
                .map(|e| e.occurred_at)
                .min()?;
            Some((first - app.applied_at).num_minutes() as f64 / 60.0)
        })
        .collect();

    if hours.is_empty() {
        None
    } else {
        Some(hours.iter().sum::<f64>() / hours.len() as f64)
    }
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Applications per Monday-based week, oldest first, ending with the week of `now`.
/// At most [`MAX_WEEKS`] weeks.
fn weekly_series<Tz: TimeZone>(
    applications: &[Application],
    now: &DateTime<Tz>,
    weeks: usize,
) -> Vec<WeekCount> {
    let tz = now.timezone();
    let current = week_start(now.date_naive());
    let mut series: Vec<WeekCount> = (0..weeks.min(MAX_WEEKS))
        .map_while(|i| current.checked_sub_signed(Duration::weeks(i as i64)))
        .map(|week| WeekCount { week, count: 0 })
        .collect();
    series.reverse();

    for app in applications {
        let week = week_start(app.applied_at.with_timezone(&tz).date_naive());
        if let Some(slot) = series.iter_mut().find(|w| w.week == week) {
            slot.count += 1;
        }
    }
    series
}
