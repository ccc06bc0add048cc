use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::logging;
use crate::models::{Application, ApplicationStatus};
use crate::storage::Storage;

type Alerts = Arc<Mutex<Option<String>>>;

/// A status change already applied locally, waiting for the write.
#[derive(Debug, Clone, PartialEq)]
struct PendingStatus {
    index: usize,
    id: String,
    previous: ApplicationStatus,
    next: ApplicationStatus,
}

struct AppState {
    applications: Vec<Application>,
    selected: usize,
    scroll_offset: u16,
    detail: Option<Application>,
    message: Option<String>,
}

impl AppState {
    fn new(applications: Vec<Application>) -> Self {
        Self {
            applications,
            selected: 0,
            scroll_offset: 0,
            detail: None,
            message: None,
        }
    }

    fn current(&self) -> Option<&Application> {
        self.applications.get(self.selected)
    }

    fn load_detail(&mut self, storage: &Storage) {
        let Some(app) = self.current() else { return };
        let id = app.id.clone();
        self.detail = match storage.get_application_by_id(&id) {
            Ok(detail) => detail,
            Err(e) => {
                self.message = Some(format!("Could not load {}: {}", id, e));
                None
            }
        };
    }

    fn next(&mut self) {
        if !self.applications.is_empty() && self.selected < self.applications.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }

    fn absorb_alert(&mut self, alerts: &Mutex<Option<String>>) {
        if let Some(alert) = alerts.lock().ok().and_then(|mut slot| slot.take()) {
            self.message = Some(alert);
        }
    }

    /// Applies the new status to the local row right away.
    fn begin_status_change(&mut self, next: ApplicationStatus) -> Option<PendingStatus> {
        let index = self.selected;
        let app = self.applications.get_mut(index)?;
        if app.status == next {
            return None;
        }
        let pending = PendingStatus {
            index,
            id: app.id.clone(),
            previous: app.status,
            next,
        };
        app.status = next;
        if let Some(detail) = self.detail.as_mut().filter(|d| d.id == pending.id) {
            detail.status = next;
        }
        Some(pending)
    }

    /// Keeps the optimistic value on success, restores the previous one on failure.
    fn finish_status_change<E: std::fmt::Display>(
        &mut self,
        pending: PendingStatus,
        result: std::result::Result<(), E>,
    ) {
        match result {
            Ok(()) => {
                self.message = Some(format!("Marked as {}", pending.next));
            }
            Err(e) => {
                warn!(id = %pending.id, error = %e, "status update failed, rolling back");
                if let Some(app) = self
                    .applications
                    .get_mut(pending.index)
                    .filter(|a| a.id == pending.id)
                {
                    app.status = pending.previous;
                }
                if let Some(detail) = self.detail.as_mut().filter(|d| d.id == pending.id) {
                    detail.status = pending.previous;
                }
                self.message = Some(format!("Update failed: {}", e));
            }
        }
    }
}

fn status_for_key(code: KeyCode) -> Option<ApplicationStatus> {
    match code {
        KeyCode::Char('a') => Some(ApplicationStatus::Applied),
        KeyCode::Char('v') => Some(ApplicationStatus::Viewed),
        KeyCode::Char('p') => Some(ApplicationStatus::PhoneScreen),
        KeyCode::Char('i') => Some(ApplicationStatus::Interview),
        KeyCode::Char('o') => Some(ApplicationStatus::Offer),
        KeyCode::Char('x') => Some(ApplicationStatus::Rejected),
        KeyCode::Char('w') => Some(ApplicationStatus::Withdrawn),
        _ => None,
    }
}

pub fn run_browse(storage: &Storage, status: Option<ApplicationStatus>) -> Result<()> {
    let applications: Vec<Application> = storage
        .get_applications_list()?
        .into_iter()
        .filter(|a| status.is_none_or(|s| a.status == s))
        .collect();
    if applications.is_empty() {
        println!("No applications found.");
        return Ok(());
    }

    // Nothing may write to stderr while the alternate screen is up.
    let alerts: Alerts = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&alerts);
    let _capture = storage.emitter().capture(move |denied| {
        if let Ok(mut slot) = sink.lock() {
            *slot = Some(format!("Permission denied: {} on {}", denied.operation, denied.path));
        }
    });
    let _logs = logging::hold();

    let mut state = AppState::new(applications);
    state.load_detail(storage);
    state.absorb_alert(&alerts);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, storage, &alerts);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    storage: &Storage,
    alerts: &Alerts,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let prev_selected = state.selected;
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => state.next(),
                KeyCode::Up | KeyCode::Char('k') => state.prev(),
                KeyCode::Char('J') | KeyCode::PageDown => state.scroll_down(),
                KeyCode::Char('K') | KeyCode::PageUp => state.scroll_up(),
                code => {
                    if let Some(next) = status_for_key(code) {
                        change_status(state, storage, next, |state| {
                            terminal.draw(|frame| draw(frame, state, &mut list_state))?;
                            Ok(())
                        })?;
                    }
                }
            }
            if state.selected != prev_selected {
                list_state.select(Some(state.selected));
                state.message = None;
                state.load_detail(storage);
            }
            state.absorb_alert(alerts);
        }
    }
    Ok(())
}

/// Optimistic status change: `show` renders the new status before the
/// write, a failed write rolls the row back.
fn change_status<F>(
    state: &mut AppState,
    storage: &Storage,
    next: ApplicationStatus,
    mut show: F,
) -> Result<()>
where
    F: FnMut(&AppState) -> Result<()>,
{
    let Some(pending) = state.begin_status_change(next) else {
        return Ok(());
    };
    show(state)?;
    let result = storage
        .update_application_status(&pending.id, next)
        .map(|_| ());
    let succeeded = result.is_ok();
    state.finish_status_change(pending, result);
    if succeeded {
        state.load_detail(storage);
    }
    Ok(())
}

fn status_style(status: ApplicationStatus) -> Style {
    match status {
        ApplicationStatus::Applied => Style::default().fg(Color::Blue),
        ApplicationStatus::Viewed => Style::default().fg(Color::Gray),
        ApplicationStatus::PhoneScreen => Style::default().fg(Color::Magenta),
        ApplicationStatus::Interview => Style::default().fg(Color::Yellow),
        ApplicationStatus::Offer => Style::default().fg(Color::Green),
        ApplicationStatus::Rejected => Style::default().fg(Color::Red),
        ApplicationStatus::Withdrawn => Style::default().fg(Color::DarkGray),
    }
}

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[0]);

    // Left panel: applications
    let items: Vec<ListItem> = state
        .applications
        .iter()
        .map(|app| {
            ListItem::new(Line::from(vec![
                Span::styled(format!("{:<12} ", app.status), status_style(app.status)),
                Span::raw(format!("{} | {}", crate::truncate(&app.title, 28), app.company_name)),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            " Applications ({}) ", state.applications.len()
        )))
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: detail
    let detail_widget = Paragraph::new(build_detail(state))
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));
    frame.render_widget(detail_widget, chunks[1]);

    let footer = match &state.message {
        Some(msg) => Paragraph::new(format!(" {}", msg)).style(Style::default().fg(Color::Yellow)),
        None => Paragraph::new(
            " j/k:navigate  J/K:scroll  a:applied v:viewed p:phone i:interview o:offer x:rejected w:withdrawn  q:quit",
        )
        .style(Style::default().fg(Color::DarkGray)),
    };
    frame.render_widget(footer, rows[1]);
}

fn build_detail(state: &AppState) -> Text<'_> {
    let Some(app) = state.current() else {
        return Text::raw("No application selected");
    };
    // The list row carries the freshest status; the rest comes from the detail fetch.
    let full = state.detail.as_ref().filter(|d| d.id == app.id);

    let mut lines: Vec<Line> = Vec::new();
    lines.push(Line::from(Span::styled(
        app.title.as_str(),
        Style::default().add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(format!("at {}", app.company_name)));
    lines.push(Line::from(Span::styled(
        format!("Status: {}", app.status),
        status_style(app.status),
    )));
    lines.push(Line::from(format!("Source: {}", app.source_name)));
    lines.push(Line::from(format!(
        "Applied: {}",
        app.applied_at.with_timezone(&chrono::Local).format("%Y-%m-%d")
    )));
    if let Some(location) = &app.location {
        lines.push(Line::from(format!("Location: {}", location)));
    }
    if let Some(salary) = &app.salary {
        lines.push(Line::from(format!("Salary: {}", salary)));
    }
    if let Some(url) = &app.url {
        lines.push(Line::from(format!("URL: {}", url)));
    }
    if !app.tags.is_empty() {
        lines.push(Line::from(format!("Tags: {}", app.tags.join(", "))));
    }
    lines.push(Line::from(""));

    let Some(full) = full else {
        return Text::from(lines);
    };

    if !full.notes.is_empty() {
        lines.push(Line::from(Span::styled(
            "NOTES",
            Style::default().add_modifier(Modifier::BOLD),
        )));
        for note in &full.notes {
            lines.push(Line::from(Span::styled(
                format!("  {}", note.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")),
                Style::default().fg(Color::DarkGray),
            )));
            for line in textwrap::fill(&note.text, 70).lines() {
                lines.push(Line::from(format!("    {}", line)));
            }
        }
        lines.push(Line::from(""));
    }

    lines.push(Line::from(Span::styled(
        "TIMELINE",
        Style::default().add_modifier(Modifier::BOLD),
    )));
    for event in full.events.iter().rev() {
        lines.push(Line::from(format!(
            "  {}  {}",
            event.occurred_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            event.display_type()
        )));
        if let Some(note) = event.note() {
            lines.push(Line::from(Span::styled(
                format!("      {}", note),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }

    Text::from(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Session;
    use crate::db::Database;
    use crate::errors::ErrorEmitter;
    use crate::models::NewApplication;
    use chrono::Utc;

    fn session(user_id: &str) -> Session {
        Session {
            user_id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            display_name: None,
            signed_in_at: Utc::now(),
        }
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn app(id: &str, status: ApplicationStatus) -> Application {
        let now = Utc::now();
        Application {
            id: id.to_string(),
            user_id: "alice".to_string(),
            company_name: "Acme".to_string(),
            title: "Engineer".to_string(),
            source_name: "LinkedIn".to_string(),
            applied_at: now,
            status,
            location: None,
            salary: None,
            url: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            notes: Vec::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn test_status_change_applies_immediately() {
        let mut state = AppState::new(vec![app("a", ApplicationStatus::Applied)]);
        let pending = state.begin_status_change(ApplicationStatus::Interview).unwrap();
        assert_eq!(state.applications[0].status, ApplicationStatus::Interview);
        assert_eq!(pending.previous, ApplicationStatus::Applied);

        state.finish_status_change::<String>(pending, Ok(()));
        assert_eq!(state.applications[0].status, ApplicationStatus::Interview);
        assert_eq!(state.message.as_deref(), Some("Marked as INTERVIEW"));
    }

    #[test]
    fn test_status_change_rolls_back_on_failure() {
        let mut state = AppState::new(vec![
            app("a", ApplicationStatus::Applied),
            app("b", ApplicationStatus::Viewed),
        ]);
        state.next();
        state.detail = Some(app("b", ApplicationStatus::Viewed));

        let pending = state.begin_status_change(ApplicationStatus::Offer).unwrap();
        assert_eq!(state.applications[1].status, ApplicationStatus::Offer);
        assert_eq!(state.detail.as_ref().unwrap().status, ApplicationStatus::Offer);

        state.finish_status_change(pending, Err("permission denied"));
        assert_eq!(state.applications[1].status, ApplicationStatus::Viewed);
        assert_eq!(state.detail.as_ref().unwrap().status, ApplicationStatus::Viewed);
        assert_eq!(state.applications[0].status, ApplicationStatus::Applied);
        assert!(state.message.as_deref().unwrap().contains("permission denied"));
    }

    #[test]
    fn test_same_status_is_not_a_change() {
        let mut state = AppState::new(vec![app("a", ApplicationStatus::Offer)]);
        assert!(state.begin_status_change(ApplicationStatus::Offer).is_none());
    }

    #[test]
    fn test_navigation_bounds() {
        let mut state = AppState::new(vec![
            app("a", ApplicationStatus::Applied),
            app("b", ApplicationStatus::Applied),
        ]);
        state.prev();
        assert_eq!(state.selected, 0);
        state.next();
        state.next();
        assert_eq!(state.selected, 1);
        state.scroll_down();
        assert_eq!(state.scroll_offset, 3);
        state.prev();
        assert_eq!(state.scroll_offset, 0);
    }

    #[test]
    fn test_status_keys() {
        assert_eq!(status_for_key(KeyCode::Char('p')), Some(ApplicationStatus::PhoneScreen));
        assert_eq!(status_for_key(KeyCode::Char('w')), Some(ApplicationStatus::Withdrawn));
        assert_eq!(status_for_key(KeyCode::Char('z')), None);
    }

    #[test]
    fn test_change_status_persists_and_shows_first() {
        let db = setup();
        let emitter = ErrorEmitter::new();
        let alice = session("alice");
        let storage = Storage::new(&db, Some(&alice), &emitter);
        storage
            .save_application(NewApplication::new("", "Acme", "Engineer", "LinkedIn"))
            .unwrap();

        let mut state = AppState::new(storage.get_applications_list().unwrap());
        let mut shown = Vec::new();
        change_status(&mut state, &storage, ApplicationStatus::Interview, |s| {
            shown.push(s.applications[0].status);
            Ok(())
        })
        .unwrap();

        assert_eq!(shown, vec![ApplicationStatus::Interview]);
        let stored = storage.get_applications_list().unwrap();
        assert_eq!(stored[0].status, ApplicationStatus::Interview);
        assert_eq!(state.detail.as_ref().unwrap().events.len(), 2);
    }

    #[test]
    fn test_change_status_rolls_back_when_application_is_gone() {
        let db = setup();
        let emitter = ErrorEmitter::new();
        let alice = session("alice");
        let storage = Storage::new(&db, Some(&alice), &emitter);
        let app = storage
            .save_application(NewApplication::new("", "Acme", "Engineer", "LinkedIn"))
            .unwrap();

        let mut state = AppState::new(storage.get_applications_list().unwrap());
        state.load_detail(&storage);
        storage.delete_application(&app.id).unwrap();

        let mut shown = Vec::new();
        change_status(&mut state, &storage, ApplicationStatus::Offer, |s| {
            shown.push(s.applications[0].status);
            Ok(())
        })
        .unwrap();

        assert_eq!(shown, vec![ApplicationStatus::Offer]);
        assert_eq!(state.applications[0].status, ApplicationStatus::Applied);
        assert_eq!(state.detail.as_ref().unwrap().status, ApplicationStatus::Applied);
        assert!(state.message.as_deref().unwrap().starts_with("Update failed"));
    }

    #[test]
    fn test_permission_error_lands_in_footer_not_outer_listeners() {
        let db = setup();
        let emitter = ErrorEmitter::new();
        let outer_calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&outer_calls);
        emitter.on(move |_| *counter.lock().unwrap() += 1);

        let bob = session("bob");
        let foreign = Storage::new(&db, Some(&bob), &emitter)
            .save_application(NewApplication::new("", "Initech", "Engineer", "Indeed"))
            .unwrap();

        let alice = session("alice");
        let storage = Storage::new(&db, Some(&alice), &emitter);
        let alerts: Alerts = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&alerts);
        let capture = storage.emitter().capture(move |denied| {
            *sink.lock().unwrap() = Some(format!("Permission denied: {} on {}", denied.operation, denied.path));
        });

        let mut state = AppState::new(vec![foreign.clone()]);
        change_status(&mut state, &storage, ApplicationStatus::Offer, |_| Ok(())).unwrap();
        state.absorb_alert(&alerts);

        assert_eq!(state.applications[0].status, ApplicationStatus::Applied);
        assert_eq!(
            state.message.as_deref(),
            Some(format!("Permission denied: update on applications/{}", foreign.id).as_str())
        );
        assert_eq!(*outer_calls.lock().unwrap(), 0);

        drop(capture);
        assert_eq!(emitter.listener_count(), 1);
    }
}
