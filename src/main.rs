mod ai;
mod analytics;
mod auth;
mod calendar;
mod config;
mod db;
mod email;
mod errors;
mod logging;
mod models;
mod storage;
mod tui;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, warn};

use ai::AnalyticsSqlInput;
use auth::{Session, SessionStore};
use config::Config;
use db::Database;
use errors::{ErrorEmitter, StoreError};
use models::{ApplicationStatus, NewApplication, EVENT_TYPES};
use storage::Storage;

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(about = "Job application tracker - log applications, follow them through the funnel")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Sign in with an email address
    Login {
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Sign out
    Logout,

    /// Show the signed-in user
    Whoami,

    /// Show or update profile settings
    Settings {
        /// New display name (empty string clears it)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Show KPIs, sources, funnel and weekly activity
    Dashboard {
        /// Number of weeks in the activity chart
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..=analytics::MAX_WEEKS as i64))]
        weeks: Option<u16>,
    },

    /// List applications
    List {
        /// Filter by status (applied, viewed, phone_screen, interview, offer, rejected, withdrawn)
        #[arg(short, long)]
        status: Option<ApplicationStatus>,

        /// Filter by source
        #[arg(long)]
        source: Option<String>,
    },

    /// Show application details, notes and timeline
    Show {
        /// Application ID
        id: String,
    },

    /// Add an application
    Add {
        /// Company name
        #[arg(short, long)]
        company: String,

        /// Job title
        #[arg(short, long)]
        title: String,

        /// Where the posting was found (LinkedIn, Referral, ...)
        #[arg(short, long)]
        source: String,

        /// Application date (YYYY-MM-DD or RFC 3339), defaults to now
        #[arg(long)]
        applied: Option<String>,

        /// Initial status
        #[arg(long, default_value = "applied")]
        status: ApplicationStatus,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        salary: Option<String>,

        /// Link to the posting
        #[arg(long)]
        url: Option<String>,

        /// Tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Initial note
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Delete an application with its notes and events
    Delete {
        /// Application ID
        id: String,
    },

    /// Change the status of an application
    Status {
        /// Application ID
        id: String,

        status: ApplicationStatus,
    },

    /// Record an event on an application
    Event {
        /// Application ID
        id: String,

        /// Event type (viewed, first_response, technical_interview, ...)
        #[arg(value_name = "TYPE")]
        event_type: String,

        /// When it happened (YYYY-MM-DD, "YYYY-MM-DD HH:MM" or RFC 3339), defaults to now
        #[arg(long)]
        at: Option<String>,

        /// Note shown with the event
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Add a note to an application
    Note {
        /// Application ID
        id: String,

        text: String,
    },

    /// Show events grouped by day
    Calendar {
        /// Only events from now on
        #[arg(long)]
        upcoming: bool,
    },

    /// Extract application details from an email
    ParseEmail {
        /// Pasted text or .eml file (reads stdin when omitted)
        file: Option<PathBuf>,

        /// Save the result as a new application
        #[arg(long)]
        save: bool,

        /// Model (claude-sonnet, claude-haiku, api-sonnet, api-haiku, gpt-4o, gpt-4o-mini)
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Generate analytics SQL for a relational copy of the data
    AnalyticsSql {
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        table_name: Option<String>,

        #[arg(long)]
        user_id_field: Option<String>,

        #[arg(long)]
        source_name_field: Option<String>,

        #[arg(long)]
        status_field: Option<String>,

        #[arg(long)]
        applied_at_field: Option<String>,

        #[arg(long)]
        first_response_event_name: Option<String>,

        #[arg(long)]
        application_event_table: Option<String>,

        #[arg(long)]
        application_id_field: Option<String>,

        #[arg(long)]
        occurred_at_field: Option<String>,

        #[arg(long)]
        event_type_field: Option<String>,
    },

    /// Browse applications interactively
    Browse {
        /// Only show applications with this status
        #[arg(short, long)]
        status: Option<ApplicationStatus>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Permission errors were already rendered by the emitter listener.
            let already_reported = e
                .downcast_ref::<StoreError>()
                .and_then(StoreError::permission_denied)
                .is_some();
            if !already_reported {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    debug!(db = %config.db_path.display(), model = %config.model, "configuration loaded");

    let sessions = SessionStore::new(config.session_path.clone());
    let emitter = ErrorEmitter::new();
    emitter.on(|denied| {
        eprintln!("Permission Denied");
        eprintln!("  operation: {}", denied.operation);
        eprintln!("  path:      {}", denied.path);
        if let Some(resource) = &denied.resource {
            let json = serde_json::to_string_pretty(resource).unwrap_or_default();
            eprintln!("  resource:  {}", json.replace('\n', "\n             "));
        }
    });
    debug!(listeners = emitter.listener_count(), "permission error listener registered");

    match cli.command {
        Commands::Init => {
            let db = Database::open(&config.db_path)?;
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Login { email, name } => {
            let session = sessions.login(&email, name.as_deref())?;
            println!("Signed in as {}", session.email);
        }

        Commands::Logout => {
            if sessions.logout()? {
                println!("Signed out.");
            } else {
                println!("Not signed in.");
            }
        }

        Commands::Whoami => match sessions.current()? {
            Some(session) => print_session(&session),
            None => println!("Not signed in."),
        },

        Commands::Settings { name } => {
            let session = match name {
                Some(name) => {
                    let session = sessions.update_profile(Some(&name))?;
                    println!("Profile updated.");
                    session
                }
                None => require_session(&sessions)?,
            };
            print_session(&session);
            println!("Session:  {}", sessions.path().display());
            println!("Database: {}", config.db_path.display());
            println!("Model:    {}", config.model);
        }

        Commands::Dashboard { weeks } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            let apps = storage.get_applications_list()?;
            let events = storage.get_all_events()?;
            let weeks = weeks.map(usize::from).unwrap_or(config.dashboard_weeks);
            let dash = analytics::build_dashboard(&apps, &events, &Local::now(), weeks);
            print_dashboard(&dash);
        }

        Commands::List { status, source } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            let source = source.map(|s| s.to_lowercase());
            let apps: Vec<_> = storage
                .get_applications_list()?
                .into_iter()
                .filter(|a| status.is_none_or(|s| a.status == s))
                .filter(|a| {
                    source
                        .as_deref()
                        .is_none_or(|s| a.source_name.to_lowercase().contains(s))
                })
                .collect();

            if apps.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<22} {:<11} {:<13} {:<28} {:<20} {:<12}",
                    "ID", "APPLIED", "STATUS", "TITLE", "COMPANY", "SOURCE"
                );
                println!("{}", "-".repeat(110));
                for app in apps {
                    println!(
                        "{:<22} {:<11} {:<13} {:<28} {:<20} {:<12}",
                        app.id,
                        app.applied_at.with_timezone(&Local).format("%Y-%m-%d"),
                        app.status,
                        truncate(&app.title, 26),
                        truncate(&app.company_name, 18),
                        truncate(&app.source_name, 12)
                    );
                }
            }
        }

        Commands::Show { id } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            match storage.get_application_by_id(&id)? {
                Some(app) => {
                    println!("Application {}", app.id);
                    println!("Title:    {}", app.title);
                    println!("Company:  {}", app.company_name);
                    println!("Status:   {}", app.status);
                    println!("Source:   {}", app.source_name);
                    println!("Applied:  {}", format_local(app.applied_at));
                    if let Some(location) = &app.location {
                        println!("Location: {}", location);
                    }
                    if let Some(salary) = &app.salary {
                        println!("Salary:   {}", salary);
                    }
                    if let Some(url) = &app.url {
                        println!("URL:      {}", url);
                    }
                    if !app.tags.is_empty() {
                        println!("Tags:     {}", app.tags.join(", "));
                    }
                    println!("Updated:  {}", format_local(app.updated_at));

                    if !app.notes.is_empty() {
                        println!("\n--- Notes ---");
                        for note in &app.notes {
                            println!("[{}]", format_local(note.created_at));
                            println!("{}\n", textwrap::fill(&note.text, 80));
                        }
                    }

                    println!("\n--- Timeline ---");
                    for event in app.events.iter().rev() {
                        match event.note() {
                            Some(note) => println!(
                                "{}  {} - {}",
                                format_local(event.occurred_at),
                                event.display_type(),
                                note
                            ),
                            None => println!(
                                "{}  {}",
                                format_local(event.occurred_at),
                                event.display_type()
                            ),
                        }
                    }
                }
                None => println!("Application {} not found.", id),
            }
        }

        Commands::Add {
            company,
            title,
            source,
            applied,
            status,
            location,
            salary,
            url,
            tags,
            note,
        } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);

            let mut new = NewApplication::new(&session.user_id, &company, &title, &source);
            if let Some(applied) = applied {
                new.applied_at = parse_when(&applied)?;
            }
            new.status = status;
            new.location = location;
            new.salary = salary;
            new.url = url;
            new.tags = tags;
            new.note = note;

            let existing = storage.get_applications_list()?;
            if let Some(similar) = email::find_similar(&existing, &company, &title) {
                println!(
                    "Note: looks similar to {} ({} at {})",
                    similar.id, similar.title, similar.company_name
                );
            }

            let app = storage.save_application(new)?;
            println!("Added application {} ({} at {})", app.id, app.title, app.company_name);
        }

        Commands::Delete { id } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            if storage.delete_application(&id)? {
                println!("Deleted application {}.", id);
            } else {
                println!("Application {} not found.", id);
            }
        }

        Commands::Status { id, status } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            match not_found_as_none(storage.update_application_status(&id, status))? {
                Some(Some(_)) => println!("Marked {} as {}.", id, status),
                Some(None) => println!("Application {} is already {}.", id, status),
                None => println!("Application {} not found.", id),
            }
        }

        Commands::Event {
            id,
            event_type,
            at,
            note,
        } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);

            let occurred_at = match at {
                Some(at) => parse_when(&at)?,
                None => Utc::now(),
            };
            let event_type = event_type.trim().to_lowercase();
            if !EVENT_TYPES.contains(&event_type.as_str()) {
                warn!(event_type = %event_type, "recording a custom event type");
            }
            let mut metadata = Map::new();
            if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
                metadata.insert("note".to_string(), Value::String(note));
            }

            match not_found_as_none(storage.add_application_event(
                &id,
                &event_type,
                occurred_at,
                metadata,
            ))? {
                Some(event) => println!(
                    "Recorded {} on {} at {}.",
                    event.display_type(),
                    id,
                    format_local(event.occurred_at)
                ),
                None => println!("Application {} not found.", id),
            }
        }

        Commands::Note { id, text } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            match not_found_as_none(storage.add_note(&id, &text))? {
                Some(note) => println!("Added note {} to {}.", note.id, id),
                None => println!("Application {} not found.", id),
            }
        }

        Commands::Calendar { upcoming } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            let apps = storage.get_applications_list()?;
            let events = storage.get_all_events()?;
            let since = upcoming.then(Utc::now);
            let days = calendar::group_by_day(&apps, events, &Local, since);

            if days.is_empty() {
                println!("No events found.");
            }
            for (day, entries) in days {
                println!("{}", day.format("%Y-%m-%d (%A)"));
                for entry in entries {
                    println!(
                        "  {}  {:<22} {} at {}",
                        entry.event.occurred_at.with_timezone(&Local).format("%H:%M"),
                        entry.event.display_type(),
                        truncate(&entry.application_title, 30),
                        entry.company_name
                    );
                    if let Some(note) = entry.event.note() {
                        println!("         {}", note);
                    }
                }
                println!();
            }
        }

        Commands::ParseEmail { file, save, model } => {
            let raw = match &file {
                Some(path) => std::fs::read(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("Failed to read email from stdin")?;
                    buf
                }
            };
            let text = email::prepare_email_text(&raw)?;

            let spec = ai::resolve_model(model.as_deref().unwrap_or(&config.model))?;
            let provider = ai::create_provider(&spec)?;
            let parsed = ai::parse_application_email(provider.as_ref(), &text)?;

            println!("Company:        {}", parsed.company);
            println!("Title:          {}", parsed.title);
            println!("Applied at:     {}", parsed.applied_at);
            println!("URL:            {}", parsed.url.as_deref().unwrap_or("-"));
            println!(
                "Application ID: {}",
                parsed.application_id.as_deref().unwrap_or("-")
            );

            if save {
                let session = require_session(&sessions)?;
                let db = open_db(&config)?;
                let storage = Storage::new(&db, Some(&session), &emitter);

                let existing = storage.get_applications_list()?;
                if let Some(similar) = email::find_similar(&existing, &parsed.company, &parsed.title) {
                    println!(
                        "\nNote: looks similar to {} ({} at {})",
                        similar.id, similar.title, similar.company_name
                    );
                }

                let mut new =
                    NewApplication::new(&session.user_id, &parsed.company, &parsed.title, "Email");
                new.applied_at = parse_when(&parsed.applied_at).unwrap_or_else(|_| {
                    warn!(applied_at = %parsed.applied_at, "unparseable date, using now");
                    Utc::now()
                });
                new.url = parsed.url.clone();
                new.note = parsed
                    .application_id
                    .as_ref()
                    .map(|id| format!("Application ID: {}", id));

                let app = storage.save_application(new)?;
                println!("\nSaved application {}", app.id);
            }
        }

        Commands::AnalyticsSql {
            model,
            table_name,
            user_id_field,
            source_name_field,
            status_field,
            applied_at_field,
            first_response_event_name,
            application_event_table,
            application_id_field,
            occurred_at_field,
            event_type_field,
        } => {
            let defaults = AnalyticsSqlInput::default();
            let input = AnalyticsSqlInput {
                table_name: table_name.unwrap_or(defaults.table_name),
                user_id_field: user_id_field.unwrap_or(defaults.user_id_field),
                source_name_field: source_name_field.unwrap_or(defaults.source_name_field),
                status_field: status_field.unwrap_or(defaults.status_field),
                applied_at_field: applied_at_field.unwrap_or(defaults.applied_at_field),
                first_response_event_name: first_response_event_name
                    .unwrap_or(defaults.first_response_event_name),
                application_event_table: application_event_table
                    .unwrap_or(defaults.application_event_table),
                application_id_field: application_id_field.unwrap_or(defaults.application_id_field),
                occurred_at_field: occurred_at_field.unwrap_or(defaults.occurred_at_field),
                event_type_field: event_type_field.unwrap_or(defaults.event_type_field),
            };

            let spec = ai::resolve_model(model.as_deref().unwrap_or(&config.model))?;
            let provider = ai::create_provider(&spec)?;
            let sql = ai::generate_analytics_sql(provider.as_ref(), &input)?;

            println!("-- Applications by source\n{}\n", sql.applications_by_source);
            println!("-- Funnel counts\n{}\n", sql.funnel_counts);
            println!("-- Average time to first response\n{}\n", sql.avg_time_to_first_response);
            println!("-- Applications per week\n{}", sql.applications_per_week);
        }

        Commands::Browse { status } => {
            let session = require_session(&sessions)?;
            let db = open_db(&config)?;
            let storage = Storage::new(&db, Some(&session), &emitter);
            tui::run_browse(&storage, status)?;
        }
    }

    Ok(())
}

fn open_db(config: &Config) -> Result<Database> {
    let db = Database::open(&config.db_path)?;
    db.ensure_initialized()?;
    Ok(db)
}

fn require_session(sessions: &SessionStore) -> Result<Session> {
    sessions.current()?.ok_or_else(|| StoreError::Unauthenticated.into())
}

fn not_found_as_none<T>(result: db::StoreResult<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn print_session(session: &Session) {
    println!("Email:    {}", session.email);
    println!("Name:     {}", session.display_name.as_deref().unwrap_or("-"));
    println!("User ID:  {}", session.user_id);
    println!("Since:    {}", format_local(session.signed_in_at));
}

fn print_dashboard(dash: &analytics::Dashboard) {
    println!("Total applications: {}", dash.total);
    println!("Active:             {}", dash.active);
    println!("Offers:             {} ({})", dash.offers, dash.offer_rate);
    match dash.avg_hours_to_first_response {
        Some(hours) if hours >= 48.0 => {
            println!("Avg first response: {:.1} days", hours / 24.0)
        }
        Some(hours) => println!("Avg first response: {:.1} hours", hours),
        None => println!("Avg first response: -"),
    }

    println!("\nBy source");
    let max = dash
        .applications_by_source
        .iter()
        .map(|s| s.count)
        .max()
        .unwrap_or(0);
    for source in &dash.applications_by_source {
        println!(
            "  {:<18} {:>4} {}",
            truncate(&source.source, 18),
            source.count,
            bar(source.count, max)
        );
    }

    println!("\nFunnel");
    let funnel = &dash.funnel;
    for (label, count) in [
        ("Applied", funnel.applied),
        ("Viewed", funnel.viewed),
        ("Interview", funnel.interview),
        ("Offer", funnel.offer),
    ] {
        println!("  {:<18} {:>4} {}", label, count, bar(count, funnel.applied));
    }

    println!("\nApplications per week");
    let max = dash.weekly_series.iter().map(|w| w.count).max().unwrap_or(0);
    for week in &dash.weekly_series {
        println!(
            "  {:<18} {:>4} {}",
            week.week.format("%Y-%m-%d"),
            week.count,
            bar(week.count, max)
        );
    }
}

fn bar(count: usize, max: usize) -> String {
    const WIDTH: usize = 40;
    if max == 0 {
        return String::new();
    }
    "#".repeat((count * WIDTH).div_ceil(max))
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM` or `YYYY-MM-DD` (local time).
fn parse_when(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = db::parse_timestamp(raw) {
        return Ok(at);
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
        })
        .map_err(|_| anyhow!("Invalid date '{}'. Use YYYY-MM-DD or YYYY-MM-DD HH:MM.", raw))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("Date '{}' does not exist in the local timezone", raw))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
