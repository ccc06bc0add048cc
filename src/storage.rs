//! Data-access facade used by every command. Wraps the document store with
//! the caller's identity and routes failures: permission errors go to the
//! [`ErrorEmitter`], missing documents become `None`/empty results, and
//! everything else is logged and handed back to the caller.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::auth::Session;
use crate::db::{Database, StoreResult};
use crate::errors::{ErrorEmitter, StoreError};
use crate::models::{Application, ApplicationEvent, ApplicationStatus, NewApplication, Note};

pub struct Storage<'a> {
    db: &'a Database,
    user_id: Option<String>,
    emitter: &'a ErrorEmitter,
}

impl<'a> Storage<'a> {
    pub fn new(db: &'a Database, session: Option<&Session>, emitter: &'a ErrorEmitter) -> Self {
        Self {
            db,
            user_id: session.map(|s| s.user_id.clone()),
            emitter,
        }
    }

    pub fn emitter(&self) -> &'a ErrorEmitter {
        self.emitter
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn report<T>(&self, operation: &str, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(err) = &result {
            match err {
                StoreError::PermissionDenied(denied) => {
                    warn!(operation, path = %denied.path, "permission denied");
                    self.emitter.emit(denied);
                }
                StoreError::NotFound(_) | StoreError::Invalid(_) | StoreError::Unauthenticated => {
                    debug!(operation, error = %err, "request rejected");
                }
                StoreError::Database(_) | StoreError::Serialization(_) => {
                    error!(operation, error = %err, "unexpected storage error");
                }
            }
        }
        result
    }

    /// The caller's applications without notes or events.
    pub fn get_applications_list(&self) -> StoreResult<Vec<Application>> {
        let Some(user_id) = self.user_id() else {
            warn!("get_applications_list called without a user");
            return Ok(Vec::new());
        };
        self.report(
            "get_applications_list",
            self.db.list_applications(Some(user_id), user_id),
        )
    }

    /// Full application with its notes and events, or None when missing.
    pub fn get_application_by_id(&self, id: &str) -> StoreResult<Option<Application>> {
        let result = self.load_application(id);
        match self.report("get_application_by_id", result) {
            Err(StoreError::NotFound(_)) => Ok(None),
            other => other,
        }
    }

    fn load_application(&self, id: &str) -> StoreResult<Option<Application>> {
        let caller = self.user_id();
        let Some(mut app) = self.db.get_application(caller, id)? else {
            return Ok(None);
        };
        app.notes = self.db.list_notes(caller, id)?;
        app.events = self.db.list_events(caller, id)?;
        Ok(Some(app))
    }

    /// Validates the form, stores the application with its initial event
    /// (and note) and returns the stored record.
    pub fn save_application(&self, mut new: NewApplication) -> StoreResult<Application> {
        let Some(user_id) = self.user_id() else {
            return self.report("save_application", Err(StoreError::Unauthenticated));
        };
        if new.user_id.is_empty() {
            new.user_id = user_id.to_string();
        }
        let new = match new.normalize() {
            Ok(n) => n,
            Err(e) => {
                return self.report("save_application", Err(StoreError::Invalid(e.to_string())));
            }
        };

        let id = self.report(
            "save_application",
            self.db.create_application(Some(user_id), &new),
        )?;
        debug!(%id, company = %new.company_name, "application created");

        self.get_application_by_id(&id)?
            .ok_or_else(|| StoreError::NotFound(crate::db::application_path(&id)))
    }

    /// Deletes the application and its sub-collections. False when it did not exist.
    pub fn delete_application(&self, id: &str) -> StoreResult<bool> {
        self.report(
            "delete_application",
            self.db.delete_application(self.user_id(), id),
        )
    }

    pub fn add_application_event(
        &self,
        application_id: &str,
        event_type: &str,
        occurred_at: DateTime<Utc>,
        metadata: Map<String, Value>,
    ) -> StoreResult<ApplicationEvent> {
        self.report(
            "add_application_event",
            self.db
                .add_event(self.user_id(), application_id, event_type, occurred_at, metadata),
        )
    }

    pub fn add_note(&self, application_id: &str, text: &str) -> StoreResult<Note> {
        self.report(
            "add_note",
            self.db.add_note(self.user_id(), application_id, text),
        )
    }

    pub fn update_application_status(
        &self,
        application_id: &str,
        status: ApplicationStatus,
    ) -> StoreResult<Option<ApplicationEvent>> {
        self.report(
            "update_application_status",
            self.db.update_status(self.user_id(), application_id, status),
        )
    }

    /// Events of every application the caller owns, oldest first.
    pub fn get_all_events(&self) -> StoreResult<Vec<ApplicationEvent>> {
        let Some(user_id) = self.user_id() else {
            warn!("get_all_events called without a user");
            return Ok(Vec::new());
        };
        self.report(
            "get_all_events",
            self.db.list_user_events(Some(user_id), user_id),
        )
    }
}
