use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A request the ownership rules refused. Carries enough context to debug the rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDenied {
    pub operation: Operation,
    pub path: String,
    pub resource: Option<Value>,
}

impl fmt::Display for PermissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permission denied for {} on {}", self.operation, self.path)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    PermissionDenied(PermissionDenied),

    #[error("You must be logged in. Run 'jobtrack login <email>' first.")]
    Unauthenticated,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn denied(operation: Operation, path: impl Into<String>) -> Self {
        StoreError::PermissionDenied(PermissionDenied {
            operation,
            path: path.into(),
            resource: None,
        })
    }

    pub fn denied_with(operation: Operation, path: impl Into<String>, resource: Value) -> Self {
        StoreError::PermissionDenied(PermissionDenied {
            operation,
            path: path.into(),
            resource: Some(resource),
        })
    }

    pub fn permission_denied(&self) -> Option<&PermissionDenied> {
        match self {
            StoreError::PermissionDenied(denied) => Some(denied),
            _ => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&PermissionDenied) + Send + Sync>;

/// Publish/subscribe channel for permission errors, so the UI can render
/// them separately from the ordinary error path.
#[derive(Default)]
pub struct ErrorEmitter {
    listeners: Mutex<Vec<Listener>>,
}

impl ErrorEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&PermissionDenied) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    /// Listeners run on a snapshot, outside the lock, so they may register
    /// further listeners.
    pub fn emit(&self, error: &PermissionDenied) {
        let snapshot: Vec<Listener> = match self.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(error);
        }
    }

    /// Routes every emission to `listener` alone until the guard is dropped,
    /// then restores the previous listeners.
    pub fn capture<F>(&self, listener: F) -> Capture<'_>
    where
        F: Fn(&PermissionDenied) + Send + Sync + 'static,
    {
        let saved = match self.listeners.lock() {
            Ok(mut listeners) => std::mem::replace(&mut *listeners, vec![Arc::new(listener)]),
            Err(_) => Vec::new(),
        };
        Capture {
            emitter: self,
            saved,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }
}

pub struct Capture<'a> {
    emitter: &'a ErrorEmitter,
    saved: Vec<Listener>,
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.emitter.listeners.lock() {
            *listeners = std::mem::take(&mut self.saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_reaches_every_listener_in_order() {
        let emitter = ErrorEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        emitter.on(move |e| first.lock().unwrap().push(format!("first:{}", e.path)));
        let second = Arc::clone(&seen);
        emitter.on(move |e| second.lock().unwrap().push(format!("second:{}", e.operation)));

        let denied = PermissionDenied {
            operation: Operation::Delete,
            path: "applications/abc".to_string(),
            resource: None,
        };
        emitter.emit(&denied);

        assert_eq!(emitter.listener_count(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:applications/abc".to_string(), "second:delete".to_string()]
        );
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let emitter = ErrorEmitter::new();
        emitter.emit(&PermissionDenied {
            operation: Operation::List,
            path: "applications".to_string(),
            resource: None,
        });
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_denied_message() {
        let err = StoreError::denied(Operation::Get, "applications/xyz");
        assert_eq!(err.to_string(), "permission denied for get on applications/xyz");
        assert!(err.permission_denied().is_some());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let emitter = ErrorEmitter::new();
        emitter.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        if let Some(denied) = err.permission_denied() {
            emitter.emit(denied);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn denied(path: &str) -> PermissionDenied {
        PermissionDenied {
            operation: Operation::Update,
            path: path.to_string(),
            resource: None,
        }
    }

    #[test]
    fn test_listener_may_subscribe_during_emit() {
        let emitter = Arc::new(ErrorEmitter::new());
        let inner = Arc::clone(&emitter);
        emitter.on(move |_| inner.on(|_| {}));

        emitter.emit(&denied("applications/abc"));
        assert_eq!(emitter.listener_count(), 2);
        emitter.emit(&denied("applications/abc"));
        assert_eq!(emitter.listener_count(), 3);
    }

    #[test]
    fn test_capture_replaces_listeners_until_dropped() {
        let emitter = ErrorEmitter::new();
        let outer = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&outer);
        emitter.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let captured = Arc::new(Mutex::new(Vec::new()));
        {
            let sink = Arc::clone(&captured);
            let _capture = emitter.capture(move |e| sink.lock().unwrap().push(e.path.clone()));
            assert_eq!(emitter.listener_count(), 1);
            emitter.emit(&denied("applications/one"));
        }
        assert_eq!(outer.load(Ordering::SeqCst), 0);
        assert_eq!(*captured.lock().unwrap(), vec!["applications/one".to_string()]);

        emitter.emit(&denied("applications/two"));
        assert_eq!(outer.load(Ordering::SeqCst), 1);
        assert_eq!(captured.lock().unwrap().len(), 1);
    }
}
