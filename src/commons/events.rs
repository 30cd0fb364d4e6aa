//! Audit events of the certificate lifecycle.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::constants::{EVENT_CATEGORY, EVENTS_LOG_TARGET};

//------------ EventKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Sign,
    ForbidSign,
    SelfRevoke,
    Revoke,
    Recover,
    Forbid,
    RecoverForbid,
    OcspSign,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EventKind::Sign => "sign",
            EventKind::ForbidSign => "forbid-sign",
            EventKind::SelfRevoke => "self-revoke",
            EventKind::Revoke => "revoke",
            EventKind::Recover => "recover",
            EventKind::Forbid => "forbid",
            EventKind::RecoverForbid => "recover-forbid",
            EventKind::OcspSign => "ocsp-sign",
        };
        f.write_str(s)
    }
}

//------------ CertOp --------------------------------------------------------

/// The object of an event: an identity, and the certificate if one is
/// involved.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertOp {
    pub unique_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub sn: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub aki: String,
}

impl CertOp {
    pub fn identity(unique_id: impl Into<String>) -> Self {
        CertOp {
            unique_id: unique_id.into(),
            ..Default::default()
        }
    }

    pub fn cert(unique_id: impl Into<String>, sn: impl Into<String>, aki: impl Into<String>) -> Self {
        CertOp {
            unique_id: unique_id.into(),
            sn: sn.into(),
            aki: aki.into(),
        }
    }
}

//------------ LifecycleEvent ------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub operator: String,
    pub category: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub obj: CertOp,
    pub time: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(operator: &str, kind: EventKind, obj: CertOp) -> Self {
        LifecycleEvent {
            operator: operator.to_string(),
            category: EVENT_CATEGORY.to_string(),
            kind,
            obj,
            time: Utc::now(),
        }
    }
}

//------------ EventSink -----------------------------------------------------

/// Receives audit events. Emitting never fails the operation that caused
/// the event.
pub trait EventSink: fmt::Debug + Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Writes events as JSON lines to the events log target.
#[derive(Debug, Default)]
pub struct LogEvents;

impl EventSink for LogEvents {
    fn emit(&self, event: LifecycleEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: EVENTS_LOG_TARGET, "{}", json),
            Err(e) => warn!(target: EVENTS_LOG_TARGET, "cannot serialize {} event: {}", event.kind, e),
        }
    }
}

/// Keeps events in memory, for inspection in tests.
#[derive(Debug, Default)]
pub struct MemoryEvents {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryEvents {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl EventSink for MemoryEvents {
    fn emit(&self, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
