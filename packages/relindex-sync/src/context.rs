//! Process-wide collaborators shared by every record service

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::notification::NotificationBus;
use crate::relations::RelationCatalog;

/// Opaque caller identity
///
/// Carried through service calls and notifications untouched. Permission
/// checks live outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    subject: String,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
        }
    }

    /// Identity used by background work (drain worker, full reindex)
    pub fn system() -> Self {
        Self::new("system")
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Shared state handed to each service at construction
///
/// Built once at startup. Cloning is cheap and every clone sees the same
/// bus and catalog.
#[derive(Clone, Default)]
pub struct ServiceContext {
    pub bus: Arc<NotificationBus>,
    pub catalog: Arc<RelationCatalog>,
}

impl ServiceContext {
    pub fn new() -> Self {
        Self::default()
    }
}
