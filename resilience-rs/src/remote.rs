//! # Remote Collaborators
//!
//! Interfaces to the services the pipeline consumes but does not own: the
//! ingestion endpoint, the alert side-channel, the primary data store and
//! the authenticated session.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::report::{AdditionalData, ErrorReport, Severity};
use crate::types::Result;

/// The authenticated session reports are sent under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer credential for the ingestion endpoint
    pub token: String,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// `None` while nobody is signed in
    async fn current_session(&self) -> Option<Session>;
}

/// Accepts one report per call
#[async_trait]
pub trait IngestionClient: Send + Sync {
    async fn send(&self, report: &ErrorReport, credential: &str) -> Result<()>;

    /// Calls to this address are never themselves reported
    fn endpoint(&self) -> &str;
}

/// Operator-visible alert record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub metadata: AdditionalData,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert) -> Result<()>;
}

/// Cheap, side-effect-free read against the primary data store
#[async_trait]
pub trait DataStoreProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// A session that never changes, e.g. a service credential
#[derive(Debug, Clone)]
pub struct StaticSession(pub Session);

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_session(&self) -> Option<Session> {
        Some(self.0.clone())
    }
}

/// A session the host updates on sign-in and sign-out
#[derive(Debug, Default)]
pub struct SharedSession {
    current: RwLock<Option<Session>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, session: Session) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(session);
    }

    pub fn sign_out(&self) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[async_trait]
impl SessionProvider for SharedSession {
    async fn current_session(&self) -> Option<Session> {
        self.current.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}
