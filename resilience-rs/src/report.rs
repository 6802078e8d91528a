//! # Error Reports
//!
//! The unit of work flowing through the tracker queue. A report is built by
//! a capture point, frozen once queued, and dropped when the ingestion
//! endpoint acknowledges it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form operator context attached to a report.
///
/// Conventional keys per [`ErrorType`]:
/// - `network-error`: `status` (number or null), `method`, `resource`
/// - `health-check-failed`: `check`, `failed_checks`
/// - `manual`: anything the caller passes
pub type AdditionalData = serde_json::Map<String, serde_json::Value>;

/// The severity level of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Reports at this level also raise an operator alert once delivered
    pub fn raises_alert(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Where a report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    UncaughtException,
    UnhandledRejection,
    NetworkError,
    HealthCheckFailed,
    Manual,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::UncaughtException => write!(f, "uncaught-exception"),
            ErrorType::UnhandledRejection => write!(f, "unhandled-rejection"),
            ErrorType::NetworkError => write!(f, "network-error"),
            ErrorType::HealthCheckFailed => write!(f, "health-check-failed"),
            ErrorType::Manual => write!(f, "manual"),
        }
    }
}

/// One captured failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub id: Uuid,
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub severity: Severity,
    /// Origin context (screen, route or resource)
    #[serde(default)]
    pub url: String,
    /// Client identification, e.g. user agent
    #[serde(default)]
    pub client_context: String,
    /// Filled from the authenticated session at send time when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub additional_data: AdditionalData,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new<S: Into<String>>(error_type: ErrorType, message: S, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type,
            message: message.into(),
            stack: None,
            severity,
            url: String::new(),
            client_context: String::new(),
            user_id: None,
            additional_data: AdditionalData::new(),
            timestamp: Utc::now(),
        }
    }

    /// A manually logged report
    pub fn manual<S: Into<String>>(message: S, severity: Severity) -> Self {
        Self::new(ErrorType::Manual, message, severity)
    }

    pub fn stack<S: Into<String>>(mut self, stack: S) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn url<S: Into<String>>(mut self, url: S) -> Self {
        self.url = url.into();
        self
    }

    pub fn client_context<S: Into<String>>(mut self, client_context: S) -> Self {
        self.client_context = client_context.into();
        self
    }

    pub fn user_id<S: Into<String>>(mut self, user_id: S) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Adds one entry to `additional_data`
    pub fn data<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.additional_data.insert(key.into(), value);
        }
        self
    }

    /// Merges a whole map into `additional_data`
    pub fn with_data(mut self, data: AdditionalData) -> Self {
        self.additional_data.extend(data);
        self
    }
}

/// Anything that accepts reports, fire-and-forget
///
/// Implemented by [`crate::tracker::ErrorTracker`]; the retry and recovery
/// layers only see this seam.
pub trait ReportSink: Send + Sync {
    fn track_error(&self, report: ErrorReport);

    fn log_error(&self, message: &str, severity: Severity, additional_data: Option<AdditionalData>) {
        let report = ErrorReport::manual(message, severity);
        self.track_error(match additional_data {
            Some(data) => report.with_data(data),
            None => report,
        });
    }
}
