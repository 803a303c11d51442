use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub const DEFAULT_AUDIT_LOG: &str = "audit.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub access_key: String,
    pub invoice_id: Option<String>,
    pub document_hash: Option<String>,
    pub state: String,
    pub attempt: Option<u32>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str, access_key: &str, state: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            access_key: access_key.to_string(),
            invoice_id: None,
            document_hash: None,
            state: state.to_string(),
            attempt: None,
            error: None,
        }
    }

    pub fn with_invoice(mut self, invoice_id: &str) -> Self {
        self.invoice_id = Some(invoice_id.to_string());
        self
    }

    pub fn with_hash(mut self, hash: &str) -> Self {
        self.document_hash = Some(hash.to_string());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only JSON-lines log of lifecycle events.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn write(&self, event: &AuditEvent) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        tracing::debug!(
            event_type = %event.event_type,
            access_key = %event.access_key,
            "Audit event written"
        );
        Ok(())
    }

    /// Writes the event, logging instead of failing when the file is unwritable.
    pub fn record(&self, event: AuditEvent) {
        if let Err(e) = self.write(&event) {
            tracing::warn!(event_type=%event.event_type, error=%e, "Failed to write audit event");
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_LOG)
    }
}
