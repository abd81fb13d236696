//! Security audit trail.
//!
//! Writes are best-effort: a failed insert is logged and dropped so the
//! security state the caller already committed (a session, a rotated
//! token) stands.

use crate::db::UnitOfWork;
use crate::models::{AuditEvent, AuditSeverity};

/// Append-only sink for [`AuditEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct AuditSink;

impl AuditSink {
    pub fn new() -> Self {
        Self
    }

    pub async fn record(&self, uow: &dyn UnitOfWork, event: AuditEvent) {
        match event.severity {
            AuditSeverity::Critical => tracing::warn!(
                event_type = event.event_type.as_str(),
                user_id = ?event.user_id,
                client_id = ?event.client_id,
                "Security event"
            ),
            _ => tracing::info!(
                event_type = event.event_type.as_str(),
                user_id = ?event.user_id,
                "Audit event"
            ),
        }

        if let Err(e) = uow.insert_audit_event(&event).await {
            tracing::error!(
                error = %e,
                event_type = event.event_type.as_str(),
                event_id = %event.id,
                "Failed to write audit event"
            );
        }
    }
}
