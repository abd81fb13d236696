//! Devices allowed to skip the MFA challenge for a bounded window.
//!
//! Fingerprints are client-supplied; only their digest is stored.

use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::UnitOfWork;
use crate::models::{AuditEvent, AuditEventType, TrustedDevice};
use crate::utils::Clock;

use super::credential::hash_token;
use super::{AuditSink, AuthError};

#[derive(Clone)]
pub struct TrustedDeviceRegistry {
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl TrustedDeviceRegistry {
    pub fn new(default_ttl: Duration, clock: Arc<dyn Clock>, audit: AuditSink) -> Self {
        Self {
            default_ttl,
            clock,
            audit,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// True while a matching device's trust window is open. A hit refreshes
    /// `last_seen_at`.
    pub async fn is_trusted(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<bool, AuthError> {
        if fingerprint.is_empty() {
            return Ok(false);
        }

        let now = self.clock.now();
        let device = uow
            .find_trusted_device(user_id, &hash_token(fingerprint))
            .await?;

        match device {
            Some(device) if device.is_trusted(now) => {
                uow.touch_trusted_device(device.id, now).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Trust (or re-trust) a device for `duration` from now.
    pub async fn trust(
        &self,
        uow: &dyn UnitOfWork,
        user_id: Uuid,
        fingerprint: &str,
        label: Option<String>,
        duration: Duration,
    ) -> Result<TrustedDevice, AuthError> {
        if fingerprint.is_empty() {
            return Err(AuthError::InvalidRequest(
                "device fingerprint is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let device = TrustedDevice {
            id: Uuid::new_v4(),
            user_id,
            fingerprint_hash: hash_token(fingerprint),
            label,
            trusted_at: now,
            trust_expires_at: now + duration,
            last_seen_at: now,
        };
        uow.upsert_trusted_device(&device).await?;

        self.audit
            .record(
                uow,
                AuditEvent::new(AuditEventType::DeviceTrusted, now)
                    .user(None, Some(user_id))
                    .detail(serde_json::json!({
                        "label": device.label,
                        "trust_expires_at": device.trust_expires_at,
                    })),
            )
            .await;

        Ok(device)
    }

    pub async fn revoke_all(&self, uow: &dyn UnitOfWork, user_id: Uuid) -> Result<u64, AuthError> {
        let removed = uow.delete_trusted_devices(user_id).await?;
        if removed > 0 {
            tracing::info!(%user_id, removed, "Trusted devices revoked");
        }
        Ok(removed)
    }
}
